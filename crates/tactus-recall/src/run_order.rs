//! Per-invocation channel order.

use crate::error::{RecallError, Result};
use crate::ids::ChannelId;

/// Order in which the channels of one invocation run when they share a
/// thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOrder {
    channels: Vec<ChannelId>,
}

impl RunOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn position(&self, channel: ChannelId) -> Option<usize> {
        self.channels.iter().position(|c| *c == channel)
    }

    pub fn add_channel(&mut self, channel: ChannelId) {
        self.channels.push(channel);
    }

    /// Inserts at `pos`, which must lie in `0..=len`.
    pub fn insert_channel(&mut self, pos: usize, channel: ChannelId) -> Result<()> {
        if pos > self.channels.len() {
            return Err(RecallError::InvalidPosition {
                pos,
                len: self.channels.len(),
            });
        }
        self.channels.insert(pos, channel);
        Ok(())
    }

    /// Removes the first occurrence of `channel`; absent channels are ignored.
    pub fn remove_channel(&mut self, channel: ChannelId) {
        if let Some(pos) = self.position(channel) {
            self.channels.remove(pos);
        }
    }
}
