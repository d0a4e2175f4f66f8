//! Bookkeeping for running invocations.

use crate::ids::{ChannelId, InvocationId, RecyclingId, TemplateId, TrackId};
use crate::recall_id::RecallId;
use crate::run_order::RunOrder;
use hashbrown::{HashMap, HashSet};

/// Lifecycle notifications for invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationEvent {
    Started { id: InvocationId },
    /// Every run and chunk instance reached DONE.
    Finished { id: InvocationId, tic: u64 },
    Cancelled { id: InvocationId, tic: u64 },
}

impl InvocationEvent {
    pub fn id(&self) -> InvocationId {
        match self {
            InvocationEvent::Started { id }
            | InvocationEvent::Finished { id, .. }
            | InvocationEvent::Cancelled { id, .. } => *id,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Invocation {
    pub recall_id: RecallId,
    pub tracks: Vec<TrackId>,
    pub run_order: RunOrder,
    pub recyclings: HashMap<ChannelId, RecyclingId>,
    /// Templates that got an instance for this invocation, including ones
    /// already swept.
    pub duplicated: HashSet<TemplateId>,
    /// Run and chunk instances that reached DONE. Ones detached or
    /// quarantined before that do not count.
    pub completed: usize,
    pub cancelled: bool,
}

impl Invocation {
    pub(crate) fn new(recall_id: RecallId, tracks: Vec<TrackId>) -> Self {
        Self {
            recall_id,
            tracks,
            run_order: RunOrder::new(),
            recyclings: HashMap::new(),
            duplicated: HashSet::new(),
            completed: 0,
            cancelled: false,
        }
    }

    /// Adds a channel with its own recycling; the recall id switches to a new
    /// context containing it.
    pub(crate) fn join_channel(&mut self, channel: ChannelId, recycling: RecyclingId) {
        if self.recyclings.contains_key(&channel) {
            return;
        }
        self.recyclings.insert(channel, recycling);
        self.run_order.add_channel(channel);
        let context = self.recall_id.context().add(recycling);
        self.recall_id = self.recall_id.with_context(context);
    }

    pub(crate) fn leave_channel(&mut self, channel: ChannelId) {
        if let Some(recycling) = self.recyclings.remove(&channel) {
            self.run_order.remove_channel(channel);
            let context = self.recall_id.context().remove(recycling);
            self.recall_id = self.recall_id.with_context(context);
        }
    }

    pub(crate) fn id(&self) -> InvocationId {
        self.recall_id.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall_id::Purpose;
    use crate::recycling::RecyclingContext;

    #[test]
    fn test_join_and_leave() {
        let id = RecallId::new(InvocationId(1), Purpose::Record, RecyclingContext::new(Vec::new()));
        let mut inv = Invocation::new(id, vec![TrackId(1)]);
        inv.join_channel(ChannelId(1), RecyclingId(10));
        inv.join_channel(ChannelId(2), RecyclingId(11));
        inv.join_channel(ChannelId(2), RecyclingId(12));

        assert_eq!(inv.run_order.channels(), &[ChannelId(1), ChannelId(2)]);
        assert_eq!(
            inv.recall_id.context().recyclings(),
            &[RecyclingId(10), RecyclingId(11)]
        );

        inv.leave_channel(ChannelId(1));
        assert_eq!(inv.run_order.channels(), &[ChannelId(2)]);
        assert_eq!(inv.recall_id.context().recyclings(), &[RecyclingId(11)]);
        assert_eq!(inv.id(), InvocationId(1));
    }
}
