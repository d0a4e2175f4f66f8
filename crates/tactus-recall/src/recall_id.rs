//! Invocation identity.

use crate::ids::InvocationId;
use crate::recycling::RecyclingContext;
use std::fmt;
use std::sync::Arc;

/// Why an invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Playback,
    Record,
    Export,
    Notation,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Purpose::Playback => "playback",
            Purpose::Record => "record",
            Purpose::Export => "export",
            Purpose::Notation => "notation",
        };
        f.write_str(name)
    }
}

/// One concrete invocation: a purpose paired with the recyclings it runs on.
#[derive(Debug, Clone)]
pub struct RecallId {
    id: InvocationId,
    purpose: Purpose,
    context: Arc<RecyclingContext>,
}

impl RecallId {
    pub fn new(id: InvocationId, purpose: Purpose, context: Arc<RecyclingContext>) -> Self {
        Self {
            id,
            purpose,
            context,
        }
    }

    #[inline]
    pub fn id(&self) -> InvocationId {
        self.id
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn context(&self) -> &Arc<RecyclingContext> {
        &self.context
    }

    /// Same invocation over a different recycling context.
    pub fn with_context(&self, context: Arc<RecyclingContext>) -> Self {
        Self {
            id: self.id,
            purpose: self.purpose,
            context,
        }
    }
}

impl PartialEq for RecallId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RecallId {}

impl fmt::Display for RecallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.purpose)
    }
}
