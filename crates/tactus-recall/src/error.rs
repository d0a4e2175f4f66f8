//! Error types for tactus-recall.

use crate::ids::{ChannelId, ContainerId, InvocationId, TemplateId, TrackId};
use crate::recall::RecallLevel;
use thiserror::Error;

/// Error type for recall graph operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecallError {
    /// No instance of the dependency was duplicated for this invocation.
    #[error("{template} has no instance for {invocation}")]
    NotFound {
        template: TemplateId,
        invocation: InvocationId,
    },

    /// Adding the edges would close a cycle; `path` lists it in order.
    #[error("Cyclic dependency: {}", format_path(.path))]
    CyclicDependency { path: Vec<TemplateId> },

    /// Linking the channels would feed a channel its own output.
    #[error("Cyclic channel link: {}", format_path(.path))]
    CyclicLink { path: Vec<ChannelId> },

    #[error("{recall}: a {level} recall needs a channel")]
    InvalidLevel { recall: String, level: RecallLevel },

    #[error("Unknown recall template: {0}")]
    UnknownTemplate(TemplateId),

    #[error("Unknown recall container: {0}")]
    UnknownContainer(ContainerId),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Unknown track: {0}")]
    UnknownTrack(TrackId),

    #[error("Unknown invocation: {0}")]
    UnknownInvocation(InvocationId),

    #[error("Position {pos} out of range (0..={len})")]
    InvalidPosition { pos: usize, len: usize },

    /// A recall may only depend on recalls of the same or a coarser level.
    #[error("{from} cannot depend on {to}: {reason}")]
    InvalidDependency {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Processor error: {0}")]
    Processor(String),
}

impl RecallError {
    pub fn processor(message: impl ToString) -> Self {
        Self::Processor(message.to_string())
    }
}

fn format_path<T: std::fmt::Display>(path: &[T]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, RecallError>;

impl From<RecallError> for tactus_core::NodeFault {
    fn from(err: RecallError) -> Self {
        tactus_core::NodeFault::new(err.to_string())
    }
}

impl From<RecallError> for tactus_core::TaskError {
    fn from(err: RecallError) -> Self {
        match err {
            RecallError::Processor(_) => tactus_core::TaskError::execution("recall", err),
            _ => tactus_core::TaskError::validation("recall", err),
        }
    }
}
