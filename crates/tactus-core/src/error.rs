//! Error types for tactus-core.

use crate::thread::NodeId;
use thiserror::Error;

/// Error type for tactus-core operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Failed to spawn thread '{name}'")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Thread node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Thread node {0} already has a parent")]
    AlreadyAttached(NodeId),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[cfg(feature = "cpal")]
    #[error("Audio device not available")]
    DeviceNotAvailable(#[from] cpal::DefaultStreamConfigError),

    #[cfg(feature = "cpal")]
    #[error("Failed to build audio stream")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[cfg(feature = "cpal")]
    #[error("Failed to play audio stream")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[cfg(feature = "cpal")]
    #[error("Failed to enumerate devices")]
    DevicesError(#[from] cpal::DevicesError),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Timing and ordering faults of the tic scheduler. These are never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("tic {tic} finished {late_pulses} hardware period(s) late")]
    Overrun { tic: u64, late_pulses: u64 },

    #[error("tic {tic}: dependency wait of '{recall}' timed out")]
    DependencyStall { tic: u64, recall: String },

    #[error("tic {requested} dispatched before tic {pending} completed")]
    GateNotReady { requested: u64, pending: u64 },
}

/// Errors reported for queued graph mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Rejected before any mutation happened; the graph is unchanged.
    #[error("Task '{task}' rejected: {reason}")]
    Validation { task: String, reason: String },

    #[error("Task '{task}' failed: {reason}")]
    Execution { task: String, reason: String },

    #[error("Task queue closed")]
    QueueClosed,
}

impl TaskError {
    pub fn validation(task: impl Into<String>, reason: impl ToString) -> Self {
        Self::Validation {
            task: task.into(),
            reason: reason.to_string(),
        }
    }

    pub fn execution(task: impl Into<String>, reason: impl ToString) -> Self {
        Self::Execution {
            task: task.into(),
            reason: reason.to_string(),
        }
    }
}
