//! Graph mutations queued for the safe window.

mod queue;

pub use queue::{DrainReport, TaskQueue};

use crate::error::TaskError;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

/// Identifier handed out by [`TaskQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskFlags(u8);

impl TaskFlags {
    pub const NONE: TaskFlags = TaskFlags(0);
    /// At most one pending task per lock key; later duplicates coalesce.
    pub const LOCKED: TaskFlags = TaskFlags(1);
    /// Re-queued after every successful launch until removed or failed.
    pub const CYCLIC: TaskFlags = TaskFlags(1 << 1);

    #[inline]
    pub fn contains(self, other: TaskFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TaskFlags {
    type Output = TaskFlags;

    fn bitor(self, rhs: TaskFlags) -> TaskFlags {
        TaskFlags(self.0 | rhs.0)
    }
}

/// A queued mutation of the engine state `C`.
///
/// Tasks never run on the submitting thread. During the safe window the queue
/// first calls [`Task::validate`], which must not mutate anything, and then
/// [`Task::launch`].
pub trait Task<C>: Send + 'static {
    fn name(&self) -> &str;

    fn flags(&self) -> TaskFlags {
        TaskFlags::NONE
    }

    /// Key identifying duplicates of a `LOCKED` task. Defaults to the name.
    fn lock_key(&self) -> String {
        self.name().to_string()
    }

    fn validate(&self, _ctx: &C) -> Result<(), TaskError> {
        Ok(())
    }

    fn launch(&mut self, ctx: &mut C) -> Result<(), TaskError>;
}

/// What happened to a submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(TaskError),
    /// Dropped because an identical `LOCKED` task was already pending.
    Coalesced,
    /// A cyclic task taken out with [`TaskQueue::remove_cyclic`].
    Removed,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

/// Receipt for a submitted task. Cyclic tasks report every launch.
#[derive(Debug)]
pub struct TaskTicket {
    id: TaskId,
    rx: Receiver<TaskOutcome>,
}

impl TaskTicket {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks until the next outcome.
    pub fn wait(&self) -> TaskOutcome {
        self.rx
            .recv()
            .unwrap_or(TaskOutcome::Failed(TaskError::QueueClosed))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(TaskOutcome::Failed(TaskError::QueueClosed))
            }
        }
    }

    pub fn try_outcome(&self) -> Option<TaskOutcome> {
        self.rx.try_recv().ok()
    }
}
