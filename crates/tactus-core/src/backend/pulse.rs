//! Hardware period pulse.

use crate::compat::{AtomicU64, Condvar, Mutex, Ordering};
use std::time::Duration;

/// Counter bumped once per hardware period.
///
/// The hardware side only touches an atomic and notifies, so [`Pulse::fire`]
/// never blocks. The scheduler waits with a timeout, which bounds a wakeup
/// lost between its check and its wait.
#[derive(Debug, Default)]
pub struct Pulse {
    count: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Pulse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals one elapsed period. Returns the new pulse count.
    pub fn fire(&self) -> u64 {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        self.cond.notify_all();
        count
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Waits until the count exceeds `seen` or `timeout` elapses. Returns the
    /// count observed last.
    pub fn wait(&self, seen: u64, timeout: Duration) -> u64 {
        let mut guard = self.lock.lock();
        let count = self.count();
        if count > seen {
            return count;
        }
        self.cond.wait_for(&mut guard, timeout);
        self.count()
    }
}
