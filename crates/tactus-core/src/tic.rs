//! Tic clock: one scheduling round per hardware buffer period.

use crate::lockfree::AtomicCounter;

/// Monotonic tic counter owned by the root of the thread tree.
///
/// `current` is the tic being processed (or about to be); `last_sync` is the
/// last tic every blocking node completed. Tic numbers start at 1, so a
/// `last_sync` of 0 means no round completed yet.
#[derive(Debug)]
pub struct TicClock {
    current: AtomicCounter,
    last_sync: AtomicCounter,
}

impl TicClock {
    pub fn new() -> Self {
        Self {
            current: AtomicCounter::new(1),
            last_sync: AtomicCounter::new(0),
        }
    }

    /// Tic currently being processed.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current.get()
    }

    /// Last fully completed tic.
    #[inline]
    pub fn last_sync(&self) -> u64 {
        self.last_sync.get()
    }

    /// Marks the current tic complete and moves on. Returns the new tic.
    ///
    /// Only the root calls this, after its blocking subtree and the task
    /// queue's safe window are done.
    pub(crate) fn advance(&self) -> u64 {
        let done = self.current.get();
        self.last_sync.set(done);
        self.current.incr()
    }
}

impl Default for TicClock {
    fn default() -> Self {
        Self::new()
    }
}
