//! Per-edge handshake between a parent node and one child.
//!
//! The parent posts a tic with [`TicGate::dispatch`]; the child blocks in
//! [`TicGate::wait_dispatch`], does its work, and reports back with
//! [`TicGate::complete`]. A blocking gate refuses a new tic until the previous
//! one completed, which makes every edge a barrier: tic `T + 1` can never reach
//! a child that has not finished `T`.
//!
//! Async children use a lossy gate. Dispatching to a lossy gate never fails;
//! a tic the child has not picked up yet is replaced by the newer one and
//! counted in [`TicGate::skipped_tics`].

use crate::compat::{Condvar, Mutex};
use crate::error::SchedulingError;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct GateState {
    /// Latest tic posted by the parent.
    dispatched: u64,
    /// Latest tic the child picked up.
    taken: u64,
    /// Latest tic the child finished.
    completed: u64,
    skipped: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct TicGate {
    state: Mutex<GateState>,
    cond: Condvar,
    lossy: bool,
}

impl TicGate {
    /// Gate for a blocking child.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
            lossy: false,
        }
    }

    /// Gate for an async child.
    pub fn lossy() -> Self {
        Self {
            lossy: true,
            ..Self::new()
        }
    }

    pub fn is_lossy(&self) -> bool {
        self.lossy
    }

    /// Posts `tic` to the child.
    pub fn dispatch(&self, tic: u64) -> Result<(), SchedulingError> {
        let mut state = self.state.lock();

        if !self.lossy && state.completed < state.dispatched {
            return Err(SchedulingError::GateNotReady {
                requested: tic,
                pending: state.dispatched,
            });
        }

        if self.lossy && state.taken < state.dispatched {
            state.skipped += 1;
        }

        state.dispatched = state.dispatched.max(tic);
        self.cond.notify_all();
        Ok(())
    }

    /// Blocks until a tic newer than `last` is posted. Returns `None` once the
    /// gate is closed.
    pub fn wait_dispatch(&self, last: u64) -> Option<u64> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if state.dispatched > last {
                state.taken = state.dispatched;
                return Some(state.dispatched);
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn complete(&self, tic: u64) {
        let mut state = self.state.lock();
        state.completed = state.completed.max(tic);
        self.cond.notify_all();
    }

    /// Blocks until the child completed `tic` or the gate is closed.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_complete(&self, tic: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.completed < tic && !state.closed {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.completed >= tic || state.closed;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        true
    }

    pub fn is_complete(&self, tic: u64) -> bool {
        self.state.lock().completed >= tic
    }

    /// Last tic the child finished.
    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    /// Tic that was posted but not finished yet, if any.
    pub fn pending(&self) -> Option<u64> {
        let state = self.state.lock();
        (state.completed < state.dispatched).then_some(state.dispatched)
    }

    /// Tics an async child never saw because a newer one replaced them.
    pub fn skipped_tics(&self) -> u64 {
        self.state.lock().skipped
    }

    /// Wakes every waiter and makes further waits return immediately.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Reopens a closed gate and forgets any outstanding tic.
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        state.completed = state.dispatched;
        state.taken = state.dispatched;
    }
}

impl Default for TicGate {
    fn default() -> Self {
        Self::new()
    }
}
