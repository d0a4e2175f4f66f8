//! Thread node state machine.

use crate::compat::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Not started, stopped, or freshly reset.
    #[default]
    Idle,
    /// Executing its work function for the current tic.
    Running,
    /// Quarantined after a fatal fault; skipped by the scheduler until reset.
    Locked,
    /// Parked on its parent edge, waiting for the next tic.
    WaitingForParent,
    /// Blocked on a recall dependency owned by another node.
    WaitingForSibling,
    /// Blocking children are processing the current tic.
    WaitingForChildren,
}

impl NodeState {
    fn to_u8(self) -> u8 {
        match self {
            NodeState::Idle => 0,
            NodeState::Running => 1,
            NodeState::Locked => 2,
            NodeState::WaitingForParent => 3,
            NodeState::WaitingForSibling => 4,
            NodeState::WaitingForChildren => 5,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => NodeState::Running,
            2 => NodeState::Locked,
            3 => NodeState::WaitingForParent,
            4 => NodeState::WaitingForSibling,
            5 => NodeState::WaitingForChildren,
            _ => NodeState::Idle,
        }
    }

    /// Whether the scheduler may move a node from `self` to `next`.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;

        if next == Idle {
            // stop and reset are always allowed
            return true;
        }

        matches!(
            (self, next),
            (Idle, WaitingForParent)
                | (WaitingForParent, Running)
                | (Running, WaitingForSibling)
                | (WaitingForSibling, Running)
                | (Running, WaitingForChildren)
                | (Running, WaitingForParent)
                | (WaitingForChildren, WaitingForParent)
                | (Running, Locked)
                | (WaitingForSibling, Locked)
                | (WaitingForChildren, Locked)
        )
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            NodeState::WaitingForParent
                | NodeState::WaitingForSibling
                | NodeState::WaitingForChildren
        )
    }
}

/// What a node is responsible for in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Owns the tic counter.
    Root,
    /// Feeds the hardware backend.
    Soundcard,
    /// One audio stream (track).
    Audio,
    /// One channel of a track.
    Channel,
    /// Non-blocking worker; the parent never waits on it.
    Async,
}

impl NodeKind {
    /// Blocking nodes hold back the tic until they complete.
    pub fn is_blocking(self) -> bool {
        !matches!(self, NodeKind::Async)
    }
}

/// Atomic cell holding a [`NodeState`].
#[derive(Debug)]
pub(crate) struct AtomicNodeState(AtomicU8);

impl AtomicNodeState {
    pub(crate) fn new(state: NodeState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    #[inline]
    pub(crate) fn get(&self) -> NodeState {
        NodeState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` if the transition is legal; returns the previous state on success.
    pub(crate) fn transition(&self, next: NodeState) -> Result<NodeState, NodeState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = NodeState::from_u8(current);
            if state == next {
                return Ok(state);
            }
            if !state.can_transition_to(next) {
                return Err(state);
            }
            match self.0.compare_exchange_weak(
                current,
                next.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(state),
                Err(actual) => current = actual,
            }
        }
    }
}
