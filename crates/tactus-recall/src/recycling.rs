//! Recycling contexts: the buffer chains taking part in one invocation.
//!
//! A context is immutable in its recycling list. `add`, `remove`, `insert` and
//! `replace` return a new context and leave the original untouched, so a
//! worker thread holding the old `Arc` keeps a consistent view for the rest of
//! its tic. Parent/child links are the only mutable part.

use crate::error::{RecallError, Result};
use crate::ids::RecyclingId;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

#[derive(Debug)]
pub struct RecyclingContext {
    recyclings: Vec<RecyclingId>,
    parent: RwLock<Weak<RecyclingContext>>,
    children: RwLock<Vec<Arc<RecyclingContext>>>,
}

impl RecyclingContext {
    pub fn new(recyclings: Vec<RecyclingId>) -> Arc<Self> {
        Arc::new(Self {
            recyclings,
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
        })
    }

    pub fn recyclings(&self) -> &[RecyclingId] {
        &self.recyclings
    }

    pub fn len(&self) -> usize {
        self.recyclings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recyclings.is_empty()
    }

    pub fn contains(&self, recycling: RecyclingId) -> bool {
        self.recyclings.contains(&recycling)
    }

    /// New context with `recycling` appended.
    pub fn add(&self, recycling: RecyclingId) -> Arc<Self> {
        let mut recyclings = self.recyclings.clone();
        recyclings.push(recycling);
        Self::new(recyclings)
    }

    /// New context without `recycling`. Unknown recyclings leave the list as is.
    pub fn remove(&self, recycling: RecyclingId) -> Arc<Self> {
        let recyclings = self
            .recyclings
            .iter()
            .copied()
            .filter(|r| *r != recycling)
            .collect();
        Self::new(recyclings)
    }

    /// New context with `recycling` inserted at `pos` (`0..=len`).
    pub fn insert(&self, recycling: RecyclingId, pos: usize) -> Result<Arc<Self>> {
        if pos > self.recyclings.len() {
            return Err(RecallError::InvalidPosition {
                pos,
                len: self.recyclings.len(),
            });
        }
        let mut recyclings = self.recyclings.clone();
        recyclings.insert(pos, recycling);
        Ok(Self::new(recyclings))
    }

    /// New context with the entry at `pos` (`0..len`) swapped for `recycling`.
    pub fn replace(&self, recycling: RecyclingId, pos: usize) -> Result<Arc<Self>> {
        if pos >= self.recyclings.len() {
            return Err(RecallError::InvalidPosition {
                pos,
                len: self.recyclings.len(),
            });
        }
        let mut recyclings = self.recyclings.clone();
        recyclings[pos] = recycling;
        Ok(Self::new(recyclings))
    }

    /// Position of `recycling` in this context.
    pub fn find(&self, recycling: RecyclingId) -> Option<usize> {
        self.recyclings.iter().position(|r| *r == recycling)
    }

    /// Index of the first child context holding `recycling`.
    pub fn find_child(&self, recycling: RecyclingId) -> Option<usize> {
        self.children
            .read()
            .iter()
            .position(|child| child.find(recycling).is_some())
    }

    /// Position of `recycling` in the parent context.
    pub fn find_parent(&self, recycling: RecyclingId) -> Option<usize> {
        self.parent().and_then(|parent| parent.find(recycling))
    }

    pub fn parent(&self) -> Option<Arc<RecyclingContext>> {
        self.parent.read().upgrade()
    }

    pub fn children(&self) -> Vec<Arc<RecyclingContext>> {
        self.children.read().clone()
    }

    /// Outermost context of this nesting.
    pub fn toplevel(self: &Arc<Self>) -> Arc<RecyclingContext> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn add_child(self: &Arc<Self>, child: Arc<RecyclingContext>) {
        *child.parent.write() = Arc::downgrade(self);
        self.children.write().push(child);
    }

    /// Unlinks `child`. Returns `false` if it was not a child of this context.
    pub fn remove_child(&self, child: &Arc<RecyclingContext>) -> bool {
        let mut children = self.children.write();
        match children.iter().position(|c| Arc::ptr_eq(c, child)) {
            Some(pos) => {
                children.remove(pos);
                *child.parent.write() = Weak::new();
                true
            }
            None => false,
        }
    }
}
