//! Schedulable thread node.

use super::gate::TicGate;
use super::state::{AtomicNodeState, NodeKind, NodeState};
use crate::compat::{Arc, Mutex, RwLock, Weak};
use crate::lockfree::{AtomicCounter, AtomicFlag};
use crate::report::{FaultKind, FaultSink};
use crate::{Error, Result};
use arc_swap::ArcSwapOption;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thread_priority::ThreadPriority;

/// Identifier of a thread node, unique within the tree it is attached to.
///
/// Ids come from a counter shared by every node of one tree. A node attached
/// somewhere is renumbered from its new tree's counter, together with its
/// subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Unrecoverable failure of a node's work for one tic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFault {
    pub message: String,
}

impl NodeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for NodeFault {}

impl From<String> for NodeFault {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for NodeFault {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Settings shared by every node of one scheduler tree.
#[derive(Debug, Clone)]
pub struct TickEnv {
    pub period: Duration,
    pub faults: FaultSink,
    pub realtime_priority: bool,
}

/// What a node's work function sees for one tic.
pub struct TicContext<'a> {
    tic: u64,
    node: &'a ThreadNode,
    env: Option<Arc<TickEnv>>,
}

impl<'a> TicContext<'a> {
    #[inline]
    pub fn tic(&self) -> u64 {
        self.tic
    }

    #[inline]
    pub fn node(&self) -> &'a ThreadNode {
        self.node
    }

    /// Hardware period, or zero when the node is not part of a scheduler.
    pub fn period(&self) -> Duration {
        self.env.as_ref().map(|env| env.period).unwrap_or_default()
    }

    /// Posts a non-fatal fault attributed to this node.
    pub fn report(&self, kind: FaultKind, source: impl Into<String>, message: impl Into<String>) {
        if let Some(env) = &self.env {
            env.faults.report(self.tic, kind, source, message);
        }
    }

    /// Runs `wait` with the node marked as waiting on a sibling.
    pub fn wait_for_sibling<R>(&self, wait: impl FnOnce() -> R) -> R {
        let _ = self.node.state.transition(NodeState::WaitingForSibling);
        let result = wait();
        let _ = self.node.state.transition(NodeState::Running);
        result
    }
}

/// Work a node performs once per tic.
pub trait ThreadWork: Send + 'static {
    fn run(&mut self, ctx: &TicContext<'_>) -> core::result::Result<(), NodeFault>;
}

impl<F> ThreadWork for F
where
    F: FnMut(&TicContext<'_>) -> core::result::Result<(), NodeFault> + Send + 'static,
{
    fn run(&mut self, ctx: &TicContext<'_>) -> core::result::Result<(), NodeFault> {
        self(ctx)
    }
}

/// Work function that does nothing; used for pure fan-out nodes.
pub fn idle_work() -> impl ThreadWork {
    |_: &TicContext<'_>| -> core::result::Result<(), NodeFault> { Ok(()) }
}

/// One schedulable unit of the thread tree.
///
/// A node is woken once per tic through the gate on its parent edge, runs its
/// work, wakes its children, waits for the blocking ones and then reports
/// completion to its parent. Children that were never started run inline on
/// the parent's thread.
pub struct ThreadNode {
    id: AtomicCounter,
    ids: RwLock<Arc<AtomicCounter>>,
    name: String,
    kind: NodeKind,
    state: AtomicNodeState,
    parent: RwLock<Weak<ThreadNode>>,
    children: RwLock<Vec<Arc<ThreadNode>>>,
    gate: TicGate,
    work: Mutex<Box<dyn ThreadWork>>,
    env: ArcSwapOption<TickEnv>,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicFlag,
    last_tic: AtomicCounter,
    tics_run: AtomicCounter,
}

impl fmt::Debug for ThreadNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadNode")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl ThreadNode {
    pub fn new(name: impl Into<String>, kind: NodeKind, work: impl ThreadWork) -> Arc<Self> {
        let gate = if kind.is_blocking() {
            TicGate::new()
        } else {
            TicGate::lossy()
        };

        let ids = Arc::new(AtomicCounter::new(0));
        Arc::new(Self {
            id: AtomicCounter::new(ids.incr()),
            ids: RwLock::new(ids),
            name: name.into(),
            kind,
            state: AtomicNodeState::new(NodeState::Idle),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
            gate,
            work: Mutex::new(Box::new(work)),
            env: ArcSwapOption::empty(),
            handle: Mutex::new(None),
            started: AtomicFlag::new(false),
            last_tic: AtomicCounter::default(),
            tics_run: AtomicCounter::default(),
        })
    }

    /// Builds a node from a closure.
    pub fn from_fn<F>(name: impl Into<String>, kind: NodeKind, work: F) -> Arc<Self>
    where
        F: FnMut(&TicContext<'_>) -> core::result::Result<(), NodeFault> + Send + 'static,
    {
        Self::new(name, kind, work)
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        NodeId(self.id.get())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    pub fn is_locked(&self) -> bool {
        self.state() == NodeState::Locked
    }

    /// Last tic this node finished.
    pub fn last_tic(&self) -> u64 {
        self.last_tic.get()
    }

    /// Number of tics this node's work ran.
    pub fn tics_run(&self) -> u64 {
        self.tics_run.get()
    }

    /// Edge gate between this node and its parent.
    pub fn gate(&self) -> &TicGate {
        &self.gate
    }

    pub fn parent(&self) -> Option<Arc<ThreadNode>> {
        self.parent.read().upgrade()
    }

    pub fn children(&self) -> Vec<Arc<ThreadNode>> {
        self.children.read().clone()
    }

    /// Other children of this node's parent.
    pub fn siblings(&self) -> Vec<Arc<ThreadNode>> {
        match self.parent() {
            Some(parent) => parent
                .children
                .read()
                .iter()
                .filter(|child| child.id() != self.id())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Root of the tree this node belongs to.
    pub fn toplevel(self: &Arc<Self>) -> Arc<ThreadNode> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// This node and all descendants, breadth-first.
    pub fn descendants(self: &Arc<Self>) -> Vec<Arc<ThreadNode>> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([Arc::clone(self)]);
        while let Some(node) = queue.pop_front() {
            queue.extend(node.children.read().iter().cloned());
            out.push(node);
        }
        out
    }

    /// First node of `kind` in this subtree, breadth-first.
    pub fn find_kind(self: &Arc<Self>, kind: NodeKind) -> Option<Arc<ThreadNode>> {
        self.descendants().into_iter().find(|node| node.kind == kind)
    }

    pub fn find(self: &Arc<Self>, id: NodeId) -> Option<Arc<ThreadNode>> {
        self.descendants().into_iter().find(|node| node.id() == id)
    }

    pub fn add_child(self: &Arc<Self>, child: Arc<ThreadNode>) -> Result<()> {
        if child.parent().is_some() || Arc::ptr_eq(&child, &self.toplevel()) {
            return Err(Error::AlreadyAttached(child.id()));
        }

        *child.parent.write() = Arc::downgrade(self);
        let ids = Arc::clone(&self.ids.read());
        for node in child.descendants() {
            node.id.set(ids.incr());
            *node.ids.write() = Arc::clone(&ids);
        }
        if let Some(env) = self.env.load_full() {
            child.set_env(env);
        }
        self.children.write().push(child);
        Ok(())
    }

    /// Detaches a child and stops its subtree.
    pub fn remove_child(&self, id: NodeId) -> Result<Arc<ThreadNode>> {
        let child = {
            let mut children = self.children.write();
            let pos = children
                .iter()
                .position(|child| child.id() == id)
                .ok_or(Error::NodeNotFound(id))?;
            children.remove(pos)
        };

        child.stop();
        *child.parent.write() = Weak::new();
        Ok(child)
    }

    pub(crate) fn set_env(&self, env: Arc<TickEnv>) {
        for child in self.children.read().iter() {
            child.set_env(Arc::clone(&env));
        }
        self.env.store(Some(env));
    }

    /// Spawns this node's thread. Calling it on a started node does nothing.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true) {
            return Ok(());
        }

        self.gate.reopen();
        let _ = self.state.transition(NodeState::WaitingForParent);

        let node = Arc::clone(self);
        let realtime = self
            .env
            .load_full()
            .is_some_and(|env| env.realtime_priority);

        let spawned = thread::Builder::new()
            .name(format!("tactus-{}", self.name))
            .spawn(move || {
                if realtime {
                    let _ = thread_priority::set_current_thread_priority(ThreadPriority::Max);
                }
                worker_loop(node);
            });

        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                tracing::debug!(node = %self.id(), name = %self.name, kind = ?self.kind, "Node started");
                Ok(())
            }
            Err(source) => {
                self.started.set(false);
                let _ = self.state.transition(NodeState::Idle);
                Err(Error::ThreadSpawn {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Starts every node below this one. This node itself is left alone.
    pub fn start_children(self: &Arc<Self>) -> Result<()> {
        for node in self.descendants().iter().skip(1) {
            node.start()?;
        }
        Ok(())
    }

    /// Stops this node's subtree and joins the threads.
    pub fn stop(&self) {
        for child in self.children.read().iter() {
            child.stop();
        }

        self.gate.close();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        if self.started.swap(false) {
            tracing::debug!(node = %self.id(), name = %self.name, "Node stopped");
        }
        let _ = self.state.transition(NodeState::Idle);
    }

    /// Brings a locked node back into scheduling. Returns `false` if the node
    /// was not locked.
    pub fn reset(&self) -> bool {
        if !self.is_locked() {
            return false;
        }

        let _ = self.state.transition(NodeState::Idle);
        if !self.gate.is_closed() {
            self.gate.reopen();
        }
        if self.is_started() {
            let _ = self.state.transition(NodeState::WaitingForParent);
        }
        tracing::debug!(node = %self.id(), name = %self.name, "Node reset");
        true
    }

    /// Runs one tic: own work first, then the children.
    pub(crate) fn run_tic(&self, tic: u64) {
        if !self.enter_running() {
            return;
        }

        let ctx = TicContext {
            tic,
            node: self,
            env: self.env.load_full(),
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.work.lock().run(&ctx)
        }));
        self.tics_run.incr();

        let fault = match result {
            Ok(Ok(())) => None,
            Ok(Err(fault)) => Some(fault.message),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        if let Some(message) = fault {
            self.quarantine(&ctx, message);
            return;
        }

        let _ = self.state.transition(NodeState::WaitingForChildren);
        self.run_children(&ctx);
        self.last_tic.set(tic);
        let _ = self.state.transition(NodeState::WaitingForParent);
    }

    fn enter_running(&self) -> bool {
        match self.state() {
            NodeState::Locked => false,
            NodeState::Idle => {
                let _ = self.state.transition(NodeState::WaitingForParent);
                self.state.transition(NodeState::Running).is_ok()
            }
            _ => self.state.transition(NodeState::Running).is_ok(),
        }
    }

    fn run_children(&self, ctx: &TicContext<'_>) {
        let tic = ctx.tic;
        let children = self.children.read();

        for child in children.iter() {
            if child.is_locked() {
                continue;
            }
            if !child.is_started() {
                child.run_tic(tic);
                continue;
            }
            if let Err(err) = child.gate.dispatch(tic) {
                ctx.report(FaultKind::GateNotReady, child.name.as_str(), err.to_string());
            }
        }

        for child in children.iter() {
            if child.kind.is_blocking() && child.is_started() && child.gate.pending() == Some(tic) {
                child.gate.wait_complete(tic, None);
            }
        }
    }

    fn quarantine(&self, ctx: &TicContext<'_>, message: String) {
        let _ = self.state.transition(NodeState::Locked);
        tracing::error!(node = %self.id(), name = %self.name, tic = ctx.tic, "Node locked: {message}");
        ctx.report(FaultKind::FatalNode, self.name.as_str(), message);
    }
}

fn worker_loop(node: Arc<ThreadNode>) {
    let mut last = node.gate.completed();
    while let Some(tic) = node.gate.wait_dispatch(last) {
        last = tic;
        node.run_tic(tic);
        node.gate.complete(tic);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::fault_channel;

    fn counting(name: &str, counter: Arc<AtomicCounter>) -> Arc<ThreadNode> {
        ThreadNode::from_fn(name, NodeKind::Channel, move |_| {
            counter.incr();
            Ok(())
        })
    }

    #[test]
    fn test_inline_children_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let make = |label: &'static str, kind: NodeKind| {
            let order = Arc::clone(&order);
            ThreadNode::from_fn(label, kind, move |_| {
                order.lock().push(label);
                Ok(())
            })
        };

        let root = make("root", NodeKind::Root);
        let a = make("a", NodeKind::Audio);
        let a1 = make("a1", NodeKind::Channel);
        a.add_child(a1).unwrap();
        root.add_child(a).unwrap();

        root.run_tic(1);
        assert_eq!(*order.lock(), vec!["root", "a", "a1"]);
        assert_eq!(root.state(), NodeState::WaitingForParent);
    }

    #[test]
    fn test_add_child_twice_fails() {
        let root = ThreadNode::new("root", NodeKind::Root, idle_work());
        let other = ThreadNode::new("other", NodeKind::Root, idle_work());
        let child = ThreadNode::new("c", NodeKind::Channel, idle_work());
        root.add_child(Arc::clone(&child)).unwrap();
        assert!(matches!(
            other.add_child(child),
            Err(Error::AlreadyAttached(_))
        ));
    }

    #[test]
    fn test_threaded_child_runs_each_tic() {
        let counter = Arc::new(AtomicCounter::default());
        let root = ThreadNode::new("root", NodeKind::Root, idle_work());
        let child = counting("c", Arc::clone(&counter));
        root.add_child(Arc::clone(&child)).unwrap();
        child.start().unwrap();

        for tic in 1..=10 {
            root.run_tic(tic);
        }
        assert_eq!(counter.get(), 10);
        assert_eq!(child.last_tic(), 10);
        root.stop();
        assert_eq!(child.state(), NodeState::Idle);
    }

    #[test]
    fn test_start_is_idempotent() {
        let counter = Arc::new(AtomicCounter::default());
        let root = ThreadNode::new("root", NodeKind::Root, idle_work());
        let child = counting("c", Arc::clone(&counter));
        root.add_child(Arc::clone(&child)).unwrap();

        child.start().unwrap();
        child.start().unwrap();
        root.run_tic(1);
        root.run_tic(2);
        assert_eq!(counter.get(), 2);
        root.stop();
    }

    #[test]
    fn test_failing_node_is_locked_and_skipped() {
        let (sink, mut agg) = fault_channel(8);
        let reports = agg.reports();
        let counter = Arc::new(AtomicCounter::default());

        let root = ThreadNode::new("root", NodeKind::Root, idle_work());
        let bad = ThreadNode::from_fn("bad", NodeKind::Channel, |ctx| {
            if ctx.tic() == 2 {
                panic!("bad sample");
            }
            Ok(())
        });
        let good = counting("good", Arc::clone(&counter));
        root.add_child(Arc::clone(&bad)).unwrap();
        root.add_child(good).unwrap();
        root.set_env(Arc::new(TickEnv {
            period: Duration::from_millis(10),
            faults: sink,
            realtime_priority: false,
        }));

        for tic in 1..=4 {
            root.run_tic(tic);
        }

        assert!(bad.is_locked());
        assert_eq!(bad.tics_run(), 2);
        assert_eq!(counter.get(), 4);

        agg.flush();
        let report = reports.try_recv().unwrap();
        assert_eq!(report.kind, FaultKind::FatalNode);
        assert_eq!(report.source, "bad");
        assert!(report.message.contains("bad sample"));

        assert!(bad.reset());
        root.run_tic(5);
        assert_eq!(bad.tics_run(), 3);
    }

    #[test]
    fn test_lookup_helpers() {
        let root = ThreadNode::new("root", NodeKind::Root, idle_work());
        let card = ThreadNode::new("card", NodeKind::Soundcard, idle_work());
        let track = ThreadNode::new("track", NodeKind::Audio, idle_work());
        let ch = ThreadNode::new("ch", NodeKind::Channel, idle_work());
        track.add_child(Arc::clone(&ch)).unwrap();
        root.add_child(Arc::clone(&card)).unwrap();
        root.add_child(Arc::clone(&track)).unwrap();

        assert_eq!(ch.toplevel().id(), root.id());
        assert_eq!(root.find_kind(NodeKind::Channel).unwrap().id(), ch.id());
        assert_eq!(card.siblings().len(), 1);
        assert_eq!(card.siblings()[0].id(), track.id());

        let removed = root.remove_child(track.id()).unwrap();
        assert!(removed.parent().is_none());
        assert!(root.find(ch.id()).is_none());
    }

    #[test]
    fn test_ids_come_from_the_owning_tree() {
        let first = ThreadNode::new("root", NodeKind::Root, idle_work());
        let second = ThreadNode::new("root", NodeKind::Root, idle_work());
        assert_eq!(first.id(), second.id());

        let track = ThreadNode::new("track", NodeKind::Audio, idle_work());
        let ch = ThreadNode::new("ch", NodeKind::Channel, idle_work());
        track.add_child(Arc::clone(&ch)).unwrap();
        first.add_child(Arc::clone(&track)).unwrap();

        let mut ids: Vec<_> = first.descendants().iter().map(|node| node.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(first.find(ch.id()).is_some());

        let stray = ThreadNode::new("stray", NodeKind::Channel, idle_work());
        second.add_child(Arc::clone(&stray)).unwrap();
        assert_eq!(stray.id().as_u64(), 2);
        assert!(matches!(
            stray.add_child(Arc::clone(&second)),
            Err(Error::AlreadyAttached(_))
        ));
        assert!(matches!(
            first.add_child(Arc::clone(&first)),
            Err(Error::AlreadyAttached(_))
        ));
    }
}
