//! Root of the thread tree: owns the tic clock and drives one round per
//! hardware pulse.

use super::node::{idle_work, panic_message, NodeId, ThreadNode, TickEnv};
use super::state::NodeKind;
use crate::backend::Pulse;
use crate::compat::{Arc, Mutex};
use crate::config::EngineConfig;
use crate::lockfree::AtomicFlag;
use crate::meter::{TicMeter, TicMetrics};
use crate::report::{fault_channel, FaultAggregator, FaultKind, FaultReport, FaultSink};
use crate::tic::TicClock;
use crate::{Error, Result};
use crossbeam_channel::Receiver;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thread_priority::ThreadPriority;

/// Upper bound on a missed pulse wakeup.
const PULSE_POLL: Duration = Duration::from_millis(2);

/// Work run between tics, after the whole tree finished and before the clock
/// advances. Topology changes are only safe here.
pub trait SafeWindow: Send + 'static {
    fn run(&mut self, tic: u64);
}

impl<F> SafeWindow for F
where
    F: FnMut(u64) + Send + 'static,
{
    fn run(&mut self, tic: u64) {
        self(tic)
    }
}

/// Shared handle to the thread tree below the root.
///
/// Cloned into graph-mutation tasks so they can add and remove worker nodes
/// without holding the scheduler itself.
#[derive(Debug, Clone)]
pub struct ThreadTree {
    root: Arc<ThreadNode>,
    workers: Arc<AtomicFlag>,
}

impl ThreadTree {
    pub fn root(&self) -> &Arc<ThreadNode> {
        &self.root
    }

    /// Whether worker nodes run on their own threads.
    pub fn workers_started(&self) -> bool {
        self.workers.get()
    }

    pub fn find(&self, id: NodeId) -> Option<Arc<ThreadNode>> {
        self.root.find(id)
    }

    pub fn find_kind(&self, kind: NodeKind) -> Option<Arc<ThreadNode>> {
        self.root.find_kind(kind)
    }

    /// Adds `child` below `parent`, starting its subtree if workers run.
    pub fn attach(&self, parent: &Arc<ThreadNode>, child: Arc<ThreadNode>) -> Result<()> {
        parent.add_child(Arc::clone(&child))?;
        if self.workers_started() {
            child.start()?;
            child.start_children()?;
        }
        tracing::debug!(node = %child.id(), name = child.name(), parent = parent.name(), "Node attached");
        Ok(())
    }

    /// Removes a node and stops its subtree.
    pub fn detach(&self, id: NodeId) -> Result<Arc<ThreadNode>> {
        let node = self.find(id).ok_or(Error::NodeNotFound(id))?;
        let parent = node.parent().ok_or(Error::NodeNotFound(id))?;
        let node = parent.remove_child(id)?;
        tracing::debug!(node = %id, name = node.name(), "Node detached");
        Ok(node)
    }

    pub fn start_workers(&self) -> Result<()> {
        self.root.start_children()?;
        self.workers.set(true);
        Ok(())
    }

    pub fn stop_workers(&self) {
        self.workers.set(false);
        self.root.stop();
    }
}

struct SchedulerInner {
    clock: TicClock,
    tree: ThreadTree,
    hooks: Mutex<Vec<Box<dyn SafeWindow>>>,
    faults: FaultSink,
    aggregator: Mutex<FaultAggregator>,
    meter: TicMeter,
    running: AtomicFlag,
    realtime_priority: bool,
    round: Mutex<()>,
}

impl SchedulerInner {
    /// One tic: the whole tree, then the safe window, then the clock.
    fn run_round(&self) -> u64 {
        let _round = self.round.lock();
        let tic = self.clock.current();

        self.tree.root.run_tic(tic);
        for hook in self.hooks.lock().iter_mut() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook.run(tic))) {
                let message = panic_message(payload.as_ref());
                tracing::error!(tic, "Safe window hook failed: {message}");
                self.faults.report(tic, FaultKind::FatalNode, "safe-window", message);
            }
        }
        self.clock.advance();
        tic
    }

    fn end_tic(&self, tic: u64) {
        self.aggregator.lock().end_tic(tic);
    }
}

/// Drives the thread tree in lock-step with the hardware period.
///
/// Rounds run either on a dedicated root thread that waits on a [`Pulse`]
/// ([`TicScheduler::start`]) or synchronously on the caller
/// ([`TicScheduler::tick`]).
pub struct TicScheduler {
    inner: Arc<SchedulerInner>,
    root_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TicScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        let (faults, aggregator) = fault_channel(config.fault_capacity);
        let root = ThreadNode::new("root", NodeKind::Root, idle_work());
        root.set_env(Arc::new(TickEnv {
            period: config.period(),
            faults: faults.clone(),
            realtime_priority: config.realtime_priority,
        }));

        Self {
            inner: Arc::new(SchedulerInner {
                clock: TicClock::new(),
                tree: ThreadTree {
                    root,
                    workers: Arc::new(AtomicFlag::new(false)),
                },
                hooks: Mutex::new(Vec::new()),
                faults,
                aggregator: Mutex::new(aggregator),
                meter: TicMeter::new(config.period()),
                running: AtomicFlag::new(false),
                realtime_priority: config.realtime_priority,
                round: Mutex::new(()),
            }),
            root_thread: Mutex::new(None),
        }
    }

    pub fn clock(&self) -> &TicClock {
        &self.inner.clock
    }

    pub fn root(&self) -> &Arc<ThreadNode> {
        &self.inner.tree.root
    }

    pub fn tree(&self) -> ThreadTree {
        self.inner.tree.clone()
    }

    /// Realtime side of the fault channel.
    pub fn faults(&self) -> FaultSink {
        self.inner.faults.clone()
    }

    /// Aggregated fault reports.
    pub fn reports(&self) -> Receiver<FaultReport> {
        self.inner.aggregator.lock().reports()
    }

    pub fn metrics(&self) -> TicMetrics {
        self.inner.meter.metrics()
    }

    pub fn overruns(&self) -> u64 {
        self.inner.meter.overruns()
    }

    /// Registers work for the safe window. Hooks run in registration order.
    pub fn add_safe_window(&self, hook: impl SafeWindow) {
        self.inner.hooks.lock().push(Box::new(hook));
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Runs one round on the calling thread. Fails while the root thread runs.
    pub fn tick(&self) -> Result<u64> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        let started = Instant::now();
        let tic = self.inner.run_round();
        self.inner.meter.record(started.elapsed());
        self.inner.end_tic(tic);
        Ok(tic)
    }

    /// Starts worker threads and the root thread, which runs one round per
    /// pulse. Does nothing if already running.
    pub fn start(&self, pulse: Arc<Pulse>) -> Result<()> {
        if self.inner.running.swap(true) {
            return Ok(());
        }

        if let Err(err) = self.inner.tree.start_workers() {
            self.inner.running.set(false);
            return Err(err);
        }

        // Pulses from here on are rounds, even if the root thread is slow to start
        let seen = pulse.count();
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("tactus-root".into())
            .spawn(move || {
                if inner.realtime_priority {
                    let _ = thread_priority::set_current_thread_priority(ThreadPriority::Max);
                }
                root_loop(inner, pulse, seen);
            });

        match spawned {
            Ok(handle) => {
                *self.root_thread.lock() = Some(handle);
                tracing::debug!("Scheduler started");
                Ok(())
            }
            Err(source) => {
                self.inner.running.set(false);
                self.inner.tree.stop_workers();
                Err(Error::ThreadSpawn {
                    name: "tactus-root".into(),
                    source,
                })
            }
        }
    }

    /// Stops the root thread and every worker, then publishes pending faults.
    pub fn stop(&self) {
        let was_running = self.inner.running.swap(false);
        if let Some(handle) = self.root_thread.lock().take() {
            let _ = handle.join();
        }
        self.inner.tree.stop_workers();
        self.inner.aggregator.lock().flush();
        if was_running {
            tracing::debug!(tic = self.clock().current(), "Scheduler stopped");
        }
    }

    /// Runs `f` while no round is in progress. A round that comes due
    /// meanwhile waits for `f` to return.
    pub fn between_rounds<R>(&self, f: impl FnOnce() -> R) -> R {
        let _round = self.inner.round.lock();
        f()
    }

    /// Publishes every open fault report now.
    pub fn flush_faults(&self) -> usize {
        self.inner.aggregator.lock().flush()
    }
}

impl Drop for TicScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn root_loop(inner: Arc<SchedulerInner>, pulse: Arc<Pulse>, mut seen: u64) {
    while inner.running.get() {
        let now = pulse.wait(seen, PULSE_POLL);
        if now == seen {
            continue;
        }
        // Pulses missed during a late tic collapse into this one round
        seen = now;

        let started = Instant::now();
        let tic = inner.run_round();
        inner.meter.record(started.elapsed());

        let after = pulse.count();
        if after > seen {
            let late = after - seen;
            let total = inner.meter.record_overrun(late);
            tracing::warn!(tic, late_pulses = late, overruns = total, "Tic overrun");
            inner.faults.report(
                tic,
                FaultKind::Overrun,
                "root",
                crate::SchedulingError::Overrun {
                    tic,
                    late_pulses: late,
                }
                .to_string(),
            );
        }

        inner.end_tic(tic);
    }
}
