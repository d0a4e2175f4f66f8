//! TactusEngine that wires the tic scheduler, the task queue and the recall
//! graph together.

use crate::context::{BackendSlot, EngineContext};
use crate::tasks::{
    AddDependency, AddTrack, AttachEffect, CancelInvocation, ChangeLink, DetachEffect,
    MoveChannel, RemoveDependency, ResizePads, StartInvocation, SwapBackend,
};
use crate::view::GraphView;
use crate::{Error, Result};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tactus_core::{
    Backend, BackendPresets, DrainReport, EngineConfig, FaultReport, FaultSink, MixBus, NodeKind,
    Pulse, Task, TaskError, TaskId, TaskOutcome, TaskQueue, TaskTicket, ThreadNode, ThreadTree,
    ThreadWork, TicClock, TicMetrics, TicScheduler,
};
use tactus_recall::{
    ChannelId, ContainerId, EffectSpec, InvocationEvent, InvocationId, Purpose, RecallGraph,
    RecallId, TemplateId, TrackId,
};
use tracing::{debug, error};

/// How often [`TactusEngine::apply`] rechecks whether the scheduler is still
/// running while it waits for a ticket.
const APPLY_POLL: Duration = Duration::from_millis(20);

/// State reached from the safe window. Held by the scheduler hook, so it must
/// not own the scheduler.
pub(crate) struct EngineShared {
    ctx: Mutex<EngineContext>,
    tasks: TaskQueue<EngineContext>,
}

impl EngineShared {
    pub(crate) fn new(ctx: EngineContext) -> Self {
        Self {
            ctx: Mutex::new(ctx),
            tasks: TaskQueue::new(),
        }
    }

    /// End of tic `tic`: pending tasks, then nodes, then schedules, then the
    /// mix goes out.
    pub(crate) fn safe_window(&self, tic: u64) {
        let mut ctx = self.ctx.lock();
        let report = self.tasks.drain(&mut ctx);
        if !report.is_empty() {
            debug!(tic, completed = report.completed, failed = report.failed, "Tasks drained");
        }
        if let Err(e) = ctx.sync_nodes() {
            error!(tic, "Thread tree out of sync: {}", e);
        }
        ctx.graph().maintain(tic);
        ctx.bus().swap();
    }

    /// Same as the safe window minus the clock-bound parts, for an engine
    /// that is not ticking.
    fn settle(&self) -> DrainReport {
        let mut ctx = self.ctx.lock();
        let report = self.tasks.drain(&mut ctx);
        if let Err(e) = ctx.sync_nodes() {
            error!("Thread tree out of sync: {}", e);
        }
        ctx.graph().refresh();
        report
    }
}

/// Realtime sequencer engine.
///
/// All structural changes go through [`Task`]s, which run between two tics.
/// [`apply`](Self::apply) submits one and waits for it; [`submit`](Self::submit)
/// only queues it.
///
/// # Example
///
/// ```ignore
/// use tactus::prelude::*;
///
/// let engine = TactusEngine::builder()
///     .backend(VirtualBackend::new(presets))
///     .build()?;
///
/// let (track, pads) = engine.add_track(2)?;
/// engine.attach_effect(
///     EffectSpec::on_channel("gain", track, pads[0])
///         .with(RecallSpec::new("gain", RecallLevel::Chunk, processor_fn(|ctx| {
///             ctx.buffer.fill(0.5);
///             Ok(StageOutcome::Continue)
///         }))),
/// )?;
/// engine.start_invocation(Purpose::Playback, &[track])?;
/// engine.start()?;
/// ```
pub struct TactusEngine {
    config: EngineConfig,
    scheduler: TicScheduler,
    graph: GraphView,
    bus: Arc<MixBus>,
    backend: BackendSlot,
    pulse: Arc<Pulse>,
    shared: Arc<EngineShared>,
}

impl TactusEngine {
    pub fn builder() -> crate::TactusEngineBuilder {
        crate::TactusEngineBuilder::default()
    }

    pub(crate) fn from_parts(
        config: EngineConfig,
        scheduler: TicScheduler,
        graph: Arc<RecallGraph>,
        bus: Arc<MixBus>,
        backend: BackendSlot,
        pulse: Arc<Pulse>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            config,
            scheduler,
            graph: GraphView::new(graph),
            bus,
            backend,
            pulse,
            shared,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Read-only view of the recall graph. Changes go through tasks.
    pub fn graph(&self) -> &GraphView {
        &self.graph
    }

    pub fn bus(&self) -> &Arc<MixBus> {
        &self.bus
    }

    pub fn tree(&self) -> ThreadTree {
        self.scheduler.tree()
    }

    pub fn clock(&self) -> &TicClock {
        self.scheduler.clock()
    }

    pub fn backend_presets(&self) -> Option<BackendPresets> {
        self.backend.lock().as_ref().map(|b| b.presets())
    }

    // =========================================================================
    // Running
    // =========================================================================

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Runs one tic on the calling thread and returns its number.
    pub fn tick(&self) -> Result<u64> {
        Ok(self.scheduler.tick()?)
    }

    /// Starts the worker threads and the backend. Rounds then follow the
    /// backend's pulse. Calling it again while running does nothing.
    pub fn start(&self) -> Result<()> {
        if self.scheduler.is_running() {
            return Ok(());
        }
        if self.backend.lock().is_none() {
            return Err(Error::NoBackend);
        }

        self.settle();
        self.scheduler.start(Arc::clone(&self.pulse))?;

        let started = match self.backend.lock().as_mut() {
            Some(backend) if backend.is_running() => Ok(()),
            Some(backend) => backend.start(Arc::clone(&self.pulse)),
            None => Ok(()),
        };
        if let Err(e) = started {
            self.scheduler.stop();
            return Err(e.into());
        }
        debug!(tic = self.clock().current(), "Engine started");
        Ok(())
    }

    /// Stops the backend, then the scheduler.
    pub fn stop(&self) {
        if let Some(backend) = self.backend.lock().as_mut() {
            backend.stop();
        }
        self.scheduler.stop();
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Queues `task` for the next safe window.
    pub fn submit(&self, task: impl Task<EngineContext>) -> TaskTicket {
        self.shared.tasks.submit(task)
    }

    /// Queues `task`; `callback` sees each outcome on the thread that
    /// produced it.
    pub fn submit_with(
        &self,
        task: impl Task<EngineContext>,
        callback: impl FnMut(&TaskOutcome) + Send + 'static,
    ) -> TaskId {
        self.shared.tasks.submit_with(task, callback)
    }

    /// Takes a cyclic task out of the queue. Its ticket reports
    /// [`TaskOutcome::Removed`].
    pub fn remove_cyclic(&self, id: TaskId) -> bool {
        self.shared.tasks.remove_cyclic(id)
    }

    /// Runs pending tasks now instead of at the end of the next tic. Waits
    /// for a round in progress to finish first.
    pub fn settle(&self) -> DrainReport {
        self.scheduler.between_rounds(|| self.shared.settle())
    }

    /// Submits `task` and waits until it ran. A `LOCKED` task that coalesced
    /// into an identical pending one counts as applied.
    pub fn apply(&self, task: impl Task<EngineContext>) -> Result<()> {
        let ticket = self.submit(task);
        loop {
            if !self.scheduler.is_running() {
                self.settle();
            }
            if let Some(outcome) = ticket.wait_timeout(APPLY_POLL) {
                return match outcome {
                    TaskOutcome::Completed | TaskOutcome::Coalesced | TaskOutcome::Removed => {
                        Ok(())
                    }
                    TaskOutcome::Failed(e) => Err(e.into()),
                };
            }
        }
    }

    fn reply<T>(&self, task: &str, rx: Receiver<T>) -> Result<T> {
        rx.try_recv()
            .map_err(|_| TaskError::execution(task, "task finished without a result").into())
    }

    /// Adds a track with `pads` channels.
    pub fn add_track(&self, pads: usize) -> Result<(TrackId, Vec<ChannelId>)> {
        let (task, rx) = AddTrack::with_reply(pads);
        self.apply(task)?;
        self.reply("add-track", rx)
    }

    /// Attaches an effect. Level and dependency problems are reported
    /// before anything is queued.
    pub fn attach_effect(&self, spec: EffectSpec) -> Result<ContainerId> {
        self.graph.check_attach(&spec)?;
        let (task, rx) = AttachEffect::with_reply(spec);
        self.apply(task)?;
        self.reply("attach-effect", rx)
    }

    pub fn detach_effect(&self, container: ContainerId) -> Result<()> {
        self.apply(DetachEffect::new(container))
    }

    pub fn resize_pads(&self, track: TrackId, pads: usize) -> Result<()> {
        self.apply(ResizePads::new(track, pads))
    }

    /// Makes `from` run after `to`. Cycles and granularity problems are
    /// reported before anything is queued.
    pub fn add_dependency(&self, from: TemplateId, to: TemplateId) -> Result<()> {
        self.graph.check_dependency(from, to)?;
        self.apply(AddDependency::new(from, to))
    }

    pub fn remove_dependency(&self, from: TemplateId, to: TemplateId) -> Result<()> {
        self.apply(RemoveDependency::new(from, to))
    }

    /// Moves `channel` to `pos` in the invocation's run order.
    pub fn move_channel(&self, invocation: InvocationId, channel: ChannelId, pos: usize) -> Result<()> {
        self.graph.check_move(invocation, channel, pos)?;
        self.apply(MoveChannel::new(invocation, channel, pos))
    }

    pub fn change_link(&self, channel: ChannelId, upstream: Option<ChannelId>) -> Result<()> {
        self.graph.check_link(channel, upstream)?;
        self.apply(ChangeLink::new(channel, upstream))
    }

    pub fn swap_backend(&self, backend: impl Backend + 'static) -> Result<()> {
        self.apply(SwapBackend::new(backend))
    }

    pub fn start_invocation(&self, purpose: Purpose, tracks: &[TrackId]) -> Result<RecallId> {
        let (task, rx) = StartInvocation::with_reply(purpose, tracks.to_vec());
        self.apply(task)?;
        self.reply("start-invocation", rx)
    }

    pub fn cancel_invocation(&self, id: InvocationId) -> Result<()> {
        self.apply(CancelInvocation::new(id))
    }

    /// Invocation lifecycle events.
    pub fn events(&self) -> Receiver<InvocationEvent> {
        self.graph.events()
    }

    // =========================================================================
    // Thread tree
    // =========================================================================

    /// Adds a non-blocking worker below the root. It gets the newest tic when
    /// it is free again; the tree never waits for it.
    pub fn attach_async(
        &self,
        name: impl Into<String>,
        work: impl ThreadWork,
    ) -> Result<Arc<ThreadNode>> {
        let node = ThreadNode::new(name, NodeKind::Async, work);
        let tree = self.scheduler.tree();
        self.scheduler
            .between_rounds(|| tree.attach(tree.root(), Arc::clone(&node)))?;
        Ok(node)
    }

    // =========================================================================
    // Faults and load
    // =========================================================================

    /// Aggregated fault reports, one per fault source and kind per tic.
    pub fn reports(&self) -> Receiver<FaultReport> {
        self.scheduler.reports()
    }

    /// Sink for faults raised outside the thread tree.
    pub fn faults(&self) -> FaultSink {
        self.scheduler.faults()
    }

    /// Publishes every open fault report now.
    pub fn flush_faults(&self) -> usize {
        self.scheduler.flush_faults()
    }

    pub fn overruns(&self) -> u64 {
        self.scheduler.overruns()
    }

    pub fn metrics(&self) -> TicMetrics {
        self.scheduler.metrics()
    }
}

impl Drop for TactusEngine {
    fn drop(&mut self) {
        self.stop();
        self.shared.tasks.close();
    }
}
