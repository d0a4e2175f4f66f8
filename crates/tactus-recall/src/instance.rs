//! Per-invocation recall instances.

use crate::error::Result;
use crate::ids::{InvocationId, RecyclingId, TemplateId};
use crate::recall::{ProcessContext, RecallLevel, RecallProcessor, RecallTemplate, Stage, StageOutcome};
use crate::recall_id::RecallId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tactus_core::{AtomicCounter, AtomicFlag, MixBus};

/// Identity of an instance: one template duplicated for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub template: TemplateId,
    pub invocation: InvocationId,
}

/// Marks the last tic an instance finished its stages for.
#[derive(Debug, Default)]
pub(crate) struct RunLatch {
    tic: Mutex<u64>,
    cond: Condvar,
}

impl RunLatch {
    pub(crate) fn mark(&self, tic: u64) {
        let mut done = self.tic.lock();
        if tic > *done {
            *done = tic;
        }
        self.cond.notify_all();
    }

    pub(crate) fn is_marked(&self, tic: u64) -> bool {
        *self.tic.lock() >= tic
    }

    /// Waits until `tic` is marked. Returns `false` on timeout.
    pub(crate) fn wait(&self, tic: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.tic.lock();
        while *done < tic {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done >= tic;
            }
        }
        true
    }
}

struct InstanceBody {
    processor: Box<dyn RecallProcessor>,
    buffer: Vec<f32>,
}

/// How one tic of an instance went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Executed {
    /// RUN happened.
    Ran,
    /// Dependencies were not ready; RUN was skipped for this tic.
    Stalled,
    /// Cancelled before or during the tic; nothing was committed.
    Cancelled,
    /// Already finished.
    Inactive,
}

/// One recall template duplicated for one invocation.
pub struct RecallInstance {
    key: InstanceKey,
    template: Arc<RecallTemplate>,
    recall_id: RecallId,
    recycling: Option<RecyclingId>,
    stage: AtomicU8,
    cancelled: AtomicFlag,
    quarantined: AtomicFlag,
    initialized: AtomicFlag,
    body: Mutex<InstanceBody>,
    pub(crate) latch: RunLatch,
    init_count: AtomicCounter,
    run_count: AtomicCounter,
    init_tic: AtomicCounter,
    first_run_tic: AtomicCounter,
    last_run_tic: AtomicCounter,
}

impl std::fmt::Debug for RecallInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecallInstance")
            .field("key", &self.key)
            .field("name", &self.template.name)
            .field("level", &self.template.level)
            .field("stage", &self.stage())
            .finish()
    }
}

impl RecallInstance {
    pub(crate) fn new(
        template: Arc<RecallTemplate>,
        recall_id: RecallId,
        recycling: Option<RecyclingId>,
        frames: usize,
    ) -> Self {
        let processor = template.duplicate_processor();
        Self {
            key: InstanceKey {
                template: template.id,
                invocation: recall_id.id(),
            },
            template,
            recall_id,
            recycling,
            stage: AtomicU8::new(Stage::Init.to_u8()),
            cancelled: AtomicFlag::new(false),
            quarantined: AtomicFlag::new(false),
            initialized: AtomicFlag::new(false),
            body: Mutex::new(InstanceBody {
                processor,
                buffer: vec![0.0; frames],
            }),
            latch: RunLatch::default(),
            init_count: AtomicCounter::default(),
            run_count: AtomicCounter::default(),
            init_tic: AtomicCounter::default(),
            first_run_tic: AtomicCounter::default(),
            last_run_tic: AtomicCounter::default(),
        }
    }

    pub fn key(&self) -> InstanceKey {
        self.key
    }

    pub fn template(&self) -> &RecallTemplate {
        &self.template
    }

    pub fn level(&self) -> RecallLevel {
        self.template.level
    }

    pub fn recall_id(&self) -> &RecallId {
        &self.recall_id
    }

    pub fn recycling(&self) -> Option<RecyclingId> {
        self.recycling
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    fn set_stage(&self, stage: Stage) {
        self.stage.store(stage.to_u8(), Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.get()
    }

    pub fn is_done(&self) -> bool {
        self.stage() == Stage::Done
    }

    /// Still scheduled: not finished, cancelled or quarantined.
    pub fn is_active(&self) -> bool {
        !self.stage().is_final() && !self.is_cancelled() && !self.is_quarantined()
    }

    /// Times INIT ran; at most one.
    pub fn init_count(&self) -> u64 {
        self.init_count.get()
    }

    pub fn run_count(&self) -> u64 {
        self.run_count.get()
    }

    /// Tic of INIT, or 0 if it never ran.
    pub fn init_tic(&self) -> u64 {
        self.init_tic.get()
    }

    /// Tic of the first RUN, or 0 if it never ran.
    pub fn first_run_tic(&self) -> u64 {
        self.first_run_tic.get()
    }

    pub fn last_run_tic(&self) -> u64 {
        self.last_run_tic.get()
    }

    /// Requests cancellation; observed at the next stage check.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true) {
            tracing::debug!(recall = %self.template.label(), invocation = %self.key.invocation, "Recall cancelled");
        }
    }

    pub(crate) fn quarantine(&self) {
        self.quarantined.set(true);
    }

    pub(crate) fn mark_removed(&self) {
        self.set_stage(Stage::Removed);
    }

    /// Runs INIT (once), PRE-RUN, RUN and POST-RUN for `tic`.
    ///
    /// `wait_deps` runs between PRE-RUN and RUN; if it returns `false` RUN is
    /// skipped. A chunk instance commits its buffer to `bus` at POST-RUN, on
    /// output channel `output`, unless it was cancelled meanwhile.
    pub(crate) fn execute(
        &self,
        tic: u64,
        wait_deps: impl FnOnce() -> bool,
        bus: &MixBus,
        output: Option<usize>,
    ) -> Result<Executed> {
        if !self.is_active() {
            if self.is_cancelled() {
                self.finish_cancel();
            }
            return Ok(Executed::Inactive);
        }

        let mut body = self.body.lock();
        let InstanceBody { processor, buffer } = &mut *body;
        if buffer.len() != bus.frames() {
            buffer.resize(bus.frames(), 0.0);
        }
        buffer.fill(0.0);

        let template = &self.template;
        let mut ctx = ProcessContext {
            tic,
            stage: Stage::Init,
            recall_id: &self.recall_id,
            level: template.level,
            track: template.track,
            channel: template.channel,
            recycling: self.recycling,
            buffer: buffer.as_mut_slice(),
        };

        if !self.initialized.get() {
            self.set_stage(Stage::Init);
            processor.init(&mut ctx)?;
            self.initialized.set(true);
            self.init_count.incr();
            self.init_tic.set(tic);
        }

        if self.is_cancelled() {
            drop(body);
            self.finish_cancel();
            return Ok(Executed::Cancelled);
        }

        self.set_stage(Stage::PreRun);
        ctx.stage = Stage::PreRun;
        let mut done = processor.run_pre(&mut ctx)? == StageOutcome::Done;

        let ready = wait_deps();
        if self.is_cancelled() {
            drop(body);
            self.finish_cancel();
            return Ok(Executed::Cancelled);
        }

        if ready {
            self.set_stage(Stage::Run);
            ctx.stage = Stage::Run;
            done |= processor.run(&mut ctx)? == StageOutcome::Done;
            if self.run_count.incr() == 1 {
                self.first_run_tic.set(tic);
            }
            self.last_run_tic.set(tic);
        }

        self.set_stage(Stage::PostRun);
        ctx.stage = Stage::PostRun;
        done |= processor.run_post(&mut ctx)? == StageOutcome::Done;

        if self.is_cancelled() {
            drop(body);
            self.finish_cancel();
            return Ok(Executed::Cancelled);
        }

        if ready && template.level == RecallLevel::Chunk {
            if let Some(output) = output {
                bus.accumulate(output, ctx.buffer);
            }
        }

        if done && !template.level.is_persistent() {
            self.set_stage(Stage::Done);
            processor.done();
            tracing::debug!(recall = %template.label(), invocation = %self.key.invocation, tic, "Recall done");
        }

        Ok(if ready {
            Executed::Ran
        } else {
            Executed::Stalled
        })
    }

    /// Moves a cancelled instance to its final stage, once.
    pub(crate) fn finish_cancel(&self) {
        let previous = self.stage.swap(Stage::Cancelled.to_u8(), Ordering::AcqRel);
        if Stage::from_u8(previous).is_final() {
            self.stage.store(previous, Ordering::Release);
            return;
        }
        self.body.lock().processor.cancel();
    }
}
