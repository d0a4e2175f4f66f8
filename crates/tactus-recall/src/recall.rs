//! Recall templates and the processor contract.

use crate::error::Result;
use crate::ids::{ChannelId, ContainerId, RecyclingId, TemplateId, TrackId};
use crate::recall_id::RecallId;
use dyn_clone::DynClone;
use std::fmt;

/// Granularity a recall runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecallLevel {
    /// Once per track; persistent.
    Track,
    /// Once per channel; persistent.
    Channel,
    /// Once per channel per invocation.
    ChannelRun,
    /// Once per recycling (buffer chain) per invocation.
    Chunk,
}

impl RecallLevel {
    /// Persistent instances never finish on their own; they live as long as
    /// their invocation.
    pub fn is_persistent(self) -> bool {
        matches!(self, RecallLevel::Track | RecallLevel::Channel)
    }

    /// Whether a recall at this level may depend on one at `other`.
    pub fn may_depend_on(self, other: RecallLevel) -> bool {
        other <= self
    }
}

impl fmt::Display for RecallLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecallLevel::Track => "track",
            RecallLevel::Channel => "channel",
            RecallLevel::ChannelRun => "channel-run",
            RecallLevel::Chunk => "chunk",
        };
        f.write_str(name)
    }
}

/// Which half of a container a recall belongs to. Within one lane, `Recall`
/// instances run before `Play` instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlayContext {
    Recall,
    Play,
}

/// Lifecycle stage of a recall instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    PreRun,
    Run,
    PostRun,
    Done,
    Cancelled,
    Removed,
}

impl Stage {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Stage::Init => 0,
            Stage::PreRun => 1,
            Stage::Run => 2,
            Stage::PostRun => 3,
            Stage::Done => 4,
            Stage::Cancelled => 5,
            Stage::Removed => 6,
        }
    }

    pub(crate) fn from_u8(val: u8) -> Self {
        match val {
            1 => Stage::PreRun,
            2 => Stage::Run,
            3 => Stage::PostRun,
            4 => Stage::Done,
            5 => Stage::Cancelled,
            6 => Stage::Removed,
            _ => Stage::Init,
        }
    }

    /// No further stages will run.
    pub fn is_final(self) -> bool {
        matches!(self, Stage::Done | Stage::Cancelled | Stage::Removed)
    }
}

/// Returned by each processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageOutcome {
    #[default]
    Continue,
    /// The processor's region ended; the instance becomes done after this tic.
    Done,
}

/// What a processor sees during one stage.
pub struct ProcessContext<'a> {
    pub tic: u64,
    pub stage: Stage,
    pub recall_id: &'a RecallId,
    pub level: RecallLevel,
    pub track: TrackId,
    pub channel: Option<ChannelId>,
    pub recycling: Option<RecyclingId>,
    /// Mono buffer of one period, owned by the instance.
    pub buffer: &'a mut [f32],
}

/// Effect behavior plugged into a recall.
///
/// Each instance gets its own clone of the template's processor, so state
/// kept in `self` is per invocation.
pub trait RecallProcessor: DynClone + Send + Sync + 'static {
    fn init(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<()> {
        Ok(())
    }

    fn run_pre(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<StageOutcome> {
        Ok(StageOutcome::Continue)
    }

    fn run(&mut self, ctx: &mut ProcessContext<'_>) -> Result<StageOutcome>;

    fn run_post(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<StageOutcome> {
        Ok(StageOutcome::Continue)
    }

    /// Called once when the instance becomes done.
    fn done(&mut self) {}

    /// Called once when the instance is cancelled.
    fn cancel(&mut self) {}
}

dyn_clone::clone_trait_object!(RecallProcessor);

/// Processor whose RUN stage is a closure.
#[derive(Clone)]
pub struct FnProcessor<F> {
    f: F,
}

impl<F> RecallProcessor for FnProcessor<F>
where
    F: FnMut(&mut ProcessContext<'_>) -> Result<StageOutcome> + Clone + Send + Sync + 'static,
{
    fn run(&mut self, ctx: &mut ProcessContext<'_>) -> Result<StageOutcome> {
        (self.f)(ctx)
    }
}

/// Wraps a closure as a [`RecallProcessor`].
pub fn processor_fn<F>(f: F) -> FnProcessor<F>
where
    F: FnMut(&mut ProcessContext<'_>) -> Result<StageOutcome> + Clone + Send + Sync + 'static,
{
    FnProcessor { f }
}

/// Edge from one recall template to another it must run after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecallDependency {
    pub target: TemplateId,
}

impl RecallDependency {
    pub fn on(target: TemplateId) -> Self {
        Self { target }
    }
}

/// Attached recall; instances are duplicated from it per invocation.
#[derive(Clone)]
pub struct RecallTemplate {
    pub id: TemplateId,
    pub name: String,
    pub level: RecallLevel,
    pub context: PlayContext,
    pub container: ContainerId,
    pub track: TrackId,
    /// `None` for track-level recalls.
    pub channel: Option<ChannelId>,
    pub dependencies: Vec<RecallDependency>,
    pub(crate) processor: Box<dyn RecallProcessor>,
}

impl RecallTemplate {
    /// Fresh processor for a new instance.
    pub(crate) fn duplicate_processor(&self) -> Box<dyn RecallProcessor> {
        dyn_clone::clone_box(&*self.processor)
    }

    /// Human-readable label used in logs and faults.
    pub fn label(&self) -> String {
        format!("{}:{}", self.name, self.id)
    }
}

impl fmt::Debug for RecallTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecallTemplate")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("level", &self.level)
            .field("context", &self.context)
            .field("container", &self.container)
            .field("track", &self.track)
            .field("channel", &self.channel)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
