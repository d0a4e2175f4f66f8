//! Built-in graph mutations.
//!
//! Each task checks its request in [`Task::validate`] without touching the
//! graph, so a rejected task leaves everything as it was.

use crate::context::EngineContext;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use tactus_core::{Backend, Task, TaskError, TaskFlags};
use tactus_recall::{
    ChannelId, ContainerId, EffectSpec, InvocationId, Purpose, RecallError, RecallId, TemplateId,
    TrackId,
};

fn rejected(task: &str, err: RecallError) -> TaskError {
    TaskError::validation(task, err)
}

fn failed(task: &str, err: impl ToString) -> TaskError {
    TaskError::execution(task, err)
}

/// Adds a track with `pads` channels.
pub struct AddTrack {
    pads: usize,
    reply: Option<Sender<(TrackId, Vec<ChannelId>)>>,
}

impl AddTrack {
    pub fn new(pads: usize) -> Self {
        Self { pads, reply: None }
    }

    /// Like [`new`](Self::new); the new ids arrive on the receiver.
    pub fn with_reply(pads: usize) -> (Self, Receiver<(TrackId, Vec<ChannelId>)>) {
        let (tx, rx) = bounded(1);
        (
            Self {
                pads,
                reply: Some(tx),
            },
            rx,
        )
    }
}

impl Task<EngineContext> for AddTrack {
    fn name(&self) -> &str {
        "add-track"
    }

    fn validate(&self, _ctx: &EngineContext) -> Result<(), TaskError> {
        if self.pads == 0 {
            return Err(TaskError::validation(self.name(), "a track needs at least one pad"));
        }
        Ok(())
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        let graph = ctx.graph();
        let track = graph.add_track();
        let channels = (0..self.pads)
            .map(|_| graph.add_channel(track))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| failed("add-track", e))?;
        if let Some(reply) = &self.reply {
            let _ = reply.try_send((track, channels));
        }
        Ok(())
    }
}

/// Removes a track, its channels and every effect on them.
pub struct RemoveTrack {
    track: TrackId,
}

impl RemoveTrack {
    pub fn new(track: TrackId) -> Self {
        Self { track }
    }
}

impl Task<EngineContext> for RemoveTrack {
    fn name(&self) -> &str {
        "remove-track"
    }

    fn flags(&self) -> TaskFlags {
        TaskFlags::LOCKED
    }

    fn lock_key(&self) -> String {
        format!("remove:{}", self.track)
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .channels(self.track)
            .map(|_| ())
            .map_err(|e| rejected(self.name(), e))
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .remove_track(self.track)
            .map_err(|e| failed("remove-track", e))
    }
}

/// Attaches one effect.
pub struct AttachEffect {
    spec: EffectSpec,
    reply: Option<Sender<ContainerId>>,
}

impl AttachEffect {
    pub fn new(spec: EffectSpec) -> Self {
        Self { spec, reply: None }
    }

    /// Like [`new`](Self::new); the container id arrives on the receiver
    /// once attached.
    pub fn with_reply(spec: EffectSpec) -> (Self, Receiver<ContainerId>) {
        let (tx, rx) = bounded(1);
        (
            Self {
                spec,
                reply: Some(tx),
            },
            rx,
        )
    }
}

impl Task<EngineContext> for AttachEffect {
    fn name(&self) -> &str {
        "attach-effect"
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .check_attach(&self.spec)
            .map_err(|e| rejected(self.name(), e))
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        let id = ctx
            .graph()
            .attach(self.spec.clone())
            .map_err(|e| failed("attach-effect", e))?;
        if let Some(reply) = &self.reply {
            let _ = reply.try_send(id);
        }
        Ok(())
    }
}

/// Detaches one effect.
pub struct DetachEffect {
    container: ContainerId,
}

impl DetachEffect {
    pub fn new(container: ContainerId) -> Self {
        Self { container }
    }
}

impl Task<EngineContext> for DetachEffect {
    fn name(&self) -> &str {
        "detach-effect"
    }

    fn flags(&self) -> TaskFlags {
        TaskFlags::LOCKED
    }

    fn lock_key(&self) -> String {
        format!("detach:{}", self.container)
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        match ctx.graph().container(self.container) {
            Some(_) => Ok(()),
            None => Err(rejected(
                self.name(),
                RecallError::UnknownContainer(self.container),
            )),
        }
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .detach(self.container)
            .map_err(|e| failed("detach-effect", e))
    }
}

/// Adds an edge `from -> to` between attached templates.
pub struct AddDependency {
    from: TemplateId,
    to: TemplateId,
}

impl AddDependency {
    pub fn new(from: TemplateId, to: TemplateId) -> Self {
        Self { from, to }
    }
}

impl Task<EngineContext> for AddDependency {
    fn name(&self) -> &str {
        "add-dependency"
    }

    fn flags(&self) -> TaskFlags {
        TaskFlags::LOCKED
    }

    fn lock_key(&self) -> String {
        format!("dependency:{}:{}", self.from, self.to)
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .check_dependency(self.from, self.to)
            .map_err(|e| rejected(self.name(), e))
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .add_dependency(self.from, self.to)
            .map_err(|e| failed("add-dependency", e))
    }
}

/// Removes the edge `from -> to`, if present.
pub struct RemoveDependency {
    from: TemplateId,
    to: TemplateId,
}

impl RemoveDependency {
    pub fn new(from: TemplateId, to: TemplateId) -> Self {
        Self { from, to }
    }
}

impl Task<EngineContext> for RemoveDependency {
    fn name(&self) -> &str {
        "remove-dependency"
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        match ctx.graph().template(self.from) {
            Some(_) => Ok(()),
            None => Err(rejected(self.name(), RecallError::UnknownTemplate(self.from))),
        }
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        let removed = ctx
            .graph()
            .remove_dependency(self.from, self.to)
            .map_err(|e| failed("remove-dependency", e))?;
        if !removed {
            tracing::debug!(from = %self.from, to = %self.to, "No such dependency");
        }
        Ok(())
    }
}

/// Moves a channel within an invocation's run order.
pub struct MoveChannel {
    invocation: InvocationId,
    channel: ChannelId,
    pos: usize,
}

impl MoveChannel {
    pub fn new(invocation: InvocationId, channel: ChannelId, pos: usize) -> Self {
        Self {
            invocation,
            channel,
            pos,
        }
    }
}

impl Task<EngineContext> for MoveChannel {
    fn name(&self) -> &str {
        "move-channel"
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .check_move(self.invocation, self.channel, self.pos)
            .map_err(|e| rejected(self.name(), e))
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .move_channel(self.invocation, self.channel, self.pos)
            .map_err(|e| failed("move-channel", e))
    }
}

/// Builds the effect placed on each pad a resize adds.
pub type PadEffect = Arc<dyn Fn(TrackId, ChannelId) -> EffectSpec + Send + Sync>;

/// Grows or shrinks a track to `pads` channels. Pads are added and removed
/// at the end.
pub struct ResizePads {
    track: TrackId,
    pads: usize,
    pad_effect: Option<PadEffect>,
}

impl ResizePads {
    pub fn new(track: TrackId, pads: usize) -> Self {
        Self {
            track,
            pads,
            pad_effect: None,
        }
    }

    fn effect_for(&self, track: TrackId, pad: ChannelId) -> Option<EffectSpec> {
        self.pad_effect.as_ref().map(|effect| effect(track, pad))
    }

    /// Attaches `effect(track, pad)` to every added pad.
    pub fn with_pad_effect(
        mut self,
        effect: impl Fn(TrackId, ChannelId) -> EffectSpec + Send + Sync + 'static,
    ) -> Self {
        self.pad_effect = Some(Arc::new(effect));
        self
    }
}

impl Task<EngineContext> for ResizePads {
    fn name(&self) -> &str {
        "resize-pads"
    }

    fn flags(&self) -> TaskFlags {
        TaskFlags::LOCKED
    }

    fn lock_key(&self) -> String {
        format!("resize:{}", self.track)
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        if self.pads == 0 {
            return Err(TaskError::validation(self.name(), "a track needs at least one pad"));
        }
        ctx.graph()
            .check_resize(self.track, self.pads, |track, pad| self.effect_for(track, pad))
            .map_err(|e| rejected(self.name(), e))
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        let added = ctx
            .graph()
            .resize_track(self.track, self.pads, |track, pad| self.effect_for(track, pad))
            .map_err(|e| failed("resize-pads", e))?;
        tracing::debug!(track = %self.track, pads = self.pads, added = added.len(), "Pads resized");
        Ok(())
    }
}

/// Feeds a channel from another one, or unlinks it.
pub struct ChangeLink {
    channel: ChannelId,
    upstream: Option<ChannelId>,
}

impl ChangeLink {
    pub fn new(channel: ChannelId, upstream: Option<ChannelId>) -> Self {
        Self { channel, upstream }
    }
}

impl Task<EngineContext> for ChangeLink {
    fn name(&self) -> &str {
        "change-link"
    }

    fn flags(&self) -> TaskFlags {
        TaskFlags::LOCKED
    }

    fn lock_key(&self) -> String {
        format!("link:{}", self.channel)
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .check_link(self.channel, self.upstream)
            .map_err(|e| rejected(self.name(), e))
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .change_link(self.channel, self.upstream)
            .map_err(|e| failed("change-link", e))
    }
}

/// Replaces the hardware backend between two tics.
pub struct SwapBackend {
    backend: Option<Box<dyn Backend>>,
}

impl SwapBackend {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: Some(Box::new(backend)),
        }
    }
}

impl Task<EngineContext> for SwapBackend {
    fn name(&self) -> &str {
        "swap-backend"
    }

    fn flags(&self) -> TaskFlags {
        TaskFlags::LOCKED
    }

    fn validate(&self, _ctx: &EngineContext) -> Result<(), TaskError> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| TaskError::validation(self.name(), "backend already used"))?;
        backend
            .presets()
            .validate()
            .map_err(|err| TaskError::validation(self.name(), err.to_string()))
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        let backend = self
            .backend
            .take()
            .ok_or_else(|| TaskError::execution("swap-backend", "backend already used"))?;
        ctx.swap_backend(backend)
    }
}

/// Starts an invocation over whole tracks.
pub struct StartInvocation {
    purpose: Purpose,
    tracks: Vec<TrackId>,
    reply: Option<Sender<RecallId>>,
}

impl StartInvocation {
    pub fn new(purpose: Purpose, tracks: impl Into<Vec<TrackId>>) -> Self {
        Self {
            purpose,
            tracks: tracks.into(),
            reply: None,
        }
    }

    /// Like [`new`](Self::new); the recall id arrives on the receiver once
    /// started.
    pub fn with_reply(
        purpose: Purpose,
        tracks: impl Into<Vec<TrackId>>,
    ) -> (Self, Receiver<RecallId>) {
        let (tx, rx) = bounded(1);
        let mut task = Self::new(purpose, tracks);
        task.reply = Some(tx);
        (task, rx)
    }
}

impl Task<EngineContext> for StartInvocation {
    fn name(&self) -> &str {
        "start-invocation"
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        for track in &self.tracks {
            ctx.graph()
                .channels(*track)
                .map_err(|e| rejected(self.name(), e))?;
        }
        Ok(())
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        let recall_id = ctx
            .graph()
            .start_invocation(self.purpose, &self.tracks)
            .map_err(|e| failed("start-invocation", e))?;
        if let Some(reply) = &self.reply {
            let _ = reply.try_send(recall_id);
        }
        Ok(())
    }
}

/// Cancels a running invocation.
pub struct CancelInvocation {
    id: InvocationId,
}

impl CancelInvocation {
    pub fn new(id: InvocationId) -> Self {
        Self { id }
    }
}

impl Task<EngineContext> for CancelInvocation {
    fn name(&self) -> &str {
        "cancel-invocation"
    }

    fn flags(&self) -> TaskFlags {
        TaskFlags::LOCKED
    }

    fn lock_key(&self) -> String {
        format!("cancel:{}", self.id)
    }

    fn validate(&self, ctx: &EngineContext) -> Result<(), TaskError> {
        match ctx.graph().invocation(self.id) {
            Some(_) => Ok(()),
            None => Err(rejected(self.name(), RecallError::UnknownInvocation(self.id))),
        }
    }

    fn launch(&mut self, ctx: &mut EngineContext) -> Result<(), TaskError> {
        ctx.graph()
            .cancel_invocation(self.id)
            .map_err(|e| failed("cancel-invocation", e))
    }
}
