//! The recall graph: topology, invocations and per-lane execution.

use crate::container::{DependencyRef, EffectSpec, RecallContainer};
use crate::dependency::{self, check_granularity, EdgeNode, EdgeSet};
use crate::destroy::DestroyWorker;
use crate::error::{RecallError, Result};
use crate::ids::{ChannelId, ContainerId, InvocationId, RecyclingId, TemplateId, TrackId};
use crate::instance::{InstanceKey, RecallInstance};
use crate::invocation::{Invocation, InvocationEvent};
use crate::recall::{PlayContext, RecallDependency, RecallLevel, RecallTemplate};
use crate::recall_id::{Purpose, RecallId};
use crate::recycling::RecyclingContext;
use crate::run_order::RunOrder;
use crate::schedule::{self, Lane, ScheduleInput, ScheduleSet};
use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tactus_core::{AtomicCounter, AtomicFlag, EngineConfig, MixBus, ThreadingMode, TicContext};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct ChannelEntry {
    track: TrackId,
    output: usize,
}

#[derive(Default, Clone)]
struct GraphState {
    tracks: BTreeMap<TrackId, Vec<ChannelId>>,
    channels: HashMap<ChannelId, ChannelEntry>,
    templates: HashMap<TemplateId, Arc<RecallTemplate>>,
    containers: HashMap<ContainerId, RecallContainer>,
    /// Downstream channel -> channel feeding it.
    links: HashMap<ChannelId, ChannelId>,
    next_track: u64,
    next_channel: u64,
    next_template: u64,
    next_container: u64,
}

impl GraphState {
    fn edges(&self) -> EdgeSet {
        EdgeSet::new(self.templates.values().map(|t| t.as_ref()), &self.links)
    }

    fn outputs(&self) -> HashMap<ChannelId, usize> {
        self.channels.iter().map(|(id, c)| (*id, c.output)).collect()
    }

    fn template(&self, id: TemplateId) -> Result<&Arc<RecallTemplate>> {
        self.templates
            .get(&id)
            .ok_or(RecallError::UnknownTemplate(id))
    }

    fn channel(&self, id: ChannelId) -> Result<ChannelEntry> {
        self.channels
            .get(&id)
            .copied()
            .ok_or(RecallError::UnknownChannel(id))
    }

    /// Templates of `containers`, after checking nothing else depends on
    /// them.
    fn doomed_templates(&self, containers: &[ContainerId]) -> Result<HashSet<TemplateId>> {
        let mut doomed = HashSet::new();
        for id in containers {
            let container = self
                .containers
                .get(id)
                .ok_or(RecallError::UnknownContainer(*id))?;
            doomed.extend(container.templates());
        }
        for template in self.templates.values() {
            if doomed.contains(&template.id) {
                continue;
            }
            if let Some(dep) = template
                .dependencies
                .iter()
                .find(|d| doomed.contains(&d.target))
            {
                let target = self.template(dep.target)?;
                return Err(RecallError::InvalidDependency {
                    from: template.label(),
                    to: target.label(),
                    reason: "the target is still depended on".into(),
                });
            }
        }
        Ok(doomed)
    }

    fn remove_containers(&mut self, containers: &[ContainerId], doomed: &HashSet<TemplateId>) {
        for id in containers {
            self.containers.remove(id);
        }
        self.templates.retain(|id, _| !doomed.contains(id));
    }

    /// Adds a channel to `track`. Its output goes to bus channel
    /// `position % outputs`.
    fn add_channel(&mut self, track: TrackId, outputs: usize) -> Result<ChannelId> {
        let position = self
            .tracks
            .get(&track)
            .map(Vec::len)
            .ok_or(RecallError::UnknownTrack(track))?;
        self.next_channel += 1;
        let id = ChannelId(self.next_channel);
        let output = position % outputs.max(1);
        self.channels.insert(id, ChannelEntry { track, output });
        if let Some(channels) = self.tracks.get_mut(&track) {
            channels.push(id);
        }
        Ok(id)
    }

    /// Removes `channels` with every effect on them and every link touching
    /// them. Returns the templates that left.
    fn remove_channels(&mut self, channels: &[ChannelId]) -> Result<HashSet<TemplateId>> {
        let mut entries = Vec::with_capacity(channels.len());
        for channel in channels {
            entries.push((*channel, self.channel(*channel)?));
        }
        let containers =
            self.containers_where(|c| c.channel.is_some_and(|ch| channels.contains(&ch)));
        let doomed = self.doomed_templates(&containers)?;

        self.remove_containers(&containers, &doomed);
        for (channel, entry) in entries {
            self.channels.remove(&channel);
            if let Some(list) = self.tracks.get_mut(&entry.track) {
                list.retain(|c| *c != channel);
            }
        }
        self.links
            .retain(|down, up| !channels.contains(down) && !channels.contains(up));
        Ok(doomed)
    }

    /// Places an effect's container and templates.
    fn attach(&mut self, spec: EffectSpec) -> Result<ContainerId> {
        let planned = validate_attach(self, &spec)?;

        self.next_container += 1;
        let container_id = ContainerId(self.next_container);
        self.next_template += spec.recalls.len() as u64;

        let mut container = RecallContainer {
            id: container_id,
            effect: spec.name.clone(),
            track: spec.track,
            channel: spec.channel,
            play: Vec::new(),
            recall: Vec::new(),
        };
        for (recall, (id, node)) in spec.recalls.into_iter().zip(planned) {
            match recall.context {
                PlayContext::Play => container.play.push(id),
                PlayContext::Recall => container.recall.push(id),
            }
            let template = RecallTemplate {
                id,
                name: recall.name,
                level: recall.level,
                context: recall.context,
                container: container_id,
                track: spec.track,
                channel: node.channel,
                dependencies: node.deps.into_iter().map(RecallDependency::on).collect(),
                processor: recall.processor,
            };
            self.templates.insert(id, Arc::new(template));
        }
        self.containers.insert(container_id, container);
        Ok(container_id)
    }

    /// Resizes `track` to `pads` channels at the end of its list. Returns
    /// the added channels and the templates that left.
    fn resize_track(
        &mut self,
        track: TrackId,
        pads: usize,
        outputs: usize,
        pad_effect: impl Fn(TrackId, ChannelId) -> Option<EffectSpec>,
    ) -> Result<(Vec<ChannelId>, HashSet<TemplateId>)> {
        let current = self
            .tracks
            .get(&track)
            .cloned()
            .ok_or(RecallError::UnknownTrack(track))?;

        let doomed = if pads < current.len() {
            self.remove_channels(&current[pads..])?
        } else {
            HashSet::new()
        };
        let mut added = Vec::new();
        for _ in current.len()..pads {
            let channel = self.add_channel(track, outputs)?;
            if let Some(spec) = pad_effect(track, channel) {
                self.attach(spec)?;
            }
            added.push(channel);
        }
        Ok((added, doomed))
    }

    fn containers_where(&self, f: impl Fn(&RecallContainer) -> bool) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = self
            .containers
            .values()
            .filter(|c| f(c))
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }
}

/// Shape of one template in a [`Topology`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateShape {
    pub id: TemplateId,
    pub name: String,
    pub level: RecallLevel,
    pub context: PlayContext,
    pub container: ContainerId,
    pub track: TrackId,
    pub channel: Option<ChannelId>,
    pub dependencies: Vec<TemplateId>,
}

/// Comparable snapshot of the graph's structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub tracks: Vec<(TrackId, Vec<ChannelId>)>,
    pub containers: Vec<RecallContainer>,
    pub templates: Vec<TemplateShape>,
    pub links: Vec<(ChannelId, ChannelId)>,
}

/// Result of one [`RecallGraph::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub finished: Vec<InvocationId>,
    pub cancelled: Vec<InvocationId>,
}

/// Effect graph of the engine.
///
/// Structure (tracks, channels, containers, links) can be changed from any
/// thread, but schedules only pick the change up in [`refresh`], which the
/// engine calls in the safe window. Worker threads call [`run_lane`] and
/// never take the structure lock.
///
/// [`refresh`]: RecallGraph::refresh
/// [`run_lane`]: RecallGraph::run_lane
pub struct RecallGraph {
    threading: ThreadingMode,
    dependency_timeout: Duration,
    bus: Arc<MixBus>,
    state: RwLock<GraphState>,
    instances: DashMap<InstanceKey, Arc<RecallInstance>>,
    invocations: DashMap<InvocationId, Invocation>,
    schedules: ArcSwap<ScheduleSet>,
    dirty: AtomicFlag,
    next_invocation: AtomicCounter,
    next_recycling: AtomicCounter,
    events_tx: Sender<InvocationEvent>,
    events_rx: Receiver<InvocationEvent>,
    destroyer: Mutex<DestroyWorker>,
}

impl std::fmt::Debug for RecallGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RecallGraph")
            .field("threading", &self.threading)
            .field("tracks", &state.tracks.len())
            .field("templates", &state.templates.len())
            .field("instances", &self.instances.len())
            .field("invocations", &self.invocations.len())
            .finish()
    }
}

impl RecallGraph {
    pub fn new(config: &EngineConfig, bus: Arc<MixBus>) -> Self {
        let (events_tx, events_rx) = unbounded();
        let mut destroyer = DestroyWorker::new();
        destroyer.start();
        Self {
            threading: config.threading,
            dependency_timeout: config.dependency_timeout(),
            bus,
            state: RwLock::new(GraphState::default()),
            instances: DashMap::new(),
            invocations: DashMap::new(),
            schedules: ArcSwap::from_pointee(ScheduleSet::default()),
            dirty: AtomicFlag::new(false),
            next_invocation: AtomicCounter::default(),
            next_recycling: AtomicCounter::default(),
            events_tx,
            events_rx,
            destroyer: Mutex::new(destroyer),
        }
    }

    pub fn threading(&self) -> ThreadingMode {
        self.threading
    }

    pub fn bus(&self) -> &Arc<MixBus> {
        &self.bus
    }

    pub fn dependency_timeout(&self) -> Duration {
        self.dependency_timeout
    }

    fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    // Tracks and channels

    pub fn add_track(&self) -> TrackId {
        let mut state = self.state.write();
        state.next_track += 1;
        let id = TrackId(state.next_track);
        state.tracks.insert(id, Vec::new());
        debug!(track = %id, "Track added");
        id
    }

    /// Adds a channel to `track`. Its output goes to bus channel
    /// `position % bus.channels()`.
    pub fn add_channel(&self, track: TrackId) -> Result<ChannelId> {
        let mut state = self.state.write();
        let id = state.add_channel(track, self.bus.channels())?;
        let output = state.channel(id)?.output;
        drop(state);
        self.mark_dirty();
        debug!(track = %track, channel = %id, output, "Channel added");
        Ok(id)
    }

    /// Removes a channel with every effect on it and every link touching it.
    pub fn remove_channel(&self, channel: ChannelId) -> Result<()> {
        let doomed = self.state.write().remove_channels(&[channel])?;
        self.retire_templates(&doomed);
        self.mark_dirty();
        debug!(channel = %channel, "Channel removed");
        Ok(())
    }

    /// Checks a [`resize_track`](Self::resize_track) without changing
    /// anything.
    pub fn check_resize(
        &self,
        track: TrackId,
        pads: usize,
        pad_effect: impl Fn(TrackId, ChannelId) -> Option<EffectSpec>,
    ) -> Result<()> {
        let mut draft = self.state.read().clone();
        draft
            .resize_track(track, pads, self.bus.channels(), pad_effect)
            .map(|_| ())
    }

    /// Grows or shrinks `track` to `pads` channels, adding and removing at
    /// the end, and attaches `pad_effect(track, pad)` to every added pad.
    /// Either the whole resize applies or the graph is left untouched.
    /// Returns the added channels.
    pub fn resize_track(
        &self,
        track: TrackId,
        pads: usize,
        pad_effect: impl Fn(TrackId, ChannelId) -> Option<EffectSpec>,
    ) -> Result<Vec<ChannelId>> {
        let mut state = self.state.write();
        let mut draft = state.clone();
        let (added, doomed) = draft.resize_track(track, pads, self.bus.channels(), pad_effect)?;
        *state = draft;
        drop(state);

        self.retire_templates(&doomed);
        self.mark_dirty();
        debug!(track = %track, pads, added = added.len(), removed_templates = doomed.len(), "Track resized");
        Ok(added)
    }

    pub fn remove_track(&self, track: TrackId) -> Result<()> {
        let mut state = self.state.write();
        let channels = state
            .tracks
            .get(&track)
            .cloned()
            .ok_or(RecallError::UnknownTrack(track))?;
        let containers = state.containers_where(|c| c.track == track);
        let doomed = state.doomed_templates(&containers)?;

        state.remove_containers(&containers, &doomed);
        for channel in &channels {
            state.channels.remove(channel);
        }
        state
            .links
            .retain(|down, up| !channels.contains(down) && !channels.contains(up));
        state.tracks.remove(&track);
        drop(state);

        self.retire_templates(&doomed);
        self.mark_dirty();
        debug!(track = %track, "Track removed");
        Ok(())
    }

    pub fn tracks(&self) -> Vec<TrackId> {
        self.state.read().tracks.keys().copied().collect()
    }

    pub fn channels(&self, track: TrackId) -> Result<Vec<ChannelId>> {
        self.state
            .read()
            .tracks
            .get(&track)
            .cloned()
            .ok_or(RecallError::UnknownTrack(track))
    }

    pub fn track_of(&self, channel: ChannelId) -> Option<TrackId> {
        self.state.read().channels.get(&channel).map(|c| c.track)
    }

    pub fn output_of(&self, channel: ChannelId) -> Option<usize> {
        self.state.read().channels.get(&channel).map(|c| c.output)
    }

    /// Channel feeding `channel`, if linked.
    pub fn upstream_of(&self, channel: ChannelId) -> Option<ChannelId> {
        self.state.read().links.get(&channel).copied()
    }

    // Effects

    /// Checks `spec` against the current graph without changing anything.
    pub fn check_attach(&self, spec: &EffectSpec) -> Result<()> {
        validate_attach(&self.state.read(), spec).map(|_| ())
    }

    /// Attaches an effect; the container is placed as a whole or not at all.
    pub fn attach(&self, spec: EffectSpec) -> Result<ContainerId> {
        let effect = spec.name.clone();
        let recalls = spec.recalls.len();
        let container = self.state.write().attach(spec)?;
        self.mark_dirty();
        debug!(container = %container, effect = %effect, recalls, "Effect attached");
        Ok(container)
    }

    /// Removes an attached effect. Fails if a recall outside the container
    /// still depends on one inside it.
    pub fn detach(&self, container: ContainerId) -> Result<()> {
        let mut state = self.state.write();
        let doomed = state.doomed_templates(&[container])?;
        state.remove_containers(&[container], &doomed);
        drop(state);

        self.retire_templates(&doomed);
        self.mark_dirty();
        debug!(container = %container, "Effect detached");
        Ok(())
    }

    /// Checks an [`add_dependency`](Self::add_dependency) without changing
    /// anything.
    pub fn check_dependency(&self, from: TemplateId, to: TemplateId) -> Result<()> {
        validate_dependency(&self.state.read(), from, to).map(|_| ())
    }

    /// Adds an edge `from -> to` between attached templates.
    pub fn add_dependency(&self, from: TemplateId, to: TemplateId) -> Result<()> {
        let mut state = self.state.write();
        let Some(source) = validate_dependency(&state, from, to)? else {
            return Ok(());
        };

        let mut updated = RecallTemplate::clone(&source);
        updated.dependencies.push(RecallDependency::on(to));
        state.templates.insert(from, Arc::new(updated));
        drop(state);

        self.mark_dirty();
        Ok(())
    }

    /// Removes the edge `from -> to`. Returns whether it existed.
    pub fn remove_dependency(&self, from: TemplateId, to: TemplateId) -> Result<bool> {
        let mut state = self.state.write();
        let source = Arc::clone(state.template(from)?);
        if !source.dependencies.iter().any(|d| d.target == to) {
            return Ok(false);
        }
        let mut updated = RecallTemplate::clone(&source);
        updated.dependencies.retain(|d| d.target != to);
        state.templates.insert(from, Arc::new(updated));
        drop(state);

        self.mark_dirty();
        Ok(true)
    }

    /// Checks a [`change_link`](Self::change_link) without changing anything.
    pub fn check_link(&self, channel: ChannelId, upstream: Option<ChannelId>) -> Result<()> {
        validate_link(&self.state.read(), channel, upstream)
    }

    /// Feeds `channel` from `upstream`, or unlinks it with `None`. Chunk
    /// recalls of `channel` then wait on the chunk recalls of `upstream`.
    pub fn change_link(&self, channel: ChannelId, upstream: Option<ChannelId>) -> Result<()> {
        let mut state = self.state.write();
        validate_link(&state, channel, upstream)?;
        match upstream {
            Some(up) => state.links.insert(channel, up),
            None => state.links.remove(&channel),
        };
        drop(state);

        self.mark_dirty();
        debug!(channel = %channel, upstream = ?upstream, "Link changed");
        Ok(())
    }

    pub fn container(&self, id: ContainerId) -> Option<RecallContainer> {
        self.state.read().containers.get(&id).cloned()
    }

    pub fn template(&self, id: TemplateId) -> Option<Arc<RecallTemplate>> {
        self.state.read().templates.get(&id).cloned()
    }

    pub fn topology(&self) -> Topology {
        let state = self.state.read();
        let mut containers: Vec<RecallContainer> = state.containers.values().cloned().collect();
        containers.sort_by_key(|c| c.id);
        let mut templates: Vec<TemplateShape> = state
            .templates
            .values()
            .map(|t| TemplateShape {
                id: t.id,
                name: t.name.clone(),
                level: t.level,
                context: t.context,
                container: t.container,
                track: t.track,
                channel: t.channel,
                dependencies: t.dependencies.iter().map(|d| d.target).collect(),
            })
            .collect();
        templates.sort_by_key(|t| t.id);
        let mut links: Vec<(ChannelId, ChannelId)> =
            state.links.iter().map(|(d, u)| (*d, *u)).collect();
        links.sort();

        Topology {
            tracks: state
                .tracks
                .iter()
                .map(|(id, channels)| (*id, channels.clone()))
                .collect(),
            containers,
            templates,
            links,
        }
    }

    // Invocations

    /// Starts an invocation over every channel of `tracks`.
    pub fn start_invocation(&self, purpose: Purpose, tracks: &[TrackId]) -> Result<RecallId> {
        let state = self.state.read();
        for track in tracks {
            if !state.tracks.contains_key(track) {
                return Err(RecallError::UnknownTrack(*track));
            }
        }

        let id = InvocationId(self.next_invocation.add(1));
        let recall_id = RecallId::new(id, purpose, RecyclingContext::new(Vec::new()));
        let mut invocation = Invocation::new(recall_id, tracks.to_vec());
        self.sync_channels(&state, &mut invocation);
        self.populate(&state, &mut invocation);
        let recall_id = invocation.recall_id.clone();
        self.invocations.insert(id, invocation);
        drop(state);

        self.mark_dirty();
        let _ = self.events_tx.send(InvocationEvent::Started { id });
        debug!(invocation = %id, purpose = %purpose, "Invocation started");
        Ok(recall_id)
    }

    /// Cancels every instance of the invocation. Instances observe it at
    /// their next stage check; the next sweep removes them.
    pub fn cancel_invocation(&self, id: InvocationId) -> Result<()> {
        let mut invocation = self
            .invocations
            .get_mut(&id)
            .ok_or(RecallError::UnknownInvocation(id))?;
        invocation.cancelled = true;
        drop(invocation);

        for entry in self.instances.iter() {
            if entry.key().invocation == id {
                entry.value().cancel();
            }
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn invocation(&self, id: InvocationId) -> Option<RecallId> {
        self.invocations.get(&id).map(|inv| inv.recall_id.clone())
    }

    pub fn invocations(&self) -> Vec<InvocationId> {
        let mut ids: Vec<InvocationId> = self.invocations.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn run_order(&self, id: InvocationId) -> Option<RunOrder> {
        self.invocations.get(&id).map(|inv| inv.run_order.clone())
    }

    /// Checks a [`move_channel`](Self::move_channel) without changing
    /// anything.
    pub fn check_move(&self, id: InvocationId, channel: ChannelId, pos: usize) -> Result<()> {
        let invocation = self
            .invocations
            .get(&id)
            .ok_or(RecallError::UnknownInvocation(id))?;
        moved_order(&invocation.run_order, channel, pos).map(|_| ())
    }

    /// Moves `channel` to `pos` in the invocation's run order.
    pub fn move_channel(&self, id: InvocationId, channel: ChannelId, pos: usize) -> Result<()> {
        let mut invocation = self
            .invocations
            .get_mut(&id)
            .ok_or(RecallError::UnknownInvocation(id))?;
        invocation.run_order = moved_order(&invocation.run_order, channel, pos)?;
        drop(invocation);

        self.mark_dirty();
        Ok(())
    }

    /// Receiver for invocation lifecycle events.
    pub fn events(&self) -> Receiver<InvocationEvent> {
        self.events_rx.clone()
    }

    pub fn instance(&self, template: TemplateId, invocation: InvocationId) -> Option<Arc<RecallInstance>> {
        self.instances
            .get(&InstanceKey {
                template,
                invocation,
            })
            .map(|e| Arc::clone(e.value()))
    }

    pub fn instances_of(&self, invocation: InvocationId) -> Vec<Arc<RecallInstance>> {
        let mut found: Vec<Arc<RecallInstance>> = self
            .instances
            .iter()
            .filter(|e| e.key().invocation == invocation)
            .map(|e| Arc::clone(e.value()))
            .collect();
        found.sort_by_key(|i| i.key());
        found
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// The instance `edge` points at for `recall_id`.
    pub fn resolve_dependency(
        &self,
        edge: &RecallDependency,
        recall_id: &RecallId,
    ) -> Result<Arc<RecallInstance>> {
        dependency::resolve_dependency(&self.instances, edge, recall_id)
    }

    /// Instances destroyed off the realtime path so far.
    pub fn destroyed(&self) -> u64 {
        self.destroyer.lock().destroyed()
    }

    // Per-tic

    /// Runs every instance scheduled on `lane` for the context's tic.
    /// Returns how many of them ran RUN.
    pub fn run_lane(&self, lane: Lane, ctx: &TicContext<'_>) -> usize {
        let set = self.schedules.load_full();
        let Some(entries) = set.lane(lane) else {
            return 0;
        };
        entries
            .iter()
            .filter(|entry| {
                schedule::run_entry(&set, entry, ctx, &self.bus, self.dependency_timeout)
            })
            .count()
    }

    /// Lanes that currently have work.
    pub fn lanes(&self) -> Vec<Lane> {
        self.schedules.load().lanes()
    }

    /// Run order of `lane` as instance keys.
    pub fn schedule(&self, lane: Lane) -> Vec<InstanceKey> {
        self.schedules
            .load()
            .lane(lane)
            .map(|entries| entries.iter().map(|e| e.instance.key()).collect())
            .unwrap_or_default()
    }

    /// Picks up structural changes: channels join or leave running
    /// invocations, missing instances are duplicated and schedules rebuilt.
    /// Returns whether anything was rebuilt.
    pub fn refresh(&self) -> bool {
        if !self.dirty.swap(false) {
            return false;
        }
        let state = self.state.read();
        for mut invocation in self.invocations.iter_mut() {
            if invocation.cancelled {
                continue;
            }
            self.sync_channels(&state, &mut invocation);
            self.populate(&state, &mut invocation);
        }

        let outputs = state.outputs();
        let edges = state.edges();
        let set = schedule::build(&ScheduleInput {
            templates: &state.templates,
            outputs: &outputs,
            edges: &edges,
            instances: &self.instances,
            invocations: &self.invocations,
            threading: self.threading,
        });
        self.schedules.store(Arc::new(set));
        true
    }

    /// Removes finished, cancelled and quarantined instances, ends
    /// invocations with nothing left to run and hands the removed instances
    /// to the destroy thread.
    ///
    /// An invocation finishes once one of its run or chunk instances reached
    /// DONE and none of them is left. Losing them to a detach alone keeps it
    /// waiting for new effects.
    pub fn sweep(&self, tic: u64) -> SweepReport {
        let mut removed = Vec::new();
        self.instances.retain(|_, instance| {
            if instance.is_active() {
                true
            } else {
                removed.push(Arc::clone(instance));
                false
            }
        });

        for instance in &removed {
            if instance.is_done() && !instance.level().is_persistent() {
                if let Some(mut invocation) = self.invocations.get_mut(&instance.key().invocation) {
                    invocation.completed += 1;
                }
            }
        }

        let mut report = SweepReport::default();
        let mut ended = Vec::new();
        for invocation in self.invocations.iter() {
            let id = invocation.id();
            let remaining: Vec<RecallLevel> = self
                .instances
                .iter()
                .filter(|e| e.key().invocation == id)
                .map(|e| e.value().level())
                .collect();
            if invocation.cancelled {
                if remaining.is_empty() {
                    ended.push((id, true));
                }
            } else if invocation.completed > 0 && remaining.iter().all(|l| l.is_persistent()) {
                ended.push((id, false));
            }
        }

        for (id, cancelled) in ended {
            self.invocations.remove(&id);
            self.instances.retain(|key, instance| {
                if key.invocation == id {
                    removed.push(Arc::clone(instance));
                    false
                } else {
                    true
                }
            });
            let event = if cancelled {
                report.cancelled.push(id);
                InvocationEvent::Cancelled { id, tic }
            } else {
                report.finished.push(id);
                InvocationEvent::Finished { id, tic }
            };
            let _ = self.events_tx.send(event);
            debug!(invocation = %id, tic, cancelled, "Invocation ended");
        }

        if removed.is_empty() && report.finished.is_empty() && report.cancelled.is_empty() {
            return report;
        }

        for instance in &removed {
            if instance.is_cancelled() {
                instance.finish_cancel();
            }
            instance.mark_removed();
        }
        report.removed = removed.len();

        self.mark_dirty();
        self.refresh();

        let destroyer = self.destroyer.lock();
        for instance in removed {
            destroyer.destroy(instance);
        }
        report
    }

    /// Safe-window maintenance: sweep, then refresh.
    pub fn maintain(&self, tic: u64) -> SweepReport {
        let report = self.sweep(tic);
        self.refresh();
        report
    }

    // Internals

    fn sync_channels(&self, state: &GraphState, invocation: &mut Invocation) {
        let current: Vec<ChannelId> = invocation
            .tracks
            .iter()
            .filter_map(|t| state.tracks.get(t))
            .flatten()
            .copied()
            .collect();
        let gone: Vec<ChannelId> = invocation
            .recyclings
            .keys()
            .copied()
            .filter(|c| !current.contains(c))
            .collect();
        for channel in gone {
            invocation.leave_channel(channel);
        }
        for channel in current {
            if !invocation.recyclings.contains_key(&channel) {
                let recycling = RecyclingId(self.next_recycling.add(1));
                invocation.join_channel(channel, recycling);
            }
        }
    }

    fn populate(&self, state: &GraphState, invocation: &mut Invocation) {
        let mut templates: Vec<&Arc<RecallTemplate>> = state
            .templates
            .values()
            .filter(|t| invocation.tracks.contains(&t.track))
            .filter(|t| !invocation.duplicated.contains(&t.id))
            .collect();
        templates.sort_by_key(|t| t.id);

        for template in templates {
            let recycling = match template.channel {
                Some(channel) => match invocation.recyclings.get(&channel) {
                    Some(r) => Some(*r),
                    None => continue,
                },
                None => None,
            };
            let instance = RecallInstance::new(
                Arc::clone(template),
                invocation.recall_id.clone(),
                recycling,
                self.bus.frames(),
            );
            invocation.duplicated.insert(template.id);
            self.instances.insert(instance.key(), Arc::new(instance));
        }
    }

    /// Cancels and drops the instances of templates that left the graph.
    fn retire_templates(&self, doomed: &HashSet<TemplateId>) {
        if doomed.is_empty() {
            return;
        }
        let mut retired = Vec::new();
        self.instances.retain(|key, instance| {
            if doomed.contains(&key.template) {
                retired.push(Arc::clone(instance));
                false
            } else {
                true
            }
        });
        let destroyer = self.destroyer.lock();
        for instance in retired {
            instance.cancel();
            instance.finish_cancel();
            instance.mark_removed();
            destroyer.destroy(instance);
        }
    }
}

fn moved_order(order: &RunOrder, channel: ChannelId, pos: usize) -> Result<RunOrder> {
    if order.position(channel).is_none() {
        return Err(RecallError::UnknownChannel(channel));
    }
    let mut order = order.clone();
    order.remove_channel(channel);
    order.insert_channel(pos, channel)?;
    Ok(order)
}

/// Checks an edge `from -> to`. Returns the source template, or `None` if
/// the edge already exists.
fn validate_dependency(
    state: &GraphState,
    from: TemplateId,
    to: TemplateId,
) -> Result<Option<Arc<RecallTemplate>>> {
    let source = Arc::clone(state.template(from)?);
    let target = state.template(to)?;
    check_granularity(&source.label(), source.level, &target.label(), target.level)?;
    if source.dependencies.iter().any(|d| d.target == to) {
        return Ok(None);
    }

    let mut edges = state.edges();
    edges.add_edge(from, to);
    edges.check()?;
    Ok(Some(source))
}

fn validate_link(state: &GraphState, channel: ChannelId, upstream: Option<ChannelId>) -> Result<()> {
    state.channel(channel)?;
    let Some(up) = upstream else {
        return Ok(());
    };
    state.channel(up)?;

    let mut path = vec![channel, up];
    let mut cursor = up;
    while cursor != channel {
        match state.links.get(&cursor) {
            Some(next) => {
                cursor = *next;
                path.push(cursor);
            }
            None => break,
        }
    }
    if cursor == channel {
        return Err(RecallError::CyclicLink { path });
    }

    let mut edges = state.edges();
    edges.set_link(channel, Some(up));
    edges.check()
}

/// Checks an attach request; returns the id and edges each recall will get.
fn validate_attach(state: &GraphState, spec: &EffectSpec) -> Result<Vec<(TemplateId, EdgeNode)>> {
    if !state.tracks.contains_key(&spec.track) {
        return Err(RecallError::UnknownTrack(spec.track));
    }
    if let Some(channel) = spec.channel {
        let entry = state.channel(channel)?;
        if entry.track != spec.track {
            return Err(RecallError::UnknownChannel(channel));
        }
    }

    let count = spec.recalls.len();
    let base = state.next_template + 1;
    let ids: Vec<TemplateId> = (0..count as u64).map(|i| TemplateId(base + i)).collect();

    let mut planned = Vec::with_capacity(count);
    for (i, recall) in spec.recalls.iter().enumerate() {
        if recall.level != RecallLevel::Track && spec.channel.is_none() {
            return Err(RecallError::InvalidLevel {
                recall: recall.name.clone(),
                level: recall.level,
            });
        }

        let mut deps = Vec::with_capacity(recall.dependencies.len());
        for dep in &recall.dependencies {
            let (target, label, level) = match *dep {
                DependencyRef::Template(id) => {
                    let target = state.template(id)?;
                    (id, target.label(), target.level)
                }
                DependencyRef::Local(j) => {
                    let target = spec.recalls.get(j).ok_or(RecallError::InvalidPosition {
                        pos: j,
                        len: count,
                    })?;
                    (ids[j], format!("{}:{}", target.name, ids[j]), target.level)
                }
            };
            let from = format!("{}:{}", recall.name, ids[i]);
            check_granularity(&from, recall.level, &label, level)?;
            deps.push(target);
        }

        let channel = match recall.level {
            RecallLevel::Track => None,
            _ => spec.channel,
        };
        planned.push((
            ids[i],
            EdgeNode {
                level: recall.level,
                channel,
                deps,
            },
        ));
    }

    let mut edges = state.edges();
    for (id, node) in &planned {
        edges.insert(*id, node.clone());
    }
    edges.check()?;
    Ok(planned)
}
