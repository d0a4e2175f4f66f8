//! Read-only access to the engine's recall graph.

use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tactus_core::ThreadingMode;
use tactus_recall::{
    ChannelId, ContainerId, EffectSpec, InstanceKey, InvocationEvent, InvocationId, Lane,
    RecallContainer, RecallDependency, RecallGraph, RecallId, RecallInstance, RecallTemplate,
    Result, RunOrder, TemplateId, Topology, TrackId,
};

/// Queries on the engine's graph.
///
/// Changes go through the engine's tasks so they land between two tics;
/// this view only reads.
#[derive(Debug, Clone)]
pub struct GraphView {
    graph: Arc<RecallGraph>,
}

impl GraphView {
    pub(crate) fn new(graph: Arc<RecallGraph>) -> Self {
        Self { graph }
    }

    pub fn threading(&self) -> ThreadingMode {
        self.graph.threading()
    }

    pub fn dependency_timeout(&self) -> Duration {
        self.graph.dependency_timeout()
    }

    // Structure

    pub fn tracks(&self) -> Vec<TrackId> {
        self.graph.tracks()
    }

    pub fn channels(&self, track: TrackId) -> Result<Vec<ChannelId>> {
        self.graph.channels(track)
    }

    pub fn track_of(&self, channel: ChannelId) -> Option<TrackId> {
        self.graph.track_of(channel)
    }

    pub fn output_of(&self, channel: ChannelId) -> Option<usize> {
        self.graph.output_of(channel)
    }

    pub fn upstream_of(&self, channel: ChannelId) -> Option<ChannelId> {
        self.graph.upstream_of(channel)
    }

    pub fn container(&self, id: ContainerId) -> Option<RecallContainer> {
        self.graph.container(id)
    }

    pub fn template(&self, id: TemplateId) -> Option<Arc<RecallTemplate>> {
        self.graph.template(id)
    }

    pub fn topology(&self) -> Topology {
        self.graph.topology()
    }

    /// Checks an effect against the current graph.
    pub fn check_attach(&self, spec: &EffectSpec) -> Result<()> {
        self.graph.check_attach(spec)
    }

    pub fn check_link(&self, channel: ChannelId, upstream: Option<ChannelId>) -> Result<()> {
        self.graph.check_link(channel, upstream)
    }

    pub fn check_dependency(&self, from: TemplateId, to: TemplateId) -> Result<()> {
        self.graph.check_dependency(from, to)
    }

    pub fn check_move(&self, invocation: InvocationId, channel: ChannelId, pos: usize) -> Result<()> {
        self.graph.check_move(invocation, channel, pos)
    }

    // Invocations

    pub fn invocation(&self, id: InvocationId) -> Option<RecallId> {
        self.graph.invocation(id)
    }

    pub fn invocations(&self) -> Vec<InvocationId> {
        self.graph.invocations()
    }

    pub fn run_order(&self, id: InvocationId) -> Option<RunOrder> {
        self.graph.run_order(id)
    }

    pub fn events(&self) -> Receiver<InvocationEvent> {
        self.graph.events()
    }

    pub fn instance(
        &self,
        template: TemplateId,
        invocation: InvocationId,
    ) -> Option<Arc<RecallInstance>> {
        self.graph.instance(template, invocation)
    }

    pub fn instances_of(&self, invocation: InvocationId) -> Vec<Arc<RecallInstance>> {
        self.graph.instances_of(invocation)
    }

    pub fn instance_count(&self) -> usize {
        self.graph.instance_count()
    }

    pub fn resolve_dependency(
        &self,
        edge: &RecallDependency,
        recall_id: &RecallId,
    ) -> Result<Arc<RecallInstance>> {
        self.graph.resolve_dependency(edge, recall_id)
    }

    pub fn destroyed(&self) -> u64 {
        self.graph.destroyed()
    }

    // Schedules

    pub fn lanes(&self) -> Vec<Lane> {
        self.graph.lanes()
    }

    pub fn schedule(&self, lane: Lane) -> Vec<InstanceKey> {
        self.graph.schedule(lane)
    }
}
