//! Per-lane run schedules and per-tic execution.
//!
//! A schedule is rebuilt in the safe window whenever the graph changed and
//! published as one immutable snapshot. Worker threads only ever read it.

use crate::dependency::{resolve_dependency, EdgeSet};
use crate::error::RecallError;
use crate::ids::{ChannelId, InvocationId, TemplateId, TrackId};
use crate::instance::{Executed, InstanceKey, RecallInstance};
use crate::invocation::Invocation;
use crate::recall::{PlayContext, RecallLevel, RecallTemplate};
use dashmap::DashMap;
use hashbrown::HashMap;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tactus_core::{FaultKind, MixBus, SchedulingError, ThreadingMode, TicContext};
use tracing::{error, warn};

/// The thread a group of instances runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    Track(TrackId),
    Channel(ChannelId),
}

impl Lane {
    /// Lane of `template` under `threading`.
    pub fn of(template: &RecallTemplate, threading: ThreadingMode) -> Lane {
        match (threading, template.channel) {
            (ThreadingMode::PerChannel, Some(channel)) => Lane::Channel(channel),
            _ => Lane::Track(template.track),
        }
    }
}

pub(crate) struct ScheduleEntry {
    pub instance: Arc<RecallInstance>,
    pub deps: Vec<Arc<RecallInstance>>,
    /// Declared dependencies that never got an instance for this invocation.
    pub missing: Vec<RecallError>,
    pub output: Option<usize>,
}

#[derive(Default)]
pub(crate) struct ScheduleSet {
    lanes: HashMap<Lane, Vec<ScheduleEntry>>,
    /// Where each instance sits in `lanes`.
    index: HashMap<InstanceKey, (Lane, usize)>,
}

impl ScheduleSet {
    fn new(lanes: HashMap<Lane, Vec<ScheduleEntry>>) -> Self {
        let index = lanes
            .iter()
            .flat_map(|(lane, entries)| {
                entries
                    .iter()
                    .enumerate()
                    .map(move |(i, entry)| (entry.instance.key(), (*lane, i)))
            })
            .collect();
        Self { lanes, index }
    }

    pub(crate) fn lane(&self, lane: Lane) -> Option<&[ScheduleEntry]> {
        self.lanes.get(&lane).map(Vec::as_slice)
    }

    pub(crate) fn entry(&self, key: InstanceKey) -> Option<&ScheduleEntry> {
        let (lane, i) = self.index.get(&key)?;
        self.lanes.get(lane)?.get(*i)
    }

    pub(crate) fn lanes(&self) -> Vec<Lane> {
        let mut lanes: Vec<Lane> = self.lanes.keys().copied().collect();
        lanes.sort();
        lanes
    }
}

pub(crate) struct ScheduleInput<'a> {
    pub templates: &'a HashMap<TemplateId, Arc<RecallTemplate>>,
    pub outputs: &'a HashMap<ChannelId, usize>,
    pub edges: &'a EdgeSet,
    pub instances: &'a DashMap<InstanceKey, Arc<RecallInstance>>,
    pub invocations: &'a DashMap<InvocationId, Invocation>,
    pub threading: ThreadingMode,
}

type SortKey = (u8, InvocationId, usize, RecallLevel, PlayContext, TemplateId);

pub(crate) fn build(input: &ScheduleInput<'_>) -> ScheduleSet {
    let live: Vec<Arc<RecallInstance>> = input
        .instances
        .iter()
        .filter(|entry| entry.value().is_active())
        .map(|entry| Arc::clone(entry.value()))
        .collect();

    let mut grouped: HashMap<Lane, Vec<(SortKey, ScheduleEntry)>> = HashMap::new();
    for instance in live {
        let Some(template) = input.templates.get(&instance.key().template) else {
            continue;
        };
        let invocation = instance.key().invocation;
        let (position, duplicated) = match input.invocations.get(&invocation) {
            Some(inv) => (
                template
                    .channel
                    .and_then(|ch| inv.run_order.position(ch))
                    .unwrap_or(0),
                inv.duplicated.clone(),
            ),
            None => continue,
        };

        let mut deps = Vec::new();
        let mut missing = Vec::new();
        for edge in &template.dependencies {
            match resolve_dependency(input.instances, edge, instance.recall_id()) {
                Ok(dep) => deps.push(dep),
                // Swept after reaching DONE; nothing left to wait for.
                Err(_) if duplicated.contains(&edge.target) => {}
                Err(e) => missing.push(e),
            }
        }
        if let (RecallLevel::Chunk, Some(channel)) = (template.level, template.channel) {
            for upstream in input.edges.upstream_chunks(channel) {
                let key = InstanceKey {
                    template: upstream,
                    invocation,
                };
                if let Some(dep) = input.instances.get(&key) {
                    deps.push(Arc::clone(dep.value()));
                }
            }
        }

        let key: SortKey = (
            u8::from(template.level != RecallLevel::Track),
            invocation,
            position,
            template.level,
            template.context,
            template.id,
        );
        let entry = ScheduleEntry {
            output: template.channel.and_then(|ch| input.outputs.get(&ch).copied()),
            instance,
            deps,
            missing,
        };
        grouped
            .entry(Lane::of(template, input.threading))
            .or_default()
            .push((key, entry));
    }

    ScheduleSet::new(
        grouped
            .into_iter()
            .map(|(lane, entries)| (lane, order(entries)))
            .collect(),
    )
}

/// Dependencies first, then by sort key.
fn order(entries: Vec<(SortKey, ScheduleEntry)>) -> Vec<ScheduleEntry> {
    let index: HashMap<InstanceKey, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, (_, e))| (e.instance.key(), i))
        .collect();

    let mut indegree = vec![0usize; entries.len()];
    let mut dependents = vec![Vec::new(); entries.len()];
    for (i, (_, entry)) in entries.iter().enumerate() {
        for dep in &entry.deps {
            if let Some(&j) = index.get(&dep.key()) {
                if j != i {
                    indegree[i] += 1;
                    dependents[j].push(i);
                }
            }
        }
    }

    let mut ready: BTreeSet<(SortKey, usize)> = entries
        .iter()
        .enumerate()
        .filter(|(i, _)| indegree[*i] == 0)
        .map(|(i, (key, _))| (*key, i))
        .collect();
    let mut sequence = Vec::with_capacity(entries.len());
    while let Some((_, i)) = ready.pop_first() {
        sequence.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert((entries[d].0, d));
            }
        }
    }
    if sequence.len() < entries.len() {
        let mut rest: Vec<usize> = (0..entries.len()).filter(|i| indegree[*i] > 0).collect();
        rest.sort_by_key(|i| entries[*i].0);
        sequence.extend(rest);
    }

    let mut slots: Vec<Option<ScheduleEntry>> = entries.into_iter().map(|(_, e)| Some(e)).collect();
    sequence
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

/// Runs one instance for the current tic. Returns whether RUN happened.
///
/// An instance runs at most once per tic. On a node without its own thread
/// every lane shares the caller's thread, so a dependency that has not run
/// yet is run inline instead of waited for.
pub(crate) fn run_entry(
    set: &ScheduleSet,
    entry: &ScheduleEntry,
    ctx: &TicContext<'_>,
    bus: &MixBus,
    timeout: Duration,
) -> bool {
    run_nested(set, entry, ctx, bus, timeout, &mut Vec::new())
}

fn run_nested(
    set: &ScheduleSet,
    entry: &ScheduleEntry,
    ctx: &TicContext<'_>,
    bus: &MixBus,
    timeout: Duration,
    path: &mut Vec<InstanceKey>,
) -> bool {
    let instance = &entry.instance;
    let tic = ctx.tic();

    if instance.latch.is_marked(tic) {
        return false;
    }
    if !instance.is_active() {
        if instance.is_cancelled() {
            instance.finish_cancel();
        }
        instance.latch.mark(tic);
        return false;
    }

    for missing in &entry.missing {
        ctx.report(
            FaultKind::ResolutionFailed,
            instance.template().label(),
            missing.to_string(),
        );
    }

    path.push(instance.key());
    let inline = !ctx.node().is_started();
    let stalled: Cell<Option<InstanceKey>> = Cell::new(None);
    let wait_deps = || {
        if !entry.missing.is_empty() {
            return false;
        }
        for dep in &entry.deps {
            if !dep.is_active() || dep.latch.is_marked(tic) {
                continue;
            }
            let ready = if inline {
                match set.entry(dep.key()) {
                    Some(dep_entry) if !path.contains(&dep.key()) => {
                        run_nested(set, dep_entry, ctx, bus, timeout, path);
                        dep.latch.is_marked(tic)
                    }
                    _ => false,
                }
            } else {
                ctx.wait_for_sibling(|| dep.latch.wait(tic, timeout))
            };
            if !ready && dep.is_active() {
                stalled.set(Some(dep.key()));
                return false;
            }
        }
        true
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        instance.execute(tic, wait_deps, bus, entry.output)
    }));
    path.pop();

    let ran = match result {
        Ok(Ok(Executed::Ran)) => true,
        Ok(Ok(Executed::Stalled)) => {
            if let Some(dep) = stalled.get() {
                let label = instance.template().label();
                let stall = SchedulingError::DependencyStall {
                    tic,
                    recall: label.clone(),
                };
                if inline {
                    warn!(recall = %label, tic, "Dependency {} could not run first", dep.template);
                } else {
                    warn!(recall = %label, tic, "Dependency {} not ready after {:?}", dep.template, timeout);
                }
                ctx.report(
                    FaultKind::DependencyStall,
                    label,
                    format!("{stall} (waiting on {})", dep.template),
                );
            }
            false
        }
        Ok(Ok(_)) => false,
        Ok(Err(e)) => {
            quarantine(instance, ctx, e.to_string());
            false
        }
        Err(payload) => {
            quarantine(instance, ctx, panic_message(payload.as_ref()));
            false
        }
    };

    instance.latch.mark(tic);
    ran
}

fn quarantine(instance: &RecallInstance, ctx: &TicContext<'_>, message: String) {
    instance.quarantine();
    let label = instance.template().label();
    error!(recall = %label, invocation = %instance.key().invocation, tic = ctx.tic(), "Recall quarantined: {}", message);
    ctx.report(FaultKind::Processor, label, message);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
