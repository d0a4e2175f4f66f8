//! State handed to tasks in the safe window.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tactus_core::{
    Backend, BackendPresets, MixBus, NodeFault, NodeKind, Pulse, TaskError, ThreadNode,
    ThreadTree, ThreadingMode, TicContext,
};
use tactus_recall::{Lane, RecallGraph};

/// The backend slot shared by the engine, the soundcard node and
/// [`SwapBackend`](crate::tasks::SwapBackend).
pub(crate) type BackendSlot = Arc<Mutex<Option<Box<dyn Backend>>>>;

/// Everything a [`Task`](tactus_core::Task) may touch while the tree is
/// between tics.
pub struct EngineContext {
    graph: Arc<RecallGraph>,
    tree: ThreadTree,
    bus: Arc<MixBus>,
    pulse: Arc<Pulse>,
    backend: BackendSlot,
    nodes: HashMap<Lane, Arc<ThreadNode>>,
}

impl EngineContext {
    pub(crate) fn new(
        graph: Arc<RecallGraph>,
        tree: ThreadTree,
        bus: Arc<MixBus>,
        pulse: Arc<Pulse>,
        backend: BackendSlot,
    ) -> Self {
        Self {
            graph,
            tree,
            bus,
            pulse,
            backend,
            nodes: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &Arc<RecallGraph> {
        &self.graph
    }

    pub fn tree(&self) -> &ThreadTree {
        &self.tree
    }

    pub fn bus(&self) -> &Arc<MixBus> {
        &self.bus
    }

    /// Worker node currently running `lane`.
    pub fn lane_node(&self, lane: Lane) -> Option<Arc<ThreadNode>> {
        self.nodes.get(&lane).cloned()
    }

    pub fn backend_presets(&self) -> Option<BackendPresets> {
        self.backend.lock().as_ref().map(|b| b.presets())
    }

    /// Replaces the backend. The new one starts if the old one was running;
    /// the mix bus follows the new presets.
    pub(crate) fn swap_backend(&mut self, mut next: Box<dyn Backend>) -> Result<(), TaskError> {
        let mut slot = self.backend.lock();
        let was_running = slot.as_ref().is_some_and(|b| b.is_running());

        if was_running {
            next.start(Arc::clone(&self.pulse))
                .map_err(|e| TaskError::execution("swap-backend", e))?;
        }
        if let Some(mut previous) = slot.take() {
            previous.stop();
            tracing::debug!(from = previous.name(), to = next.name(), "Backend swapped");
        }

        let presets = next.presets();
        if presets.channels != self.bus.channels() || presets.buffer_size != self.bus.frames() {
            self.bus.resize(presets.channels, presets.buffer_size);
        }
        *slot = Some(next);
        Ok(())
    }

    /// Brings the thread tree in line with the graph: one node per track
    /// and, under per-channel threading, one per channel below it.
    pub(crate) fn sync_nodes(&mut self) -> tactus_core::Result<()> {
        let per_channel = self.graph.threading() == ThreadingMode::PerChannel;
        let mut wanted: Vec<(Lane, Option<Lane>)> = Vec::new();
        for track in self.graph.tracks() {
            wanted.push((Lane::Track(track), None));
            if per_channel {
                for channel in self.graph.channels(track).unwrap_or_default() {
                    wanted.push((Lane::Channel(channel), Some(Lane::Track(track))));
                }
            }
        }

        let mut stale: Vec<Lane> = self
            .nodes
            .keys()
            .filter(|lane| !wanted.iter().any(|(w, _)| w == *lane))
            .copied()
            .collect();
        // channels before their tracks
        stale.sort_by(|a, b| b.cmp(a));
        for lane in stale {
            if let Some(node) = self.nodes.remove(&lane) {
                if let Err(e) = self.tree.detach(node.id()) {
                    tracing::debug!(node = node.name(), "Detach skipped: {}", e);
                    node.stop();
                }
            }
        }

        for (lane, parent) in wanted {
            if self.nodes.contains_key(&lane) {
                continue;
            }
            let parent = parent
                .and_then(|p| self.nodes.get(&p).cloned())
                .unwrap_or_else(|| Arc::clone(self.tree.root()));
            let node = lane_node(Arc::clone(&self.graph), lane);
            self.tree.attach(&parent, Arc::clone(&node))?;
            self.nodes.insert(lane, node);
        }
        Ok(())
    }
}

fn lane_node(graph: Arc<RecallGraph>, lane: Lane) -> Arc<ThreadNode> {
    let (name, kind) = match lane {
        Lane::Track(track) => (track.to_string(), NodeKind::Audio),
        Lane::Channel(channel) => (channel.to_string(), NodeKind::Channel),
    };
    ThreadNode::from_fn(name, kind, move |ctx: &TicContext<'_>| -> Result<(), NodeFault> {
        graph.run_lane(lane, ctx);
        Ok(())
    })
}

/// Node that hands the published mix to the backend once per tic.
pub(crate) fn soundcard_node(bus: Arc<MixBus>, backend: BackendSlot) -> Arc<ThreadNode> {
    ThreadNode::from_fn("soundcard", NodeKind::Soundcard, move |_ctx: &TicContext<'_>| {
        if let Some(backend) = backend.lock().as_mut() {
            bus.with_front(|mix| backend.write(mix));
        }
        Ok(())
    })
}
