//! Builder for configuring and constructing a `TactusEngine`.

use crate::context::{soundcard_node, BackendSlot, EngineContext};
use crate::engine::EngineShared;
use crate::{Result, TactusEngine};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tactus_core::{Backend, EngineConfig, MixBus, Pulse, ThreadingMode, TicScheduler};
use tactus_recall::RecallGraph;

/// A backend's presets win over `sample_rate`, `buffer_size` and
/// `channels`.
///
/// # Example
///
/// ```ignore
/// use tactus::prelude::*;
///
/// let engine = TactusEngine::builder()
///     .threading(ThreadingMode::PerTrack)
///     .dependency_timeout(Duration::from_millis(50))
///     .backend(VirtualBackend::new(presets))
///     .build()?;
/// ```
#[derive(Default)]
pub struct TactusEngineBuilder {
    config: EngineConfig,
    backend: Option<Box<dyn Backend>>,
}

impl TactusEngineBuilder {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: 44100
    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.config.sample_rate = rate;
        self
    }

    /// Frames per tic. Default: 512
    pub fn buffer_size(mut self, frames: usize) -> Self {
        self.config.buffer_size = frames;
        self
    }

    /// Default: 2
    pub fn channels(mut self, channels: usize) -> Self {
        self.config.channels = channels;
        self
    }

    /// Default: [`ThreadingMode::PerChannel`]
    pub fn threading(mut self, threading: ThreadingMode) -> Self {
        self.config.threading = threading;
        self
    }

    /// Longest a recall waits on a dependency within one tic.
    pub fn dependency_timeout(mut self, timeout: Duration) -> Self {
        self.config.dependency_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    pub fn fault_capacity(mut self, capacity: usize) -> Self {
        self.config.fault_capacity = capacity;
        self
    }

    pub fn realtime_priority(mut self, enabled: bool) -> Self {
        self.config.realtime_priority = enabled;
        self
    }

    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn build(self) -> Result<TactusEngine> {
        let mut config = self.config;
        if let Some(backend) = &self.backend {
            backend.presets().apply(&mut config);
        }
        config.validate()?;

        let bus = Arc::new(MixBus::new(config.channels, config.buffer_size));
        let pulse = Arc::new(Pulse::new());
        let backend: BackendSlot = Arc::new(Mutex::new(self.backend));
        let scheduler = TicScheduler::new(&config);
        let graph = Arc::new(RecallGraph::new(&config, Arc::clone(&bus)));

        let tree = scheduler.tree();
        tree.attach(
            tree.root(),
            soundcard_node(Arc::clone(&bus), Arc::clone(&backend)),
        )?;

        let shared = Arc::new(EngineShared::new(EngineContext::new(
            Arc::clone(&graph),
            tree,
            Arc::clone(&bus),
            Arc::clone(&pulse),
            Arc::clone(&backend),
        )));
        let hook = Arc::clone(&shared);
        scheduler.add_safe_window(move |tic: u64| hook.safe_window(tic));

        tracing::debug!(
            sample_rate = config.sample_rate,
            buffer_size = config.buffer_size,
            channels = config.channels,
            threading = ?config.threading,
            "Engine built"
        );

        Ok(TactusEngine::from_parts(
            config, scheduler, graph, bus, backend, pulse, shared,
        ))
    }
}
