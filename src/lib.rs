//! # Tactus - Realtime Sequencer Engine
//!
//! Tic-driven audio engine built from two member crates.
//!
//! ## Architecture
//!
//! Tactus is an umbrella crate that coordinates:
//! - **tactus-core** - thread tree, tic scheduler, task queue, backends, mix bus, fault reporting
//! - **tactus-recall** - effect recalls, invocations, dependency resolution, run schedules
//!
//! One hardware period is one tic. Each tic the root wakes every worker node
//! of the tree, waits for the blocking ones, then opens the safe window where
//! queued [`Task`](tactus_core::Task)s change the graph.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tactus::prelude::*;
//!
//! let engine = TactusEngine::builder()
//!     .backend(VirtualBackend::new(presets))
//!     .build()?;
//!
//! let (track, pads) = engine.add_track(2)?;
//! engine.attach_effect(EffectSpec::on_track("volume", track).with_pair(RecallLevel::Chunk, volume))?;
//! engine.start_invocation(Purpose::Playback, &[track])?;
//! engine.start()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `default` - Engine with virtual and manual backends
//! - `cpal` - Hardware output through CPAL

/// Re-export of tactus-core for direct access
pub use tactus_core as core;

/// Re-export of tactus-recall for direct access
pub use tactus_recall as recall;

pub use tactus_core::{
    Backend, BackendPresets, DrainReport, EngineConfig, FaultKind, FaultReport, ManualBackend,
    ManualHandle, NodeKind, NodeState, SampleFormat, Task, TaskError, TaskFlags, TaskOutcome,
    TaskTicket, ThreadNode, ThreadWork, ThreadingMode, TicContext, TicMetrics, VirtualBackend,
};

#[cfg(feature = "cpal")]
pub use tactus_core::CpalBackend;

pub use tactus_recall::{
    processor_fn, ChannelId, ContainerId, EffectSpec, InvocationEvent, InvocationId, Lane,
    PlayContext, ProcessContext, Purpose, RecallError, RecallGraph, RecallId, RecallLevel,
    RecallProcessor, RecallSpec, Stage, StageOutcome, TemplateId, Topology, TrackId,
};

pub mod error;
pub use error::{Error, Result};

mod context;
pub use context::EngineContext;

pub mod tasks;

mod view;
pub use view::GraphView;

mod builder;
mod engine;

pub use builder::TactusEngineBuilder;
pub use engine::TactusEngine;

/// Convenience prelude for common imports
pub mod prelude {
    // Main engine
    pub use crate::{GraphView, TactusEngine, TactusEngineBuilder};

    // Configuration and backends
    pub use crate::core::{
        BackendPresets, EngineConfig, ManualBackend, ThreadingMode, VirtualBackend,
    };

    // Effects
    pub use crate::recall::{
        processor_fn, EffectSpec, ProcessContext, Purpose, RecallLevel, RecallProcessor,
        RecallSpec, StageOutcome,
    };

    // Tasks
    pub use crate::tasks::*;
    pub use crate::core::{Task, TaskOutcome};
}
