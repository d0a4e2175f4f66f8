//! Recall graph of the tactus audio engine.
//!
//! Effects attach as [`RecallContainer`]s of [`RecallTemplate`]s at one of
//! four [`RecallLevel`]s. Each invocation ([`RecallId`]) duplicates the
//! templates it covers into [`RecallInstance`]s, which run per tic on their
//! [`Lane`] in dependency order.
//!
//! # Example
//!
//! ```ignore
//! use tactus_recall::*;
//!
//! let graph = RecallGraph::new(&config, bus);
//! let track = graph.add_track();
//! let channel = graph.add_channel(track)?;
//! graph.attach(
//!     EffectSpec::on_channel("gain", track, channel)
//!         .with(RecallSpec::new("gain", RecallLevel::Chunk, processor_fn(|ctx| {
//!             ctx.buffer.fill(0.25);
//!             Ok(StageOutcome::Continue)
//!         }))),
//! )?;
//! let recall_id = graph.start_invocation(Purpose::Playback, &[track])?;
//! graph.refresh();
//! ```

pub mod error;
pub use error::{RecallError, Result};

mod ids;
pub use ids::{ChannelId, ContainerId, InvocationId, RecyclingId, TemplateId, TrackId};

mod recycling;
pub use recycling::RecyclingContext;

mod recall_id;
pub use recall_id::{Purpose, RecallId};

mod run_order;
pub use run_order::RunOrder;

mod recall;
pub use recall::{
    processor_fn, FnProcessor, PlayContext, ProcessContext, RecallDependency, RecallLevel,
    RecallProcessor, RecallTemplate, Stage, StageOutcome,
};

mod container;
pub use container::{DependencyRef, EffectSpec, RecallContainer, RecallSpec};

mod instance;
pub use instance::{InstanceKey, RecallInstance};

mod dependency;
pub use dependency::resolve_dependency;

mod invocation;
pub use invocation::InvocationEvent;

mod schedule;
pub use schedule::Lane;

mod destroy;

mod graph;
pub use graph::{RecallGraph, SweepReport, TemplateShape, Topology};
