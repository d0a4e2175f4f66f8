//! Tic-driven scheduling core of the tactus audio engine.
//!
//! # Primary API
//!
//! - [`TicScheduler`]: root of the thread tree, one round per hardware period
//! - [`ThreadNode`] / [`ThreadWork`]: schedulable workers
//! - [`TicGate`]: per-edge handshake between a node and its parent
//! - [`TaskQueue`] / [`Task`]: graph mutations run in the safe window
//! - [`Backend`]: hardware period source and output sink
//! - [`MixBus`]: double-buffered output mix
//! - [`FaultSink`] / [`FaultReport`]: realtime fault reporting
//!
//! # Feature-gated APIs
//!
//! - `"cpal"`: [`CpalBackend`] for real audio devices
//!
//! # Example
//!
//! ```ignore
//! use tactus_core::*;
//!
//! let config = EngineConfig::default();
//! let scheduler = TicScheduler::new(&config);
//! let tree = scheduler.tree();
//! tree.attach(scheduler.root(), ThreadNode::from_fn("ch0", NodeKind::Channel, |ctx| {
//!     // process one period for tic ctx.tic()
//!     Ok(())
//! }))?;
//!
//! scheduler.tick()?;
//! ```

pub mod compat;

pub mod error;
pub use error::{Error, Result, SchedulingError, TaskError};

mod config;
pub use config::{EngineConfig, SampleFormat, ThreadingMode};

pub(crate) mod lockfree;
pub use compat::{Arc, AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
pub use lockfree::{AtomicCounter, AtomicFlag, AtomicFloat};

mod tic;
pub use tic::TicClock;

pub mod thread;
pub use thread::{
    idle_work, NodeFault, NodeId, NodeKind, NodeState, SafeWindow, ThreadNode, ThreadTree,
    ThreadWork, TicContext, TicGate, TicScheduler, TickEnv,
};

pub mod task;
pub use task::{DrainReport, Task, TaskFlags, TaskId, TaskOutcome, TaskQueue, TaskTicket};

pub mod backend;
pub use backend::{Backend, BackendPresets, ManualBackend, ManualHandle, Pulse, VirtualBackend};

#[cfg(feature = "cpal")]
pub use backend::CpalBackend;

mod mix;
pub use mix::MixBus;

mod meter;
pub use meter::{TicMeter, TicMetrics};

pub mod report;
pub use report::{fault_channel, Fault, FaultAggregator, FaultKind, FaultReport, FaultSink};
