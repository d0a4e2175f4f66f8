//! Integration test modules for Tactus
//!
//! - engine: build, start/stop, stepping, backends, async workers
//! - tasks: queue semantics against a live engine
//! - recall: dependencies, invocations, faults, attach/detach symmetry
//! - scenarios: topology changes and late tics during playback

pub mod engine;
pub mod recall;
pub mod scenarios;
pub mod tasks;
