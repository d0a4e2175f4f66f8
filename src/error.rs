//! Centralized error type for the tactus umbrella crate.
//!
//! Wraps all subsystem errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] tactus_core::Error),

    #[error("Recall: {0}")]
    Recall(#[from] tactus_recall::RecallError),

    #[error(transparent)]
    Task(#[from] tactus_core::TaskError),

    #[error("No backend configured")]
    NoBackend,
}

pub type Result<T> = std::result::Result<T, Error>;
