//! Engine configuration.

use crate::backend::BackendPresets;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sample format exposed by a hardware backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    #[default]
    F32,
    I16,
    U16,
}

/// How channel work is spread across worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingMode {
    /// One worker thread per channel.
    #[default]
    PerChannel,
    /// One worker thread per track; its channels run sequentially in run order.
    PerTrack,
}

/// Configuration for the audio engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Frames per hardware period (one tic).
    pub buffer_size: usize,
    /// Interleaved hardware output channels.
    pub channels: usize,
    pub format: SampleFormat,
    pub threading: ThreadingMode,
    /// Upper bound for a recall waiting on a dependency, in milliseconds.
    pub dependency_timeout_ms: u64,
    /// Capacity of the realtime fault queue.
    pub fault_capacity: usize,
    /// Raise worker thread priority.
    pub realtime_priority: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            buffer_size: 512,
            channels: 2,
            format: SampleFormat::F32,
            threading: ThreadingMode::PerChannel,
            dependency_timeout_ms: 200,
            fault_capacity: 1024,
            realtime_priority: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        BackendPresets::from(self).validate()?;
        if self.dependency_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "dependency_timeout_ms must be non-zero".into(),
            ));
        }
        if self.fault_capacity == 0 {
            return Err(Error::InvalidConfig("fault_capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Duration of one hardware period.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_size as f64 / self.sample_rate as f64)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }
}
