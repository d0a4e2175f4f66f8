//! Hardware backends.
//!
//! A backend owns the sound device (or a stand-in for it). It reports its
//! [`BackendPresets`], fires a [`Pulse`] once per period, and accepts
//! interleaved samples through a lock-free ring buffer. The device side never
//! waits on the engine: an empty ring plays silence.

mod manual;
mod pulse;
mod timer;

#[cfg(feature = "cpal")]
mod device;

pub use manual::{ManualBackend, ManualHandle};
pub use pulse::Pulse;
pub use timer::VirtualBackend;

#[cfg(feature = "cpal")]
pub use device::CpalBackend;

use crate::compat::Arc;
use crate::config::{EngineConfig, SampleFormat};
use crate::{Error, Result};
use ringbuf::traits::{Consumer as _, Split as _};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Device parameters a backend runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendPresets {
    pub channels: usize,
    pub sample_rate: u32,
    /// Frames per period.
    pub buffer_size: usize,
    pub format: SampleFormat,
}

impl BackendPresets {
    /// Interleaved samples in one period.
    #[inline]
    pub fn period_samples(&self) -> usize {
        self.channels * self.buffer_size
    }

    /// Checks the stream parameters against the ranges the engine runs with.
    pub fn validate(&self) -> Result<()> {
        if !(8000..=384000).contains(&self.sample_rate) {
            return Err(Error::InvalidConfig(format!(
                "sample_rate {} out of range (8000-384000 Hz)",
                self.sample_rate
            )));
        }
        if !(16..=8192).contains(&self.buffer_size) {
            return Err(Error::InvalidConfig(format!(
                "buffer_size {} out of range (16-8192 frames)",
                self.buffer_size
            )));
        }
        if !(1..=64).contains(&self.channels) {
            return Err(Error::InvalidConfig(format!(
                "channels {} out of range (1-64)",
                self.channels
            )));
        }
        Ok(())
    }

    /// Applies these presets to `config`.
    pub fn apply(&self, config: &mut EngineConfig) {
        config.channels = self.channels;
        config.sample_rate = self.sample_rate;
        config.buffer_size = self.buffer_size;
        config.format = self.format;
    }
}

impl From<&EngineConfig> for BackendPresets {
    fn from(config: &EngineConfig) -> Self {
        Self {
            channels: config.channels,
            sample_rate: config.sample_rate,
            buffer_size: config.buffer_size,
            format: config.format,
        }
    }
}

/// A source of hardware periods and a sink for mixed audio.
pub trait Backend: Send {
    fn name(&self) -> &str;

    fn presets(&self) -> BackendPresets;

    /// Starts firing `pulse` once per period.
    fn start(&mut self, pulse: Arc<Pulse>) -> Result<()>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Queues interleaved samples for playback without blocking. Returns how
    /// many were accepted.
    fn write(&mut self, interleaved: &[f32]) -> usize;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name())
            .field("presets", &self.presets())
            .finish()
    }
}

/// Ring holding a few periods of output.
pub(crate) fn output_ring(presets: &BackendPresets) -> (HeapProd<f32>, HeapCons<f32>) {
    HeapRb::<f32>::new(presets.period_samples() * 4).split()
}

/// Pops one period into `out`, zero-filling what the ring could not supply.
/// Returns `true` on underflow.
pub(crate) fn pop_period(cons: &mut HeapCons<f32>, out: &mut [f32]) -> bool {
    let read = cons.pop_slice(out);
    out[read..].fill(0.0);
    read < out.len()
}
