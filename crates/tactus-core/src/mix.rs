//! Double-buffered interleaved mix bus.
//!
//! Chunk-level work of tic `T` accumulates into the back buffer. At the end of
//! the tic the root swaps the buffers, and during tic `T + 1` the soundcard
//! node hands the front buffer (the mix of `T`) to the backend. The hardware
//! therefore never waits on the tic that is still being computed.

use crate::compat::{Mutex, RwLock};

#[derive(Debug)]
struct Buffers {
    front: Vec<f32>,
    back: Vec<f32>,
}

#[derive(Debug)]
pub struct MixBus {
    layout: RwLock<(usize, usize)>,
    buffers: Mutex<Buffers>,
}

impl MixBus {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            layout: RwLock::new((channels, frames)),
            buffers: Mutex::new(Buffers {
                front: vec![0.0; channels * frames],
                back: vec![0.0; channels * frames],
            }),
        }
    }

    pub fn channels(&self) -> usize {
        self.layout.read().0
    }

    pub fn frames(&self) -> usize {
        self.layout.read().1
    }

    /// Adds mono `samples` into one output channel of the back buffer.
    /// Channels outside the layout wrap around.
    pub fn accumulate(&self, channel: usize, samples: &[f32]) {
        let (channels, frames) = *self.layout.read();
        if channels == 0 {
            return;
        }
        let channel = channel % channels;

        let mut buffers = self.buffers.lock();
        for (frame, sample) in samples.iter().take(frames).enumerate() {
            buffers.back[frame * channels + channel] += sample;
        }
    }

    /// Publishes the back buffer and clears the new back buffer.
    pub fn swap(&self) {
        let mut buffers = self.buffers.lock();
        let Buffers { front, back } = &mut *buffers;
        std::mem::swap(front, back);
        back.fill(0.0);
    }

    /// Runs `f` on the published mix.
    pub fn with_front<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        f(&self.buffers.lock().front)
    }

    /// Changes the layout. Both buffers are cleared.
    pub fn resize(&self, channels: usize, frames: usize) {
        let mut layout = self.layout.write();
        let mut buffers = self.buffers.lock();
        *layout = (channels, frames);
        buffers.front = vec![0.0; channels * frames];
        buffers.back = vec![0.0; channels * frames];
    }
}
