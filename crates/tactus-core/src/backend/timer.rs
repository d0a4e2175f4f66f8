//! Virtual sound card clocked by a timer thread.

use super::{output_ring, pop_period, Backend, BackendPresets, Pulse};
use crate::compat::{Arc, Mutex};
use crate::lockfree::{AtomicCounter, AtomicFlag};
use crate::{Error, Result};
use ringbuf::traits::Producer as _;
use ringbuf::{HeapCons, HeapProd};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Backend that plays into nowhere at the pace of real hardware.
pub struct VirtualBackend {
    presets: BackendPresets,
    prod: HeapProd<f32>,
    cons: Arc<Mutex<HeapCons<f32>>>,
    running: Arc<AtomicFlag>,
    underruns: Arc<AtomicCounter>,
    periods: Arc<AtomicCounter>,
    thread: Option<JoinHandle<()>>,
}

impl VirtualBackend {
    pub fn new(presets: BackendPresets) -> Self {
        let (prod, cons) = output_ring(&presets);
        Self {
            presets,
            prod,
            cons: Arc::new(Mutex::new(cons)),
            running: Arc::new(AtomicFlag::new(false)),
            underruns: Arc::new(AtomicCounter::default()),
            periods: Arc::new(AtomicCounter::default()),
            thread: None,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.presets.buffer_size as f64 / self.presets.sample_rate as f64)
    }

    /// Periods played since start.
    pub fn periods(&self) -> u64 {
        self.periods.get()
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.get()
    }
}

impl Backend for VirtualBackend {
    fn name(&self) -> &str {
        "virtual"
    }

    fn presets(&self) -> BackendPresets {
        self.presets
    }

    fn start(&mut self, pulse: Arc<Pulse>) -> Result<()> {
        if self.running.swap(true) {
            return Ok(());
        }

        let period = self.period();
        let samples = self.presets.period_samples();
        let cons = Arc::clone(&self.cons);
        let running = Arc::clone(&self.running);
        let underruns = Arc::clone(&self.underruns);
        let periods = Arc::clone(&self.periods);

        let spawned = thread::Builder::new()
            .name("tactus-virtual-card".into())
            .spawn(move || {
                let mut buffer = vec![0.0f32; samples];
                let mut next = Instant::now() + period;

                while running.get() {
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    }
                    next += period;

                    if pop_period(&mut cons.lock(), &mut buffer) {
                        underruns.incr();
                    }
                    periods.incr();
                    pulse.fire();
                }
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                tracing::debug!(?period, "Virtual backend started");
                Ok(())
            }
            Err(source) => {
                self.running.set(false);
                Err(Error::ThreadSpawn {
                    name: "tactus-virtual-card".into(),
                    source,
                })
            }
        }
    }

    fn stop(&mut self) {
        self.running.set(false);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn write(&mut self, interleaved: &[f32]) -> usize {
        self.prod.push_slice(interleaved)
    }
}

impl Drop for VirtualBackend {
    fn drop(&mut self) {
        self.stop();
    }
}
