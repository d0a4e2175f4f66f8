//! Backend driven by hand, for tests and offline stepping.

use super::{output_ring, pop_period, Backend, BackendPresets, Pulse};
use crate::compat::{Arc, Mutex};
use crate::lockfree::{AtomicCounter, AtomicFlag};
use crate::Result;
use ringbuf::traits::Producer as _;
use ringbuf::{HeapCons, HeapProd};

struct Shared {
    presets: BackendPresets,
    cons: Mutex<HeapCons<f32>>,
    pulse: Mutex<Option<Arc<Pulse>>>,
    captured: Mutex<Vec<f32>>,
    underruns: AtomicCounter,
    running: AtomicFlag,
}

/// Backend whose periods elapse only when [`ManualHandle::fire`] is called.
pub struct ManualBackend {
    name: String,
    prod: HeapProd<f32>,
    shared: Arc<Shared>,
}

/// Test-side handle of a [`ManualBackend`].
#[derive(Clone)]
pub struct ManualHandle {
    shared: Arc<Shared>,
}

impl ManualBackend {
    pub fn new(presets: BackendPresets) -> Self {
        let (prod, cons) = output_ring(&presets);
        Self {
            name: "manual".to_string(),
            prod,
            shared: Arc::new(Shared {
                presets,
                cons: Mutex::new(cons),
                pulse: Mutex::new(None),
                captured: Mutex::new(Vec::new()),
                underruns: AtomicCounter::default(),
                running: AtomicFlag::new(false),
            }),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn handle(&self) -> ManualHandle {
        ManualHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Backend for ManualBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn presets(&self) -> BackendPresets {
        self.shared.presets
    }

    fn start(&mut self, pulse: Arc<Pulse>) -> Result<()> {
        *self.shared.pulse.lock() = Some(pulse);
        self.shared.running.set(true);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.set(false);
        self.shared.pulse.lock().take();
    }

    fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    fn write(&mut self, interleaved: &[f32]) -> usize {
        self.prod.push_slice(interleaved)
    }
}

impl ManualHandle {
    /// Plays one period and fires the pulse. Returns the new pulse count, or
    /// `None` when the backend is not started.
    pub fn fire(&self) -> Option<u64> {
        let pulse = self.shared.pulse.lock().clone()?;

        let mut period = vec![0.0; self.shared.presets.period_samples()];
        if pop_period(&mut self.shared.cons.lock(), &mut period) {
            self.shared.underruns.incr();
        }
        self.shared.captured.lock().extend_from_slice(&period);

        Some(pulse.fire())
    }

    /// Fires the pulse without consuming output.
    pub fn fire_pulse_only(&self) -> Option<u64> {
        let pulse = self.shared.pulse.lock().clone()?;
        Some(pulse.fire())
    }

    /// Everything played so far.
    pub fn take_captured(&self) -> Vec<f32> {
        std::mem::take(&mut *self.shared.captured.lock())
    }

    /// Periods that played at least partly as silence.
    pub fn underruns(&self) -> u64 {
        self.shared.underruns.get()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.get()
    }
}
