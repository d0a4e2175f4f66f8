//! Tic load and overrun tracking.

use crate::compat::{AtomicU32, Ordering};
use crate::lockfree::{AtomicCounter, AtomicFloat};
use std::time::Duration;

/// Snapshot of [`TicMeter`].
#[derive(Debug, Clone, Default)]
pub struct TicMetrics {
    /// Load of the last tic, in percent of the hardware period.
    pub current: f32,
    pub peak: f32,
    pub average: f32,
    /// Tics that finished after the next pulse.
    pub overruns: u64,
    /// Hardware periods that elapsed without a tic of their own.
    pub coalesced_pulses: u64,
    pub period_us: f64,
}

/// Tracks how much of each hardware period the tree needs.
#[derive(Debug)]
pub struct TicMeter {
    current: AtomicFloat,
    peak: AtomicFloat,
    average: AtomicFloat,
    overruns: AtomicCounter,
    coalesced: AtomicCounter,
    samples: AtomicU32,
    period: Duration,
}

impl TicMeter {
    pub fn new(period: Duration) -> Self {
        Self {
            current: AtomicFloat::new(0.0),
            peak: AtomicFloat::new(0.0),
            average: AtomicFloat::new(0.0),
            overruns: AtomicCounter::default(),
            coalesced: AtomicCounter::default(),
            samples: AtomicU32::new(0),
            period,
        }
    }

    pub fn record(&self, elapsed: Duration) {
        if self.period.is_zero() {
            return;
        }
        let load = (elapsed.as_secs_f64() / self.period.as_secs_f64()) as f32;

        self.current.set(load);
        if load > self.peak.get() {
            self.peak.set(load);
        }

        // Exponential moving average
        let count = self.samples.fetch_add(1, Ordering::Relaxed);
        let alpha = 1.0 / (count.min(100) + 1) as f32;
        let avg = self.average.get();
        self.average.set(avg * (1.0 - alpha) + load * alpha);
    }

    /// Counts one late tic covering `late_pulses` extra periods.
    pub fn record_overrun(&self, late_pulses: u64) -> u64 {
        self.coalesced.add(late_pulses);
        self.overruns.incr()
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.get()
    }

    pub fn metrics(&self) -> TicMetrics {
        TicMetrics {
            current: self.current.get() * 100.0,
            peak: self.peak.get() * 100.0,
            average: self.average.get() * 100.0,
            overruns: self.overruns.get(),
            coalesced_pulses: self.coalesced.get(),
            period_us: self.period.as_secs_f64() * 1_000_000.0,
        }
    }

    pub fn reset(&self) {
        self.current.set(0.0);
        self.peak.set(0.0);
        self.average.set(0.0);
        self.overruns.set(0);
        self.coalesced.set(0);
        self.samples.store(0, Ordering::Relaxed);
    }
}
