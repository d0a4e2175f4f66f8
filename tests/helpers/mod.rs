//! Test helpers and fixtures for Tactus integration tests
//!
//! Engines are driven either by a [`ManualBackend`], whose periods elapse
//! only when the test fires them, or by stepping `tick()` directly.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tactus::prelude::*;
use tactus::{ManualHandle, SampleFormat};

pub const TEST_SAMPLE_RATE: u32 = 48000;

/// Small period so buffer checks stay readable.
pub const TEST_BUFFER_SIZE: usize = 64;

pub const TEST_CHANNELS: usize = 2;

pub fn test_presets() -> BackendPresets {
    BackendPresets {
        channels: TEST_CHANNELS,
        sample_rate: TEST_SAMPLE_RATE,
        buffer_size: TEST_BUFFER_SIZE,
        format: SampleFormat::F32,
    }
}

/// Engine without a backend, advanced with `tick()`.
pub fn stepped_engine(threading: ThreadingMode) -> TactusEngine {
    TactusEngine::builder()
        .sample_rate(TEST_SAMPLE_RATE)
        .buffer_size(TEST_BUFFER_SIZE)
        .channels(TEST_CHANNELS)
        .threading(threading)
        .build()
        .expect("Failed to create stepped engine")
}

/// Engine on a manual backend, plus the handle that fires its periods.
pub fn manual_engine(threading: ThreadingMode) -> (TactusEngine, ManualHandle) {
    let backend = ManualBackend::new(test_presets());
    let handle = backend.handle();
    let engine = TactusEngine::builder()
        .threading(threading)
        .dependency_timeout(Duration::from_secs(2))
        .backend(backend)
        .build()
        .expect("Failed to create manual engine");
    (engine, handle)
}

/// Polls `cond` for up to five seconds.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Fires one period and waits until its round finished.
pub fn fire_and_wait(engine: &TactusEngine, handle: &ManualHandle) -> u64 {
    let tic = engine.clock().current();
    handle.fire().expect("backend not started");
    assert!(
        wait_until(|| engine.clock().current() > tic),
        "round for tic {tic} never finished"
    );
    tic
}

/// Chunk processor writing `value` into every sample.
pub fn constant(value: f32) -> impl RecallProcessor + Clone {
    processor_fn(move |ctx| {
        ctx.buffer.fill(value);
        Ok(StageOutcome::Continue)
    })
}

/// Shared log of `(tic, label)` pairs written by [`logging`] processors.
pub type RunLog = Arc<Mutex<Vec<(u64, &'static str)>>>;

pub fn run_log() -> RunLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Processor that records each RUN in `log`.
pub fn logging(label: &'static str, log: &RunLog) -> impl RecallProcessor + Clone {
    let log = Arc::clone(log);
    processor_fn(move |ctx| {
        log.lock().push((ctx.tic, label));
        Ok(StageOutcome::Continue)
    })
}

/// Tics at which `label` ran.
pub fn tics_of(log: &RunLog, label: &str) -> Vec<u64> {
    log.lock()
        .iter()
        .filter(|(_, l)| *l == label)
        .map(|(tic, _)| *tic)
        .collect()
}

/// Installs a test subscriber; repeated calls are harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
