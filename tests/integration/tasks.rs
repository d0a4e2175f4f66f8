//! Task queue integration tests
//!
//! Submission from many threads, coalescing of locked tasks, validation
//! and cyclic tasks against a live engine.

use crate::helpers::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tactus::prelude::*;
use tactus::{EngineContext, Error, RecallError, TaskError, TaskFlags};

/// Counts its launches.
struct Count(Arc<AtomicUsize>);

impl Task<EngineContext> for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn launch(&mut self, _ctx: &mut EngineContext) -> Result<(), TaskError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts its launches and keeps coming back.
struct Heartbeat(Arc<AtomicUsize>);

impl Task<EngineContext> for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn flags(&self) -> TaskFlags {
        TaskFlags::CYCLIC
    }

    fn launch(&mut self, _ctx: &mut EngineContext) -> Result<(), TaskError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Panics when launched.
struct Explode;

impl Task<EngineContext> for Explode {
    fn name(&self) -> &str {
        "explode"
    }

    fn launch(&mut self, _ctx: &mut EngineContext) -> Result<(), TaskError> {
        panic!("task went wrong");
    }
}

#[test]
fn test_panicking_task_keeps_rounds_running() {
    let (engine, handle) = manual_engine(ThreadingMode::PerChannel);
    engine.start().unwrap();
    fire_and_wait(&engine, &handle);

    let ticket = engine.submit(Explode);
    let after = engine.submit(Count(Arc::new(AtomicUsize::new(0))));
    fire_and_wait(&engine, &handle);
    let tic = fire_and_wait(&engine, &handle);
    engine.stop();

    assert!(engine.clock().current() > tic);
    assert!(matches!(
        ticket.try_outcome(),
        Some(TaskOutcome::Failed(TaskError::Execution { ref reason, .. })) if reason.contains("task went wrong")
    ));
    assert_eq!(after.try_outcome(), Some(TaskOutcome::Completed));
}

#[test]
fn test_failed_resize_adds_no_pads() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(2).unwrap();
    let before = engine.graph().topology();

    let result = engine.apply(ResizePads::new(track, 4).with_pad_effect(|track, _pad| {
        EffectSpec::on_track("bad", track).with(RecallSpec::new(
            "gain",
            RecallLevel::Chunk,
            constant(1.0),
        ))
    }));

    assert!(matches!(
        result,
        Err(Error::Task(TaskError::Validation { .. }))
    ));
    assert_eq!(engine.graph().topology(), before);
    assert_eq!(engine.graph().channels(track).unwrap(), pads);
}

#[test]
fn test_tasks_from_many_threads_run_once_each() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    let engine = Arc::new(stepped_engine(ThreadingMode::PerChannel));
    let count = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let count = Arc::clone(&count);
            std::thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|_| engine.submit(Count(Arc::clone(&count))))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let tickets: Vec<_> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    // Nothing runs on the submitting threads
    assert_eq!(count.load(Ordering::SeqCst), 0);

    engine.tick().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), THREADS * PER_THREAD);
    for ticket in tickets {
        assert_eq!(ticket.try_outcome(), Some(TaskOutcome::Completed));
    }
}

#[test]
fn test_locked_duplicates_coalesce() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, _pads) = engine.add_track(2).unwrap();

    let first = engine.submit(ResizePads::new(track, 3));
    let second = engine.submit(ResizePads::new(track, 5));
    let third = engine.submit(ResizePads::new(track, 7));
    engine.tick().unwrap();

    assert_eq!(first.try_outcome(), Some(TaskOutcome::Completed));
    assert_eq!(second.try_outcome(), Some(TaskOutcome::Coalesced));
    assert_eq!(third.try_outcome(), Some(TaskOutcome::Coalesced));
    assert_eq!(engine.graph().channels(track).unwrap().len(), 3);

    // Once the first ran, the key is free again
    engine.resize_pads(track, 1).unwrap();
    assert_eq!(engine.graph().channels(track).unwrap().len(), 1);
}

#[test]
fn test_different_locked_keys_do_not_coalesce() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (a, _) = engine.add_track(1).unwrap();
    let (b, _) = engine.add_track(1).unwrap();

    let ta = engine.submit(ResizePads::new(a, 2));
    let tb = engine.submit(ResizePads::new(b, 2));
    engine.settle();

    assert_eq!(ta.try_outcome(), Some(TaskOutcome::Completed));
    assert_eq!(tb.try_outcome(), Some(TaskOutcome::Completed));
}

#[test]
fn test_rejected_task_leaves_topology() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(2).unwrap();
    let before = engine.graph().topology();

    // Chunk recall on a track-wide effect
    let result = engine.apply(AttachEffect::new(
        EffectSpec::on_track("bad", track).with(RecallSpec::new(
            "bad",
            RecallLevel::Chunk,
            constant(1.0),
        )),
    ));
    assert!(matches!(result, Err(Error::Task(TaskError::Validation { .. }))));

    let result = engine.apply(ResizePads::new(track, 0));
    assert!(result.is_err());

    let result = engine.apply(ChangeLink::new(pads[0], Some(pads[0])));
    assert!(result.is_err());

    assert_eq!(engine.graph().topology(), before);
}

#[test]
fn test_attach_effect_checks_before_queueing() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(1).unwrap();

    let result = engine.attach_effect(
        EffectSpec::on_channel("eq", track, pads[0]).with(
            RecallSpec::new("eq", RecallLevel::Chunk, constant(1.0))
                .depends_on(tactus::TemplateId(999)),
        ),
    );
    assert!(matches!(
        result,
        Err(Error::Recall(RecallError::UnknownTemplate(_)))
    ));
}

#[test]
fn test_detach_unknown_container_fails() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let result = engine.detach_effect(tactus::ContainerId(42));
    assert!(matches!(result, Err(Error::Task(TaskError::Validation { .. }))));
}

#[test]
fn test_cyclic_task_runs_every_tic_until_removed() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let beats = Arc::new(AtomicUsize::new(0));
    let ticket = engine.submit(Heartbeat(Arc::clone(&beats)));

    for _ in 0..3 {
        engine.tick().unwrap();
    }
    assert_eq!(beats.load(Ordering::SeqCst), 3);

    assert!(engine.remove_cyclic(ticket.id()));
    engine.tick().unwrap();
    assert_eq!(beats.load(Ordering::SeqCst), 3);

    let outcomes: Vec<_> = std::iter::from_fn(|| ticket.try_outcome()).collect();
    assert_eq!(outcomes.last(), Some(&TaskOutcome::Removed));
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == TaskOutcome::Completed)
            .count(),
        3
    );
}

#[test]
fn test_submit_with_callback_reports_outcome() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (tx, rx) = crossbeam_channel::unbounded();
    engine.submit_with(AddTrack::new(2), move |outcome| {
        let _ = tx.send(outcome.clone());
    });

    engine.tick().unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        TaskOutcome::Completed
    );
    assert_eq!(engine.graph().tracks().len(), 1);
}

#[test]
fn test_apply_while_running() {
    let (engine, handle) = manual_engine(ThreadingMode::PerChannel);
    engine.start().unwrap();

    let engine = Arc::new(engine);
    let applier = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || engine.add_track(2))
    };

    // The task only runs once a round ends
    while !applier.is_finished() {
        handle.fire().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
    let (track, pads) = applier.join().unwrap().unwrap();
    assert_eq!(engine.graph().channels(track).unwrap(), pads);
    engine.stop();
}
