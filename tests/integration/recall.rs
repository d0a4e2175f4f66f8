//! Recall graph integration tests
//!
//! Dependency ordering, cancellation, invocation lifecycle, fault isolation
//! and attach/detach symmetry, run through the engine.

use crate::helpers::*;
use proptest::prelude::*;
use std::time::Duration;
use tactus::prelude::*;
use tactus::recall::RecallDependency;
use tactus::{Error, FaultKind, InvocationEvent, Lane, RecallError};

#[test]
fn test_dependency_runs_first_across_threads() {
    let (engine, handle) = manual_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(2).unwrap();
    let log = run_log();

    // The dependency lives on the later channel so its thread would
    // otherwise tend to run second.
    let a = engine
        .attach_effect(
            EffectSpec::on_channel("a", track, pads[1])
                .with(RecallSpec::new("a", RecallLevel::Chunk, logging("a", &log))),
        )
        .unwrap();
    let a_template = engine.graph().container(a).unwrap().play[0];
    engine
        .attach_effect(
            EffectSpec::on_channel("b", track, pads[0]).with(
                RecallSpec::new("b", RecallLevel::Chunk, logging("b", &log)).depends_on(a_template),
            ),
        )
        .unwrap();

    engine.start_invocation(Purpose::Playback, &[track]).unwrap();
    engine.start().unwrap();
    for _ in 0..6 {
        fire_and_wait(&engine, &handle);
    }
    engine.stop();

    let b_tics = tics_of(&log, "b");
    assert_eq!(b_tics, tics_of(&log, "a"));
    assert_eq!(b_tics.len(), 6);

    let entries = log.lock().clone();
    for tic in b_tics {
        let a_at = entries.iter().position(|e| *e == (tic, "a")).unwrap();
        let b_at = entries.iter().position(|e| *e == (tic, "b")).unwrap();
        assert!(a_at < b_at, "b ran before its dependency at tic {tic}");
    }
}

#[test]
fn test_stepped_dependency_on_later_channel_runs_first() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(2).unwrap();
    let log = run_log();

    // Lanes run one after the other on the caller, in channel order
    let late = engine
        .attach_effect(
            EffectSpec::on_channel("late", track, pads[1])
                .with(RecallSpec::new("late", RecallLevel::Chunk, logging("late", &log))),
        )
        .unwrap();
    let late_template = engine.graph().container(late).unwrap().play[0];
    engine
        .attach_effect(
            EffectSpec::on_channel("eager", track, pads[0]).with(
                RecallSpec::new("eager", RecallLevel::Chunk, logging("eager", &log))
                    .depends_on(late_template),
            ),
        )
        .unwrap();
    engine.start_invocation(Purpose::Playback, &[track]).unwrap();

    let reports = engine.reports();
    for _ in 0..3 {
        engine.tick().unwrap();
    }
    engine.flush_faults();

    assert_eq!(tics_of(&log, "eager"), vec![1, 2, 3]);
    assert_eq!(tics_of(&log, "late"), vec![1, 2, 3]);
    assert_eq!(
        *log.lock(),
        vec![
            (1, "late"),
            (1, "eager"),
            (2, "late"),
            (2, "eager"),
            (3, "late"),
            (3, "eager"),
        ]
    );
    assert!(!reports
        .try_iter()
        .any(|r| r.kind == FaultKind::DependencyStall));
}

#[test]
fn test_stepped_link_from_later_channel_feeds_earlier() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(2).unwrap();
    let log = run_log();
    for (pad, label) in [(pads[0], "down"), (pads[1], "up")] {
        engine
            .attach_effect(
                EffectSpec::on_channel(label, track, pad)
                    .with(RecallSpec::new(label, RecallLevel::Chunk, logging(label, &log))),
            )
            .unwrap();
    }
    engine.change_link(pads[0], Some(pads[1])).unwrap();
    engine.start_invocation(Purpose::Playback, &[track]).unwrap();

    for _ in 0..3 {
        engine.tick().unwrap();
    }

    assert_eq!(tics_of(&log, "up"), vec![1, 2, 3]);
    assert_eq!(tics_of(&log, "down"), vec![1, 2, 3]);
    let entries = log.lock().clone();
    for tic in 1..=3 {
        let up_at = entries.iter().position(|e| *e == (tic, "up")).unwrap();
        let down_at = entries.iter().position(|e| *e == (tic, "down")).unwrap();
        assert!(up_at < down_at, "downstream ran first at tic {tic}");
    }
}

#[test]
fn test_threaded_dependency_stall_skips_run() {
    let backend = ManualBackend::new(test_presets());
    let handle = backend.handle();
    let engine = TactusEngine::builder()
        .threading(ThreadingMode::PerChannel)
        .dependency_timeout(Duration::from_millis(20))
        .backend(backend)
        .build()
        .unwrap();
    let (track, pads) = engine.add_track(2).unwrap();
    let log = run_log();

    let slow_log = std::sync::Arc::clone(&log);
    let slow = engine
        .attach_effect(EffectSpec::on_channel("slow", track, pads[1]).with(RecallSpec::new(
            "slow",
            RecallLevel::Chunk,
            processor_fn(move |ctx| {
                std::thread::sleep(Duration::from_millis(200));
                slow_log.lock().push((ctx.tic, "slow"));
                Ok(StageOutcome::Continue)
            }),
        )))
        .unwrap();
    let slow_template = engine.graph().container(slow).unwrap().play[0];
    engine
        .attach_effect(
            EffectSpec::on_channel("eager", track, pads[0]).with(
                RecallSpec::new("eager", RecallLevel::Chunk, logging("eager", &log))
                    .depends_on(slow_template),
            ),
        )
        .unwrap();
    engine.start_invocation(Purpose::Playback, &[track]).unwrap();

    let reports = engine.reports();
    engine.start().unwrap();
    let tic = fire_and_wait(&engine, &handle);
    engine.stop();

    assert_eq!(tics_of(&log, "slow"), vec![tic]);
    assert!(tics_of(&log, "eager").is_empty());
    let stall = reports
        .try_iter()
        .find(|r| r.kind == FaultKind::DependencyStall)
        .expect("no stall reported");
    assert!(stall.source.starts_with("eager"));
}

#[test]
fn test_cancel_stops_run_from_next_tic() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(1).unwrap();
    let log = run_log();
    engine
        .attach_effect(
            EffectSpec::on_channel("x", track, pads[0])
                .with(RecallSpec::new("x", RecallLevel::Chunk, logging("x", &log))),
        )
        .unwrap();

    let events = engine.events();
    let recall_id = engine.start_invocation(Purpose::Record, &[track]).unwrap();
    for _ in 0..3 {
        engine.tick().unwrap();
    }

    engine.cancel_invocation(recall_id.id()).unwrap();
    for _ in 0..3 {
        engine.tick().unwrap();
    }

    assert_eq!(tics_of(&log, "x"), vec![1, 2, 3]);
    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(
        events,
        vec![
            InvocationEvent::Started { id: recall_id.id() },
            InvocationEvent::Cancelled {
                id: recall_id.id(),
                tic: 4
            },
        ]
    );
    assert!(engine.graph().invocation(recall_id.id()).is_none());
    assert!(engine.graph().instances_of(recall_id.id()).is_empty());
}

#[test]
fn test_cancel_unknown_invocation_fails() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let result = engine.cancel_invocation(tactus::InvocationId(7));
    assert!(result.is_err());
}

#[test]
fn test_invocation_finishes_when_only_persistent_recalls_remain() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(1).unwrap();
    engine
        .attach_effect(
            EffectSpec::on_channel("region", track, pads[0])
                .with(RecallSpec::new(
                    "meter",
                    RecallLevel::Channel,
                    constant(0.0),
                ))
                .with(RecallSpec::new(
                    "region",
                    RecallLevel::Chunk,
                    processor_fn(|ctx| {
                        Ok(if ctx.tic >= 2 {
                            StageOutcome::Done
                        } else {
                            StageOutcome::Continue
                        })
                    }),
                )),
        )
        .unwrap();

    let events = engine.events();
    let recall_id = engine.start_invocation(Purpose::Export, &[track]).unwrap();
    assert_eq!(engine.graph().instances_of(recall_id.id()).len(), 2);

    for _ in 0..3 {
        engine.tick().unwrap();
    }

    assert!(events.try_iter().any(|e| e
        == InvocationEvent::Finished {
            id: recall_id.id(),
            tic: 2
        }));
    assert!(engine.graph().invocation(recall_id.id()).is_none());
    assert!(wait_until(|| engine.graph().destroyed() == 2));
}

#[test]
fn test_panicking_processor_is_quarantined() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(2).unwrap();
    let log = run_log();

    let bad = engine
        .attach_effect(
            EffectSpec::on_channel("bad", track, pads[0]).with(RecallSpec::new(
                "bad",
                RecallLevel::Chunk,
                processor_fn(|ctx| {
                    if ctx.tic == 2 {
                        panic!("filter blew up");
                    }
                    Ok(StageOutcome::Continue)
                }),
            )),
        )
        .unwrap();
    engine
        .attach_effect(
            EffectSpec::on_channel("good", track, pads[1])
                .with(RecallSpec::new("good", RecallLevel::Chunk, logging("good", &log))),
        )
        .unwrap();

    let reports = engine.reports();
    let recall_id = engine.start_invocation(Purpose::Playback, &[track]).unwrap();
    for _ in 0..4 {
        engine.tick().unwrap();
    }
    engine.flush_faults();

    // The neighbour is unaffected
    assert_eq!(tics_of(&log, "good"), vec![1, 2, 3, 4]);

    let bad_template = engine.graph().container(bad).unwrap().play[0];
    assert!(engine
        .graph()
        .instance(bad_template, recall_id.id())
        .is_none());
    let fault = reports
        .try_iter()
        .find(|r| r.kind == FaultKind::Processor)
        .expect("no processor fault");
    assert_eq!(fault.count, 1);
    assert!(fault.message.contains("filter blew up"));
}

#[test]
fn test_per_track_lane_follows_run_order() {
    let engine = stepped_engine(ThreadingMode::PerTrack);
    let (track, pads) = engine.add_track(3).unwrap();
    let gain = engine
        .attach_effect(
            EffectSpec::on_track("gain", track)
                .with(RecallSpec::new("gain", RecallLevel::Track, constant(1.0))),
        )
        .unwrap();
    for pad in &pads {
        engine
            .attach_effect(
                EffectSpec::on_channel("pad", track, *pad)
                    .with(RecallSpec::new("pad", RecallLevel::Chunk, constant(0.1))),
            )
            .unwrap();
    }
    let recall_id = engine.start_invocation(Purpose::Playback, &[track]).unwrap();

    let graph = engine.graph();
    let channels_in_lane = || -> Vec<Option<tactus::ChannelId>> {
        graph
            .schedule(Lane::Track(track))
            .into_iter()
            .map(|key| graph.template(key.template).unwrap().channel)
            .collect()
    };

    let gain_template = graph.container(gain).unwrap().play[0];
    assert_eq!(graph.schedule(Lane::Track(track))[0].template, gain_template);
    assert_eq!(
        channels_in_lane(),
        vec![None, Some(pads[0]), Some(pads[1]), Some(pads[2])]
    );

    engine.move_channel(recall_id.id(), pads[2], 0).unwrap();
    assert_eq!(
        channels_in_lane(),
        vec![None, Some(pads[2]), Some(pads[0]), Some(pads[1])]
    );
}

#[test]
fn test_resolve_dependency_per_invocation() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(1).unwrap();
    let container = engine
        .attach_effect(
            EffectSpec::on_channel("eq", track, pads[0])
                .with_pair(RecallLevel::Chunk, constant(1.0)),
        )
        .unwrap();
    let recall_half = engine.graph().container(container).unwrap().recall[0];

    let first = engine.start_invocation(Purpose::Playback, &[track]).unwrap();
    let second = engine.start_invocation(Purpose::Record, &[track]).unwrap();
    let edge = RecallDependency::on(recall_half);

    let a = engine.graph().resolve_dependency(&edge, &first).unwrap();
    let b = engine.graph().resolve_dependency(&edge, &second).unwrap();
    assert_eq!(a.key().invocation, first.id());
    assert_eq!(b.key().invocation, second.id());

    engine.cancel_invocation(second.id()).unwrap();
    engine.tick().unwrap();
    assert!(matches!(
        engine.graph().resolve_dependency(&edge, &second),
        Err(RecallError::NotFound { .. })
    ));
}

// Three recalls in a cycle

#[test]
fn test_cyclic_effect_rejected_synchronously() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(1).unwrap();
    let before = engine.graph().topology();

    let spec = EffectSpec::on_channel("loop", track, pads[0])
        .with(RecallSpec::new("a", RecallLevel::Chunk, constant(0.0)).depends_on_local(2))
        .with(RecallSpec::new("b", RecallLevel::Chunk, constant(0.0)).depends_on_local(0))
        .with(RecallSpec::new("c", RecallLevel::Chunk, constant(0.0)).depends_on_local(1));

    match engine.attach_effect(spec) {
        Err(Error::Recall(RecallError::CyclicDependency { path })) => {
            assert_eq!(path.len(), 4);
            assert_eq!(path.first(), path.last());
        }
        other => panic!("expected a cycle, got {other:?}"),
    }

    assert_eq!(engine.graph().topology(), before);
    assert!(engine.settle().is_empty());
}

#[test]
fn test_closing_edge_rejected_without_mutation() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(1).unwrap();
    let graph = engine.graph();

    let attach = |name: &'static str, dep: Option<tactus::TemplateId>| {
        let mut recall = RecallSpec::new(name, RecallLevel::Chunk, constant(0.0));
        if let Some(dep) = dep {
            recall = recall.depends_on(dep);
        }
        let id = engine
            .attach_effect(EffectSpec::on_channel(name, track, pads[0]).with(recall))
            .unwrap();
        graph.container(id).unwrap().play[0]
    };
    let a = attach("a", None);
    let b = attach("b", Some(a));
    let c = attach("c", Some(b));

    let before = graph.topology();
    assert!(matches!(
        engine.add_dependency(a, c),
        Err(Error::Recall(RecallError::CyclicDependency { .. }))
    ));
    assert_eq!(graph.topology(), before);

    // Dropping the middle edge frees the way for the reverse one
    engine.remove_dependency(b, a).unwrap();
    engine.add_dependency(a, c).unwrap();
    let shape = graph.topology();
    let deps_of = |id| {
        shape
            .templates
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.dependencies.clone())
            .unwrap()
    };
    assert!(deps_of(b).is_empty());
    assert_eq!(deps_of(a), vec![c]);
    assert!(matches!(
        engine.move_channel(tactus::InvocationId(99), pads[0], 0),
        Err(Error::Recall(RecallError::UnknownInvocation(_)))
    ));
}

// Attach then detach

const LEVELS: [RecallLevel; 4] = [
    RecallLevel::Track,
    RecallLevel::Channel,
    RecallLevel::ChannelRun,
    RecallLevel::Chunk,
];

fn effect(
    engine: &TactusEngine,
    track: tactus::TrackId,
    pad: tactus::ChannelId,
    level: RecallLevel,
    dep: Option<tactus::TemplateId>,
) -> EffectSpec {
    let mut recall = RecallSpec::new("fx", level, constant(0.5));
    if let Some(dep) = dep {
        let allowed = engine
            .graph()
            .template(dep)
            .is_some_and(|t| level.may_depend_on(t.level));
        if allowed {
            recall = recall.depends_on(dep);
        }
    }
    EffectSpec::on_channel("fx", track, pad).with(recall)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_attach_then_detach_restores_topology(
        pads in 1usize..4,
        base in prop::collection::vec((0usize..4, 0usize..4), 0..6),
        probe in (0usize..4, 0usize..4, any::<bool>()),
    ) {
        let engine = stepped_engine(ThreadingMode::PerChannel);
        let (track, channels) = engine.add_track(pads).unwrap();

        let mut last = None;
        for (pad, level) in base {
            let spec = effect(&engine, track, channels[pad % pads], LEVELS[level], last);
            let id = engine.attach_effect(spec).unwrap();
            last = engine.graph().container(id).unwrap().templates().next();
        }
        let before = engine.graph().topology();

        let (pad, level, linked) = probe;
        let dep = if linked { last } else { None };
        let spec = effect(&engine, track, channels[pad % pads], LEVELS[level], dep);
        let id = engine.attach_effect(spec).unwrap();
        prop_assert_ne!(&engine.graph().topology(), &before);

        engine.detach_effect(id).unwrap();
        prop_assert_eq!(engine.graph().topology(), before);
    }
}
