//! End-to-end scenarios on a running engine
//!
//! A soundcard node and channel threads driven by a manual backend, with
//! topology changes and late tics arriving mid-playback.

use crate::helpers::*;
use approx::assert_relative_eq;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::time::Duration;
use tactus::prelude::*;
use tactus::{FaultKind, NodeKind};

fn pad_effect(track: tactus::TrackId, pad: tactus::ChannelId, value: f32) -> EffectSpec {
    EffectSpec::on_channel("pad", track, pad).with(RecallSpec::new(
        "pad",
        RecallLevel::Chunk,
        constant(value),
    ))
}

#[test]
fn test_resize_pads_mid_playback() {
    init_tracing();
    let (engine, handle) = manual_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(2).unwrap();
    for pad in &pads {
        engine.attach_effect(pad_effect(track, *pad, 0.25)).unwrap();
    }
    let recall_id = engine.start_invocation(Purpose::Playback, &[track]).unwrap();
    engine.start().unwrap();

    for _ in 0..3 {
        fire_and_wait(&engine, &handle);
    }

    let ticket = engine.submit(
        ResizePads::new(track, 4).with_pad_effect(|track, pad| pad_effect(track, pad, 0.1)),
    );
    let resize_tic = fire_and_wait(&engine, &handle);
    assert_eq!(ticket.try_outcome(), Some(TaskOutcome::Completed));

    for _ in 0..3 {
        fire_and_wait(&engine, &handle);
    }
    engine.stop();
    let last_tic = engine.clock().current() - 1;

    let channels = engine.graph().channels(track).unwrap();
    assert_eq!(channels.len(), 4);
    let channel_nodes = engine
        .tree()
        .root()
        .descendants()
        .into_iter()
        .filter(|n| n.kind() == NodeKind::Channel)
        .count();
    assert_eq!(channel_nodes, 4);

    for instance in engine.graph().instances_of(recall_id.id()) {
        let channel = instance.template().channel.unwrap();
        if pads.contains(&channel) {
            // Old pads never missed a tic
            assert_eq!(instance.first_run_tic(), 1);
            assert_eq!(instance.run_count(), last_tic);
        } else {
            // New pads start exactly one tic after the boundary they landed on
            assert_eq!(instance.init_count(), 1);
            assert_eq!(instance.init_tic(), resize_tic + 1);
            assert_eq!(instance.first_run_tic(), resize_tic + 1);
            assert_eq!(instance.run_count(), last_tic - resize_tic);
        }
    }

    let period = TEST_BUFFER_SIZE * TEST_CHANNELS;
    let captured = handle.take_captured();
    let periods: Vec<&[f32]> = captured.chunks(period).collect();
    // The first two periods play before any mix was published
    for samples in &periods[2..] {
        assert!(samples[0] >= 0.25, "dropout in a period after warm-up");
    }
    let last = periods[periods.len() - 1];
    assert_relative_eq!(last[0], 0.35, epsilon = 1e-6);
    assert_relative_eq!(last[1], 0.35, epsilon = 1e-6);
}

/// Chunk processor that parks at the given tics until released.
fn stalling(
    at: &'static [u64],
    log: &RunLog,
    entered: Sender<u64>,
    release: Receiver<()>,
) -> impl RecallProcessor + Clone {
    let log = std::sync::Arc::clone(log);
    processor_fn(move |ctx| {
        log.lock().push((ctx.tic, "slow"));
        if at.contains(&ctx.tic) {
            let _ = entered.send(ctx.tic);
            let _ = release.recv_timeout(Duration::from_secs(5));
        }
        Ok(StageOutcome::Continue)
    })
}

#[test]
fn test_two_missed_deadlines() {
    init_tracing();
    let (engine, handle) = manual_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(1).unwrap();
    let log = run_log();
    let (entered_tx, entered) = unbounded();
    let (release, release_rx) = unbounded();

    engine
        .attach_effect(EffectSpec::on_channel("slow", track, pads[0]).with(RecallSpec::new(
            "slow",
            RecallLevel::Chunk,
            stalling(&[2, 3], &log, entered_tx, release_rx),
        )))
        .unwrap();
    engine.start_invocation(Purpose::Playback, &[track]).unwrap();
    let reports = engine.reports();
    engine.start().unwrap();

    fire_and_wait(&engine, &handle);

    // Tic 2 misses the next period, and so does tic 3 which it triggered
    handle.fire().unwrap();
    for expected in [2, 3] {
        assert_eq!(entered.recv_timeout(Duration::from_secs(5)), Ok(expected));
        handle.fire_pulse_only().unwrap();
        release.send(()).unwrap();
    }

    // The pulse that came in during tic 3 runs tic 4 on time
    assert!(wait_until(|| engine.clock().current() == 5));
    engine.stop();

    assert_eq!(engine.overruns(), 2);
    assert_eq!(tics_of(&log, "slow"), vec![1, 2, 3, 4]);

    let overruns: Vec<_> = reports
        .try_iter()
        .filter(|r| r.kind == FaultKind::Overrun)
        .collect();
    assert_eq!(overruns.len(), 1);
    assert_eq!(overruns[0].count, 2);
    assert_eq!(overruns[0].first_tic, 2);
    assert_eq!(overruns[0].last_tic, 3);
}

#[test]
fn test_change_link_orders_chunks_across_channels() {
    let (engine, handle) = manual_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(2).unwrap();
    let log = run_log();

    engine
        .attach_effect(
            EffectSpec::on_channel("down", track, pads[0])
                .with(RecallSpec::new("down", RecallLevel::Chunk, logging("down", &log))),
        )
        .unwrap();
    engine
        .attach_effect(
            EffectSpec::on_channel("up", track, pads[1])
                .with(RecallSpec::new("up", RecallLevel::Chunk, logging("up", &log))),
        )
        .unwrap();
    engine.change_link(pads[0], Some(pads[1])).unwrap();
    assert_eq!(engine.graph().upstream_of(pads[0]), Some(pads[1]));

    // Closing the loop is refused
    assert!(engine.change_link(pads[1], Some(pads[0])).is_err());

    engine.start_invocation(Purpose::Playback, &[track]).unwrap();
    engine.start().unwrap();
    for _ in 0..4 {
        fire_and_wait(&engine, &handle);
    }
    engine.stop();

    let entries = log.lock().clone();
    for tic in 1..=4u64 {
        let up = entries.iter().position(|e| *e == (tic, "up")).unwrap();
        let down = entries.iter().position(|e| *e == (tic, "down")).unwrap();
        assert!(up < down, "downstream chunk ran first at tic {tic}");
    }
}

#[test]
fn test_detach_while_running_lands_between_tics() {
    let (engine, handle) = manual_engine(ThreadingMode::PerTrack);
    let (track, pads) = engine.add_track(1).unwrap();
    let log = run_log();
    let container = engine
        .attach_effect(
            EffectSpec::on_channel("tone", track, pads[0])
                .with(RecallSpec::new("tone", RecallLevel::Chunk, logging("tone", &log))),
        )
        .unwrap();
    engine.start_invocation(Purpose::Playback, &[track]).unwrap();
    engine.start().unwrap();

    fire_and_wait(&engine, &handle);
    let ticket = engine.submit(DetachEffect::new(container));
    let detach_tic = fire_and_wait(&engine, &handle);
    assert_eq!(ticket.try_outcome(), Some(TaskOutcome::Completed));
    fire_and_wait(&engine, &handle);
    engine.stop();

    // Ran through the tic whose safe window detached it, never after
    assert_eq!(tics_of(&log, "tone"), (1..=detach_tic).collect::<Vec<_>>());
    assert!(engine.graph().container(container).is_none());
}
