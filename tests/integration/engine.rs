//! Engine lifecycle integration tests
//!
//! Building, starting, stopping, stepping and backend handling.

use crate::helpers::*;
use approx::assert_relative_eq;
use tactus::prelude::*;
use tactus::{Error, NodeKind, TaskError};

#[test]
fn test_builder_adopts_backend_presets() {
    let engine = TactusEngine::builder()
        .sample_rate(96000)
        .buffer_size(1024)
        .backend(ManualBackend::new(test_presets()))
        .build()
        .unwrap();

    assert_eq!(engine.sample_rate(), TEST_SAMPLE_RATE);
    assert_eq!(engine.config().buffer_size, TEST_BUFFER_SIZE);
    assert_eq!(engine.bus().frames(), TEST_BUFFER_SIZE);
    assert_eq!(engine.bus().channels(), TEST_CHANNELS);
}

#[test]
fn test_builder_rejects_invalid_config() {
    let result = TactusEngine::builder().buffer_size(4).build();
    assert!(matches!(
        result,
        Err(Error::Core(tactus::core::Error::InvalidConfig(_)))
    ));
}

#[test]
fn test_soundcard_node_below_root() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let tree = engine.tree();
    let soundcard = tree.find_kind(NodeKind::Soundcard).unwrap();
    assert_eq!(soundcard.parent().unwrap().id(), tree.root().id());
}

#[test]
fn test_start_without_backend_fails() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    assert!(matches!(engine.start(), Err(Error::NoBackend)));
    assert!(!engine.is_running());
}

#[test]
fn test_tic_numbers_start_at_one() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    assert_eq!(engine.tick().unwrap(), 1);
    assert_eq!(engine.tick().unwrap(), 2);
    assert_eq!(engine.clock().current(), 3);
}

#[test]
fn test_start_twice_is_start_once() {
    let (engine, handle) = manual_engine(ThreadingMode::PerChannel);
    let (_track, _pads) = engine.add_track(2).unwrap();

    engine.start().unwrap();
    engine.start().unwrap();
    assert!(engine.is_running());

    let threads_before = engine.tree().root().descendants().len();
    fire_and_wait(&engine, &handle);
    fire_and_wait(&engine, &handle);
    assert_eq!(engine.tree().root().descendants().len(), threads_before);

    // Each round ran exactly once per pulse
    assert_eq!(engine.clock().current(), 3);
    engine.stop();
    assert!(!engine.is_running());
}

#[test]
fn test_tick_refused_while_running() {
    let (engine, _handle) = manual_engine(ThreadingMode::PerTrack);
    engine.start().unwrap();

    assert!(matches!(
        engine.tick(),
        Err(Error::Core(tactus::core::Error::AlreadyRunning))
    ));

    engine.stop();
    assert!(engine.tick().is_ok());
}

#[test]
fn test_tree_follows_tracks_and_channels() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(3).unwrap();

    let tree = engine.tree();
    let channels: Vec<_> = tree
        .root()
        .descendants()
        .into_iter()
        .filter(|n| n.kind() == NodeKind::Channel)
        .collect();
    assert_eq!(channels.len(), 3);
    assert_eq!(pads.len(), 3);

    engine.apply(RemoveTrack::new(track)).unwrap();
    assert!(tree.find_kind(NodeKind::Channel).is_none());
    assert!(tree.find_kind(NodeKind::Audio).is_none());
}

#[test]
fn test_per_track_threading_has_no_channel_nodes() {
    let engine = stepped_engine(ThreadingMode::PerTrack);
    engine.add_track(4).unwrap();

    let tree = engine.tree();
    assert!(tree.find_kind(NodeKind::Audio).is_some());
    assert!(tree.find_kind(NodeKind::Channel).is_none());
}

#[test]
fn test_chunk_output_reaches_backend() {
    let (engine, handle) = manual_engine(ThreadingMode::PerChannel);
    let (track, pads) = engine.add_track(1).unwrap();
    engine
        .attach_effect(
            EffectSpec::on_channel("tone", track, pads[0])
                .with(RecallSpec::new("tone", RecallLevel::Chunk, constant(0.25))),
        )
        .unwrap();
    engine.start_invocation(Purpose::Playback, &[track]).unwrap();
    engine.start().unwrap();

    for _ in 0..5 {
        fire_and_wait(&engine, &handle);
    }
    engine.stop();

    let captured = handle.take_captured();
    let period = TEST_BUFFER_SIZE * TEST_CHANNELS;
    let last = &captured[captured.len() - period..];
    for frame in last.chunks(TEST_CHANNELS) {
        assert_relative_eq!(frame[0], 0.25);
        assert_relative_eq!(frame[1], 0.0);
    }
}

#[test]
fn test_swap_backend_resizes_bus() {
    let (engine, _handle) = manual_engine(ThreadingMode::PerChannel);
    let presets = BackendPresets {
        channels: 4,
        buffer_size: 128,
        ..test_presets()
    };

    engine
        .swap_backend(ManualBackend::new(presets).named("wide"))
        .unwrap();

    assert_eq!(engine.backend_presets(), Some(presets));
    assert_eq!(engine.bus().channels(), 4);
    assert_eq!(engine.bus().frames(), 128);
}

#[test]
fn test_swap_backend_rejects_unusable_presets() {
    let (engine, _handle) = manual_engine(ThreadingMode::PerChannel);
    let broken = BackendPresets {
        sample_rate: 0,
        ..test_presets()
    };

    let result = engine.swap_backend(ManualBackend::new(broken).named("broken"));
    assert!(matches!(
        result,
        Err(Error::Task(TaskError::Validation { .. }))
    ));
    assert_eq!(engine.backend_presets(), Some(test_presets()));
    assert_eq!(engine.bus().channels(), TEST_CHANNELS);
}

#[test]
fn test_swap_backend_while_running() {
    let (engine, handle) = manual_engine(ThreadingMode::PerChannel);
    engine.start().unwrap();
    fire_and_wait(&engine, &handle);

    let next = ManualBackend::new(test_presets()).named("next");
    let next_handle = next.handle();
    let ticket = engine.submit(SwapBackend::new(next));
    handle.fire().unwrap();
    assert_eq!(
        ticket.wait_timeout(std::time::Duration::from_secs(5)),
        Some(TaskOutcome::Completed)
    );

    // The new backend took over the pulse
    assert!(next_handle.is_running());
    assert!(!handle.is_running());
    fire_and_wait(&engine, &next_handle);
    engine.stop();
}

#[test]
fn test_async_worker_never_holds_back_the_tic() {
    let engine = stepped_engine(ThreadingMode::PerChannel);
    let node = engine
        .attach_async("analysis", |_ctx: &tactus::TicContext<'_>| -> Result<(), tactus::core::NodeFault> {
            std::thread::sleep(std::time::Duration::from_millis(1));
            Ok(())
        })
        .unwrap();

    assert_eq!(node.kind(), NodeKind::Async);
    for _ in 0..3 {
        engine.tick().unwrap();
    }
    assert_eq!(engine.clock().current(), 4);
}
