//! Construction, deferred commands, reset and shutdown of `SlamSystem`.

mod common;

use std::time::{Duration, Instant};

use vslam_pipeline::config::Sensor;
use vslam_pipeline::map::{KeyFrameId, MapPointId};
use vslam_pipeline::synthetic::SyntheticSequence;
use vslam_pipeline::tracking::frame::FeatureSet;
use vslam_pipeline::tracking::TrackingState;
use vslam_pipeline::SlamError;

use common::{feed_stereo, settings, start, wait_for_indexing};

#[test]
fn wrong_entry_point_is_rejected() {
    let sequence = SyntheticSequence::sideways(2, 0.02, 1);
    let mut system = start(&sequence, settings(), Sensor::Stereo);

    let err = system
        .track_monocular(sequence.monocular(0), 0.0)
        .unwrap_err();
    assert!(matches!(
        err,
        SlamError::SensorMismatch {
            expected: Sensor::Stereo,
            got: Sensor::Monocular
        }
    ));
    let (features, depths) = sequence.rgbd(0, 1000.0);
    assert!(system.track_rgbd(features, &depths, 0.0).is_err());
    assert_eq!(system.tracking_state(), TrackingState::NoImagesYet);
}

#[test]
fn missing_vocabulary_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("settings.yaml");
    std::fs::write(&settings_path, vslam_pipeline::synthetic::SETTINGS_YAML).unwrap();

    let result = vslam_pipeline::SlamSystem::new(
        &dir.path().join("missing.txt"),
        &settings_path,
        Sensor::Stereo,
    );
    assert!(matches!(result, Err(SlamError::Vocabulary(_))));
}

#[test]
fn reset_restores_post_construction_state() {
    let sequence = SyntheticSequence::sideways(20, 0.02, 2);
    let empty = || (FeatureSet::default(), FeatureSet::default());

    let mut used = start(&sequence, settings(), Sensor::Stereo);
    assert!(feed_stereo(&mut used, &sequence, 0..20).iter().all(Option::is_some));
    assert!(used.num_keyframes() >= 1);

    used.reset();
    let (left, right) = empty();
    assert!(used.track_stereo(left, &right, 2.0).unwrap().is_none());

    let mut fresh = start(&sequence, settings(), Sensor::Stereo);
    let (left, right) = empty();
    assert!(fresh.track_stereo(left, &right, 2.0).unwrap().is_none());

    for system in [&used, &fresh] {
        assert_eq!(system.tracking_state(), TrackingState::NotInitialized);
        assert_eq!(system.num_keyframes(), 0);
        assert_eq!(system.num_map_points(), 0);
        assert!(system.shared_state().index.read().is_empty());
        assert!(system.tracked_map_points().is_empty());
    }

    // Ids restart from zero after a reset.
    feed_stereo(&mut used, &sequence, 0..1);
    feed_stereo(&mut fresh, &sequence, 0..1);
    assert!(wait_for_indexing(&used));
    assert!(wait_for_indexing(&fresh));
    for system in [&used, &fresh] {
        let map = system.map();
        assert_eq!(map.keyframe_ids(), vec![KeyFrameId(0)]);
        assert_eq!(map.map_point_ids().first(), Some(&MapPointId(0)));
    }
    assert_eq!(used.num_map_points(), fresh.num_map_points());
}

#[test]
fn localization_mode_freezes_the_map() {
    let sequence = SyntheticSequence::sideways(40, 0.03, 3);
    let mut system = start(&sequence, settings(), Sensor::Stereo);
    feed_stereo(&mut system, &sequence, 0..15);

    system.activate_localization_mode();
    let poses = feed_stereo(&mut system, &sequence, 15..16);
    assert!(poses[0].is_some());
    assert!(system.is_localization_mode());
    assert!(system.shared_state().is_mapper_stopped());

    let keyframes = system.num_keyframes();
    let poses = feed_stereo(&mut system, &sequence, 16..30);
    assert!(poses.iter().all(Option::is_some));
    assert_eq!(system.num_keyframes(), keyframes);

    system.deactivate_localization_mode();
    feed_stereo(&mut system, &sequence, 30..31);
    assert!(!system.is_localization_mode());
    assert!(!system.shared_state().is_mapper_stop_requested());
}

#[test]
fn shutdown_is_idempotent_and_bounded() {
    // Fast motion keeps Local Mapping busy with new keyframes.
    let sequence = SyntheticSequence::sideways(60, 0.08, 4);
    let mut system = start(&sequence, settings(), Sensor::Stereo);
    feed_stereo(&mut system, &sequence, 0..60);

    let started = Instant::now();
    system.shutdown();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(system.is_shutdown());

    let keyframes = system.num_keyframes();
    let points = system.num_map_points();
    system.shutdown();
    assert!(started.elapsed() < Duration::from_secs(10));

    // No map mutation after shutdown, even for new frames.
    assert!(feed_stereo(&mut system, &sequence, 0..1)[0].is_none());
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(system.num_keyframes(), keyframes);
    assert_eq!(system.num_map_points(), points);
    drop(system);
}

#[test]
fn shutdown_saves_the_map_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("on_exit.map");
    let mut settings = settings();
    settings.map.save_on_shutdown_path = Some(path.clone());

    let sequence = SyntheticSequence::sideways(5, 0.02, 5);
    let mut system = start(&sequence, settings, Sensor::Stereo);
    feed_stereo(&mut system, &sequence, 0..5);
    drop(system);

    assert!(path.exists());
}

#[test]
fn loop_closing_can_be_disabled() {
    let mut settings = settings();
    settings.loop_closing.enabled = false;
    let sequence = SyntheticSequence::sideways(10, 0.02, 6);
    let mut system = start(&sequence, settings, Sensor::Stereo);

    assert!(feed_stereo(&mut system, &sequence, 0..10).iter().all(Option::is_some));
    system.reset();
    feed_stereo(&mut system, &sequence, 0..1);
    assert!(wait_for_indexing(&system));
    assert_eq!(system.num_keyframes(), 1);
}
