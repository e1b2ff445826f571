//! End-to-end runs over synthetic sequences.

mod common;

use std::time::Duration;

use nalgebra::Vector3;

use vslam_pipeline::config::Sensor;
use vslam_pipeline::io::read_tum;
use vslam_pipeline::synthetic::{circular_trajectory, straight_trajectory, SyntheticScene, SyntheticSequence};
use vslam_pipeline::tracking::frame::FeatureSet;
use vslam_pipeline::tracking::TrackingState;
use vslam_pipeline::SlamError;

use common::{center, feed_stereo, settings, start, vocabulary, wait_for_indexing, wait_until};

const DRIFT_BOUND: f64 = 0.05;

#[test]
fn stereo_run_stays_on_ground_truth() {
    let sequence = SyntheticSequence::sideways(50, 0.02, 11);
    let mut system = start(&sequence, settings(), Sensor::Stereo);

    let poses = feed_stereo(&mut system, &sequence, 0..50);
    for (i, pose) in poses.iter().enumerate() {
        let pose = pose.unwrap_or_else(|| panic!("frame {} not tracked", i));
        let error = (center(&pose) - sequence.poses[i].translation).norm();
        assert!(error < DRIFT_BOUND, "frame {}: drift {:.4}", i, error);
    }
    assert_eq!(system.tracking_state(), TrackingState::Ok);
    assert!(!system.tracked_map_points().is_empty());

    system.shutdown();
    assert!(system.num_keyframes() >= 1);
    assert!(system.num_map_points() > 0);
}

#[test]
fn rgbd_run_stays_on_ground_truth() {
    let sequence = SyntheticSequence::sideways(30, 0.02, 12);
    let mut system = start(&sequence, settings(), Sensor::Rgbd);
    let factor = system.settings().camera.depth_map_factor;

    for i in 0..sequence.len() {
        let (features, depths) = sequence.rgbd(i, factor);
        let pose = system
            .track_rgbd(features, &depths, sequence.timestamp(i))
            .unwrap()
            .unwrap_or_else(|| panic!("frame {} not tracked", i));
        let error = (center(&pose) - sequence.poses[i].translation).norm();
        assert!(error < DRIFT_BOUND, "frame {}: drift {:.4}", i, error);
    }
}

#[test]
fn saved_map_loads_with_same_counts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.map");
    let sequence = SyntheticSequence::sideways(30, 0.04, 13);

    let mut system = start(&sequence, settings(), Sensor::Stereo);
    feed_stereo(&mut system, &sequence, 0..30);
    system.shutdown();
    let (keyframes, points, edges) = {
        let map = system.map();
        (map.num_keyframes(), map.num_map_points(), map.num_covisibility_edges())
    };
    assert!(keyframes >= 1);
    system.save_map(&path).unwrap();

    let mut other = start(&sequence, settings(), Sensor::Stereo);
    other.load_map(&path).unwrap();
    {
        let map = other.map();
        assert_eq!(map.num_keyframes(), keyframes);
        assert_eq!(map.num_map_points(), points);
        assert_eq!(map.num_covisibility_edges(), edges);
    }
    assert_eq!(other.tracking_state(), TrackingState::Lost);
    assert_eq!(other.shared_state().index.read().len(), keyframes);
}

#[test]
fn corrupt_map_file_leaves_live_map_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.map");
    std::fs::write(&path, b"not a map at all").unwrap();

    let sequence = SyntheticSequence::sideways(10, 0.02, 14);
    let mut system = start(&sequence, settings(), Sensor::Stereo);
    feed_stereo(&mut system, &sequence, 0..10);
    assert!(wait_for_indexing(&system));
    let keyframes = system.map().keyframe_ids();

    let err = system.load_map(&path).unwrap_err();
    assert!(matches!(err, SlamError::MapFormat(_)));
    assert_eq!(system.map().keyframe_ids(), keyframes);
    assert_eq!(system.tracking_state(), TrackingState::Ok);
}

#[test]
fn configured_map_starts_lost_and_relocalizes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prior.map");
    let sequence = SyntheticSequence::sideways(20, 0.02, 15);

    let mut first = start(&sequence, settings(), Sensor::Stereo);
    feed_stereo(&mut first, &sequence, 0..20);
    first.shutdown();
    first.save_map(&path).unwrap();

    let mut settings = settings();
    settings.map.load_path = Some(path);
    let mut system = start(&sequence, settings, Sensor::Stereo);
    assert_eq!(system.tracking_state(), TrackingState::Lost);
    assert!(system.num_keyframes() >= 1);

    let pose = feed_stereo(&mut system, &sequence, 10..11)[0].expect("relocalized");
    let error = (center(&pose) - sequence.poses[10].translation).norm();
    assert!(error < DRIFT_BOUND, "drift {:.4}", error);
    assert_eq!(system.tracking_state(), TrackingState::Ok);
}

#[test]
fn lost_tracking_recovers_by_relocalization() {
    let sequence = SyntheticSequence::sideways(12, 0.02, 16);
    let mut settings = settings();
    // Keep the map when tracking is lost early.
    settings.tracker.lost_reset_keyframes = 0;
    let mut system = start(&sequence, settings, Sensor::Stereo);

    assert!(feed_stereo(&mut system, &sequence, 0..10).iter().all(Option::is_some));
    assert!(wait_for_indexing(&system));
    let keyframes = system.num_keyframes();

    for k in 0..2 {
        let pose = system
            .track_stereo(FeatureSet::default(), &FeatureSet::default(), 1.0 + 0.1 * k as f64)
            .unwrap();
        assert!(pose.is_none());
        assert_eq!(system.tracking_state(), TrackingState::Lost);
    }

    // Back in front of an existing keyframe.
    let (left, right) = sequence.stereo(4);
    let pose = system.track_stereo(left, &right, 1.5).unwrap().expect("relocalized");
    assert_eq!(system.tracking_state(), TrackingState::Ok);
    let error = (center(&pose) - sequence.poses[4].translation).norm();
    assert!(error < DRIFT_BOUND, "drift {:.4}", error);
    // No reset happened on the way.
    assert!(system.num_keyframes() >= keyframes);
}

#[test]
fn trajectories_are_exported_per_sensor() {
    let dir = tempfile::tempdir().unwrap();
    let sequence = SyntheticSequence::sideways(20, 0.02, 17);

    let mut system = start(&sequence, settings(), Sensor::Stereo);
    feed_stereo(&mut system, &sequence, 0..20);
    system.shutdown();

    let tum = dir.path().join("frames.txt");
    let kitti = dir.path().join("frames_kitti.txt");
    let keyframes = dir.path().join("keyframes.txt");
    system.save_trajectory_tum(&tum).unwrap();
    system.save_trajectory_kitti(&kitti).unwrap();
    system.save_keyframe_trajectory_tum(&keyframes).unwrap();

    let frames = read_tum(&tum).unwrap();
    assert_eq!(frames.len(), 20);
    for (i, entry) in frames.iter().enumerate() {
        assert!((entry.timestamp - sequence.timestamp(i)).abs() < 1e-6);
        let error = (entry.pose_wc.translation - sequence.poses[i].translation).norm();
        assert!(error < DRIFT_BOUND, "frame {}: {:.4}", i, error);
    }
    let kitti_text = std::fs::read_to_string(&kitti).unwrap();
    assert_eq!(kitti_text.lines().count(), 20);
    assert!(kitti_text.lines().all(|line| line.split(' ').count() == 12));
    assert_eq!(read_tum(&keyframes).unwrap().len(), system.num_keyframes());

    // Monocular systems only export keyframes.
    let mono = start(&sequence, common::settings(), Sensor::Monocular);
    assert!(matches!(
        mono.save_trajectory_tum(&tum),
        Err(SlamError::UnsupportedSensor {
            sensor: Sensor::Monocular,
            ..
        })
    ));
    let err = mono.save_trajectory_kitti(&kitti).unwrap_err();
    assert!(matches!(
        err,
        SlamError::UnsupportedSensor {
            sensor: Sensor::Monocular,
            ..
        }
    ));
    assert_eq!(err.to_string(), "KITTI trajectory is not available for monocular input");
    mono.save_keyframe_trajectory_tum(&keyframes).unwrap();
    assert!(read_tum(&keyframes).unwrap().is_empty());
}

#[test]
fn mapping_creates_keyframes_while_moving() {
    let sequence = SyntheticSequence::sideways(40, 0.05, 18);
    let vocabulary = vocabulary(&sequence);
    let mut system =
        vslam_pipeline::SlamSystem::with_vocabulary(vocabulary, settings(), Sensor::Stereo).unwrap();

    feed_stereo(&mut system, &sequence, 0..40);
    assert!(wait_until(Duration::from_secs(10), || system.num_keyframes() >= 2));
    system.shutdown();

    // Every keyframe but the first hangs in the spanning tree.
    let map = system.map();
    let origin = map.origin_keyframe_id().unwrap();
    assert!(map
        .keyframe_ids()
        .iter()
        .filter(|&&id| id != origin)
        .all(|&id| map.get_keyframe(id).unwrap().parent_id.is_some()));
}

#[test]
fn far_scene_keeps_creating_keyframes() {
    // Every landmark lies beyond the close-point depth, so only the
    // tracked/reference ratio can ask for new keyframes.
    let frames = 120;
    let step = 0.2;
    let scene = SyntheticScene::random_box(
        1200,
        Vector3::new(-10.0, -2.5, 6.0),
        Vector3::new(10.0 + step * frames as f64, 2.5, 10.0),
        19,
    );
    let poses = straight_trajectory(frames, Vector3::zeros(), Vector3::new(step, 0.0, 0.0));
    let sequence = SyntheticSequence::new(scene, poses);
    let mut system = start(&sequence, settings(), Sensor::Stereo);
    assert!(system.settings().th_depth() < 6.0);

    let poses = feed_stereo(&mut system, &sequence, 0..frames);
    for (i, pose) in poses.iter().enumerate() {
        let pose = pose.unwrap_or_else(|| panic!("frame {} not tracked", i));
        let error = (center(&pose) - sequence.poses[i].translation).norm();
        assert!(error < DRIFT_BOUND, "frame {}: drift {:.4}", i, error);
    }
    assert!(wait_until(Duration::from_secs(10), || system.num_keyframes() >= 3));
    system.shutdown();
}

#[test]
fn revisiting_the_start_closes_a_loop() {
    let scene = SyntheticScene::cylinder(1200, 3.0, 3.0, 21);
    let sequence = SyntheticSequence::new(scene, circular_trajectory(240, 0.5, 1.5));
    let mut system = start(&sequence, settings(), Sensor::Stereo);

    let poses = feed_stereo(&mut system, &sequence, 0..sequence.len());
    assert!(poses.iter().all(Option::is_some));
    assert_eq!(system.tracking_state(), TrackingState::Ok);

    let closed = wait_until(Duration::from_secs(60), || {
        let shared = system.shared_state();
        let has_loop_edge = {
            let map = shared.map.read();
            map.keyframe_ids()
                .iter()
                .filter_map(|id| map.get_keyframe(*id))
                .any(|kf| !kf.loop_edges.is_empty())
        };
        has_loop_edge && shared.num_global_ba_applied() >= 1
    });
    assert!(closed, "no loop edge with a completed global BA");
    system.shutdown();

    // Loop edges are symmetric.
    let map = system.map();
    for id in map.keyframe_ids() {
        let kf = map.get_keyframe(id).unwrap();
        for other in &kf.loop_edges {
            if let Some(other_kf) = map.get_keyframe(*other) {
                assert!(other_kf.loop_edges.contains(&id));
            }
        }
    }
}

#[test]
fn monocular_run_initializes_and_maps() {
    let sequence = SyntheticSequence::sideways(60, 0.05, 23);
    let mut system = start(&sequence, settings(), Sensor::Monocular);

    let mut first_ok = None;
    for i in 0..sequence.len() {
        let pose = system
            .track_monocular(sequence.monocular(i), sequence.timestamp(i))
            .unwrap();
        match first_ok {
            None if system.tracking_state() == TrackingState::Ok => first_ok = Some(i),
            Some(_) => assert!(pose.is_some(), "frame {} lost after initialization", i),
            None => {}
        }
    }
    let first_ok = first_ok.expect("monocular initialization never succeeded");
    assert!(first_ok < 20, "initialized only at frame {}", first_ok);
    assert_eq!(system.tracking_state(), TrackingState::Ok);

    assert!(wait_until(Duration::from_secs(10), || system.num_keyframes() >= 2));
    system.shutdown();
    assert!(system.num_map_points() >= 50);
}
