#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nalgebra::{Matrix4, Vector3};

use vslam_pipeline::config::{Sensor, Settings};
use vslam_pipeline::synthetic::{SyntheticSequence, SETTINGS_YAML};
use vslam_pipeline::system::SlamSystem;
use vslam_pipeline::vocabulary::OrbVocabulary;

pub fn settings() -> Settings {
    Settings::from_yaml(SETTINGS_YAML).unwrap()
}

pub fn vocabulary(sequence: &SyntheticSequence) -> Arc<OrbVocabulary> {
    let text = sequence.scene.vocabulary_text();
    Arc::new(OrbVocabulary::from_reader(text.as_bytes()).unwrap())
}

pub fn start(sequence: &SyntheticSequence, settings: Settings, sensor: Sensor) -> SlamSystem {
    SlamSystem::with_vocabulary(vocabulary(sequence), settings, sensor).unwrap()
}

/// Track frames `range` of a stereo sequence.
pub fn feed_stereo(
    system: &mut SlamSystem,
    sequence: &SyntheticSequence,
    range: std::ops::Range<usize>,
) -> Vec<Option<Matrix4<f64>>> {
    range
        .map(|i| {
            let (left, right) = sequence.stereo(i);
            system.track_stereo(left, &right, sequence.timestamp(i)).unwrap()
        })
        .collect()
}

/// Camera center of a `T_cw` matrix.
pub fn center(pose_cw: &Matrix4<f64>) -> Vector3<f64> {
    let rotation = pose_cw.fixed_view::<3, 3>(0, 0);
    -(rotation.transpose() * pose_cw.fixed_view::<3, 1>(0, 3))
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Wait for Local Mapping to index every keyframe of the map.
pub fn wait_for_indexing(system: &SlamSystem) -> bool {
    wait_until(Duration::from_secs(10), || {
        let shared = system.shared_state();
        let map = shared.map.read();
        let index = shared.index.read();
        map.num_keyframes() > 0 && map.keyframe_ids().iter().all(|id| index.contains(*id))
    })
}
