//! Global Bundle Adjustment for Loop Closing.
//!
//! After pose graph optimization corrects keyframe poses, Global BA refines
//! both poses and map points to minimize reprojection error across the
//! entire map.
//!
//! It runs in a background thread with the snapshot-then-patch pattern: the
//! problem is copied out under a read lock, solved without locks, and only
//! entities that still exist are patched afterwards.

use std::collections::HashMap;

use tracing::debug;

use crate::config::Settings;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::tracking::frame::CameraModel;

use super::reprojection::{BundleEdge, BundleProblem, Measurement};

/// Configuration for Global Bundle Adjustment.
#[derive(Debug, Clone)]
pub struct GlobalBAConfig {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,

    /// Use the Huber kernel.
    pub robust: bool,
}

impl Default for GlobalBAConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            robust: true,
        }
    }
}

impl GlobalBAConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_iterations: settings.loop_closing.global_ba_iterations,
            ..Self::default()
        }
    }
}

/// Detached copy of the whole map.
#[derive(Debug, Clone)]
pub struct GlobalBASnapshot {
    pub change_index: u64,
    pub keyframes: Vec<KeyFrameId>,
    pub map_points: Vec<MapPointId>,
    pub bundle: BundleProblem,
}

/// Result of Global BA.
#[derive(Debug, Clone, Default)]
pub struct GlobalBAResult {
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub aborted: bool,
}

/// PHASE 1: Snapshot every keyframe and map point. The origin keyframe is
/// the gauge anchor.
pub fn collect_global_ba(map: &Map, camera: &CameraModel) -> Option<GlobalBASnapshot> {
    let keyframes: Vec<KeyFrameId> = map
        .keyframe_ids()
        .into_iter()
        .filter(|id| map.get_keyframe(*id).is_some_and(|kf| !kf.is_bad))
        .collect();
    if keyframes.len() < 2 {
        return None;
    }
    let anchor = map.origin_keyframe_id().unwrap_or(keyframes[0]);

    let mut bundle = BundleProblem::default();
    let mut pose_index: HashMap<KeyFrameId, usize> = HashMap::new();
    for (i, id) in keyframes.iter().enumerate() {
        let kf = map.get_keyframe(*id)?;
        pose_index.insert(*id, i);
        bundle.poses_cw.push(kf.pose_cw());
        bundle.pose_fixed.push(*id == anchor);
    }
    if !bundle.pose_fixed.iter().any(|f| *f) {
        bundle.pose_fixed[0] = true;
    }

    let mut map_points = Vec::new();
    for mp_id in map.map_point_ids() {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        if mp.is_bad {
            continue;
        }
        let point_idx = map_points.len();
        let mut observers: Vec<(KeyFrameId, usize)> =
            mp.observations().iter().map(|(k, v)| (*k, *v)).collect();
        observers.sort();
        let mut n_edges = 0;
        for (kf_id, feature_idx) in observers {
            let (Some(&pose), Some(kf)) = (pose_index.get(&kf_id), map.get_keyframe(kf_id)) else {
                continue;
            };
            let Some(kp) = kf.keypoints.get(feature_idx) else {
                continue;
            };
            bundle.edges.push(BundleEdge {
                pose,
                point: point_idx,
                measurement: Measurement::new(kp, kf.points_cam[feature_idx].as_ref(), camera),
                active: true,
            });
            n_edges += 1;
        }
        if n_edges == 0 {
            continue;
        }
        map_points.push(mp_id);
        bundle.points.push(mp.position);
    }

    Some(GlobalBASnapshot {
        change_index: map.change_index(),
        keyframes,
        map_points,
        bundle,
    })
}

/// PHASE 2: Solve without holding any lock.
pub fn solve_global_ba(
    snapshot: &mut GlobalBASnapshot,
    camera: &CameraModel,
    config: &GlobalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> GlobalBAResult {
    let stats = snapshot
        .bundle
        .optimize(camera, config.max_iterations, config.robust, should_stop);
    GlobalBAResult {
        iterations: stats.iterations,
        initial_error: stats.initial_error,
        final_error: stats.final_error,
        aborted: should_stop(),
    }
}

/// PHASE 3: Patch the live map. Keyframes and points that were erased or
/// flagged bad meanwhile are skipped; anything created after the snapshot
/// is untouched. Returns how many entities were updated.
pub fn apply_global_ba(map: &mut Map, snapshot: &GlobalBASnapshot) -> usize {
    let mut updated = 0;
    let mut skipped = 0;

    for (i, kf_id) in snapshot.keyframes.iter().enumerate() {
        if snapshot.bundle.pose_fixed[i] {
            continue;
        }
        match map.get_keyframe_mut(*kf_id) {
            Some(kf) if !kf.is_bad => {
                kf.pose = snapshot.bundle.poses_cw[i].inverse();
                updated += 1;
            }
            _ => {
                debug!("[GlobalBA] {} no longer in the map, skipped", kf_id);
                skipped += 1;
            }
        }
    }

    for (i, mp_id) in snapshot.map_points.iter().enumerate() {
        match map.get_map_point_mut(*mp_id) {
            Some(mp) if !mp.is_bad => {
                mp.position = snapshot.bundle.points[i];
                updated += 1;
            }
            _ => {
                debug!("[GlobalBA] {} no longer in the map, skipped", mp_id);
                skipped += 1;
                continue;
            }
        }
        map.update_map_point_normal_and_depth(*mp_id);
    }

    if map.change_index() != snapshot.change_index {
        debug!(
            "[GlobalBA] Map changed while solving ({} -> {}), {} stale entities skipped",
            snapshot.change_index,
            map.change_index(),
            skipped
        );
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::KeyFrameData;
    use crate::tracking::frame::KeyPoint;
    use crate::tracking::FeatureGrid;
    use crate::vocabulary::{BowVector, FeatureVector};
    use nalgebra::Vector3;

    fn small_map() -> Map {
        let cam = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640.0, 480.0, 40.0);
        let truth: Vec<Vector3<f64>> = (0..30)
            .map(|i| {
                let f = i as f64;
                Vector3::new((f * 0.5).sin(), (f * 0.8).cos() * 0.8, 5.0 + (f * 0.3).cos())
            })
            .collect();
        let mut map = Map::new();
        let mut kfs = Vec::new();
        for k in 0..3 {
            let pose_wc = SE3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(0.3 * k as f64, 0.0, 0.0));
            let pose_cw = pose_wc.inverse();
            let keypoints: Vec<KeyPoint> = truth
                .iter()
                .map(|p| {
                    let uv = cam.project(&pose_cw.transform_point(p)).unwrap();
                    KeyPoint::new(uv.x, uv.y, 0)
                })
                .collect();
            let points_cam = truth.iter().map(|p| Some(pose_cw.transform_point(p))).collect();
            let grid = FeatureGrid::new(&keypoints, cam.width, cam.height);
            kfs.push(map.create_keyframe(KeyFrameData {
                timestamp: k as f64,
                pose: pose_wc,
                descriptors: vec![[0u8; 32]; keypoints.len()],
                keypoints,
                points_cam,
                bow_vector: BowVector::new(),
                feature_vector: FeatureVector::new(),
                grid,
            }));
        }
        for (j, p) in truth.iter().enumerate() {
            let mp = map.create_map_point(p + Vector3::new(0.02, 0.0, -0.02), [0u8; 32], kfs[0]);
            for &kf in &kfs {
                map.associate(kf, j, mp);
            }
        }
        map
    }

    #[test]
    fn test_snapshot_then_patch_skips_deleted() {
        let cam = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640.0, 480.0, 40.0);
        let mut map = small_map();
        let mut snapshot = collect_global_ba(&map, &cam).unwrap();
        assert_eq!(snapshot.keyframes.len(), 3);
        assert_eq!(snapshot.map_points.len(), 30);

        let result = solve_global_ba(&mut snapshot, &cam, &GlobalBAConfig::default(), &|| false);
        assert!(result.final_error < result.initial_error);

        // Deleted and created while the solver ran
        let deleted = snapshot.map_points[3];
        map.erase_map_point(deleted);
        let kf = snapshot.keyframes[0];
        let created = map.create_map_point(Vector3::new(9.0, 9.0, 9.0), [1u8; 32], kf);

        let updated = apply_global_ba(&mut map, &snapshot);
        assert_eq!(updated, 2 + 29);
        assert!(map.get_map_point(deleted).is_none());
        assert_eq!(map.get_map_point(created).unwrap().position, Vector3::new(9.0, 9.0, 9.0));
    }
}
