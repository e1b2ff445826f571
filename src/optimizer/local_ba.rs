//! Local Bundle Adjustment.
//!
//! Optimizes the poses of the current keyframe and its covisible neighbors
//! together with every map point they observe. Keyframes that observe those
//! points but are outside the window contribute constraints with a fixed
//! pose.
//!
//! The work is split so the map lock is never held while solving:
//! 1. COLLECT under a read lock ([`collect_local_ba`])
//! 2. SOLVE without any lock ([`solve_local_ba`])
//! 3. APPLY under a write lock ([`apply_local_ba`]), skipping entities that
//!    disappeared in the meantime.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector3;
use parking_lot::RwLock;
use tracing::debug;

use crate::map::{KeyFrameId, Map, MapPointId};
use crate::tracking::frame::CameraModel;

use super::reprojection::{BundleEdge, BundleProblem, Measurement};

/// Configuration for Local BA.
#[derive(Debug, Clone)]
pub struct LocalBAConfig {
    /// Iterations before outlier rejection.
    pub first_pass_iterations: usize,
    /// Iterations after outliers are removed.
    pub second_pass_iterations: usize,
}

impl Default for LocalBAConfig {
    fn default() -> Self {
        Self {
            first_pass_iterations: 5,
            second_pass_iterations: 10,
        }
    }
}

impl LocalBAConfig {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        let iterations = settings.local_mapping.local_ba_iterations;
        Self {
            first_pass_iterations: iterations,
            second_pass_iterations: iterations * 2,
        }
    }
}

/// Result of local bundle adjustment.
#[derive(Debug, Clone, Default)]
pub struct LocalBAResult {
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub num_keyframes: usize,
    pub num_fixed_keyframes: usize,
    pub num_map_points: usize,
    pub num_observations: usize,
    /// Observations rejected as outliers: (keyframe, feature slot, point).
    pub outliers: Vec<(KeyFrameId, usize, MapPointId)>,
    /// The solve was cut short by the abort flag.
    pub aborted: bool,
}

/// Everything the solver needs, detached from the map.
#[derive(Debug, Clone)]
pub struct LocalBAProblem {
    /// Map change index at collection time.
    pub change_index: u64,
    /// Pose index in `bundle` → keyframe.
    pub keyframes: Vec<KeyFrameId>,
    /// Point index in `bundle` → map point.
    pub map_points: Vec<MapPointId>,
    /// Edge index in `bundle` → (keyframe, feature slot, point).
    pub edge_keys: Vec<(KeyFrameId, usize, MapPointId)>,
    pub num_local: usize,
    pub bundle: BundleProblem,
}

/// PHASE 1: collect the local window around `current_kf_id`.
pub fn collect_local_ba(map: &Map, current_kf_id: KeyFrameId, camera: &CameraModel) -> Option<LocalBAProblem> {
    let current = map.get_keyframe(current_kf_id)?;

    // Local keyframes: current + covisible neighbors
    let mut local_kfs = vec![current_kf_id];
    local_kfs.extend(
        current
            .ordered_covisibles()
            .filter(|id| map.get_keyframe(*id).is_some_and(|kf| !kf.is_bad)),
    );
    let local_set: HashSet<KeyFrameId> = local_kfs.iter().copied().collect();

    // Local map points
    let mut local_mps: Vec<MapPointId> = map
        .get_map_points_from_keyframes(&local_kfs)
        .into_iter()
        .filter(|id| map.get_map_point(*id).is_some_and(|mp| !mp.is_bad))
        .collect();
    local_mps.sort();
    if local_mps.is_empty() {
        return None;
    }

    // Fixed keyframes: observe local points but are not local
    let mut fixed_kfs: Vec<KeyFrameId> = local_mps
        .iter()
        .filter_map(|id| map.get_map_point(*id))
        .flat_map(|mp| mp.observations().keys().copied())
        .filter(|id| !local_set.contains(id))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    fixed_kfs.sort();

    let origin = map.origin_keyframe_id();
    let mut keyframes = Vec::with_capacity(local_kfs.len() + fixed_kfs.len());
    let mut bundle = BundleProblem::default();
    let mut pose_index: HashMap<KeyFrameId, usize> = HashMap::new();
    for (id, fixed) in local_kfs
        .iter()
        .map(|id| (*id, Some(*id) == origin))
        .chain(fixed_kfs.iter().map(|id| (*id, true)))
    {
        let Some(kf) = map.get_keyframe(id) else {
            continue;
        };
        pose_index.insert(id, keyframes.len());
        keyframes.push(id);
        bundle.poses_cw.push(kf.pose_cw());
        bundle.pose_fixed.push(fixed);
    }

    let mut edge_keys = Vec::new();
    let mut map_points = Vec::with_capacity(local_mps.len());
    for mp_id in local_mps {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        let point_idx = map_points.len();
        map_points.push(mp_id);
        bundle.points.push(mp.position);

        let mut observers: Vec<(KeyFrameId, usize)> =
            mp.observations().iter().map(|(k, v)| (*k, *v)).collect();
        observers.sort();
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
            edge_keys.push((kf_id, feature_idx, mp_id));
        }
    }

    Some(LocalBAProblem {
        change_index: map.change_index(),
        keyframes,
        map_points,
        edge_keys,
        num_local: local_kfs.len(),
        bundle,
    })
}

/// PHASE 2: optimize, drop outliers, optimize again. Polls `abort` between
/// iterations.
pub fn solve_local_ba(
    problem: &mut LocalBAProblem,
    camera: &CameraModel,
    config: &LocalBAConfig,
    abort: &AtomicBool,
) -> LocalBAResult {
    let should_stop = || abort.load(Ordering::SeqCst);

    let first = problem
        .bundle
        .optimize(camera, config.first_pass_iterations, true, &should_stop);
    let mut iterations = first.iterations;
    let mut final_error = first.final_error;

    let aborted = should_stop();
    if !aborted {
        problem.bundle.flag_outliers(camera);
        let second = problem
            .bundle
            .optimize(camera, config.second_pass_iterations, false, &should_stop);
        iterations += second.iterations;
        final_error = second.final_error;
    }

    // Classify with the final estimate, active or not.
    let outliers = problem
        .bundle
        .edges
        .iter()
        .zip(problem.edge_keys.iter())
        .filter(|(edge, _)| match problem.bundle.edge_chi2(edge, camera) {
            Some(c) => c > edge.measurement.chi2_threshold(),
            None => true,
        })
        .map(|(_, key)| *key)
        .collect();

    LocalBAResult {
        iterations,
        initial_error: first.initial_error,
        final_error,
        num_keyframes: problem.num_local,
        num_fixed_keyframes: problem.keyframes.len() - problem.num_local,
        num_map_points: problem.map_points.len(),
        num_observations: problem.bundle.edges.len(),
        outliers,
        aborted: aborted || should_stop(),
    }
}

/// PHASE 3: write poses and points back and drop outlier observations.
///
/// Entities removed since collection are skipped. Returns the number of
/// updated keyframes and points.
pub fn apply_local_ba(map: &mut Map, problem: &LocalBAProblem, result: &LocalBAResult) -> usize {
    if map.change_index() != problem.change_index {
        debug!(
            "[LocalBA] Map changed during optimization ({} -> {}), skipping stale entities",
            problem.change_index,
            map.change_index()
        );
    }

    for &(kf_id, feature_idx, mp_id) in &result.outliers {
        let still_linked = map
            .get_keyframe(kf_id)
            .is_some_and(|kf| kf.get_map_point(feature_idx) == Some(mp_id));
        if still_linked {
            map.disassociate(kf_id, feature_idx);
        }
    }

    let mut updated = 0;
    for (i, &kf_id) in problem.keyframes.iter().enumerate().take(problem.num_local) {
        if problem.bundle.pose_fixed[i] {
            continue;
        }
        match map.get_keyframe_mut(kf_id) {
            Some(kf) if !kf.is_bad => {
                kf.pose = problem.bundle.poses_cw[i].inverse();
                updated += 1;
            }
            _ => debug!("[LocalBA] {} vanished during optimization", kf_id),
        }
    }

    for (i, &mp_id) in problem.map_points.iter().enumerate() {
        let position: Vector3<f64> = problem.bundle.points[i];
        match map.get_map_point_mut(mp_id) {
            Some(mp) if !mp.is_bad => {
                mp.position = position;
                updated += 1;
            }
            _ => {
                debug!("[LocalBA] {} vanished during optimization", mp_id);
                continue;
            }
        }
        map.update_map_point_normal_and_depth(mp_id);
    }

    updated
}

/// Run all three phases against the shared map.
pub fn local_bundle_adjustment(
    map: &RwLock<Map>,
    current_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &LocalBAConfig,
    abort: &AtomicBool,
) -> Option<LocalBAResult> {
    let mut problem = {
        let guard = map.read();
        collect_local_ba(&guard, current_kf_id, camera)?
    };

    let result = solve_local_ba(&mut problem, camera, config, abort);

    let updated = {
        let mut guard = map.write();
        apply_local_ba(&mut guard, &problem, &result)
    };

    debug!(
        "[LocalBA] {}: {} local KFs, {} fixed, {} MPs, {} obs, {} iters, error {:.3} -> {:.3}, {} outliers, {} updated{}",
        current_kf_id,
        result.num_keyframes,
        result.num_fixed_keyframes,
        result.num_map_points,
        result.num_observations,
        result.iterations,
        result.initial_error,
        result.final_error,
        result.outliers.len(),
        updated,
        if result.aborted { " (aborted)" } else { "" }
    );
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::KeyFrameData;
    use crate::tracking::frame::KeyPoint;
    use crate::tracking::FeatureGrid;
    use crate::vocabulary::{BowVector, FeatureVector};
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640.0, 480.0, 40.0)
    }

    /// Three keyframes observing the same 40 points; returns the map and
    /// the ground-truth positions.
    fn build_map(point_noise: f64) -> (Map, Vec<KeyFrameId>, Vec<Vector3<f64>>) {
        let cam = camera();
        let truth: Vec<Vector3<f64>> = (0..40)
            .map(|i| {
                let f = i as f64;
                Vector3::new((f * 0.37).sin() * 1.5, (f * 0.91).cos(), 4.0 + (f * 0.13).sin())
            })
            .collect();

        let mut map = Map::new();
        let mut kfs = Vec::new();
        for k in 0..3 {
            let pose_wc = SE3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(0.2 * k as f64, 0.0, 0.0));
            let pose_cw = pose_wc.inverse();
            let mut keypoints = Vec::new();
            let mut points_cam = Vec::new();
            for p in &truth {
                let pc = pose_cw.transform_point(p);
                let uv = cam.project(&pc).unwrap();
                keypoints.push(KeyPoint::new(uv.x, uv.y, 0));
                points_cam.push(Some(pc));
            }
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
            let mp = map.create_map_point(p + Vector3::new(point_noise, -point_noise, point_noise), [0u8; 32], kfs[0]);
            for &kf in &kfs {
                map.associate(kf, j, mp);
            }
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }
        (map, kfs, truth)
    }

    #[test]
    fn test_local_ba_reduces_error() {
        let cam = camera();
        let (map, kfs, truth) = build_map(0.03);
        let lock = RwLock::new(map);
        {
            let mut guard = lock.write();
            let kf = guard.get_keyframe_mut(kfs[2]).unwrap();
            kf.pose.translation += Vector3::new(0.02, -0.01, 0.01);
        }

        let abort = AtomicBool::new(false);
        let result =
            local_bundle_adjustment(&lock, kfs[2], &cam, &LocalBAConfig::default(), &abort).unwrap();

        assert!(result.final_error < result.initial_error);
        assert!(result.outliers.is_empty());
        assert_eq!(result.num_keyframes, 3);

        let guard = lock.read();
        let kf = guard.get_keyframe(kfs[2]).unwrap();
        assert_relative_eq!(kf.pose.translation.x, 0.4, epsilon = 1e-3);
        let mp = guard.get_map_point(guard.map_point_ids()[0]).unwrap();
        assert_relative_eq!(mp.position, truth[0], epsilon = 1e-3);
    }

    #[test]
    fn test_apply_skips_erased_entities() {
        let cam = camera();
        let (mut map, kfs, _) = build_map(0.01);
        let mut problem = collect_local_ba(&map, kfs[2], &cam).unwrap();
        let abort = AtomicBool::new(false);
        let result = solve_local_ba(&mut problem, &cam, &LocalBAConfig::default(), &abort);

        // A point disappears between SOLVE and APPLY.
        let gone = problem.map_points[0];
        map.erase_map_point(gone);

        let updated = apply_local_ba(&mut map, &problem, &result);
        assert!(updated > 0);
        assert!(map.get_map_point(gone).is_none());
    }

    #[test]
    fn test_aborted_solve_stops_early() {
        let cam = camera();
        let (map, kfs, _) = build_map(0.05);
        let mut problem = collect_local_ba(&map, kfs[2], &cam).unwrap();
        let abort = AtomicBool::new(true);
        let result = solve_local_ba(&mut problem, &cam, &LocalBAConfig::default(), &abort);
        assert!(result.aborted);
        assert_eq!(result.iterations, 0);
    }
}
