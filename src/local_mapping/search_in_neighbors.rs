//! SearchInNeighbors - map point fusion between covisible keyframes.
//!
//! Duplicates appear when the same landmark is triangulated from different
//! keyframe pairs. The fusion:
//! 1. Collects first and second order covisible neighbors
//! 2. Projects the current keyframe's points into every neighbor
//! 3. Projects the neighbors' points into the current keyframe
//! 4. Refreshes descriptors, normals and covisibility of the current keyframe

use std::collections::HashSet;

use tracing::debug;

use crate::map::{KeyFrameId, Map, MapPointId};
use crate::tracking::frame::CameraModel;
use crate::tracking::matching::{fuse_candidates, CameraPose, FuseAction};

/// Configuration for SearchInNeighbors.
#[derive(Debug, Clone)]
pub struct SearchInNeighborsConfig {
    /// Number of best covisible keyframes to collect.
    pub nn_covisibles: usize,
    /// Second order neighbors taken from each first order one.
    pub second_order: usize,
    /// Search radius multiplier (radius = factor * level scale).
    pub radius_factor: f64,
}

impl SearchInNeighborsConfig {
    pub fn new(monocular: bool) -> Self {
        Self {
            nn_covisibles: if monocular { 20 } else { 10 },
            second_order: 5,
            radius_factor: 3.0,
        }
    }
}

/// Result of SearchInNeighbors operation.
#[derive(Debug, Default)]
pub struct SearchInNeighborsResult {
    /// Duplicate pairs merged through [`Map::replace`].
    pub num_fused: usize,
    /// Free slots that received an existing point.
    pub num_observations_added: usize,
}

/// Fuse the current keyframe's points with those of its neighbors.
pub fn search_in_neighbors(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &SearchInNeighborsConfig,
) -> SearchInNeighborsResult {
    let mut result = SearchInNeighborsResult::default();

    let neighbor_ids = collect_neighbors(map, current_kf_id, config);
    if neighbor_ids.is_empty() {
        return result;
    }

    // Current points into every neighbor.
    for &neighbor_id in &neighbor_ids {
        let current_points = keyframe_points(map, &[current_kf_id]);
        let actions = match map.get_keyframe(neighbor_id) {
            Some(kf) => {
                let pose = CameraPose::from_twc(&kf.pose);
                fuse_candidates(kf, &pose, &current_points, map, camera, config.radius_factor)
            }
            None => continue,
        };
        apply_fuse_actions(map, neighbor_id, &actions, &mut result);
    }

    // Neighbor points into the current keyframe.
    let neighbor_points = keyframe_points(map, &neighbor_ids);
    let actions = match map.get_keyframe(current_kf_id) {
        Some(kf) => {
            let pose = CameraPose::from_twc(&kf.pose);
            fuse_candidates(kf, &pose, &neighbor_points, map, camera, config.radius_factor)
        }
        None => return result,
    };
    apply_fuse_actions(map, current_kf_id, &actions, &mut result);

    let current_points = keyframe_points(map, &[current_kf_id]);
    for mp_id in current_points {
        map.compute_distinctive_descriptor(mp_id);
        map.update_map_point_normal_and_depth(mp_id);
    }
    map.update_connections(current_kf_id);

    if result.num_fused > 0 || result.num_observations_added > 0 {
        debug!(
            "[SearchInNeighbors] {}: fused {} points, added {} observations",
            current_kf_id, result.num_fused, result.num_observations_added
        );
    }
    result
}

/// Apply fuse actions computed against `kf_id`. A merge keeps the point with
/// more observations.
pub fn apply_fuse_actions(
    map: &mut Map,
    kf_id: KeyFrameId,
    actions: &[FuseAction],
    result: &mut SearchInNeighborsResult,
) {
    for action in actions {
        match *action {
            FuseAction::Merge { existing, candidate } => {
                let obs = |id: MapPointId| map.get_map_point(id).map(|mp| mp.num_observations());
                let (Some(n_existing), Some(n_candidate)) = (obs(existing), obs(candidate)) else {
                    continue;
                };
                let merged = if n_existing > n_candidate {
                    map.replace(candidate, existing)
                } else {
                    map.replace(existing, candidate)
                };
                if merged {
                    result.num_fused += 1;
                }
            }
            FuseAction::Associate { feature_idx, candidate } => {
                let slot_free = map
                    .get_keyframe(kf_id)
                    .is_some_and(|kf| kf.get_map_point(feature_idx).is_none());
                if slot_free && map.associate(kf_id, feature_idx, candidate) {
                    result.num_observations_added += 1;
                }
            }
        }
    }
}

fn collect_neighbors(map: &Map, current_kf_id: KeyFrameId, config: &SearchInNeighborsConfig) -> Vec<KeyFrameId> {
    let Some(kf) = map.get_keyframe(current_kf_id) else {
        return Vec::new();
    };
    let mut seen: HashSet<KeyFrameId> = HashSet::from([current_kf_id]);
    let mut neighbors = Vec::new();

    for id in kf.get_best_covisibles(config.nn_covisibles) {
        let Some(first) = map.get_keyframe(id).filter(|k| !k.is_bad) else {
            continue;
        };
        if seen.insert(id) {
            neighbors.push(id);
        }
        for second in first.get_best_covisibles(config.second_order) {
            if map.get_keyframe(second).is_some_and(|k| !k.is_bad) && seen.insert(second) {
                neighbors.push(second);
            }
        }
    }
    neighbors
}

fn keyframe_points(map: &Map, kf_ids: &[KeyFrameId]) -> Vec<MapPointId> {
    let mut points: Vec<MapPointId> = map.get_map_points_from_keyframes(kf_ids).into_iter().collect();
    points.sort_unstable();
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::KeyFrameData;
    use crate::tracking::frame::{Descriptor, KeyPoint};
    use crate::tracking::FeatureGrid;
    use crate::vocabulary::{BowVector, FeatureVector};
    use nalgebra::Vector3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640.0, 480.0, 40.0)
    }

    fn desc(i: usize) -> Descriptor {
        StdRng::seed_from_u64(i as u64).gen()
    }

    fn scene() -> Vec<Vector3<f64>> {
        (0..30)
            .map(|i| {
                let f = i as f64;
                Vector3::new((f * 0.37).sin(), (f * 0.71).cos() * 0.8, 4.0 + (f * 0.13).sin())
            })
            .collect()
    }

    fn keyframe(map: &mut Map, x: f64, points: &[Vector3<f64>]) -> KeyFrameId {
        let cam = camera();
        let pose_wc = SE3::from_rt(nalgebra::Matrix3::identity(), Vector3::new(x, 0.0, 0.0));
        let pose_cw = pose_wc.inverse();
        let keypoints: Vec<KeyPoint> = points
            .iter()
            .map(|p| {
                let uv = cam.project(&pose_cw.transform_point(p)).unwrap();
                KeyPoint::new(uv.x, uv.y, 0)
            })
            .collect();
        let grid = FeatureGrid::new(&keypoints, cam.width, cam.height);
        map.create_keyframe(KeyFrameData {
            timestamp: x,
            pose: pose_wc,
            descriptors: (0..points.len()).map(desc).collect(),
            keypoints,
            points_cam: vec![],
            bow_vector: BowVector::new(),
            feature_vector: FeatureVector::new(),
            grid,
        })
    }

    #[test]
    fn test_duplicates_are_merged() {
        let points = scene();
        let mut map = Map::new();
        let a = keyframe(&mut map, 0.0, &points);
        let b = keyframe(&mut map, 0.2, &points);

        // Shared anchors make a and b covisible.
        for i in 0..20 {
            let mp = map.create_map_point(points[i], desc(i), a);
            map.associate(a, i, mp);
            map.associate(b, i, mp);
        }
        // The rest was triangulated twice: one copy per keyframe.
        let mut duplicates = Vec::new();
        for i in 20..30 {
            let pa = map.create_map_point(points[i], desc(i), a);
            map.associate(a, i, pa);
            let pb = map.create_map_point(points[i], desc(i), b);
            map.associate(b, i, pb);
            duplicates.push((pa, pb));
        }
        map.update_connections(a);
        map.update_connections(b);
        assert_eq!(map.num_map_points(), 40);

        let result = search_in_neighbors(&mut map, b, &camera(), &SearchInNeighborsConfig::new(true));

        assert_eq!(result.num_fused, 10);
        assert_eq!(map.num_map_points(), 30);
        for (pa, pb) in duplicates {
            let survivor = if map.contains_map_point(pa) { pa } else { pb };
            assert!(!(map.contains_map_point(pa) && map.contains_map_point(pb)));
            let mp = map.get_map_point(survivor).unwrap();
            assert!(mp.is_observed_by(a) && mp.is_observed_by(b));
        }
    }

    #[test]
    fn test_free_slot_receives_point() {
        let points = scene();
        let mut map = Map::new();
        let a = keyframe(&mut map, 0.0, &points);
        let b = keyframe(&mut map, 0.2, &points);
        for i in 0..20 {
            let mp = map.create_map_point(points[i], desc(i), a);
            map.associate(a, i, mp);
            map.associate(b, i, mp);
        }
        let lonely = map.create_map_point(points[25], desc(25), a);
        map.associate(a, 25, lonely);
        map.update_connections(a);
        map.update_connections(b);

        let result = search_in_neighbors(&mut map, b, &camera(), &SearchInNeighborsConfig::new(false));

        assert_eq!(result.num_observations_added, 1);
        assert_eq!(map.get_keyframe(b).unwrap().get_map_point(25), Some(lonely));
    }
}
