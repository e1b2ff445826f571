//! Descriptor matching between frames, keyframes and map points.
//!
//! Every search here is read-only on the map. Searches that would change
//! associations (fusion) return [`FuseAction`]s that the caller applies
//! under the map write lock.

use std::collections::{HashMap, HashSet};

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::geometry::{skew, Sim3, SE3};
use crate::map::{KeyFrame, Map, MapPoint, MapPointId};
use crate::tracking::frame::{
    descriptor_distance, level_scale, level_sigma2, predict_scale, CameraModel, Descriptor,
    TH_HIGH, TH_LOW,
};
use crate::tracking::tracking_frame::Frame;

/// Minimum cosine between the viewing ray and the point's mean normal (60°).
const MIN_VIEW_COS: f64 = 0.5;

/// Chi-square threshold (2 DoF, 95%) for reprojection checks.
const CHI2_MONO: f64 = 5.991;

/// Chi-square threshold (1 DoF, 95%) for the epipolar distance.
const CHI2_EPIPOLAR: f64 = 3.84;

/// Ratio between best and second best distance when both sit at the same
/// pyramid level (local map search).
const LOCAL_MAP_RATIO: f64 = 0.8;

/// World-to-camera rigid motion with the camera center cached.
#[derive(Debug, Clone)]
pub struct CameraPose {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    center: Vector3<f64>,
}

impl CameraPose {
    /// From a `T_wc` pose.
    pub fn from_twc(pose_wc: &SE3) -> Self {
        Self::from_tcw(&pose_wc.inverse())
    }

    pub fn from_tcw(pose_cw: &SE3) -> Self {
        let rotation = pose_cw.rotation_matrix();
        let translation = pose_cw.translation;
        Self {
            center: -rotation.transpose() * translation,
            rotation,
            translation,
        }
    }

    /// From a world-to-camera similarity; the scale is divided out of the
    /// translation so the rotation acts on world points directly.
    pub fn from_scw(scw: &Sim3) -> Self {
        let rotation = scw.rotation_matrix();
        let translation = scw.translation / scw.scale;
        Self {
            center: -rotation.transpose() * translation,
            rotation,
            translation,
        }
    }

    pub fn to_camera(&self, p_world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p_world + self.translation
    }

    pub fn center(&self) -> &Vector3<f64> {
        &self.center
    }
}

/// Where a map point lands in an image.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub uv: Vector2<f64>,
    pub depth: f64,
    /// Predicted pyramid level.
    pub level: i32,
    pub view_cos: f64,
}

/// Project a map point and check it is inside the image, the distance range
/// and the viewing cone.
pub fn project_in_frustum(
    mp: &MapPoint,
    pose: &CameraPose,
    camera: &CameraModel,
) -> Option<Projection> {
    let p_cam = pose.to_camera(&mp.position);
    let uv = camera.project(&p_cam)?;
    if !camera.is_in_image(uv.x, uv.y) {
        return None;
    }

    let ray = mp.position - pose.center;
    let dist = ray.norm();
    if !mp.is_in_distance_range(dist) {
        return None;
    }

    // Points whose normal is not set yet are visible from anywhere.
    let view_cos = if mp.normal.norm_squared() > 0.0 {
        ray.dot(&mp.normal) / dist
    } else {
        1.0
    };
    if view_cos < MIN_VIEW_COS {
        return None;
    }

    Some(Projection {
        uv,
        depth: p_cam.z,
        level: predict_scale(dist, mp.max_distance),
        view_cos,
    })
}

/// Best and second best Hamming distance of `desc` among `candidates`.
fn best_two<'a, I>(desc: &Descriptor, candidates: I) -> Option<(usize, u32, u32)>
where
    I: IntoIterator<Item = (usize, &'a Descriptor)>,
{
    let mut best_idx = None;
    let mut best = u32::MAX;
    let mut second = u32::MAX;
    for (idx, other) in candidates {
        let dist = descriptor_distance(desc, other);
        if dist < best {
            second = best;
            best = dist;
            best_idx = Some(idx);
        } else if dist < second {
            second = dist;
        }
    }
    best_idx.map(|idx| (idx, best, second))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracking searches (frame side)
// ─────────────────────────────────────────────────────────────────────────────

/// Motion-model tracking: project the map points tracked in `last` into
/// `current` (which must carry a predicted pose).
pub fn search_by_projection_last_frame(
    current: &mut Frame,
    last: &Frame,
    map: &Map,
    camera: &CameraModel,
    th: f64,
) -> usize {
    let Some(pose_wc) = current.pose.as_ref() else {
        return 0;
    };
    let pose = CameraPose::from_twc(pose_wc);
    let mut already: HashSet<MapPointId> = current.map_point_matches.iter().flatten().copied().collect();
    let mut n_matches = 0;

    for (i, (mp_id, &outlier)) in last
        .map_point_matches
        .iter()
        .zip(last.outliers.iter())
        .enumerate()
    {
        let Some(mp_id) = mp_id else { continue };
        if outlier || already.contains(mp_id) {
            continue;
        }
        let Some(mp) = map.get_map_point(*mp_id) else {
            continue;
        };
        let p_cam = pose.to_camera(&mp.position);
        let Some(uv) = camera.project(&p_cam) else {
            continue;
        };
        if !camera.is_in_image(uv.x, uv.y) {
            continue;
        }

        let last_octave = last.features.keypoints[i].octave;
        let radius = th * level_scale(last_octave);
        let candidates = current.get_features_in_area(
            uv.x,
            uv.y,
            radius,
            Some(last_octave - 1),
            Some(last_octave + 1),
        );
        let best = best_two(
            &mp.descriptor,
            candidates
                .into_iter()
                .filter(|&idx| current.map_point_matches[idx].is_none())
                .map(|idx| (idx, &current.features.descriptors[idx])),
        );
        if let Some((idx, dist, _)) = best {
            if dist <= TH_HIGH {
                current.map_point_matches[idx] = Some(*mp_id);
                already.insert(*mp_id);
                n_matches += 1;
            }
        }
    }

    n_matches
}

/// Reference-keyframe tracking: match keyframe map points to frame features
/// that share a vocabulary node.
pub fn search_by_bow_frame(kf: &KeyFrame, frame: &mut Frame, map: &Map, nn_ratio: f64) -> usize {
    let mut n_matches = 0;
    let mut used: HashSet<MapPointId> = frame.map_point_matches.iter().flatten().copied().collect();

    for (node, kf_indices) in &kf.feature_vector {
        let Some(frame_indices) = frame.feature_vector.get(node) else {
            continue;
        };
        for &kf_idx in kf_indices {
            let Some(mp_id) = kf.get_map_point(kf_idx) else {
                continue;
            };
            if used.contains(&mp_id) || !map.contains_map_point(mp_id) {
                continue;
            }
            let desc = &kf.descriptors[kf_idx];
            let best = best_two(
                desc,
                frame_indices
                    .iter()
                    .filter(|&&i| frame.map_point_matches[i].is_none())
                    .map(|&i| (i, &frame.features.descriptors[i])),
            );
            if let Some((idx, best, second)) = best {
                if best <= TH_LOW && (best as f64) < nn_ratio * second as f64 {
                    frame.map_point_matches[idx] = Some(mp_id);
                    used.insert(mp_id);
                    n_matches += 1;
                }
            }
        }
    }

    n_matches
}

/// Result of a local-map projection search.
#[derive(Debug, Default)]
pub struct LocalSearch {
    pub matches: usize,
    /// Points predicted visible in the frame (for visibility counters).
    pub visible: Vec<MapPointId>,
}

/// Project local map points not yet matched and search by descriptor.
pub fn search_local_points(
    frame: &mut Frame,
    map: &Map,
    local_points: &[MapPointId],
    camera: &CameraModel,
    th: f64,
) -> LocalSearch {
    let mut result = LocalSearch::default();
    let Some(pose_wc) = frame.pose.as_ref() else {
        return result;
    };
    let pose = CameraPose::from_twc(pose_wc);
    let already: HashSet<MapPointId> = frame.map_point_matches.iter().flatten().copied().collect();

    for &mp_id in local_points {
        if already.contains(&mp_id) {
            continue;
        }
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        let Some(proj) = project_in_frustum(mp, &pose, camera) else {
            continue;
        };
        result.visible.push(mp_id);

        let window = if proj.view_cos > 0.998 { 2.5 } else { 4.0 };
        let radius = th * window * level_scale(proj.level);
        let candidates =
            frame.get_features_in_area(proj.uv.x, proj.uv.y, radius, Some(proj.level - 1), Some(proj.level));

        let mut best_idx = None;
        let mut best = u32::MAX;
        let mut second = u32::MAX;
        let mut best_level = -1;
        let mut second_level = -1;
        for idx in candidates {
            if frame.map_point_matches[idx].is_some() {
                continue;
            }
            let dist = descriptor_distance(&mp.descriptor, &frame.features.descriptors[idx]);
            let level = frame.features.keypoints[idx].octave;
            if dist < best {
                second = best;
                second_level = best_level;
                best = dist;
                best_level = level;
                best_idx = Some(idx);
            } else if dist < second {
                second = dist;
                second_level = level;
            }
        }

        let Some(idx) = best_idx else { continue };
        if best > TH_HIGH {
            continue;
        }
        if best_level == second_level && best as f64 > LOCAL_MAP_RATIO * second as f64 {
            continue;
        }
        frame.map_point_matches[idx] = Some(mp_id);
        result.matches += 1;
    }

    result
}

/// Relocalization refinement: project the keyframe's points not in
/// `already_found` into the frame.
pub fn search_by_projection_keyframe(
    frame: &mut Frame,
    kf: &KeyFrame,
    map: &Map,
    camera: &CameraModel,
    already_found: &HashSet<MapPointId>,
    th: f64,
    orb_dist: u32,
) -> usize {
    let Some(pose_wc) = frame.pose.as_ref() else {
        return 0;
    };
    let pose = CameraPose::from_twc(pose_wc);
    let mut n_matches = 0;

    for (_, mp_id) in kf.get_map_point_indices() {
        if already_found.contains(&mp_id) {
            continue;
        }
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        let p_cam = pose.to_camera(&mp.position);
        let Some(uv) = camera.project(&p_cam) else {
            continue;
        };
        if !camera.is_in_image(uv.x, uv.y) {
            continue;
        }
        let dist3d = (mp.position - pose.center).norm();
        if !mp.is_in_distance_range(dist3d) {
            continue;
        }
        let level = predict_scale(dist3d, mp.max_distance);
        let radius = th * level_scale(level);
        let candidates =
            frame.get_features_in_area(uv.x, uv.y, radius, Some(level - 1), Some(level + 1));

        let best = best_two(
            &mp.descriptor,
            candidates
                .into_iter()
                .filter(|&idx| frame.map_point_matches[idx].is_none())
                .map(|idx| (idx, &frame.features.descriptors[idx])),
        );
        if let Some((idx, dist, _)) = best {
            if dist <= orb_dist {
                frame.map_point_matches[idx] = Some(mp_id);
                n_matches += 1;
            }
        }
    }

    n_matches
}

/// Monocular initialization: match every feature of `reference` to a
/// feature of `current` within `window` pixels of its last known position.
///
/// `prev_positions[i]` holds where feature i of the reference was last
/// matched (its own position at first). Returns one entry per reference
/// feature and the number of matches.
pub fn search_for_initialization(
    reference: &Frame,
    current: &Frame,
    prev_positions: &mut [Vector2<f64>],
    window: f64,
    nn_ratio: f64,
) -> (Vec<Option<usize>>, usize) {
    let mut matches12: Vec<Option<usize>> = vec![None; reference.num_features()];
    let mut matched21: HashMap<usize, (usize, u32)> = HashMap::new();

    for (i1, kp1) in reference.keypoints().iter().enumerate() {
        if kp1.octave > 0 {
            continue;
        }
        let Some(prev) = prev_positions.get(i1) else {
            continue;
        };
        let candidates = current.get_features_in_area(prev.x, prev.y, window, Some(0), Some(0));
        let Some((i2, best, second)) = best_two(
            &reference.features.descriptors[i1],
            candidates
                .into_iter()
                .map(|i2| (i2, &current.features.descriptors[i2])),
        ) else {
            continue;
        };
        if best > TH_LOW || (best as f64) >= nn_ratio * second as f64 {
            continue;
        }
        // Keep the closer of two reference features claiming the same target.
        if let Some(&(other, other_dist)) = matched21.get(&i2) {
            if other_dist <= best {
                continue;
            }
            matches12[other] = None;
        }
        matches12[i1] = Some(i2);
        matched21.insert(i2, (i1, best));
    }

    let mut n_matches = 0;
    for (i1, m) in matches12.iter().enumerate() {
        if let Some(i2) = m {
            let kp2 = &current.features.keypoints[*i2];
            prev_positions[i1] = Vector2::new(kp2.x, kp2.y);
            n_matches += 1;
        }
    }
    (matches12, n_matches)
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyframe-to-keyframe searches
// ─────────────────────────────────────────────────────────────────────────────

/// Match map points of two keyframes through shared vocabulary nodes.
/// Returns `(feature index in kf1, map point of kf2)` pairs.
pub fn search_by_bow_keyframes(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    map: &Map,
    nn_ratio: f64,
) -> Vec<(usize, MapPointId)> {
    let mut matches = Vec::new();
    let mut used2: HashSet<usize> = HashSet::new();

    for (node, indices1) in &kf1.feature_vector {
        let Some(indices2) = kf2.feature_vector.get(node) else {
            continue;
        };
        for &i1 in indices1 {
            let Some(mp1) = kf1.get_map_point(i1) else {
                continue;
            };
            if !map.contains_map_point(mp1) {
                continue;
            }
            let best = best_two(
                &kf1.descriptors[i1],
                indices2
                    .iter()
                    .filter(|&&i2| !used2.contains(&i2))
                    .filter(|&&i2| {
                        kf2.get_map_point(i2)
                            .is_some_and(|mp2| map.contains_map_point(mp2))
                    })
                    .map(|&i2| (i2, &kf2.descriptors[i2])),
            );
            if let Some((i2, best, second)) = best {
                if best <= TH_LOW && (best as f64) < nn_ratio * second as f64 {
                    if let Some(mp2) = kf2.get_map_point(i2) {
                        used2.insert(i2);
                        matches.push((i1, mp2));
                    }
                }
            }
        }
    }

    matches
}

/// Fundamental matrix `F12` with `p1ᵀ F12 p2 = 0` for pixels of kf1 and kf2.
pub fn fundamental_between(kf1: &KeyFrame, kf2: &KeyFrame, camera: &CameraModel) -> Matrix3<f64> {
    let t12_pose = kf1.pose_cw().compose(&kf2.pose);
    let e12 = skew(&t12_pose.translation) * t12_pose.rotation_matrix();
    let k_inv = Matrix3::new(
        1.0 / camera.fx,
        0.0,
        -camera.cx / camera.fx,
        0.0,
        1.0 / camera.fy,
        -camera.cy / camera.fy,
        0.0,
        0.0,
        1.0,
    );
    k_inv.transpose() * e12 * k_inv
}

/// Squared distance of `p2` to the epipolar line of `p1`, compared against
/// the level-scaled chi-square bound.
fn epipolar_consistent(p1: &Vector2<f64>, p2: &Vector2<f64>, f12: &Matrix3<f64>, level2: i32) -> bool {
    let a = p1.x * f12[(0, 0)] + p1.y * f12[(1, 0)] + f12[(2, 0)];
    let b = p1.x * f12[(0, 1)] + p1.y * f12[(1, 1)] + f12[(2, 1)];
    let c = p1.x * f12[(0, 2)] + p1.y * f12[(1, 2)] + f12[(2, 2)];
    let den = a * a + b * b;
    if den == 0.0 {
        return false;
    }
    let num = a * p2.x + b * p2.y + c;
    num * num / den < CHI2_EPIPOLAR * level_sigma2(level2)
}

/// Pair features of two keyframes that have no map point yet and satisfy
/// the epipolar constraint. Returns `(index in kf1, index in kf2)`.
pub fn search_for_triangulation(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    camera: &CameraModel,
) -> Vec<(usize, usize)> {
    let f12 = fundamental_between(kf1, kf2, camera);

    // Epipole of kf1's center in kf2.
    let c1_in_2 = kf2.pose_cw().transform_point(&kf1.camera_center());
    let epipole = camera.project(&c1_in_2);

    let mut best_for_2: HashMap<usize, (usize, u32)> = HashMap::new();

    for (node, indices1) in &kf1.feature_vector {
        let Some(indices2) = kf2.feature_vector.get(node) else {
            continue;
        };
        for &i1 in indices1 {
            if kf1.get_map_point(i1).is_some() {
                continue;
            }
            let kp1 = &kf1.keypoints[i1];
            let p1 = Vector2::new(kp1.x, kp1.y);
            let stereo1 = kf1.points_cam[i1].is_some();

            let mut best: Option<(usize, u32)> = None;
            for &i2 in indices2 {
                if kf2.get_map_point(i2).is_some() {
                    continue;
                }
                let stereo2 = kf2.points_cam[i2].is_some();
                let dist = descriptor_distance(&kf1.descriptors[i1], &kf2.descriptors[i2]);
                if dist > TH_LOW || best.is_some_and(|(_, d)| dist >= d) {
                    continue;
                }
                let kp2 = &kf2.keypoints[i2];
                let p2 = Vector2::new(kp2.x, kp2.y);

                if !stereo1 && !stereo2 {
                    if let Some(ep) = epipole {
                        if (p2 - ep).norm_squared() < 100.0 * level_scale(kp2.octave) {
                            continue;
                        }
                    }
                }
                if epipolar_consistent(&p1, &p2, &f12, kp2.octave) {
                    best = Some((i2, dist));
                }
            }

            if let Some((i2, dist)) = best {
                let replace = best_for_2.get(&i2).map_or(true, |&(_, d)| dist < d);
                if replace {
                    best_for_2.insert(i2, (i1, dist));
                }
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = best_for_2.into_iter().map(|(i2, (i1, _))| (i1, i2)).collect();
    pairs.sort_unstable();
    pairs
}

// ─────────────────────────────────────────────────────────────────────────────
// Fusion
// ─────────────────────────────────────────────────────────────────────────────

/// A change to apply to the map after a fuse search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseAction {
    /// The slot already holds `existing`; the two points are duplicates.
    Merge {
        existing: MapPointId,
        candidate: MapPointId,
    },
    /// The slot is free; associate the candidate.
    Associate { feature_idx: usize, candidate: MapPointId },
}

/// Project candidate points into a keyframe and find duplicates.
///
/// `pose` is the keyframe's world-to-camera transform; loop fusion passes a
/// corrected similarity through [`CameraPose::from_scw`].
pub fn fuse_candidates(
    kf: &KeyFrame,
    pose: &CameraPose,
    candidates: &[MapPointId],
    map: &Map,
    camera: &CameraModel,
    th: f64,
) -> Vec<FuseAction> {
    let mut actions = Vec::new();
    let mut claimed: HashSet<usize> = HashSet::new();

    for &mp_id in candidates {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        if mp.is_observed_by(kf.id) {
            continue;
        }
        let Some(proj) = project_in_frustum(mp, pose, camera) else {
            continue;
        };
        let radius = th * level_scale(proj.level);

        let mut best_idx = None;
        let mut best = u32::MAX;
        for idx in kf.get_features_in_area(proj.uv.x, proj.uv.y, radius, None, None) {
            if claimed.contains(&idx) {
                continue;
            }
            let kp = &kf.keypoints[idx];
            if kp.octave < proj.level - 1 || kp.octave > proj.level {
                continue;
            }
            let e = Vector2::new(proj.uv.x - kp.x, proj.uv.y - kp.y);
            if e.norm_squared() > CHI2_MONO * level_sigma2(kp.octave) {
                continue;
            }
            let dist = descriptor_distance(&mp.descriptor, &kf.descriptors[idx]);
            if dist < best {
                best = dist;
                best_idx = Some(idx);
            }
        }

        let Some(idx) = best_idx else { continue };
        if best > TH_LOW {
            continue;
        }
        claimed.insert(idx);
        match kf.get_map_point(idx) {
            Some(existing) if existing != mp_id => actions.push(FuseAction::Merge {
                existing,
                candidate: mp_id,
            }),
            Some(_) => {}
            None => actions.push(FuseAction::Associate {
                feature_idx: idx,
                candidate: mp_id,
            }),
        }
    }

    actions
}

/// Project landmarks into `kf` with a corrected similarity and fill free
/// slots of `matched` (indexed by kf feature).
pub fn search_by_projection_sim3(
    kf: &KeyFrame,
    scw: &Sim3,
    candidates: &[MapPointId],
    matched: &mut [Option<MapPointId>],
    map: &Map,
    camera: &CameraModel,
    th: f64,
) -> usize {
    let pose = CameraPose::from_scw(scw);
    let already: HashSet<MapPointId> = matched.iter().flatten().copied().collect();
    let mut n_matches = 0;

    for &mp_id in candidates {
        if already.contains(&mp_id) {
            continue;
        }
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        let Some(proj) = project_in_frustum(mp, &pose, camera) else {
            continue;
        };
        let radius = th * level_scale(proj.level);
        let best = best_two(
            &mp.descriptor,
            kf.get_features_in_area(proj.uv.x, proj.uv.y, radius, Some(proj.level - 1), Some(proj.level))
                .into_iter()
                .filter(|&idx| matched.get(idx).is_some_and(|m| m.is_none()))
                .map(|idx| (idx, &kf.descriptors[idx])),
        );
        if let Some((idx, dist, _)) = best {
            if dist <= TH_LOW {
                matched[idx] = Some(mp_id);
                n_matches += 1;
            }
        }
    }

    n_matches
}

/// Guided search between two keyframes given `S12` (kf2 camera → kf1
/// camera). Only mutually consistent matches are added to `matches12`,
/// which is indexed by kf1 feature and holds kf2 map points.
pub fn search_by_sim3(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    matches12: &mut [Option<MapPointId>],
    s12: &Sim3,
    map: &Map,
    camera: &CameraModel,
    th: f64,
) -> usize {
    let s21 = s12.inverse();
    let pose1 = CameraPose::from_twc(&kf1.pose);
    let pose2 = CameraPose::from_twc(&kf2.pose);

    let already2: HashSet<MapPointId> = matches12.iter().flatten().copied().collect();

    // kf2 point → kf1 feature
    let mut match21: HashMap<usize, usize> = HashMap::new();
    for (i2, mp_id) in kf2.get_map_point_indices() {
        if already2.contains(&mp_id) {
            continue;
        }
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        let p_c1 = s12.transform_point(&pose2.to_camera(&mp.position));
        if let Some(i1) = guided_match(kf1, &p_c1, mp, camera, th) {
            match21.insert(i2, i1);
        }
    }

    // kf1 point → kf2 feature
    let mut match12: HashMap<usize, usize> = HashMap::new();
    for (i1, mp_id) in kf1.get_map_point_indices() {
        if matches12.get(i1).is_some_and(|m| m.is_some()) {
            continue;
        }
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        let p_c2 = s21.transform_point(&pose1.to_camera(&mp.position));
        if let Some(i2) = guided_match(kf2, &p_c2, mp, camera, th) {
            match12.insert(i1, i2);
        }
    }

    let mut n_found = 0;
    for (i2, i1) in match21 {
        if match12.get(&i1) != Some(&i2) {
            continue;
        }
        if let (Some(slot), Some(mp2)) = (matches12.get_mut(i1), kf2.get_map_point(i2)) {
            if slot.is_none() {
                *slot = Some(mp2);
                n_found += 1;
            }
        }
    }
    n_found
}

fn guided_match(
    kf: &KeyFrame,
    p_cam: &Vector3<f64>,
    mp: &MapPoint,
    camera: &CameraModel,
    th: f64,
) -> Option<usize> {
    let uv = camera.project(p_cam)?;
    if !camera.is_in_image(uv.x, uv.y) {
        return None;
    }
    let dist3d = p_cam.norm();
    if !mp.is_in_distance_range(dist3d) {
        return None;
    }
    let level = predict_scale(dist3d, mp.max_distance);
    let radius = th * level_scale(level);
    let (idx, dist, _) = best_two(
        &mp.descriptor,
        kf.get_features_in_area(uv.x, uv.y, radius, Some(level - 1), Some(level))
            .into_iter()
            .map(|idx| (idx, &kf.descriptors[idx])),
    )?;
    (dist <= TH_HIGH).then_some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::KeyFrameData;
    use crate::tracking::frame::{FeatureSet, KeyPoint};
    use crate::tracking::FeatureGrid;
    use crate::vocabulary::{BowVector, FeatureVector};

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640.0, 480.0, 40.0)
    }

    fn desc(seed: u8) -> Descriptor {
        let mut d = [0u8; 32];
        d[seed as usize % 32] = 0xFF;
        d[(seed as usize * 7 + 3) % 32] ^= 0x0F;
        d
    }

    /// Keyframe at the origin observing `points` (world == camera frame).
    fn keyframe_seeing(map: &mut Map, points: &[Vector3<f64>]) -> crate::map::KeyFrameId {
        let cam = camera();
        let keypoints: Vec<KeyPoint> = points
            .iter()
            .map(|p| {
                let uv = cam.project(p).unwrap();
                KeyPoint::new(uv.x, uv.y, 0)
            })
            .collect();
        let descriptors: Vec<Descriptor> = (0..points.len()).map(|i| desc(i as u8)).collect();
        let mut fv = FeatureVector::new();
        for i in 0..points.len() {
            fv.entry(i as u32).or_insert_with(Vec::new).push(i);
        }
        let grid = FeatureGrid::new(&keypoints, cam.width, cam.height);
        let kf = map.create_keyframe(KeyFrameData {
            timestamp: 0.0,
            pose: SE3::identity(),
            keypoints,
            descriptors: descriptors.clone(),
            points_cam: points.iter().map(|p| Some(*p)).collect(),
            bow_vector: BowVector::new(),
            feature_vector: fv,
            grid,
        });
        for (i, p) in points.iter().enumerate() {
            let mp = map.create_map_point(*p, descriptors[i], kf);
            map.associate(kf, i, mp);
            map.update_map_point_normal_and_depth(mp);
        }
        kf
    }

    fn scene() -> Vec<Vector3<f64>> {
        (0..12)
            .map(|i| Vector3::new(-1.0 + 0.2 * i as f64, 0.3 * ((i % 3) as f64 - 1.0), 4.0))
            .collect()
    }

    #[test]
    fn test_project_in_frustum_rejects_behind_and_oblique() {
        let mut map = Map::new();
        let kf = keyframe_seeing(&mut map, &scene());
        let mp_id = map.get_keyframe(kf).unwrap().get_map_point(0).unwrap();
        let mp = map.get_map_point(mp_id).unwrap();
        let cam = camera();

        assert!(project_in_frustum(mp, &CameraPose::from_twc(&SE3::identity()), &cam).is_some());

        // Looking from behind the point.
        let behind = SE3::from_rt(Matrix3::identity(), Vector3::new(0.0, 0.0, 8.0));
        assert!(project_in_frustum(mp, &CameraPose::from_twc(&behind), &cam).is_none());
    }

    #[test]
    fn test_local_search_recovers_all_points() {
        let mut map = Map::new();
        let points = scene();
        let kf = keyframe_seeing(&mut map, &points);
        let cam = camera();

        let kf_ref = map.get_keyframe(kf).unwrap();
        let features = FeatureSet::new(kf_ref.keypoints.clone(), kf_ref.descriptors.clone());
        let mut frame = Frame::new(1.0, features, vec![], &cam);
        frame.pose = Some(SE3::identity());

        let local: Vec<MapPointId> = map.map_point_ids();
        let result = search_local_points(&mut frame, &map, &local, &cam, 1.0);

        assert_eq!(result.matches, points.len());
        assert_eq!(result.visible.len(), points.len());
        for (i, m) in frame.map_point_matches.iter().enumerate() {
            assert_eq!(*m, kf_ref.get_map_point(i));
        }
    }

    #[test]
    fn test_bow_frame_search() {
        let mut map = Map::new();
        let kf = keyframe_seeing(&mut map, &scene());
        let cam = camera();
        let kf_ref = map.get_keyframe(kf).unwrap();

        let features = FeatureSet::new(kf_ref.keypoints.clone(), kf_ref.descriptors.clone());
        let mut frame = Frame::new(1.0, features, vec![], &cam);
        frame.feature_vector = kf_ref.feature_vector.clone();

        let n = search_by_bow_frame(kf_ref, &mut frame, &map, 0.7);
        assert_eq!(n, scene().len());
    }

    #[test]
    fn test_fuse_finds_duplicate() {
        let mut map = Map::new();
        let points = scene();
        let kf = keyframe_seeing(&mut map, &points);
        let original = map.get_keyframe(kf).unwrap().get_map_point(2).unwrap();

        // A second point at the same place with the same descriptor.
        let dup = map.create_map_point(points[2], desc(2), kf);
        let kf_ref = map.get_keyframe(kf).unwrap();
        let actions = fuse_candidates(
            kf_ref,
            &CameraPose::from_twc(&kf_ref.pose),
            &[dup],
            &map,
            &camera(),
            3.0,
        );
        assert_eq!(
            actions,
            vec![FuseAction::Merge {
                existing: original,
                candidate: dup
            }]
        );
    }

    #[test]
    fn test_fundamental_satisfies_epipolar_constraint() {
        let mut map = Map::new();
        let points = scene();
        let a = keyframe_seeing(&mut map, &points);
        let b = keyframe_seeing(&mut map, &points);
        map.get_keyframe_mut(b).unwrap().pose =
            SE3::from_rt(Matrix3::identity(), Vector3::new(0.3, 0.05, 0.0));

        let cam = camera();
        let (ka, kb) = (map.get_keyframe(a).unwrap(), map.get_keyframe(b).unwrap());
        let f = fundamental_between(ka, kb, &cam);
        let p = Vector3::new(0.2, -0.1, 5.0);
        let pa = cam.project(&ka.pose_cw().transform_point(&p)).unwrap();
        let pb = cam.project(&kb.pose_cw().transform_point(&p)).unwrap();
        let residual = Vector3::new(pa.x, pa.y, 1.0).dot(&(f * Vector3::new(pb.x, pb.y, 1.0)));
        assert!(residual.abs() < 1e-9);
    }
}
