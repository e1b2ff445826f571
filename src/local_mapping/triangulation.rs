//! New map points from keyframe pairs.
//!
//! For the current keyframe and each of its best covisible neighbors:
//! 1. Pair unmatched features sharing a vocabulary node under the epipolar
//!    constraint
//! 2. Triangulate with DLT, or take a stereo/RGB-D depth when its parallax
//!    is larger than the rays'
//! 3. Validate depth, reprojection error and scale consistency

use nalgebra::{Vector2, Vector3};
use tracing::debug;

use crate::geometry::{triangulate_dlt, SE3};
use crate::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::optimizer::{CHI2_MONO, CHI2_STEREO};
use crate::tracking::frame::{level_scale, level_sigma2, CameraModel, SCALE_FACTOR};
use crate::tracking::matching::search_for_triangulation;

/// Configuration for multi-frame triangulation.
#[derive(Debug, Clone)]
pub struct TriangulationConfig {
    /// Number of neighbor keyframes to consider.
    pub num_neighbors: usize,
    /// Monocular pairs need a baseline of at least this fraction of the
    /// neighbor's median depth.
    pub min_baseline_ratio: f64,
    /// Rays more parallel than this (cosine) are not triangulated without
    /// depth.
    pub max_parallax_cos: f64,
    /// Allowed ratio between the distance ratio and the octave ratio.
    pub scale_ratio_factor: f64,
    pub monocular: bool,
}

impl TriangulationConfig {
    pub fn new(num_neighbors: usize, monocular: bool) -> Self {
        Self {
            num_neighbors,
            min_baseline_ratio: 0.01,
            max_parallax_cos: 0.9998,
            scale_ratio_factor: 1.5 * SCALE_FACTOR,
            monocular,
        }
    }
}

/// Result of multi-frame triangulation.
#[derive(Debug, Default)]
pub struct TriangulationResult {
    pub num_pairs_checked: usize,
    pub num_matches_found: usize,
    /// Points created, in creation order.
    pub new_points: Vec<MapPointId>,
}

/// One side of a candidate match.
struct View<'a> {
    kf: &'a KeyFrame,
    pose_cw: SE3,
    idx: usize,
}

impl View<'_> {
    fn pixel(&self) -> Vector2<f64> {
        let kp = &self.kf.keypoints[self.idx];
        Vector2::new(kp.x, kp.y)
    }

    fn octave(&self) -> i32 {
        self.kf.keypoints[self.idx].octave
    }

    fn depth_point(&self) -> Option<Vector3<f64>> {
        self.kf.points_cam.get(self.idx).copied().flatten()
    }

    /// Parallax cosine of the stereo pair itself, or > 1 without depth.
    fn stereo_parallax_cos(&self, camera: &CameraModel) -> f64 {
        match self.depth_point() {
            Some(p) if p.z > 0.0 => (2.0 * (camera.baseline() / 2.0).atan2(p.z)).cos(),
            _ => 1.1,
        }
    }

    /// Chi-square reprojection test; stereo views are also checked in the
    /// right image.
    fn reprojects(&self, p_world: &Vector3<f64>, camera: &CameraModel) -> Option<f64> {
        let p_cam = self.pose_cw.transform_point(p_world);
        if p_cam.z <= 0.0 {
            return None;
        }
        let uv = camera.project(&p_cam)?;
        let observed = self.pixel();
        let sigma2 = level_sigma2(self.octave());
        let mut err2 = (uv - observed).norm_squared();
        let threshold = match self.depth_point() {
            Some(depth) if depth.z > 0.0 => {
                let observed_right = observed.x - camera.bf / depth.z;
                let e = camera.project_right_u(&p_cam) - observed_right;
                err2 += e * e;
                CHI2_STEREO
            }
            _ => CHI2_MONO,
        };
        (err2 <= threshold * sigma2).then(|| (p_world - self.kf.camera_center()).norm())
    }
}

/// Triangulate new map points between `current_kf_id` and its neighbors.
pub fn create_new_map_points(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &TriangulationConfig,
) -> TriangulationResult {
    let mut result = TriangulationResult::default();
    let neighbors = match map.get_keyframe(current_kf_id) {
        Some(kf) => kf.get_best_covisibles(config.num_neighbors),
        None => return result,
    };

    for neighbor_id in neighbors {
        let candidates = {
            let (Some(kf1), Some(kf2)) = (map.get_keyframe(current_kf_id), map.get_keyframe(neighbor_id)) else {
                continue;
            };
            if kf2.is_bad || !baseline_sufficient(map, kf1, kf2, camera, config) {
                continue;
            }
            result.num_pairs_checked += 1;

            let matches = search_for_triangulation(kf1, kf2, camera);
            result.num_matches_found += matches.len();
            let pose1_cw = kf1.pose_cw();
            let pose2_cw = kf2.pose_cw();

            matches
                .into_iter()
                .filter_map(|(i1, i2)| {
                    let v1 = View { kf: kf1, pose_cw: pose1_cw.clone(), idx: i1 };
                    let v2 = View { kf: kf2, pose_cw: pose2_cw.clone(), idx: i2 };
                    triangulate_pair(&v1, &v2, camera, config).map(|p| (i1, i2, p, kf1.descriptors[i1]))
                })
                .collect::<Vec<_>>()
        };

        for (i1, i2, position, descriptor) in candidates {
            let mp_id = map.create_map_point(position, descriptor, current_kf_id);
            map.associate(current_kf_id, i1, mp_id);
            map.associate(neighbor_id, i2, mp_id);
            map.compute_distinctive_descriptor(mp_id);
            map.update_map_point_normal_and_depth(mp_id);
            result.new_points.push(mp_id);
        }
    }

    if !result.new_points.is_empty() {
        debug!(
            "[Triangulation] {}: {} new points (pairs={}, matches={})",
            current_kf_id,
            result.new_points.len(),
            result.num_pairs_checked,
            result.num_matches_found
        );
    }
    result
}

fn baseline_sufficient(
    map: &Map,
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    camera: &CameraModel,
    config: &TriangulationConfig,
) -> bool {
    let baseline = (kf2.camera_center() - kf1.camera_center()).norm();
    if !config.monocular {
        return baseline >= camera.baseline();
    }
    match map.median_scene_depth(kf2.id) {
        Some(median) if median > 0.0 => baseline / median >= config.min_baseline_ratio,
        _ => false,
    }
}

fn triangulate_pair(v1: &View, v2: &View, camera: &CameraModel, config: &TriangulationConfig) -> Option<Vector3<f64>> {
    let xn1 = camera.normalize(v1.pixel().x, v1.pixel().y);
    let xn2 = camera.normalize(v2.pixel().x, v2.pixel().y);
    let ray1 = v1.kf.pose.rotation_matrix() * Vector3::new(xn1.x, xn1.y, 1.0);
    let ray2 = v2.kf.pose.rotation_matrix() * Vector3::new(xn2.x, xn2.y, 1.0);
    let cos_rays = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());

    let cos_stereo1 = v1.stereo_parallax_cos(camera);
    let cos_stereo2 = v2.stereo_parallax_cos(camera);
    let cos_stereo = cos_stereo1.min(cos_stereo2);
    let has_depth = v1.depth_point().is_some() || v2.depth_point().is_some();

    let position = if cos_rays < cos_stereo && cos_rays > 0.0 && (has_depth || cos_rays < config.max_parallax_cos) {
        triangulate_dlt(&v1.pose_cw, &v2.pose_cw, &xn1, &xn2)?
    } else if cos_stereo1 < cos_stereo2 {
        v1.kf.pose.transform_point(&v1.depth_point()?)
    } else if cos_stereo2 < cos_stereo1 {
        v2.kf.pose.transform_point(&v2.depth_point()?)
    } else {
        return None;
    };

    let dist1 = v1.reprojects(&position, camera)?;
    let dist2 = v2.reprojects(&position, camera)?;
    if dist1 <= 0.0 || dist2 <= 0.0 {
        return None;
    }

    let ratio_dist = dist2 / dist1;
    let ratio_octave = level_scale(v1.octave()) / level_scale(v2.octave());
    if ratio_dist * config.scale_ratio_factor < ratio_octave || ratio_dist > ratio_octave * config.scale_ratio_factor {
        return None;
    }
    Some(position)
}
