//! Sim3 solver using Horn's method with RANSAC.
//!
//! Estimates `S12`, the similarity mapping points from the camera frame of
//! keyframe 2 into the camera frame of keyframe 1, from matched map points.
//! Hypotheses are scored by reprojection in both images. Scale is estimated
//! only for monocular maps; stereo and RGB-D fix it to 1.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;

use crate::geometry::Sim3;
use crate::tracking::frame::CameraModel;

/// Chi-squared bound (2 DoF, 99%) for a reprojection inlier.
const CHI2_INLIER: f64 = 9.210;

/// Configuration for Sim3 RANSAC solver.
#[derive(Debug, Clone)]
pub struct Sim3SolverConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Minimum number of inliers required.
    pub min_inliers: usize,
    /// Fix scale to 1.0 (stereo and RGB-D).
    pub fix_scale: bool,
    /// Probability of drawing at least one outlier-free sample.
    pub probability: f64,
}

impl Default for Sim3SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            min_inliers: 20,
            fix_scale: true,
            probability: 0.99,
        }
    }
}

impl Sim3SolverConfig {
    pub fn new(fix_scale: bool) -> Self {
        Self {
            fix_scale,
            ..Default::default()
        }
    }
}

/// One matched map point seen from both keyframes.
#[derive(Debug, Clone)]
pub struct Sim3Correspondence {
    /// Point in the camera frame of keyframe 1.
    pub p1: Vector3<f64>,
    /// Point in the camera frame of keyframe 2.
    pub p2: Vector3<f64>,
    /// Keypoint observing the point in keyframe 1.
    pub uv1: Vector2<f64>,
    /// Keypoint observing the point in keyframe 2.
    pub uv2: Vector2<f64>,
    /// Level variance of the keypoint in keyframe 1.
    pub sigma2_1: f64,
    /// Level variance of the keypoint in keyframe 2.
    pub sigma2_2: f64,
}

/// Result from Sim3 RANSAC solver.
#[derive(Debug, Clone)]
pub struct Sim3Result {
    /// Similarity from keyframe 2 camera to keyframe 1 camera.
    pub s12: Sim3,
    /// Per-correspondence inlier flags.
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

/// Estimate `S12` with RANSAC over minimal 3-point samples.
///
/// The best hypothesis is refit on all of its inliers; the refit is kept
/// only if it does not lose inliers.
pub fn solve_sim3_ransac(
    correspondences: &[Sim3Correspondence],
    camera: &CameraModel,
    config: &Sim3SolverConfig,
    rng: &mut StdRng,
) -> Option<Sim3Result> {
    let n = correspondences.len();
    if n < 3 || n < config.min_inliers {
        return None;
    }

    let mut best: Option<Sim3Result> = None;
    let mut max_iter = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iter {
        iteration += 1;
        let sample_idx = sample(rng, n, 3);
        let p1: Vec<Vector3<f64>> = sample_idx.iter().map(|i| correspondences[i].p1).collect();
        let p2: Vec<Vector3<f64>> = sample_idx.iter().map(|i| correspondences[i].p2).collect();

        let Some(s12) = compute_sim3_horn(&p2, &p1, config.fix_scale) else {
            continue;
        };
        let inlier_mask = check_inliers(correspondences, &s12, camera);
        let num_inliers = inlier_mask.iter().filter(|&&b| b).count();

        if best.as_ref().map_or(true, |b| num_inliers > b.num_inliers) {
            if num_inliers >= config.min_inliers {
                let ratio = num_inliers as f64 / n as f64;
                max_iter = max_iter.min(iteration + adaptive_iterations(ratio, config.probability, 3));
            }
            best = Some(Sim3Result {
                s12,
                inlier_mask,
                num_inliers,
            });
        }
    }

    let mut best = best.filter(|b| b.num_inliers >= config.min_inliers)?;
    if let Some(refined) = refine_sim3(correspondences, &best.inlier_mask, camera, config.fix_scale) {
        if refined.num_inliers >= best.num_inliers {
            best = refined;
        }
    }
    Some(best)
}

/// Refit `S12` on the flagged correspondences and rescore.
pub fn refine_sim3(
    correspondences: &[Sim3Correspondence],
    mask: &[bool],
    camera: &CameraModel,
    fix_scale: bool,
) -> Option<Sim3Result> {
    let (p1, p2): (Vec<_>, Vec<_>) = correspondences
        .iter()
        .zip(mask)
        .filter(|(_, &keep)| keep)
        .map(|(c, _)| (c.p1, c.p2))
        .unzip();
    let s12 = compute_sim3_horn(&p2, &p1, fix_scale)?;
    let inlier_mask = check_inliers(correspondences, &s12, camera);
    let num_inliers = inlier_mask.iter().filter(|&&b| b).count();
    Some(Sim3Result {
        s12,
        inlier_mask,
        num_inliers,
    })
}

/// A correspondence is an inlier when `S12 * p2` reprojects onto its
/// keypoint in image 1 and `S21 * p1` onto its keypoint in image 2.
fn check_inliers(correspondences: &[Sim3Correspondence], s12: &Sim3, camera: &CameraModel) -> Vec<bool> {
    let s21 = s12.inverse();
    correspondences
        .iter()
        .map(|c| {
            let err1 = camera
                .project(&s12.transform_point(&c.p2))
                .map(|uv| (uv - c.uv1).norm_squared());
            let err2 = camera
                .project(&s21.transform_point(&c.p1))
                .map(|uv| (uv - c.uv2).norm_squared());
            match (err1, err2) {
                (Some(e1), Some(e2)) => e1 < CHI2_INLIER * c.sigma2_1 && e2 < CHI2_INLIER * c.sigma2_2,
                _ => false,
            }
        })
        .collect()
}

/// Closed-form similarity `S` with `dst ≈ S * src`.
///
/// 1. Center both point sets on their centroids
/// 2. Rotation from the SVD of the cross-covariance matrix
/// 3. Scale (unless fixed) as the ratio of spreads: s = sqrt(Σ|d|² / Σ|s|²)
/// 4. Translation t = c_dst - s * R * c_src
///
/// Reference: B.K.P. Horn, "Closed-form solution of absolute orientation using unit quaternions"
pub fn compute_sim3_horn(src: &[Vector3<f64>], dst: &[Vector3<f64>], fix_scale: bool) -> Option<Sim3> {
    let n = src.len();
    if n < 3 || n != dst.len() {
        return None;
    }

    let c_src = src.iter().sum::<Vector3<f64>>() / n as f64;
    let c_dst = dst.iter().sum::<Vector3<f64>>() / n as f64;
    let src_c: Vec<_> = src.iter().map(|p| p - c_src).collect();
    let dst_c: Vec<_> = dst.iter().map(|p| p - c_dst).collect();

    let mut h = Matrix3::zeros();
    for (s, d) in src_c.iter().zip(&dst_c) {
        h += s * d.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation_mat = v_t.transpose() * u.transpose();
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        v.column_mut(2).neg_mut();
        rotation_mat = v * u.transpose();
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_mat));

    let scale = if fix_scale {
        1.0
    } else {
        let spread_src: f64 = src_c.iter().map(|p| p.norm_squared()).sum();
        let spread_dst: f64 = dst_c.iter().map(|p| p.norm_squared()).sum();
        if spread_src < 1e-10 {
            return None;
        }
        (spread_dst / spread_src).sqrt()
    };

    let translation = c_dst - scale * (rotation * c_src);
    Some(Sim3 {
        rotation,
        translation,
        scale,
    })
}

/// k = log(1 - p) / log(1 - w^n)
fn adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: i32) -> usize {
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let denom = (1.0 - inlier_ratio.powi(sample_size)).ln();
    if denom.abs() < 1e-10 {
        return usize::MAX;
    }
    (((1.0 - probability).ln() / denom).ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640.0, 480.0, 40.0)
    }

    fn cloud() -> Vec<Vector3<f64>> {
        (0..10)
            .map(|i| Vector3::new((i + 1) as f64, ((i + 1) * 2) as f64 % 7.0, ((i + 1) * 3) as f64 % 5.0))
            .collect()
    }

    #[test]
    fn test_horn_recovers_rotation_translation_and_scale() {
        let src = cloud();
        let truth = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.3, 0.7),
            translation: Vector3::new(0.5, -1.0, 2.0),
            scale: 2.5,
        };
        let dst: Vec<_> = src.iter().map(|p| truth.transform_point(p)).collect();

        let s = compute_sim3_horn(&src, &dst, false).unwrap();
        assert_relative_eq!(s.scale, 2.5, epsilon = 1e-9);
        for (p, q) in src.iter().zip(&dst) {
            assert_relative_eq!(s.transform_point(p), *q, epsilon = 1e-9);
        }

        let fixed = compute_sim3_horn(&src, &src, true).unwrap();
        assert_relative_eq!(fixed.scale, 1.0);
        assert_relative_eq!(fixed.translation.norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(7);
        let s12_truth = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            translation: Vector3::new(0.2, 0.0, 0.1),
            scale: 1.0,
        };

        let mut corrs = Vec::new();
        for i in 0..60 {
            let p1 = Vector3::new(rng.gen_range(-1.5..1.5), rng.gen_range(-1.0..1.0), rng.gen_range(3.0..6.0));
            let mut p2 = s12_truth.inverse().transform_point(&p1);
            let uv2 = cam.project(&p2).unwrap();
            if i % 6 == 0 {
                // Wrong association: the point sits elsewhere in frame 2.
                p2 += Vector3::new(0.8, -0.6, 0.4);
            }
            corrs.push(Sim3Correspondence {
                p1,
                p2,
                uv1: cam.project(&p1).unwrap(),
                uv2,
                sigma2_1: 1.0,
                sigma2_2: 1.0,
            });
        }

        let result = solve_sim3_ransac(&corrs, &cam, &Sim3SolverConfig::new(true), &mut rng).unwrap();
        assert_eq!(result.num_inliers, 50);
        for (i, inlier) in result.inlier_mask.iter().enumerate() {
            assert_eq!(*inlier, i % 6 != 0);
        }
        assert_relative_eq!(result.s12.translation, s12_truth.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_too_few_correspondences() {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(1);
        let c = Sim3Correspondence {
            p1: Vector3::new(0.0, 0.0, 4.0),
            p2: Vector3::new(0.0, 0.0, 4.0),
            uv1: Vector2::new(320.0, 240.0),
            uv2: Vector2::new(320.0, 240.0),
            sigma2_1: 1.0,
            sigma2_2: 1.0,
        };
        assert!(solve_sim3_ransac(&vec![c; 5], &cam, &Sim3SolverConfig::default(), &mut rng).is_none());
    }
}
