//! PnP (Perspective-n-Point) with RANSAC over a linear DLT solver.
//!
//! Used by relocalization: 3D map points matched by BoW against a candidate
//! keyframe are fed here to get an initial `T_cw`, which the tracker then
//! refines with the pose-only optimizer.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;

use super::so3::nearest_rotation;
use super::{smallest_eigenvector, SE3};
use crate::tracking::frame::CameraModel;

/// Minimal sample size of the linear solver.
const DLT_SAMPLE_SIZE: usize = 6;

#[derive(Debug, Clone)]
pub struct PnPConfig {
    pub max_iterations: usize,
    /// Inlier threshold on the reprojection error in pixels.
    pub reprojection_threshold: f64,
    pub min_inliers: usize,
    pub probability: f64,
}

impl Default for PnPConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            reprojection_threshold: 5.991f64.sqrt(),
            min_inliers: 10,
            probability: 0.99,
        }
    }
}

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated world-to-camera pose (T_cw).
    pub pose_cw: SE3,
    /// Inlier mask per correspondence.
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

/// Solve PnP with RANSAC given 3D world points and pixel observations.
///
/// Returns `None` when fewer than `config.min_inliers` agree on any model.
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    config: &PnPConfig,
    rng: &mut StdRng,
) -> Option<PnPResult> {
    let n = points3d.len();
    if n < DLT_SAMPLE_SIZE || n != points2d.len() || n < config.min_inliers {
        return None;
    }

    let normalized: Vec<Vector2<f64>> = points2d
        .iter()
        .map(|p| camera.normalize(p.x, p.y))
        .collect();

    let mut best: Option<(SE3, Vec<bool>, usize)> = None;
    let mut max_iterations = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iterations {
        iteration += 1;

        let sample = rand::seq::index::sample(rng, n, DLT_SAMPLE_SIZE).into_vec();
        let sample_3d: Vec<Vector3<f64>> = sample.iter().map(|&i| points3d[i]).collect();
        let sample_2d: Vec<Vector2<f64>> = sample.iter().map(|&i| normalized[i]).collect();

        let Some(pose) = solve_dlt(&sample_3d, &sample_2d) else {
            continue;
        };

        let (mask, count) = find_inliers(&pose, points3d, points2d, camera, config);
        if count > best.as_ref().map_or(0, |b| b.2) {
            let ratio = count as f64 / n as f64;
            max_iterations = max_iterations.min(adaptive_iterations(
                ratio,
                config.probability,
                config.max_iterations,
            ));
            best = Some((pose, mask, count));
        }
    }

    let (pose, mask, count) = best?;
    if count < config.min_inliers {
        return None;
    }

    // Re-estimate from the whole consensus set.
    let (in_3d, in_2d): (Vec<_>, Vec<_>) = mask
        .iter()
        .enumerate()
        .filter(|(_, &inlier)| inlier)
        .map(|(i, _)| (points3d[i], normalized[i]))
        .unzip();

    if let Some(refined) = solve_dlt(&in_3d, &in_2d) {
        let (refined_mask, refined_count) = find_inliers(&refined, points3d, points2d, camera, config);
        if refined_count >= count {
            return Some(PnPResult {
                pose_cw: refined,
                inlier_mask: refined_mask,
                num_inliers: refined_count,
            });
        }
    }

    Some(PnPResult {
        pose_cw: pose,
        inlier_mask: mask,
        num_inliers: count,
    })
}

/// Linear pose from at least six correspondences in normalized coordinates.
///
/// Solves `x ~ P X` for the 3x4 matrix `P`, then projects its left block
/// onto SO(3) and divides out the scale.
pub fn solve_dlt(points3d: &[Vector3<f64>], normalized: &[Vector2<f64>]) -> Option<SE3> {
    let n = points3d.len();
    if n < DLT_SAMPLE_SIZE {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (p, x)) in points3d.iter().zip(normalized).enumerate() {
        let row0 = 2 * i;
        let row1 = row0 + 1;
        for k in 0..3 {
            a[(row0, k)] = p[k];
            a[(row1, 4 + k)] = p[k];
            a[(row0, 8 + k)] = -x.x * p[k];
            a[(row1, 8 + k)] = -x.y * p[k];
        }
        a[(row0, 3)] = 1.0;
        a[(row1, 7)] = 1.0;
        a[(row0, 11)] = -x.x;
        a[(row1, 11)] = -x.y;
    }

    let v = smallest_eigenvector(&a)?;
    let mut m = Matrix3::new(v[0], v[1], v[2], v[4], v[5], v[6], v[8], v[9], v[10]);
    let mut t = Vector3::new(v[3], v[7], v[11]);

    if m.determinant() < 0.0 {
        m = -m;
        t = -t;
    }

    let singular = m.singular_values();
    let scale = singular.mean();
    if scale < 1e-12 {
        return None;
    }
    let rotation = nearest_rotation(&m)?;
    let pose = SE3::from_rt(rotation, t / scale);

    // The sign fix above only guarantees a proper rotation; reject
    // solutions that place the sample behind the camera.
    let in_front = points3d
        .iter()
        .filter(|p| pose.transform_point(p).z > 0.0)
        .count();
    if in_front * 2 < n {
        return None;
    }
    Some(pose)
}

fn find_inliers(
    pose_cw: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    config: &PnPConfig,
) -> (Vec<bool>, usize) {
    let th2 = config.reprojection_threshold * config.reprojection_threshold;
    let mut count = 0;
    let mask = points3d
        .iter()
        .zip(points2d)
        .map(|(p, obs)| {
            let inlier = camera
                .project(&pose_cw.transform_point(p))
                .is_some_and(|uv| (uv - obs).norm_squared() < th2);
            if inlier {
                count += 1;
            }
            inlier
        })
        .collect();
    (mask, count)
}

/// RANSAC iterations needed to draw one all-inlier sample with `probability`.
fn adaptive_iterations(inlier_ratio: f64, probability: f64, max_iterations: usize) -> usize {
    if inlier_ratio >= 1.0 {
        return 1;
    }
    if inlier_ratio <= 0.0 {
        return max_iterations;
    }
    let p_good = inlier_ratio.powi(DLT_SAMPLE_SIZE as i32);
    if p_good < 1e-12 {
        return max_iterations;
    }
    let iterations = ((1.0 - probability).ln() / (1.0 - p_good).ln()).ceil();
    (iterations as usize).clamp(1, max_iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use nalgebra::{Unit, UnitQuaternion};

    fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640.0, 480.0, 50.0)
    }

    fn scene(rng: &mut StdRng, n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(4.0..8.0),
                )
            })
            .collect()
    }

    fn true_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &Unit::new_normalize(Vector3::new(0.1, 1.0, 0.0)),
                0.1,
            ),
            translation: Vector3::new(0.2, -0.1, 0.3),
        }
    }

    #[test]
    fn test_dlt_recovers_exact_pose() {
        let mut rng = StdRng::seed_from_u64(1);
        let points = scene(&mut rng, 12);
        let pose = true_pose();
        let normalized: Vec<_> = points
            .iter()
            .map(|p| {
                let pc = pose.transform_point(p);
                Vector2::new(pc.x / pc.z, pc.y / pc.z)
            })
            .collect();

        let est = solve_dlt(&points, &normalized).unwrap();
        assert_relative_eq!(est.translation, pose.translation, epsilon = 1e-6);
        assert_relative_eq!(est.rotation_matrix(), pose.rotation_matrix(), epsilon = 1e-6);
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let mut rng = StdRng::seed_from_u64(7);
        let cam = camera();
        let pose = true_pose();
        let points = scene(&mut rng, 80);
        let mut pixels: Vec<Vector2<f64>> = points
            .iter()
            .map(|p| cam.project(&pose.transform_point(p)).unwrap())
            .collect();
        for px in pixels.iter_mut().take(20) {
            px.x += rng.gen_range(30.0..80.0);
            px.y -= rng.gen_range(30.0..80.0);
        }

        let result =
            solve_pnp_ransac(&points, &pixels, &cam, &PnPConfig::default(), &mut rng).unwrap();

        assert_eq!(result.num_inliers, 60);
        assert!(result.inlier_mask.iter().take(20).all(|&m| !m));
        assert_relative_eq!(result.pose_cw.translation, pose.translation, epsilon = 1e-4);
    }

    #[test]
    fn test_too_few_points() {
        let mut rng = StdRng::seed_from_u64(3);
        let points = scene(&mut rng, 4);
        let pixels = vec![Vector2::new(320.0, 240.0); 4];
        assert!(
            solve_pnp_ransac(&points, &pixels, &camera(), &PnPConfig::default(), &mut rng)
                .is_none()
        );
    }
}
