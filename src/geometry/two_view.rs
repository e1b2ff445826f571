//! Two-view reconstruction for monocular map initialization.
//!
//! An essential matrix is fitted with an 8-point RANSAC on normalized image
//! coordinates, decomposed into its four `(R, t)` hypotheses, and the
//! hypothesis that triangulates the most points in front of both cameras wins.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;

use super::{smallest_eigenvector, SE3};
use crate::tracking::frame::CameraModel;

const EIGHT_POINT_SAMPLE: usize = 8;

/// Chi-square thresholds at 95% for 1 and 2 degrees of freedom.
const CHI2_1DOF: f64 = 3.841;
const CHI2_2DOF: f64 = 5.991;

#[derive(Debug, Clone)]
pub struct TwoViewConfig {
    pub max_iterations: usize,
    /// Measurement noise in pixels.
    pub sigma: f64,
    /// Minimum parallax (degrees) of the reconstruction.
    pub min_parallax_deg: f64,
    /// Minimum number of points triangulated by the winning hypothesis.
    pub min_triangulated: usize,
}

impl Default for TwoViewConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            sigma: 1.0,
            min_parallax_deg: 1.0,
            min_triangulated: 50,
        }
    }
}

/// Relative motion and structure recovered from two views.
#[derive(Debug, Clone)]
pub struct TwoViewResult {
    /// Pose of the second camera relative to the first (`T_c2c1`), with a
    /// unit-norm translation.
    pub pose_21: SE3,
    /// Triangulated point per correspondence, in the first camera's frame.
    pub points: Vec<Option<Vector3<f64>>>,
    pub num_triangulated: usize,
}

/// Reconstruct relative motion from matched pixel pairs.
pub fn reconstruct_two_view(
    pixels1: &[Vector2<f64>],
    pixels2: &[Vector2<f64>],
    camera: &CameraModel,
    config: &TwoViewConfig,
    rng: &mut StdRng,
) -> Option<TwoViewResult> {
    let n = pixels1.len();
    if n < EIGHT_POINT_SAMPLE || n != pixels2.len() {
        return None;
    }

    let x1: Vec<Vector2<f64>> = pixels1.iter().map(|p| camera.normalize(p.x, p.y)).collect();
    let x2: Vec<Vector2<f64>> = pixels2.iter().map(|p| camera.normalize(p.x, p.y)).collect();

    let focal = 0.5 * (camera.fx + camera.fy);
    let threshold = CHI2_1DOF * config.sigma * config.sigma / (focal * focal);

    let mut best: Option<(Matrix3<f64>, Vec<bool>, usize)> = None;
    for _ in 0..config.max_iterations {
        let sample = rand::seq::index::sample(rng, n, EIGHT_POINT_SAMPLE).into_vec();
        let s1: Vec<_> = sample.iter().map(|&i| x1[i]).collect();
        let s2: Vec<_> = sample.iter().map(|&i| x2[i]).collect();
        let Some(e) = estimate_essential(&s1, &s2) else {
            continue;
        };

        let mut count = 0;
        let mask: Vec<bool> = x1
            .iter()
            .zip(&x2)
            .map(|(a, b)| {
                let inlier = sampson_error(&e, a, b) < threshold;
                count += usize::from(inlier);
                inlier
            })
            .collect();

        if count > best.as_ref().map_or(0, |b| b.2) {
            best = Some((e, mask, count));
        }
    }

    let (e, mask, count) = best?;
    if count < config.min_triangulated {
        return None;
    }

    // Refit on the consensus set before decomposing.
    let (in1, in2): (Vec<_>, Vec<_>) = mask
        .iter()
        .enumerate()
        .filter(|(_, &m)| m)
        .map(|(i, _)| (x1[i], x2[i]))
        .unzip();
    let e = estimate_essential(&in1, &in2).unwrap_or(e);

    select_hypothesis(&e, &x1, &x2, &mask, count, camera, config)
}

/// Normalized 8-point algorithm for `x2ᵀ E x1 = 0`.
pub fn estimate_essential(x1: &[Vector2<f64>], x2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = x1.len();
    if n < EIGHT_POINT_SAMPLE {
        return None;
    }

    let (n1, t1) = hartley_normalize(x1)?;
    let (n2, t2) = hartley_normalize(x2)?;

    let mut a = DMatrix::<f64>::zeros(n, 9);
    for (i, (p, q)) in n1.iter().zip(&n2).enumerate() {
        let row = [
            q.x * p.x,
            q.x * p.y,
            q.x,
            q.y * p.x,
            q.y * p.y,
            q.y,
            p.x,
            p.y,
            1.0,
        ];
        for (j, v) in row.iter().enumerate() {
            a[(i, j)] = *v;
        }
    }

    let v = smallest_eigenvector(&a)?;
    let f = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);
    let e = t2.transpose() * f * t1;

    // Project onto the essential manifold: singular values (σ, σ, 0).
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let sigma = 0.5 * (svd.singular_values[0] + svd.singular_values[1]);
    let d = Matrix3::from_diagonal(&Vector3::new(sigma, sigma, 0.0));
    Some(u * d * v_t)
}

/// Squared Sampson distance of a correspondence, in normalized units.
pub fn sampson_error(e: &Matrix3<f64>, x1: &Vector2<f64>, x2: &Vector2<f64>) -> f64 {
    let p1 = x1.push(1.0);
    let p2 = x2.push(1.0);
    let ex1 = e * p1;
    let etx2 = e.transpose() * p2;
    let num = p2.dot(&ex1);
    let den = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if den < 1e-18 {
        return f64::MAX;
    }
    num * num / den
}

/// Linear triangulation from two world-to-camera poses and normalized
/// observations. Returns the world point, or `None` at infinity.
pub fn triangulate_dlt(
    pose1_cw: &SE3,
    pose2_cw: &SE3,
    x1: &Vector2<f64>,
    x2: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let p1 = pose1_cw.to_matrix();
    let p2 = pose2_cw.to_matrix();

    let mut a = DMatrix::<f64>::zeros(4, 4);
    for c in 0..4 {
        a[(0, c)] = x1.x * p1[(2, c)] - p1[(0, c)];
        a[(1, c)] = x1.y * p1[(2, c)] - p1[(1, c)];
        a[(2, c)] = x2.x * p2[(2, c)] - p2[(0, c)];
        a[(3, c)] = x2.y * p2[(2, c)] - p2[(1, c)];
    }

    let h = smallest_eigenvector(&a)?;
    if h[3].abs() < 1e-12 {
        return None;
    }
    let point = Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]);
    point.iter().all(|v| v.is_finite()).then_some(point)
}

fn hartley_normalize(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dev = points.iter().map(|p| (p - mean).abs()).fold(Vector2::zeros(), |a, d| a + d) / n;
    if mean_dev.x < 1e-12 || mean_dev.y < 1e-12 {
        return None;
    }
    let sx = 1.0 / mean_dev.x;
    let sy = 1.0 / mean_dev.y;
    let normalized = points
        .iter()
        .map(|p| Vector2::new((p.x - mean.x) * sx, (p.y - mean.y) * sy))
        .collect();
    let t = Matrix3::new(sx, 0.0, -mean.x * sx, 0.0, sy, -mean.y * sy, 0.0, 0.0, 1.0);
    Some((normalized, t))
}

struct HypothesisCheck {
    good: usize,
    points: Vec<Option<Vector3<f64>>>,
    parallax_deg: f64,
}

fn select_hypothesis(
    e: &Matrix3<f64>,
    x1: &[Vector2<f64>],
    x2: &[Vector2<f64>],
    mask: &[bool],
    num_inliers: usize,
    camera: &CameraModel,
    config: &TwoViewConfig,
) -> Option<TwoViewResult> {
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    let mut r1 = u * w * v_t;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * v_t;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }
    let t: Vector3<f64> = u.column(2).into_owned().normalize();

    let hypotheses = [
        SE3::from_rt(r1, t),
        SE3::from_rt(r1, -t),
        SE3::from_rt(r2, t),
        SE3::from_rt(r2, -t),
    ];

    let checks: Vec<HypothesisCheck> = hypotheses
        .iter()
        .map(|pose| check_hypothesis(pose, x1, x2, mask, camera, config))
        .collect();

    let (best_idx, best) = checks
        .iter()
        .enumerate()
        .max_by_key(|(_, c)| c.good)?;

    let min_good = ((0.9 * num_inliers as f64) as usize).max(config.min_triangulated);
    let similar = checks
        .iter()
        .filter(|c| c.good as f64 > 0.7 * best.good as f64)
        .count();

    if best.good < min_good || similar > 1 || best.parallax_deg < config.min_parallax_deg {
        return None;
    }

    Some(TwoViewResult {
        pose_21: hypotheses[best_idx].clone(),
        num_triangulated: best.good,
        points: best.points.clone(),
    })
}

fn check_hypothesis(
    pose_21: &SE3,
    x1: &[Vector2<f64>],
    x2: &[Vector2<f64>],
    mask: &[bool],
    camera: &CameraModel,
    config: &TwoViewConfig,
) -> HypothesisCheck {
    let identity = SE3::identity();
    let focal = 0.5 * (camera.fx + camera.fy);
    let th2 = 4.0 * CHI2_2DOF * config.sigma * config.sigma / (focal * focal);
    let center2 = pose_21.inverse().translation;

    let mut points = vec![None; x1.len()];
    let mut cos_parallaxes = Vec::new();
    let mut good = 0;

    for i in 0..x1.len() {
        if !mask[i] {
            continue;
        }
        let Some(p) = triangulate_dlt(&identity, pose_21, &x1[i], &x2[i]) else {
            continue;
        };

        let ray1 = p;
        let ray2 = p - center2;
        let cos_parallax = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());

        let p2 = pose_21.transform_point(&p);
        if (p.z <= 0.0 || p2.z <= 0.0) && cos_parallax < 0.99998 {
            continue;
        }

        let e1 = Vector2::new(p.x / p.z, p.y / p.z) - x1[i];
        let e2 = Vector2::new(p2.x / p2.z, p2.y / p2.z) - x2[i];
        if e1.norm_squared() > th2 || e2.norm_squared() > th2 {
            continue;
        }

        cos_parallaxes.push(cos_parallax);
        if cos_parallax < 0.99998 {
            good += 1;
            points[i] = Some(p);
        }
    }

    let parallax_deg = if cos_parallaxes.is_empty() {
        0.0
    } else {
        cos_parallaxes.sort_by(|a, b| a.total_cmp(b));
        let idx = 50.min(cos_parallaxes.len() - 1);
        cos_parallaxes[idx].clamp(-1.0, 1.0).acos().to_degrees()
    };

    HypothesisCheck {
        good,
        points,
        parallax_deg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use nalgebra::{Unit, UnitQuaternion};

    fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640.0, 480.0, 0.0)
    }

    fn setup(n: usize) -> (Vec<Vector3<f64>>, SE3) {
        let mut rng = StdRng::seed_from_u64(11);
        let points = (0..n)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(4.0..9.0),
                )
            })
            .collect();
        let pose_21 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &Unit::new_normalize(Vector3::new(0.0, 1.0, 0.1)),
                0.05,
            ),
            translation: Vector3::new(-0.5, 0.05, 0.02),
        };
        (points, pose_21)
    }

    #[test]
    fn test_essential_satisfies_epipolar_constraint() {
        let (points, pose) = setup(20);
        let x1: Vec<_> = points.iter().map(|p| Vector2::new(p.x / p.z, p.y / p.z)).collect();
        let x2: Vec<_> = points
            .iter()
            .map(|p| {
                let q = pose.transform_point(p);
                Vector2::new(q.x / q.z, q.y / q.z)
            })
            .collect();

        let e = estimate_essential(&x1, &x2).unwrap();
        for (a, b) in x1.iter().zip(&x2) {
            assert!(sampson_error(&e, a, b) < 1e-12);
        }
    }

    #[test]
    fn test_triangulate_dlt_exact() {
        let (_, pose) = setup(1);
        let p = Vector3::new(0.3, -0.2, 5.0);
        let q = pose.transform_point(&p);
        let x1 = Vector2::new(p.x / p.z, p.y / p.z);
        let x2 = Vector2::new(q.x / q.z, q.y / q.z);

        let est = triangulate_dlt(&SE3::identity(), &pose, &x1, &x2).unwrap();
        assert_relative_eq!(est, p, epsilon = 1e-8);
    }

    #[test]
    fn test_reconstruct_recovers_direction() {
        let (points, pose) = setup(200);
        let cam = camera();
        let px1: Vec<_> = points.iter().map(|p| cam.project(p).unwrap()).collect();
        let px2: Vec<_> = points
            .iter()
            .map(|p| cam.project(&pose.transform_point(p)).unwrap())
            .collect();
        let mut rng = StdRng::seed_from_u64(5);

        let result =
            reconstruct_two_view(&px1, &px2, &cam, &TwoViewConfig::default(), &mut rng).unwrap();

        let expected_dir = pose.translation.normalize();
        assert_relative_eq!(result.pose_21.translation, expected_dir, epsilon = 1e-5);
        assert_relative_eq!(
            result.pose_21.rotation_matrix(),
            pose.rotation_matrix(),
            epsilon = 1e-6
        );
        assert!(result.num_triangulated > 150);
    }
}
