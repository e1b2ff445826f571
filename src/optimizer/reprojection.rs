//! Reprojection residuals and the sparse Schur-complement solver shared by
//! local and global bundle adjustment.
//!
//! Poses are `T_cw` and are updated by left multiplication:
//! `T_new = exp(δ) * T_old` with `δ = [ω, v]`. Residuals follow the
//! convention `e = observed - projected`, so the Gauss-Newton system is
//! `(Jᵀ W J) δ = -Jᵀ W e`.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x6, Matrix6, Matrix6x3, Vector2, Vector3, Vector6};

use crate::geometry::{skew, SE3};
use crate::tracking::frame::{level_sigma2, CameraModel, KeyPoint};

/// Chi-square at 95% for 2 DoF (monocular pixel residual).
pub const CHI2_MONO: f64 = 5.991;
/// Chi-square at 95% for 3 DoF (left pixel plus right u).
pub const CHI2_STEREO: f64 = 7.815;

/// Points closer than this (camera z) are treated as behind the camera.
const MIN_DEPTH: f64 = 1e-6;

/// One keypoint measurement. Stereo and RGB-D measurements carry the right
/// image u coordinate synthesized from depth.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub uv: Vector2<f64>,
    pub u_right: Option<f64>,
    pub inv_sigma2: f64,
}

impl Measurement {
    pub fn new(kp: &KeyPoint, point_cam: Option<&Vector3<f64>>, camera: &CameraModel) -> Self {
        let u_right = point_cam
            .filter(|p| p.z > MIN_DEPTH && camera.bf > 0.0)
            .map(|p| kp.x - camera.bf / p.z);
        Self {
            uv: Vector2::new(kp.x, kp.y),
            u_right,
            inv_sigma2: 1.0 / level_sigma2(kp.octave),
        }
    }

    pub fn chi2_threshold(&self) -> f64 {
        if self.u_right.is_some() {
            CHI2_STEREO
        } else {
            CHI2_MONO
        }
    }
}

/// `observed - projected` for a camera-frame point. The third row is zero
/// for monocular measurements. `None` behind the camera.
pub fn residual_cam(p_cam: &Vector3<f64>, m: &Measurement, camera: &CameraModel) -> Option<Vector3<f64>> {
    if p_cam.z <= MIN_DEPTH {
        return None;
    }
    let inv_z = 1.0 / p_cam.z;
    let u = camera.fx * p_cam.x * inv_z + camera.cx;
    let v = camera.fy * p_cam.y * inv_z + camera.cy;
    let er = m.u_right.map_or(0.0, |ur| ur - (u - camera.bf * inv_z));
    Some(Vector3::new(m.uv.x - u, m.uv.y - v, er))
}

/// Weighted squared error of one measurement. `None` behind the camera.
pub fn chi2(pose_cw: &SE3, point: &Vector3<f64>, m: &Measurement, camera: &CameraModel) -> Option<f64> {
    let p_cam = pose_cw.transform_point(point);
    residual_cam(&p_cam, m, camera).map(|e| m.inv_sigma2 * e.norm_squared())
}

/// Jacobians of the residual with respect to the pose update `[ω, v]` and
/// the world point.
pub fn jacobians(
    p_cam: &Vector3<f64>,
    r_cw: &Matrix3<f64>,
    m: &Measurement,
    camera: &CameraModel,
) -> (Matrix3x6<f64>, Matrix3<f64>) {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    let inv_z = 1.0 / z;
    let inv_z2 = inv_z * inv_z;

    // d(projection)/d(p_cam)
    let mut j_proj = Matrix3::new(
        camera.fx * inv_z, 0.0, -camera.fx * x * inv_z2,
        0.0, camera.fy * inv_z, -camera.fy * y * inv_z2,
        camera.fx * inv_z, 0.0, -camera.fx * x * inv_z2 + camera.bf * inv_z2,
    );
    if m.u_right.is_none() {
        j_proj.row_mut(2).fill(0.0);
    }

    // d(p_cam)/d[ω, v] = [-[p_cam]x | I]
    let mut d_pcam = Matrix3x6::zeros();
    d_pcam.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(p_cam)));
    d_pcam.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());

    let j_pose = -(j_proj * d_pcam);
    let j_point = -(j_proj * r_cw);
    (j_pose, j_point)
}

pub fn huber_weight(chi2: f64, threshold: f64) -> f64 {
    if chi2 <= threshold {
        1.0
    } else {
        (threshold / chi2).sqrt()
    }
}

pub fn huber_cost(chi2: f64, threshold: f64) -> f64 {
    if chi2 <= threshold {
        chi2
    } else {
        2.0 * (threshold * chi2).sqrt() - threshold
    }
}

/// Apply a 6-vector update `[ω, v]` to a `T_cw` pose.
pub fn apply_update(pose_cw: &SE3, delta: &Vector6<f64>) -> SE3 {
    let omega = Vector3::new(delta[0], delta[1], delta[2]);
    let v = Vector3::new(delta[3], delta[4], delta[5]);
    pose_cw.left_update(&omega, &v)
}

// ─────────────────────────────────────────────────────────────────────────────
// Bundle adjustment problem
// ─────────────────────────────────────────────────────────────────────────────

/// An observation of `point` from `pose` (indices into the problem).
#[derive(Debug, Clone)]
pub struct BundleEdge {
    pub pose: usize,
    pub point: usize,
    pub measurement: Measurement,
    /// Inactive edges (flagged outliers) do not contribute.
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BundleProblem {
    pub poses_cw: Vec<SE3>,
    pub pose_fixed: Vec<bool>,
    pub points: Vec<Vector3<f64>>,
    pub edges: Vec<BundleEdge>,
}

/// Outcome of [`BundleProblem::optimize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BundleStats {
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

impl BundleProblem {
    pub fn edge_chi2(&self, edge: &BundleEdge, camera: &CameraModel) -> Option<f64> {
        chi2(&self.poses_cw[edge.pose], &self.points[edge.point], &edge.measurement, camera)
    }

    /// Total (robust) cost over the active edges. Points behind the camera
    /// count as one threshold-sized error each.
    pub fn cost(&self, camera: &CameraModel, robust: bool) -> f64 {
        self.edges
            .iter()
            .filter(|e| e.active)
            .map(|e| {
                let th = e.measurement.chi2_threshold();
                match self.edge_chi2(e, camera) {
                    Some(c) if robust => huber_cost(c, th),
                    Some(c) => c,
                    None => th,
                }
            })
            .sum()
    }

    /// Deactivate edges above their chi-square threshold or behind the
    /// camera. Returns how many edges are now inactive.
    pub fn flag_outliers(&mut self, camera: &CameraModel) -> usize {
        let mut outliers = 0;
        for i in 0..self.edges.len() {
            let edge = &self.edges[i];
            let bad = match self.edge_chi2(edge, camera) {
                Some(c) => c > edge.measurement.chi2_threshold(),
                None => true,
            };
            self.edges[i].active = !bad;
            outliers += usize::from(bad);
        }
        outliers
    }

    /// Levenberg-Marquardt over all non-fixed poses and all points, with the
    /// point blocks eliminated by the Schur complement.
    pub fn optimize(
        &mut self,
        camera: &CameraModel,
        max_iterations: usize,
        robust: bool,
        should_stop: &dyn Fn() -> bool,
    ) -> BundleStats {
        let initial_error = self.cost(camera, robust);
        let mut stats = BundleStats {
            iterations: 0,
            initial_error,
            final_error: initial_error,
        };

        // Block column of every optimized pose.
        let mut pose_col: Vec<Option<usize>> = vec![None; self.poses_cw.len()];
        let mut n_free = 0;
        for (i, fixed) in self.pose_fixed.iter().enumerate() {
            if !fixed {
                pose_col[i] = Some(n_free);
                n_free += 1;
            }
        }

        let mut lambda = 1e-4;
        let mut current_error = initial_error;

        for iter in 0..max_iterations {
            if should_stop() {
                break;
            }
            stats.iterations = iter + 1;

            let system = self.build_system(camera, robust, &pose_col, n_free);
            let Some((delta_p, delta_l)) = system.solve(lambda) else {
                lambda *= 10.0;
                continue;
            };

            let backup_poses = self.poses_cw.clone();
            let backup_points = self.points.clone();

            for (i, col) in pose_col.iter().enumerate() {
                if let Some(c) = col {
                    let d: Vector6<f64> = delta_p.fixed_rows::<6>(c * 6).into_owned();
                    self.poses_cw[i] = apply_update(&self.poses_cw[i], &d);
                }
            }
            for (i, d) in delta_l {
                self.points[i] += d;
            }

            let new_error = self.cost(camera, robust);
            if new_error < current_error {
                let relative = (current_error - new_error) / current_error.max(1e-12);
                current_error = new_error;
                lambda = (lambda * 0.1).max(1e-12);
                if relative < 1e-6 {
                    break;
                }
            } else {
                self.poses_cw = backup_poses;
                self.points = backup_points;
                lambda *= 10.0;
                if lambda > 1e8 {
                    break;
                }
            }
        }

        stats.final_error = current_error;
        stats
    }

    fn build_system(
        &self,
        camera: &CameraModel,
        robust: bool,
        pose_col: &[Option<usize>],
        n_free: usize,
    ) -> NormalEquations {
        let mut eq = NormalEquations {
            h_pp: DMatrix::zeros(n_free * 6, n_free * 6),
            b_p: DVector::zeros(n_free * 6),
            points: HashMap::new(),
        };

        let rotations: Vec<Matrix3<f64>> = self.poses_cw.iter().map(SE3::rotation_matrix).collect();

        for edge in self.edges.iter().filter(|e| e.active) {
            let pose = &self.poses_cw[edge.pose];
            let p_cam = pose.transform_point(&self.points[edge.point]);
            let Some(e) = residual_cam(&p_cam, &edge.measurement, camera) else {
                continue;
            };
            let m = &edge.measurement;
            let chi2 = m.inv_sigma2 * e.norm_squared();
            let robust_weight = if robust {
                huber_weight(chi2, m.chi2_threshold())
            } else {
                1.0
            };
            let w = robust_weight * m.inv_sigma2;

            let (j_pose, j_point) = jacobians(&p_cam, &rotations[edge.pose], m, camera);

            let block = eq.points.entry(edge.point).or_insert_with(PointBlock::new);
            block.h_ll += j_point.transpose() * j_point * w;
            block.b_l -= j_point.transpose() * e * w;

            if let Some(c) = pose_col[edge.pose] {
                let h = j_pose.transpose() * j_pose * w;
                let mut view = eq.h_pp.fixed_view_mut::<6, 6>(c * 6, c * 6);
                view += h;
                let b = j_pose.transpose() * e * w;
                let mut bv = eq.b_p.fixed_rows_mut::<6>(c * 6);
                bv -= b;

                let h_pl = j_pose.transpose() * j_point * w;
                match block.h_pl.iter_mut().find(|(col, _)| *col == c) {
                    Some((_, existing)) => *existing += h_pl,
                    None => block.h_pl.push((c, h_pl)),
                }
            }
        }

        eq
    }
}

/// Per-point blocks of the normal equations.
struct PointBlock {
    h_ll: Matrix3<f64>,
    b_l: Vector3<f64>,
    /// (pose block column, H_pl block)
    h_pl: Vec<(usize, Matrix6x3<f64>)>,
}

impl PointBlock {
    fn new() -> Self {
        Self {
            h_ll: Matrix3::zeros(),
            b_l: Vector3::zeros(),
            h_pl: Vec::new(),
        }
    }
}

struct NormalEquations {
    h_pp: DMatrix<f64>,
    b_p: DVector<f64>,
    points: HashMap<usize, PointBlock>,
}

impl NormalEquations {
    /// Solve the damped system. Returns the pose update and the per-point
    /// updates.
    fn solve(&self, lambda: f64) -> Option<(DVector<f64>, Vec<(usize, Vector3<f64>)>)> {
        let n = self.b_p.len();
        let mut schur = self.h_pp.clone();
        for i in 0..n {
            schur[(i, i)] += lambda * schur[(i, i)] + 1e-9;
        }
        let mut rhs = self.b_p.clone();

        let mut inverses: Vec<(usize, Matrix3<f64>)> = Vec::with_capacity(self.points.len());
        for (&idx, block) in &self.points {
            let mut h_ll = block.h_ll;
            for i in 0..3 {
                h_ll[(i, i)] += lambda * h_ll[(i, i)] + 1e-9;
            }
            let Some(h_ll_inv) = h_ll.try_inverse() else {
                continue;
            };
            for (cj, wj) in &block.h_pl {
                let wj_hinv: Matrix6x3<f64> = wj * h_ll_inv;
                let mut r = rhs.fixed_rows_mut::<6>(cj * 6);
                r -= wj_hinv * block.b_l;
                for (ck, wk) in &block.h_pl {
                    let s: Matrix6<f64> = wj_hinv * wk.transpose();
                    let mut view = schur.fixed_view_mut::<6, 6>(cj * 6, ck * 6);
                    view -= s;
                }
            }
            inverses.push((idx, h_ll_inv));
        }

        let delta_p = if n == 0 {
            DVector::zeros(0)
        } else {
            match schur.clone().cholesky() {
                Some(chol) => chol.solve(&rhs),
                None => schur.lu().solve(&rhs)?,
            }
        };
        if delta_p.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let mut delta_l = Vec::with_capacity(inverses.len());
        for (idx, h_ll_inv) in inverses {
            let block = &self.points[&idx];
            let mut r = block.b_l;
            for (c, w) in &block.h_pl {
                let dp: Vector6<f64> = delta_p.fixed_rows::<6>(c * 6).into_owned();
                r -= w.transpose() * dp;
            }
            let d = h_ll_inv * r;
            if d.iter().all(|v| v.is_finite()) {
                delta_l.push((idx, d));
            }
        }

        Some((delta_p, delta_l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640.0, 480.0, 40.0)
    }

    fn measurement(pose_cw: &SE3, p: &Vector3<f64>, stereo: bool, cam: &CameraModel) -> Measurement {
        let pc = pose_cw.transform_point(p);
        let uv = cam.project(&pc).unwrap();
        let kp = KeyPoint::new(uv.x, uv.y, 0);
        Measurement::new(&kp, stereo.then_some(&pc), cam)
    }

    #[test]
    fn test_jacobians_match_numeric() {
        let cam = camera();
        let pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.2, 0.05),
            translation: Vector3::new(0.2, -0.1, 0.5),
        };
        let point = Vector3::new(0.5, 0.3, 4.0);
        let mut m = measurement(&pose, &point, true, &cam);
        m.uv += Vector2::new(1.5, -0.7);

        let p_cam = pose.transform_point(&point);
        let (j_pose, j_point) = jacobians(&p_cam, &pose.rotation_matrix(), &m, &cam);
        let e0 = residual_cam(&p_cam, &m, &cam).unwrap();

        let eps = 1e-6;
        for k in 0..6 {
            let mut d = Vector6::zeros();
            d[k] = eps;
            let moved = apply_update(&pose, &d);
            let e1 = residual_cam(&moved.transform_point(&point), &m, &cam).unwrap();
            let numeric = (e1 - e0) / eps;
            assert_relative_eq!(numeric, j_pose.column(k).into_owned(), epsilon = 1e-3);
        }
        for k in 0..3 {
            let mut p = point;
            p[k] += eps;
            let e1 = residual_cam(&pose.transform_point(&p), &m, &cam).unwrap();
            let numeric = (e1 - e0) / eps;
            assert_relative_eq!(numeric, j_point.column(k).into_owned(), epsilon = 1e-3);
        }
    }

    #[test]
    fn test_bundle_recovers_perturbed_pose_and_points() {
        let cam = camera();
        let poses = vec![
            SE3::identity(),
            SE3 {
                rotation: UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
                translation: Vector3::new(-0.3, 0.0, 0.0),
            },
        ];
        let truth: Vec<Vector3<f64>> = (0..40)
            .map(|i| {
                let f = i as f64;
                Vector3::new((f * 0.37).sin() * 1.5, (f * 0.91).cos(), 4.0 + (f * 0.13).sin())
            })
            .collect();

        let mut problem = BundleProblem {
            poses_cw: poses.clone(),
            pose_fixed: vec![true, false],
            points: truth.iter().map(|p| p + Vector3::new(0.02, -0.03, 0.05)).collect(),
            edges: Vec::new(),
        };
        for (pi, pose) in poses.iter().enumerate() {
            for (i, p) in truth.iter().enumerate() {
                problem.edges.push(BundleEdge {
                    pose: pi,
                    point: i,
                    measurement: measurement(pose, p, true, &cam),
                    active: true,
                });
            }
        }
        problem.poses_cw[1].translation += Vector3::new(0.03, 0.02, -0.02);

        let stats = problem.optimize(&cam, 20, true, &|| false);
        assert!(stats.final_error < stats.initial_error * 1e-3);
        assert_relative_eq!(problem.poses_cw[1].translation, poses[1].translation, epsilon = 1e-3);
        assert_eq!(problem.flag_outliers(&cam), 0);
    }

    #[test]
    fn test_huber_is_quadratic_below_threshold() {
        assert_eq!(huber_weight(1.0, CHI2_MONO), 1.0);
        assert!(huber_weight(100.0, CHI2_MONO) < 1.0);
        assert_relative_eq!(huber_cost(2.0, CHI2_MONO), 2.0);
        assert!(huber_cost(100.0, CHI2_MONO) < 100.0);
    }
}
