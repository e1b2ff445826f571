//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Keyframe and frame poses are stored as `T_wc` (camera to world). The
//! optimizers work with `T_cw` and convert at the boundaries.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Rigid body transformation. Transforms points as `p' = R * p + t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from a rotation matrix and translation.
    ///
    /// The matrix is re-orthonormalized through the quaternion conversion.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation =
            UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a homogeneous 4x4 matrix `[R | t; 0 | 1]`.
    pub fn from_matrix(mat: &Matrix4<f64>) -> Self {
        let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(r, t)
    }

    /// Homogeneous 4x4 matrix `[R | t; 0 0 0 1]`.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            translation: -(rot_inv * self.translation),
            rotation: rot_inv,
        }
    }

    /// `self ∘ other`: applies `other` first, then `self`.
    ///
    /// The product quaternion is renormalized so `|q|` stays 1 along long
    /// composition chains such as the motion model.
    pub fn compose(&self, other: &SE3) -> Self {
        let mut rotation = self.rotation * other.rotation;
        rotation.renormalize();
        Self {
            rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Left-multiplicative update `exp(δ) * T` with `δ = [ω, v]`.
    ///
    /// Uses the first-order translation part, which is what the
    /// Gauss-Newton Jacobians in `optimizer` are linearized against.
    pub fn left_update(&self, omega: &Vector3<f64>, v: &Vector3<f64>) -> Self {
        let delta_rotation = UnitQuaternion::from_scaled_axis(*omega);
        let mut rotation = delta_rotation * self.rotation;
        rotation.renormalize();
        Self {
            rotation,
            translation: delta_rotation * self.translation + v,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.3, -1.0, 0.2)),
                0.7,
            ),
            translation: Vector3::new(1.0, -2.0, 0.5),
        }
    }

    #[test]
    fn test_inverse_compose_is_identity() {
        let pose = sample_pose();
        let composed = pose.compose(&pose.inverse());

        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(composed.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_roundtrip() {
        let pose = sample_pose();
        let back = SE3::from_matrix(&pose.to_matrix());

        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(
            back.rotation_matrix(),
            pose.rotation_matrix(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_transform_point_matches_matrix() {
        let pose = sample_pose();
        let p = Vector3::new(0.4, 1.5, -3.0);
        let via_matrix = pose.to_matrix() * p.push(1.0);

        assert_relative_eq!(pose.transform_point(&p), via_matrix.xyz(), epsilon = 1e-12);
    }

    #[test]
    fn test_long_composition_chain_stays_unit() {
        // Constant-velocity chain: the same pattern the motion model runs
        // every frame.
        let step = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.01, 0.13, -0.02),
            translation: Vector3::new(0.05, 0.0, 0.1),
        };
        let mut prev = SE3::identity();
        let mut pose = step.clone();
        for _ in 0..200 {
            let velocity = pose.inverse().compose(&prev);
            let next = velocity.compose(&pose.inverse()).inverse();
            prev = pose;
            pose = next;
            assert_relative_eq!(pose.rotation.quaternion().norm(), 1.0, epsilon = 1e-12);
        }

        let p = Vector3::new(1.0, -2.0, 5.0);
        let moved = pose.transform_point(&p) - pose.translation;
        assert_relative_eq!(moved.norm(), p.norm(), epsilon = 1e-9);
    }

    #[test]
    fn test_repeated_left_updates_stay_unit() {
        let mut pose = sample_pose();
        for k in 0..500 {
            let omega = Vector3::new(0.01, -0.02, 0.015) * (k as f64).sin();
            pose = pose.left_update(&omega, &Vector3::new(0.001, 0.0, -0.001));
        }
        assert_relative_eq!(pose.rotation.quaternion().norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_left_update_zero_is_noop() {
        let pose = sample_pose();
        let updated = pose.left_update(&Vector3::zeros(), &Vector3::zeros());
        assert_relative_eq!(updated.translation, pose.translation, epsilon = 1e-12);
    }
}
