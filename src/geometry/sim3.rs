//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Loop correction and the essential-graph optimization move keyframes with
//! similarity transforms. Stereo and RGB-D maps keep the scale at 1.0; only
//! monocular maps let it drift.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::SE3;

/// Transforms points as `p' = s * R * p + t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    /// Rigid transform lifted to Sim3 with unit scale.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Rigid part of a similarity whose scale acts on the translation.
    ///
    /// A corrected `S_wc = [sR | t]` becomes the keyframe pose
    /// `T_wc = [R | t]`, which is how corrected monocular keyframes are
    /// written back (the map points carry the scale).
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation,
        }
    }

    /// Homogeneous matrix `[s*R | t; 0 0 0 1]`.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.scaled_rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// `S^-1 = [(1/s) R^T | -(1/s) R^T t]`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            translation: -(rot_inv * self.translation) * scale_inv,
            rotation: rot_inv,
            scale: scale_inv,
        }
    }

    /// `self ∘ other`: applies `other` first.
    pub fn compose(&self, other: &Sim3) -> Self {
        let mut rotation = self.rotation * other.rotation;
        rotation.renormalize();
        Self {
            rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn scaled_rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation_matrix() * self.scale
    }

    /// Tangent parameterization `[rotation_vec (3), translation (3), ln(scale)]`.
    ///
    /// This is not the true Sim3 logarithm; the pose-graph solver only needs a
    /// smooth local chart around each estimate, which `retract` provides.
    pub fn log(&self) -> [f64; 7] {
        let rot_vec = self.rotation.scaled_axis();
        [
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }

    pub fn exp(tangent: &[f64; 7]) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(
                tangent[0], tangent[1], tangent[2],
            )),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }

    /// Right-multiplicative update `self ∘ exp(delta)`.
    pub fn retract(&self, delta: &[f64; 7]) -> Self {
        self.compose(&Self::exp(delta))
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}
