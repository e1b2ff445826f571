//! Pinhole camera with radial-tangential distortion.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Intrinsics of the (left) camera.
///
/// `bf` is the stereo baseline times `fx`; it is also used for RGB-D, where
/// a virtual right coordinate `u_r = u - bf / z` is synthesized from depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub width: f64,
    pub height: f64,
    pub bf: f64,
}

/// Gauss-Newton steps used to invert the distortion model.
const UNDISTORT_ITERATIONS: usize = 10;

impl CameraModel {
    /// Distortion-free camera, mostly used by tests and synthetic data.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: f64, height: f64, bf: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            width,
            height,
            bf,
        }
    }

    /// Stereo baseline in meters.
    pub fn baseline(&self) -> f64 {
        self.bf / self.fx
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0
    }

    /// Project a camera-frame point. `None` behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some(Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Right-image u coordinate of a camera-frame point.
    pub fn project_right_u(&self, p_cam: &Vector3<f64>) -> f64 {
        self.fx * p_cam.x / p_cam.z + self.cx - self.bf / p_cam.z
    }

    /// Back-project a pixel at the given depth.
    pub fn unproject(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }

    /// Normalized image coordinates `K^-1 [u v 1]`.
    pub fn normalize(&self, u: f64, v: f64) -> Vector2<f64> {
        Vector2::new((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && u < self.width && v >= 0.0 && v < self.height
    }

    /// Remove lens distortion from a pixel measurement.
    pub fn undistort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }
        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (x * self.fx + self.cx, y * self.fy + self.cy)
    }

    /// Apply lens distortion to an ideal pixel.
    pub fn distort_point(&self, u: f64, v: f64) -> (f64, f64) {
        let x = (u - self.cx) / self.fx;
        let y = (v - self.cy) / self.fy;
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd * self.fx + self.cx, yd * self.fy + self.cy)
    }
}
