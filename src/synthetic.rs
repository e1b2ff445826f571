//! Synthetic scenes and sequences for tests and the demo binary.
//!
//! A scene is a set of static landmarks, each with its own random ORB
//! descriptor. A sequence moves a pinhole camera through the scene and
//! produces the feature sets the tracking entry points take: monocular
//! keypoints, rectified stereo pairs and RGB-D depth readings. A matching
//! DBoW2 text vocabulary (one word per landmark) makes place recognition
//! behave as on real data.

use std::fmt::Write as _;

use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geometry::SE3;
use crate::tracking::frame::{CameraModel, Descriptor, FeatureSet, KeyPoint};

/// Settings matching [`SyntheticSequence::camera`], with thresholds scaled
/// to a few hundred landmarks and a fixed RANSAC seed.
pub const SETTINGS_YAML: &str = "\
camera:
  fx: 400.0
  fy: 400.0
  cx: 320.0
  cy: 240.0
  width: 640
  height: 480
  fps: 10.0
  bf: 40.0
  depth_map_factor: 1000.0
tracker:
  min_init_points: 100
  min_reloc_inliers: 30
  seed: 7
loop_closing:
  min_loop_matches: 30
";

/// Static landmarks with unique descriptors.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub points: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
}

impl SyntheticScene {
    /// Uniformly spread landmarks inside the axis-aligned box `[min, max]`.
    pub fn random_box(num_points: usize, min: Vector3<f64>, max: Vector3<f64>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let points = (0..num_points)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(min.x..max.x),
                    rng.gen_range(min.y..max.y),
                    rng.gen_range(min.z..max.z),
                )
            })
            .collect();
        let descriptors = (0..num_points).map(|_| rng.gen()).collect();
        Self { points, descriptors }
    }

    /// Landmarks on the inside wall of a vertical cylinder around the
    /// origin, for trajectories that turn in place or circle.
    pub fn cylinder(num_points: usize, radius: f64, height: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let points = (0..num_points)
            .map(|_| {
                let angle = rng.gen_range(0.0..std::f64::consts::TAU);
                let r = radius * rng.gen_range(0.9..1.1);
                Vector3::new(r * angle.cos(), rng.gen_range(-height..height) * 0.5, r * angle.sin())
            })
            .collect();
        let descriptors = (0..num_points).map(|_| rng.gen()).collect();
        Self { points, descriptors }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// DBoW2 text vocabulary with one leaf word per landmark descriptor.
    pub fn vocabulary_text(&self) -> String {
        let mut text = format!("{} 1 0 0\n", self.descriptors.len().max(1));
        for desc in &self.descriptors {
            text.push_str("0 1");
            for byte in desc {
                let _ = write!(text, " {}", byte);
            }
            text.push_str(" 1.0\n");
        }
        text
    }
}

/// Camera poses (`T_wc`) translating along `step` from `start`, looking
/// down +z.
pub fn straight_trajectory(num_frames: usize, start: Vector3<f64>, step: Vector3<f64>) -> Vec<SE3> {
    (0..num_frames)
        .map(|i| SE3 {
            rotation: UnitQuaternion::identity(),
            translation: start + step * i as f64,
        })
        .collect()
}

/// Camera poses (`T_wc`) on a circle of `radius` in the x-z plane, facing
/// away from the center. `turns` full revolutions over `num_frames`.
pub fn circular_trajectory(num_frames: usize, radius: f64, turns: f64) -> Vec<SE3> {
    (0..num_frames)
        .map(|i| {
            let angle = std::f64::consts::TAU * turns * i as f64 / num_frames.max(1) as f64;
            // Optical axis (+z in camera) points along (cos, 0, sin).
            let rotation = UnitQuaternion::from_axis_angle(
                &Vector3::y_axis(),
                std::f64::consts::FRAC_PI_2 - angle,
            );
            SE3 {
                rotation,
                translation: Vector3::new(radius * angle.cos(), 0.0, radius * angle.sin()),
            }
        })
        .collect()
}

/// One observed landmark.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub landmark: usize,
    pub u: f64,
    pub v: f64,
    /// Point in the camera frame.
    pub point_cam: Vector3<f64>,
}

/// A scene seen through a camera along a trajectory.
#[derive(Debug, Clone)]
pub struct SyntheticSequence {
    pub scene: SyntheticScene,
    pub camera: CameraModel,
    pub poses: Vec<SE3>,
    pub fps: f64,
}

impl SyntheticSequence {
    /// Camera of [`SETTINGS_YAML`]: 640x480, f = 400, 10 cm baseline.
    pub fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640.0, 480.0, 40.0)
    }

    pub fn new(scene: SyntheticScene, poses: Vec<SE3>) -> Self {
        Self {
            scene,
            camera: Self::camera(),
            poses,
            fps: 10.0,
        }
    }

    /// A sideways walk in front of a box of landmarks.
    pub fn sideways(num_frames: usize, step: f64, seed: u64) -> Self {
        let scene = SyntheticScene::random_box(
            600,
            Vector3::new(-6.0, -2.5, 3.0),
            Vector3::new(6.0 + step * num_frames as f64, 2.5, 8.0),
            seed,
        );
        let poses = straight_trajectory(num_frames, Vector3::zeros(), Vector3::new(step, 0.0, 0.0));
        Self::new(scene, poses)
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn timestamp(&self, index: usize) -> f64 {
        index as f64 / self.fps
    }

    /// Landmarks in front of the camera that project inside the image.
    pub fn observe(&self, index: usize) -> Vec<Observation> {
        let Some(pose_wc) = self.poses.get(index) else {
            return Vec::new();
        };
        let pose_cw = pose_wc.inverse();
        self.scene
            .points
            .iter()
            .enumerate()
            .filter_map(|(landmark, p)| {
                let point_cam = pose_cw.transform_point(p);
                let uv = self.camera.project(&point_cam)?;
                if !self.camera.is_in_image(uv.x, uv.y) {
                    return None;
                }
                Some(Observation {
                    landmark,
                    u: uv.x,
                    v: uv.y,
                    point_cam,
                })
            })
            .collect()
    }

    /// Left image features.
    pub fn monocular(&self, index: usize) -> FeatureSet {
        self.features(&self.observe(index))
    }

    /// Rectified stereo pair. Right keypoints sit `bf / z` to the left and
    /// carry the same descriptors.
    pub fn stereo(&self, index: usize) -> (FeatureSet, FeatureSet) {
        let observations = self.observe(index);
        let left = self.features(&observations);
        let mut right_kps = Vec::with_capacity(observations.len());
        let mut right_descs = Vec::with_capacity(observations.len());
        for obs in &observations {
            let u_right = obs.u - self.camera.bf / obs.point_cam.z;
            if u_right >= 0.0 {
                right_kps.push(KeyPoint::new(u_right, obs.v, 0));
                right_descs.push(self.scene.descriptors[obs.landmark]);
            }
        }
        (left, FeatureSet::new(right_kps, right_descs))
    }

    /// Features with raw depth readings (`z * depth_map_factor`).
    pub fn rgbd(&self, index: usize, depth_map_factor: f64) -> (FeatureSet, Vec<f64>) {
        let observations = self.observe(index);
        let depths = observations
            .iter()
            .map(|obs| obs.point_cam.z * depth_map_factor)
            .collect();
        (self.features(&observations), depths)
    }

    fn features(&self, observations: &[Observation]) -> FeatureSet {
        let keypoints = observations
            .iter()
            .map(|obs| KeyPoint::new(obs.u, obs.v, 0))
            .collect();
        let descriptors = observations
            .iter()
            .map(|obs| self.scene.descriptors[obs.landmark])
            .collect();
        FeatureSet::new(keypoints, descriptors)
    }
}
