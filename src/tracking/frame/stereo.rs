//! Depth for caller-supplied features: rectified stereo correspondence
//! search and RGB-D back-projection.

use nalgebra::Vector3;

use crate::tracking::frame::camera::CameraModel;
use crate::tracking::frame::features::{descriptor_distance, FeatureSet, KeyPoint};

/// ORB-SLAM matching thresholds
pub const TH_HIGH: u32 = 100; // Max descriptor distance for acceptance
pub const TH_LOW: u32 = 50; // Stricter threshold
pub const NN_RATIO: f64 = 0.75; // Ratio test threshold (best/second_best)

const MIN_DEPTH: f64 = 0.1; // meters
const MAX_DEPTH: f64 = 40.0; // meters
const VERTICAL_MARGIN: f64 = 2.0; // pixels tolerance for y-coordinate
const STEREO_RATIO: f64 = 0.9;

/// For each left keypoint, search the right image along the (horizontal)
/// epipolar line within the disparity range implied by [MIN_DEPTH, MAX_DEPTH]
/// and triangulate the best match.
///
/// Returns one entry per left keypoint, in the left camera frame.
pub fn match_stereo(
    left: &FeatureSet,
    right: &FeatureSet,
    camera: &CameraModel,
) -> Vec<Option<Vector3<f64>>> {
    let mut points = vec![None; left.len()];
    if camera.bf <= 0.0 {
        return points;
    }

    // Disparity bounds from the depth range
    let max_disparity = camera.bf / MIN_DEPTH;
    let min_disparity = camera.bf / MAX_DEPTH;

    for (left_idx, (left_kp, left_desc)) in left
        .keypoints
        .iter()
        .zip(left.descriptors.iter())
        .enumerate()
    {
        let mut best_dist = TH_HIGH;
        let mut second_best_dist = TH_HIGH;
        let mut best_right: Option<&KeyPoint> = None;

        for (right_kp, right_desc) in right.keypoints.iter().zip(right.descriptors.iter()) {
            // Rectified images: rows must agree
            if (left_kp.y - right_kp.y).abs() > VERTICAL_MARGIN {
                continue;
            }
            let disparity = left_kp.x - right_kp.x;
            if disparity < min_disparity || disparity > max_disparity {
                continue;
            }
            // Features from very different pyramid levels are unlikely to match
            if (left_kp.octave - right_kp.octave).abs() > 1 {
                continue;
            }

            let dist = descriptor_distance(left_desc, right_desc);
            if dist < best_dist {
                second_best_dist = best_dist;
                best_dist = dist;
                best_right = Some(right_kp);
            } else if dist < second_best_dist {
                second_best_dist = dist;
            }
        }

        let Some(right_kp) = best_right else {
            continue;
        };
        // Ratio test (Lowe)
        if second_best_dist != TH_HIGH && best_dist as f64 >= STEREO_RATIO * second_best_dist as f64 {
            continue;
        }

        let disparity = left_kp.x - right_kp.x;
        let z = camera.bf / disparity;
        points[left_idx] = Some(camera.unproject(left_kp.x, left_kp.y, z));
    }

    points
}

/// Back-project registered depth readings. `depths[i]` is the raw value at
/// keypoint `i`; raw / `depth_map_factor` gives meters and non-positive or
/// non-finite readings are treated as missing.
pub fn back_project_depths(
    keypoints: &[KeyPoint],
    depths: &[f64],
    depth_map_factor: f64,
    camera: &CameraModel,
) -> Vec<Option<Vector3<f64>>> {
    keypoints
        .iter()
        .enumerate()
        .map(|(i, kp)| {
            let raw = *depths.get(i)?;
            let z = raw / depth_map_factor;
            if !z.is_finite() || z <= 0.0 {
                return None;
            }
            Some(camera.unproject(kp.x, kp.y, z))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640.0, 480.0, 40.0)
    }

    fn desc(seed: u8) -> [u8; 32] {
        let mut d = [0u8; 32];
        for (i, b) in d.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8 * 7);
        }
        d
    }

    #[test]
    fn test_stereo_match_triangulates_depth() {
        let cam = camera();
        // Point at z = 4 m: disparity = bf / z = 10 px.
        let left = FeatureSet::new(vec![KeyPoint::new(300.0, 200.0, 0)], vec![desc(1)]);
        let right = FeatureSet::new(
            vec![KeyPoint::new(290.0, 200.5, 0), KeyPoint::new(250.0, 200.0, 0)],
            vec![desc(1), desc(200)],
        );

        let points = match_stereo(&left, &right, &cam);
        let p = points[0].expect("matched");
        assert_relative_eq!(p.z, 4.0, epsilon = 1e-9);
        assert_relative_eq!(p.x, (300.0 - 320.0) * 4.0 / 400.0, epsilon = 1e-9);
    }

    #[test]
    fn test_stereo_rejects_wrong_row_and_negative_disparity() {
        let cam = camera();
        let left = FeatureSet::new(vec![KeyPoint::new(300.0, 200.0, 0)], vec![desc(1)]);
        let right = FeatureSet::new(
            vec![KeyPoint::new(290.0, 210.0, 0), KeyPoint::new(310.0, 200.0, 0)],
            vec![desc(1), desc(1)],
        );
        assert!(match_stereo(&left, &right, &cam)[0].is_none());
    }

    #[test]
    fn test_back_project_depths() {
        let cam = camera();
        let kps = vec![KeyPoint::new(320.0, 240.0, 0), KeyPoint::new(0.0, 0.0, 0)];
        let points = back_project_depths(&kps, &[5000.0, 0.0], 1000.0, &cam);

        assert_relative_eq!(points[0].unwrap().z, 5.0, epsilon = 1e-12);
        assert!(points[1].is_none());
    }
}
