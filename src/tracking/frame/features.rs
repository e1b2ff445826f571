//! Caller-supplied ORB features and the scale pyramid they come from.

use serde::{Deserialize, Serialize};

/// 256-bit binary ORB descriptor.
pub type Descriptor = [u8; 32];

/// Pyramid parameters of the ORB extractor that produced the features.
pub const SCALE_FACTOR: f64 = 1.2;
pub const N_LEVELS: i32 = 8;

/// A detected keypoint in (undistorted) pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub x: f64,
    pub y: f64,
    /// Pyramid level the keypoint was detected at.
    pub octave: i32,
    /// Orientation in degrees, or negative when unknown.
    pub angle: f64,
}

impl KeyPoint {
    pub fn new(x: f64, y: f64, octave: i32) -> Self {
        Self {
            x,
            y,
            octave,
            angle: -1.0,
        }
    }
}

/// A set of ORB features for one image.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<KeyPoint>, descriptors: Vec<Descriptor>) -> Self {
        Self {
            keypoints,
            descriptors,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Drop trailing entries so keypoints and descriptors line up.
    pub fn truncate_to_consistent(&mut self) {
        let n = self.keypoints.len().min(self.descriptors.len());
        self.keypoints.truncate(n);
        self.descriptors.truncate(n);
    }
}

/// Hamming distance between two ORB descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Scale factor of a pyramid level (1.2^level).
#[inline]
pub fn level_scale(level: i32) -> f64 {
    SCALE_FACTOR.powi(level)
}

/// Measurement variance of a keypoint detected at `level`.
#[inline]
pub fn level_sigma2(level: i32) -> f64 {
    let s = level_scale(level);
    s * s
}

/// Pyramid level at which a point at `dist` would be observed, given its
/// maximum scale-invariance distance.
pub fn predict_scale(dist: f64, max_distance: f64) -> i32 {
    if dist <= 0.0 || max_distance <= 0.0 || !max_distance.is_finite() {
        return 0;
    }
    let ratio = max_distance / dist;
    let level = (ratio.ln() / SCALE_FACTOR.ln()).ceil() as i32;
    level.clamp(0, N_LEVELS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(descriptor_distance(&a, &b), 0);

        b[0] = 0b1010_1010;
        b[31] = 0xFF;
        assert_eq!(descriptor_distance(&a, &b), 12);
    }

    #[test]
    fn test_level_scale() {
        assert_eq!(level_scale(0), 1.0);
        assert!((level_scale(2) - 1.44).abs() < 1e-12);
        assert!((level_sigma2(1) - 1.44).abs() < 1e-12);
    }

    #[test]
    fn test_predict_scale_is_clamped() {
        assert_eq!(predict_scale(10.0, 10.0), 0);
        assert_eq!(predict_scale(1e-3, 10.0), N_LEVELS - 1);
        assert_eq!(predict_scale(12.0, 10.0), 0);
    }

    #[test]
    fn test_truncate_to_consistent() {
        let mut set = FeatureSet::new(vec![KeyPoint::new(1.0, 2.0, 0); 3], vec![[0u8; 32]; 2]);
        set.truncate_to_consistent();
        assert_eq!(set.len(), 2);
        assert_eq!(set.descriptors.len(), 2);
    }
}
