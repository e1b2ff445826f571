//! Tracking `Frame` representation.
//!
//! A `Frame` is what the Tracker operates on: caller-supplied features,
//! optional per-feature depth, a Bag-of-Words summary and temporary
//! associations to `MapPoint`s. It is discarded unless promoted to a
//! keyframe through [`Frame::to_keyframe_data`].

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::map::{KeyFrameData, MapPointId};
use crate::tracking::frame::{CameraModel, Descriptor, FeatureSet, KeyPoint};
use crate::vocabulary::{BowVector, FeatureVector, OrbVocabulary, FEATURE_VECTOR_LEVELS_UP};

/// Spatial grid for O(1) feature lookup.
///
/// The grid divides the image into GRID_COLS × GRID_ROWS cells.
/// Each cell stores indices of features whose keypoints fall within that cell.
/// This enables O(k) feature search in a radius, where k << N (total features).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureGrid {
    /// Grid cells, each containing indices of features in that cell.
    /// Stored as row-major: cell[row * GRID_COLS + col]
    cells: Vec<Vec<usize>>,
    /// Inverse of cell width (1.0 / cell_width)
    grid_element_width_inv: f64,
    /// Inverse of cell height (1.0 / cell_height)
    grid_element_height_inv: f64,
    grid_cols: usize,
    grid_rows: usize,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    pub fn new(keypoints: &[KeyPoint], img_width: f64, img_height: f64) -> Self {
        let grid_element_width_inv = Self::GRID_COLS as f64 / img_width.max(1.0);
        let grid_element_height_inv = Self::GRID_ROWS as f64 / img_height.max(1.0);

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS];
        for (idx, kp) in keypoints.iter().enumerate() {
            let cell_x = Self::clamp_cell(kp.x * grid_element_width_inv, Self::GRID_COLS);
            let cell_y = Self::clamp_cell(kp.y * grid_element_height_inv, Self::GRID_ROWS);
            cells[cell_y * Self::GRID_COLS + cell_x].push(idx);
        }

        Self {
            cells,
            grid_element_width_inv,
            grid_element_height_inv,
            grid_cols: Self::GRID_COLS,
            grid_rows: Self::GRID_ROWS,
        }
    }

    /// Cell index of a scaled coordinate, clamped before the cast so negative
    /// coordinates land in the first cell.
    fn clamp_cell(scaled: f64, n: usize) -> usize {
        (scaled.floor() as i64).clamp(0, n as i64 - 1) as usize
    }

    /// Feature indices in the cells overlapping a square of half-side `r`.
    ///
    /// These are spatial candidates only; the caller does the exact radius
    /// check.
    pub fn get_features_in_area(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        let min_cell_x = ((x - r) * self.grid_element_width_inv).floor() as i64;
        let max_cell_x = ((x + r) * self.grid_element_width_inv).ceil() as i64;
        let min_cell_y = ((y - r) * self.grid_element_height_inv).floor() as i64;
        let max_cell_y = ((y + r) * self.grid_element_height_inv).ceil() as i64;

        if max_cell_x < 0
            || max_cell_y < 0
            || min_cell_x >= self.grid_cols as i64
            || min_cell_y >= self.grid_rows as i64
        {
            return Vec::new();
        }

        let min_cell_x = min_cell_x.max(0) as usize;
        let max_cell_x = (max_cell_x as usize).min(self.grid_cols - 1);
        let min_cell_y = min_cell_y.max(0) as usize;
        let max_cell_y = (max_cell_y as usize).min(self.grid_rows - 1);

        let mut candidates = Vec::new();
        for cell_y in min_cell_y..=max_cell_y {
            for cell_x in min_cell_x..=max_cell_x {
                candidates.extend(&self.cells[cell_y * self.grid_cols + cell_x]);
            }
        }
        candidates
    }
}

/// A frame being tracked (not yet a KeyFrame).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Undistorted features (the left image for stereo).
    pub features: FeatureSet,
    /// 3D points in camera frame from stereo matching or depth.
    /// None if no valid depth; always None for monocular.
    pub points_cam: Vec<Option<Vector3<f64>>>,
    pub bow_vector: BowVector,
    pub feature_vector: FeatureVector,
    /// Temporary MapPoint associations for tracking:
    /// map_point_matches[i] = Some(mp_id) if feature i is associated.
    pub map_point_matches: Vec<Option<MapPointId>>,
    /// Set by pose optimization for associations with a large residual.
    pub outliers: Vec<bool>,
    /// Estimated pose (T_wc), if any.
    pub pose: Option<SE3>,
    pub grid: FeatureGrid,
}

impl Frame {
    /// Build a frame from caller features. Keypoints are undistorted when
    /// the camera has distortion; `points_cam` may be empty (monocular).
    pub fn new(
        timestamp: f64,
        mut features: FeatureSet,
        mut points_cam: Vec<Option<Vector3<f64>>>,
        camera: &CameraModel,
    ) -> Self {
        features.truncate_to_consistent();
        if camera.has_distortion() {
            for kp in &mut features.keypoints {
                let (u, v) = camera.undistort_point(kp.x, kp.y);
                kp.x = u;
                kp.y = v;
            }
        }

        let n = features.len();
        points_cam.resize(n, None);
        let grid = FeatureGrid::new(&features.keypoints, camera.width, camera.height);

        Self {
            timestamp,
            features,
            points_cam,
            bow_vector: BowVector::new(),
            feature_vector: FeatureVector::new(),
            map_point_matches: vec![None; n],
            outliers: vec![false; n],
            pose: None,
            grid,
        }
    }

    pub fn compute_bow(&mut self, vocabulary: &OrbVocabulary) {
        if !self.bow_vector.is_empty() {
            return;
        }
        let (bow, feat) = vocabulary.transform(&self.features.descriptors, FEATURE_VECTOR_LEVELS_UP);
        self.bow_vector = bow;
        self.feature_vector = feat;
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn keypoints(&self) -> &[KeyPoint] {
        &self.features.keypoints
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.features.descriptors
    }

    /// World-to-camera transform of the current estimate.
    pub fn pose_cw(&self) -> Option<SE3> {
        self.pose.as_ref().map(SE3::inverse)
    }

    pub fn num_valid_depths(&self) -> usize {
        self.points_cam.iter().filter(|p| p.is_some()).count()
    }

    /// Associations that are not flagged as outliers.
    pub fn num_tracked(&self) -> usize {
        self.map_point_matches
            .iter()
            .zip(self.outliers.iter())
            .filter(|(m, &out)| m.is_some() && !out)
            .count()
    }

    pub fn clear_matches(&mut self) {
        self.map_point_matches.iter_mut().for_each(|m| *m = None);
        self.outliers.iter_mut().for_each(|o| *o = false);
    }

    /// Drop associations flagged as outliers. Returns how many were removed.
    pub fn discard_outliers(&mut self) -> usize {
        let mut removed = 0;
        for (m, out) in self.map_point_matches.iter_mut().zip(self.outliers.iter_mut()) {
            if *out {
                if m.take().is_some() {
                    removed += 1;
                }
                *out = false;
            }
        }
        removed
    }

    /// Indices of keypoints within `radius` of (u, v), optionally restricted
    /// to a range of pyramid levels.
    pub fn get_features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.grid
            .get_features_in_area(u, v, radius)
            .into_iter()
            .filter(|&i| {
                let kp = &self.features.keypoints[i];
                if min_level.is_some_and(|min| kp.octave < min)
                    || max_level.is_some_and(|max| kp.octave > max)
                {
                    return false;
                }
                let du = kp.x - u;
                let dv = kp.y - v;
                du * du + dv * dv <= radius_sq
            })
            .collect()
    }

    /// Snapshot of everything a keyframe needs. `None` without a pose.
    pub fn to_keyframe_data(&self) -> Option<KeyFrameData> {
        Some(KeyFrameData {
            timestamp: self.timestamp,
            pose: self.pose.clone()?,
            keypoints: self.features.keypoints.clone(),
            descriptors: self.features.descriptors.clone(),
            points_cam: self.points_cam.clone(),
            bow_vector: self.bow_vector.clone(),
            feature_vector: self.feature_vector.clone(),
            grid: self.grid.clone(),
        })
    }
}
