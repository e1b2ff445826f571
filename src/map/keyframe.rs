//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the nodes of the SLAM graph. They hold:
//! - features, per-feature camera-frame points and BoW data
//! - a pose estimate (`T_wc`)
//! - graph relationships: covisibility, spanning tree, loop edges
//!
//! Everything but the pose and the graph bookkeeping is fixed once the
//! keyframe is inserted; mutations of associations go through [`super::Map`]
//! so that both sides of the KF ↔ MP relation stay consistent.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, KeyPoint};
use crate::tracking::FeatureGrid;
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{KeyFrameId, MapPointId};

/// A KeyFrame in the SLAM map.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose: transform from camera to world (T_wc).
    pub pose: SE3,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<KeyPoint>,

    pub descriptors: Vec<Descriptor>,

    /// 3D points in camera frame from stereo matching or depth.
    /// Always `None` for monocular keyframes.
    pub points_cam: Vec<Option<Vector3<f64>>>,

    pub bow_vector: BowVector,

    pub feature_vector: FeatureVector,

    grid: FeatureGrid,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// map_point_ids[i] = Some(mp_id) if feature i observes mp_id.
    map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Temporal Links
    // ─────────────────────────────────────────────────────────────────────────
    pub prev_kf: Option<KeyFrameId>,

    pub next_kf: Option<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Same edges, best first. Rebuilt on every change.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree and Loops
    // ─────────────────────────────────────────────────────────────────────────
    /// None for the root KeyFrame and for keyframes not yet connected.
    pub parent_id: Option<KeyFrameId>,

    pub children_ids: HashSet<KeyFrameId>,

    pub loop_edges: HashSet<KeyFrameId>,

    pub is_bad: bool,
}

/// Everything a new keyframe is built from; the id is assigned by the map.
#[derive(Clone, Debug)]
pub struct KeyFrameData {
    pub timestamp: f64,
    pub pose: SE3,
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub points_cam: Vec<Option<Vector3<f64>>>,
    pub bow_vector: BowVector,
    pub feature_vector: FeatureVector,
    pub grid: FeatureGrid,
}

impl KeyFrame {
    pub fn new(id: KeyFrameId, data: KeyFrameData) -> Self {
        let num_features = data.keypoints.len();
        let mut points_cam = data.points_cam;
        points_cam.resize(num_features, None);

        Self {
            id,
            timestamp: data.timestamp,
            pose: data.pose,
            keypoints: data.keypoints,
            descriptors: data.descriptors,
            points_cam,
            bow_vector: data.bow_vector,
            feature_vector: data.feature_vector,
            grid: data.grid,
            map_point_ids: vec![None; num_features],
            prev_kf: None,
            next_kf: None,
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            loop_edges: HashSet::new(),
            is_bad: false,
        }
    }

    /// Camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World-to-camera transform (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Returns the previous MapPoint ID if there was one.
    pub(crate) fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub(crate) fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// Feature slot currently holding `mp_id`, if any.
    pub fn feature_of(&self, mp_id: MapPointId) -> Option<usize> {
        self.map_point_ids.iter().position(|m| *m == Some(mp_id))
    }

    /// All (feature index, MapPoint) associations.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn map_point_slots(&self) -> &[Option<MapPointId>] {
        &self.map_point_ids
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or overwrite a covisibility edge. Self-edges are ignored.
    pub(crate) fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.rebuild_ordered_covisibles();
    }

    pub(crate) fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.rebuild_ordered_covisibles();
        }
    }

    /// Replace every covisibility edge at once.
    pub(crate) fn set_covisibility(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
        self.rebuild_ordered_covisibles();
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// All covisible keyframes, best first.
    pub fn ordered_covisibles(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.ordered_covisibles.iter().map(|(id, _)| *id)
    }

    /// The N best covisible KeyFrames (most shared points first).
    pub fn get_best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn get_covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    fn rebuild_ordered_covisibles(&mut self) {
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        // Heaviest first; ties broken by id for a stable order.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spatial Queries
    // ─────────────────────────────────────────────────────────────────────────

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
                let kp = &self.keypoints[i];
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
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("num_children", &self.children_ids.len())
            .field("loop_edges", &self.loop_edges.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
