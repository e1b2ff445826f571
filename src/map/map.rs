//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map owns both arenas and is the only place where the KF ↔ MP relation
//! is mutated, so observer sets and keyframe slots stay mutually consistent.
//! Every structural mutation bumps a monotonically increasing change index;
//! optimizers that solve outside the lock compare it at apply time.
//!
//! Covisibility is only recomputed through [`Map::update_connections`], which
//! the local mapper and the loop closer call. Plain associations never touch
//! the covisibility graph.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::SE3;
use crate::tracking::frame::Descriptor;

use super::keyframe::{KeyFrame, KeyFrameData};
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Shared landmarks needed for a covisibility edge.
pub const COVISIBILITY_THRESHOLD: usize = 15;

/// Pose of an erased keyframe relative to its spanning-tree parent, kept so
/// trajectories referencing it can still be resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ErasedKeyFrame {
    pub parent: KeyFrameId,
    /// T_parent_child: pose of the erased keyframe in its parent's frame.
    pub relative_pose: SE3,
}

/// The SLAM map containing KeyFrames and MapPoints.
pub struct Map {
    pub(super) keyframes: HashMap<KeyFrameId, KeyFrame>,

    pub(super) map_points: HashMap<MapPointId, MapPoint>,

    pub(super) next_kf_id: u64,

    pub(super) next_mp_id: u64,

    /// Tail of the temporal chain.
    pub(super) last_keyframe_id: Option<KeyFrameId>,

    /// First keyframe of the map; never culled.
    pub(super) origin_kf_id: Option<KeyFrameId>,

    pub(super) change_index: u64,

    pub(super) erased_keyframes: HashMap<KeyFrameId, ErasedKeyFrame>,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            last_keyframe_id: None,
            origin_kf_id: None,
            change_index: 0,
            erased_keyframes: HashMap::new(),
        }
    }

    /// Monotonic counter of structural mutations.
    pub fn change_index(&self) -> u64 {
        self.change_index
    }

    fn bump(&mut self) {
        self.change_index += 1;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create and add a new KeyFrame, linked after the current last one.
    pub fn create_keyframe(&mut self, data: KeyFrameData) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;

        let mut kf = KeyFrame::new(id, data);
        if let Some(prev_id) = self.last_keyframe_id {
            kf.prev_kf = Some(prev_id);
            if let Some(prev_kf) = self.keyframes.get_mut(&prev_id) {
                prev_kf.next_kf = Some(id);
            }
        }
        if self.origin_kf_id.is_none() {
            self.origin_kf_id = Some(id);
        }

        self.keyframes.insert(id, kf);
        self.last_keyframe_id = Some(id);
        self.bump();
        id
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_keyframe_id
    }

    pub fn origin_keyframe_id(&self) -> Option<KeyFrameId> {
        self.origin_kf_id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    /// Mutable access for pose updates. Associations and graph edges are
    /// changed through the Map's own methods.
    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn contains_keyframe(&self, id: KeyFrameId) -> bool {
        self.keyframes.contains_key(&id)
    }

    /// All KeyFrame IDs in creation order.
    pub fn keyframe_ids(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self.keyframes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// Keyframes oldest to newest, following the temporal chain.
    pub fn keyframes_temporal_order(&self) -> Vec<&KeyFrame> {
        let mut result = Vec::with_capacity(self.keyframes.len());
        let mut current = self
            .origin_kf_id
            .and_then(|id| self.keyframes.get(&id))
            .or_else(|| self.keyframes.values().find(|kf| kf.prev_kf.is_none()));

        while let Some(kf) = current {
            result.push(kf);
            current = kf.next_kf.and_then(|id| self.keyframes.get(&id));
        }
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        self.bump();
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    /// Mutable access for position and counter updates.
    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn contains_map_point(&self, id: MapPointId) -> bool {
        self.map_points.contains_key(&id)
    }

    /// All MapPoint IDs in creation order.
    pub fn map_point_ids(&self) -> Vec<MapPointId> {
        let mut ids: Vec<MapPointId> = self.map_points.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Bidirectionally link a keyframe feature to a MapPoint.
    ///
    /// A MapPoint previously held by the slot loses that observation. If the
    /// keyframe already observes `mp_id` through another slot the call is
    /// rejected, so a keyframe never observes a point twice.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.num_features() {
            return false;
        }
        let Some(mp) = self.map_points.get(&mp_id) else {
            return false;
        };
        if let Some(&existing) = mp.observations.get(&kf_id) {
            return existing == feature_idx;
        }

        let previous = self
            .keyframes
            .get_mut(&kf_id)
            .and_then(|kf| kf.set_map_point(feature_idx, mp_id));
        if let Some(prev_mp) = previous {
            if let Some(prev) = self.map_points.get_mut(&prev_mp) {
                prev.observations.remove(&kf_id);
            }
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.observations.insert(kf_id, feature_idx);
        }
        self.bump();
        true
    }

    /// Remove the association of a keyframe feature. Returns the MapPoint it
    /// pointed to.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.observations.remove(&kf_id);
            if mp.ref_kf_id == kf_id {
                if let Some(&other) = mp.observations.keys().min() {
                    mp.ref_kf_id = other;
                }
            }
        }
        self.bump();
        Some(mp_id)
    }

    /// Remove a MapPoint and every observation slot pointing to it.
    pub fn erase_map_point(&mut self, mp_id: MapPointId) -> bool {
        let Some(mp) = self.map_points.remove(&mp_id) else {
            return false;
        };
        for (kf_id, feature_idx) in mp.observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.get_map_point(feature_idx) == Some(mp_id) {
                    kf.erase_map_point(feature_idx);
                }
            }
        }
        self.bump();
        true
    }

    /// Merge `old` into `new`: every observer of `old` is retargeted to `new`.
    ///
    /// An observer that already sees `new` just drops its `old` slot, so no
    /// keyframe ends up observing `new` twice. Counters are merged and `old`
    /// is removed.
    pub fn replace(&mut self, old: MapPointId, new: MapPointId) -> bool {
        if old == new || !self.map_points.contains_key(&new) {
            return false;
        }
        let Some(old_mp) = self.map_points.remove(&old) else {
            return false;
        };

        for (&kf_id, &feature_idx) in &old_mp.observations {
            let already_sees_new = self
                .map_points
                .get(&new)
                .is_some_and(|mp| mp.observations.contains_key(&kf_id));

            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                continue;
            };
            if kf.get_map_point(feature_idx) != Some(old) {
                continue;
            }
            if already_sees_new {
                kf.erase_map_point(feature_idx);
            } else {
                kf.set_map_point(feature_idx, new);
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.observations.insert(kf_id, feature_idx);
                }
            }
        }

        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.visible_count += old_mp.visible_count;
            mp.found_count += old_mp.found_count;
        }
        self.bump();

        self.compute_distinctive_descriptor(new);
        self.update_map_point_normal_and_depth(new);
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph and Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute the covisibility edges of `kf_id` from its current
    /// observations, mirror them into the neighbors, and attach the keyframe
    /// to the spanning tree on its first connection.
    ///
    /// Edges need [`COVISIBILITY_THRESHOLD`] shared landmarks; if none reaches
    /// it, only the strongest neighbor is kept.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };

        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.get_map_point_indices() {
            let Some(mp) = self.map_points.get(&mp_id) else {
                continue;
            };
            for &other in mp.observations.keys() {
                if other != kf_id {
                    *counter.entry(other).or_insert(0) += 1;
                }
            }
        }

        let mut weights: HashMap<KeyFrameId, usize> = counter
            .iter()
            .filter(|(_, &w)| w >= COVISIBILITY_THRESHOLD)
            .map(|(&id, &w)| (id, w))
            .collect();
        if weights.is_empty() {
            if let Some((&best, &w)) = counter.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))) {
                weights.insert(best, w);
            }
        }

        let previous: Vec<KeyFrameId> = kf.covisibility_weights().keys().copied().collect();
        for other in previous {
            if !weights.contains_key(&other) {
                if let Some(other_kf) = self.keyframes.get_mut(&other) {
                    other_kf.erase_covisibility(kf_id);
                }
            }
        }
        for (&other, &w) in &weights {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.add_covisibility(kf_id, w);
            }
        }

        let best = weights
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&id, _)| id);

        let needs_parent = Some(kf_id) != self.origin_kf_id;
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_covisibility(weights);
            if needs_parent && kf.parent_id.is_none() {
                if let Some(parent) = best {
                    kf.parent_id = Some(parent);
                    if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                        parent_kf.children_ids.insert(kf_id);
                    }
                }
            }
        }
    }

    /// The N keyframes sharing the most landmarks with `kf_id`.
    pub fn get_local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.get_best_covisibles(n))
            .unwrap_or_default()
    }

    /// Record a loop edge on both keyframes.
    pub fn add_loop_edge(&mut self, a: KeyFrameId, b: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.loop_edges.insert(b);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.loop_edges.insert(a);
        }
    }

    /// Make `new_parent` the spanning-tree parent of `kf_id`.
    pub fn change_parent(&mut self, kf_id: KeyFrameId, new_parent: KeyFrameId) {
        if kf_id == new_parent || !self.keyframes.contains_key(&new_parent) {
            return;
        }
        let old_parent = self.keyframes.get(&kf_id).and_then(|kf| kf.parent_id);
        if let Some(old) = old_parent {
            if let Some(old_kf) = self.keyframes.get_mut(&old) {
                old_kf.children_ids.remove(&kf_id);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.parent_id = Some(new_parent);
        }
        if let Some(parent_kf) = self.keyframes.get_mut(&new_parent) {
            parent_kf.children_ids.insert(kf_id);
        }
    }

    /// Remove a keyframe with full graph cleanup.
    ///
    /// - its observations are dropped (points left unobserved are erased)
    /// - neighbors lose their covisibility edge to it
    /// - children are re-parented to the candidate they share most landmarks
    ///   with, starting from the erased keyframe's parent
    /// - the temporal chain is relinked
    ///
    /// The origin keyframe is never erased.
    pub fn erase_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        if Some(kf_id) == self.origin_kf_id {
            return false;
        }
        let Some(kf) = self.keyframes.remove(&kf_id) else {
            return false;
        };

        for (_, mp_id) in kf.get_map_point_indices() {
            let orphaned = match self.map_points.get_mut(&mp_id) {
                Some(mp) => {
                    mp.observations.remove(&kf_id);
                    if mp.ref_kf_id == kf_id {
                        if let Some(&other) = mp.observations.keys().min() {
                            mp.ref_kf_id = other;
                        }
                    }
                    mp.observations.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.map_points.remove(&mp_id);
            }
        }

        for other in kf.covisibility_weights().keys() {
            if let Some(other_kf) = self.keyframes.get_mut(other) {
                other_kf.erase_covisibility(kf_id);
            }
        }
        for other in &kf.loop_edges {
            if let Some(other_kf) = self.keyframes.get_mut(other) {
                other_kf.loop_edges.remove(&kf_id);
            }
        }

        self.reparent_children(&kf);

        if let Some(parent) = kf.parent_id {
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.children_ids.remove(&kf_id);
                let relative_pose = parent_kf.pose.inverse().compose(&kf.pose);
                self.erased_keyframes.insert(
                    kf_id,
                    ErasedKeyFrame {
                        parent,
                        relative_pose,
                    },
                );
            }
        }

        if let Some(prev) = kf.prev_kf {
            if let Some(prev_kf) = self.keyframes.get_mut(&prev) {
                prev_kf.next_kf = kf.next_kf;
            }
        }
        if let Some(next) = kf.next_kf {
            if let Some(next_kf) = self.keyframes.get_mut(&next) {
                next_kf.prev_kf = kf.prev_kf;
            }
        }
        if self.last_keyframe_id == Some(kf_id) {
            self.last_keyframe_id = kf.prev_kf;
        }

        debug!("[Map] Erased {}", kf_id);
        self.bump();
        true
    }

    /// Greedy re-parenting: repeatedly attach the child with the strongest
    /// covisibility link to any candidate parent, then make it a candidate.
    fn reparent_children(&mut self, erased: &KeyFrame) {
        let mut children: HashSet<KeyFrameId> = erased
            .children_ids
            .iter()
            .copied()
            .filter(|c| self.keyframes.contains_key(c))
            .collect();
        let mut candidates: Vec<KeyFrameId> = erased.parent_id.into_iter().collect();

        while !children.is_empty() {
            let mut best: Option<(KeyFrameId, KeyFrameId, usize)> = None;
            for &child in &children {
                let Some(child_kf) = self.keyframes.get(&child) else {
                    continue;
                };
                for &candidate in &candidates {
                    let w = child_kf.get_covisibility_weight(candidate);
                    if w > 0 && best.map_or(true, |b| w > b.2) {
                        best = Some((child, candidate, w));
                    }
                }
            }

            let Some((child, parent, _)) = best else {
                break;
            };
            self.set_parent_link(child, parent);
            candidates.push(child);
            children.remove(&child);
        }

        // Children with no covisible candidate hang from the erased
        // keyframe's parent.
        for child in children {
            match erased.parent_id {
                Some(parent) if self.keyframes.contains_key(&parent) => {
                    self.set_parent_link(child, parent)
                }
                _ => {
                    if let Some(child_kf) = self.keyframes.get_mut(&child) {
                        child_kf.parent_id = None;
                    }
                }
            }
        }
    }

    fn set_parent_link(&mut self, child: KeyFrameId, parent: KeyFrameId) {
        if let Some(child_kf) = self.keyframes.get_mut(&child) {
            child_kf.parent_id = Some(parent);
        }
        if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
            parent_kf.children_ids.insert(child);
        }
    }

    /// Current `T_wc` of a keyframe, following the spanning tree for
    /// keyframes that have been erased.
    pub fn resolve_keyframe_pose(&self, kf_id: KeyFrameId) -> Option<SE3> {
        let mut accumulated = SE3::identity();
        let mut current = kf_id;
        // Each erased record points to an older keyframe, so this terminates.
        for _ in 0..=self.erased_keyframes.len() {
            if let Some(kf) = self.keyframes.get(&current) {
                return Some(kf.pose.compose(&accumulated));
            }
            let record = self.erased_keyframes.get(&current)?;
            accumulated = record.relative_pose.compose(&accumulated);
            current = record.parent;
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// All MapPoints observed by a set of KeyFrames.
    pub fn get_map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> HashSet<MapPointId> {
        kf_ids
            .iter()
            .filter_map(|id| self.keyframes.get(id))
            .flat_map(|kf| kf.get_map_point_indices().map(|(_, mp)| mp))
            .collect()
    }

    /// Median depth of the keyframe's landmarks in its camera frame.
    pub fn median_scene_depth(&self, kf_id: KeyFrameId) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let pose_cw = kf.pose_cw();
        let mut depths: Vec<f64> = kf
            .get_map_point_indices()
            .filter_map(|(_, mp_id)| self.map_points.get(&mp_id))
            .map(|mp| pose_cw.transform_point(&mp.position).z)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.total_cmp(b));
        Some(depths[(depths.len() - 1) / 2])
    }

    /// Observation count where a keyframe slot with depth (stereo or RGB-D)
    /// counts twice, once per view. 0 for an unknown point.
    pub fn weighted_observations(&self, mp_id: MapPointId) -> usize {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return 0;
        };
        mp.observations()
            .iter()
            .map(|(kf_id, &idx)| {
                let has_depth = self
                    .keyframes
                    .get(kf_id)
                    .and_then(|kf| kf.points_cam.get(idx).copied().flatten())
                    .is_some();
                if has_depth {
                    2
                } else {
                    1
                }
            })
            .sum()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute normal and distance bounds from the current observers.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let observers: Vec<(KeyFrameId, Vector3<f64>, i32)> = mp
            .observations
            .iter()
            .filter_map(|(&kf_id, &idx)| {
                let kf = self.keyframes.get(&kf_id)?;
                let octave = kf.keypoints.get(idx).map_or(0, |kp| kp.octave);
                Some((kf_id, kf.camera_center(), octave))
            })
            .collect();
        if observers.is_empty() {
            return;
        }
        let reference = observers
            .iter()
            .find(|(id, _, _)| *id == mp.ref_kf_id)
            .or_else(|| observers.iter().min_by_key(|(id, _, _)| *id))
            .map(|(_, c, o)| (*c, *o));

        let views: Vec<(Vector3<f64>, i32)> = observers.iter().map(|(_, c, o)| (*c, *o)).collect();
        if let (Some(mp), Some(reference)) = (self.map_points.get_mut(&mp_id), reference) {
            mp.update_normal_and_depth(&views, reference);
        }
    }

    /// Re-pick the representative descriptor from the observing features.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let mut obs: Vec<(KeyFrameId, usize)> =
            mp.observations.iter().map(|(&k, &i)| (k, i)).collect();
        obs.sort_unstable();
        let descriptors: Vec<Descriptor> = obs
            .iter()
            .filter_map(|(kf_id, idx)| self.keyframes.get(kf_id)?.descriptors.get(*idx).copied())
            .collect();
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.compute_distinctive_descriptor(&descriptors);
        }
    }

    /// Remove everything. Id counters restart; the change index keeps
    /// increasing.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.erased_keyframes.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
        self.last_keyframe_id = None;
        self.origin_kf_id = None;
        self.bump();
    }

    /// Take over the contents of a loaded map. The change index moves past
    /// both maps so snapshots taken from either are stale.
    pub fn adopt(&mut self, other: Map) {
        let change_index = self.change_index.max(other.change_index) + 1;
        *self = other;
        self.change_index = change_index;
    }

    /// Number of undirected covisibility edges.
    pub fn num_covisibility_edges(&self) -> usize {
        let directed: usize = self
            .keyframes
            .values()
            .map(|kf| kf.covisibility_weights().len())
            .sum();
        directed / 2
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("change_index", &self.change_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::KeyPoint;
    use crate::tracking::FeatureGrid;
    use crate::vocabulary::{BowVector, FeatureVector};

    fn data(num_features: usize, x: f64) -> KeyFrameData {
        let keypoints: Vec<KeyPoint> = (0..num_features)
            .map(|i| KeyPoint::new(i as f64, 10.0, 0))
            .collect();
        let grid = FeatureGrid::new(&keypoints, 640.0, 480.0);
        KeyFrameData {
            timestamp: x,
            pose: SE3::from_rt(nalgebra::Matrix3::identity(), Vector3::new(x, 0.0, 0.0)),
            keypoints,
            descriptors: vec![[0u8; 32]; num_features],
            points_cam: vec![],
            bow_vector: BowVector::new(),
            feature_vector: FeatureVector::new(),
            grid,
        }
    }

    /// Keyframes that all observe the same `n` points through slots 0..n.
    fn shared_map(num_kfs: usize, n: usize) -> (Map, Vec<KeyFrameId>, Vec<MapPointId>) {
        let mut map = Map::new();
        let kfs: Vec<KeyFrameId> = (0..num_kfs)
            .map(|i| map.create_keyframe(data(n + 5, i as f64)))
            .collect();
        let mps: Vec<MapPointId> = (0..n)
            .map(|i| map.create_map_point(Vector3::new(i as f64, 0.0, 5.0), [0u8; 32], kfs[0]))
            .collect();
        for &kf in &kfs {
            for (i, &mp) in mps.iter().enumerate() {
                assert!(map.associate(kf, i, mp));
            }
        }
        (map, kfs, mps)
    }

    #[test]
    fn test_create_keyframe_links_temporal_chain() {
        let mut map = Map::new();
        let a = map.create_keyframe(data(3, 0.0));
        let b = map.create_keyframe(data(3, 1.0));

        assert_eq!(map.origin_keyframe_id(), Some(a));
        assert_eq!(map.last_keyframe_id(), Some(b));
        assert_eq!(map.get_keyframe(a).unwrap().next_kf, Some(b));
        assert_eq!(map.get_keyframe(b).unwrap().prev_kf, Some(a));
        assert_eq!(map.keyframes_temporal_order().len(), 2);
    }

    #[test]
    fn test_change_index_bumps_on_structural_mutations() {
        let mut map = Map::new();
        let c0 = map.change_index();
        let kf = map.create_keyframe(data(3, 0.0));
        let mp = map.create_map_point(Vector3::zeros(), [0u8; 32], kf);
        let c1 = map.change_index();
        assert!(c1 > c0);

        map.get_map_point_mut(mp).unwrap().position.x = 1.0;
        map.get_keyframe_mut(kf).unwrap().pose = SE3::identity();
        assert_eq!(map.change_index(), c1);

        map.associate(kf, 0, mp);
        assert!(map.change_index() > c1);
    }

    #[test]
    fn test_associate_is_bidirectional_and_unique() {
        let mut map = Map::new();
        let kf = map.create_keyframe(data(4, 0.0));
        let a = map.create_map_point(Vector3::zeros(), [0u8; 32], kf);
        let b = map.create_map_point(Vector3::zeros(), [0u8; 32], kf);

        assert!(map.associate(kf, 0, a));
        assert!(!map.associate(kf, 1, a));
        assert!(map.get_map_point(a).unwrap().is_observed_by(kf));

        // Overwriting the slot drops the previous observation.
        assert!(map.associate(kf, 0, b));
        assert!(!map.get_map_point(a).unwrap().is_observed_by(kf));

        assert_eq!(map.disassociate(kf, 0), Some(b));
        assert_eq!(map.get_map_point(b).unwrap().num_observations(), 0);
        assert_eq!(map.get_keyframe(kf).unwrap().num_map_points(), 0);
    }

    #[test]
    fn test_update_connections_threshold_and_parent() {
        let (mut map, kfs, _) = shared_map(3, 20);
        for &kf in &kfs {
            map.update_connections(kf);
        }

        let k1 = map.get_keyframe(kfs[1]).unwrap();
        assert_eq!(k1.get_covisibility_weight(kfs[0]), 20);
        assert_eq!(k1.parent_id, Some(kfs[0]));
        assert!(map.get_keyframe(kfs[0]).unwrap().parent_id.is_none());
        assert_eq!(map.num_covisibility_edges(), 3);
    }

    #[test]
    fn test_weak_link_keeps_only_best_neighbor() {
        let (mut map, kfs, _) = shared_map(3, 5);
        map.update_connections(kfs[2]);

        let k2 = map.get_keyframe(kfs[2]).unwrap();
        assert_eq!(k2.covisibility_weights().len(), 1);
    }

    #[test]
    fn test_replace_merges_without_duplicates() {
        let mut map = Map::new();
        let k0 = map.create_keyframe(data(4, 0.0));
        let k1 = map.create_keyframe(data(4, 1.0));
        let k2 = map.create_keyframe(data(4, 2.0));
        let old = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], k0);
        let new = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], k1);
        map.associate(k0, 0, old);
        map.associate(k1, 0, old);
        map.associate(k1, 1, new);
        map.associate(k2, 2, new);

        assert!(map.replace(old, new));

        assert!(map.get_map_point(old).is_none());
        let merged = map.get_map_point(new).unwrap();
        assert_eq!(merged.num_observations(), 3);
        assert_eq!(map.get_keyframe(k0).unwrap().get_map_point(0), Some(new));
        // k1 already saw `new` through slot 1, so slot 0 is cleared.
        assert_eq!(map.get_keyframe(k1).unwrap().get_map_point(0), None);
        assert_eq!(map.get_keyframe(k1).unwrap().get_map_point(1), Some(new));
        assert_eq!(merged.visible_count, 2);
    }

    #[test]
    fn test_erase_keyframe_reparents_children() {
        let (mut map, kfs, _) = shared_map(4, 20);
        for &kf in &kfs {
            map.update_connections(kf);
        }
        // Chain the tree explicitly: 0 <- 1 <- {2, 3}.
        map.change_parent(kfs[2], kfs[1]);
        map.change_parent(kfs[3], kfs[1]);

        assert!(map.erase_keyframe(kfs[1]));

        for &child in &kfs[2..] {
            let parent = map.get_keyframe(child).unwrap().parent_id;
            assert!(parent.is_some());
            assert_ne!(parent, Some(kfs[1]));
        }
        assert!(map
            .get_keyframe(kfs[0])
            .unwrap()
            .covisibility_weights()
            .get(&kfs[1])
            .is_none());
        assert_eq!(map.get_keyframe(kfs[0]).unwrap().next_kf, Some(kfs[2]));
        assert!(!map.erase_keyframe(kfs[0]));
    }

    #[test]
    fn test_resolve_erased_keyframe_pose() {
        let (mut map, kfs, _) = shared_map(3, 20);
        for &kf in &kfs {
            map.update_connections(kf);
        }
        let expected = map.get_keyframe(kfs[1]).unwrap().pose.clone();
        map.erase_keyframe(kfs[1]);

        // Moving the parent moves the resolved pose with it.
        map.get_keyframe_mut(kfs[0]).unwrap().pose.translation.y = 2.0;
        let resolved = map.resolve_keyframe_pose(kfs[1]).unwrap();
        assert!((resolved.translation.x - expected.translation.x).abs() < 1e-12);
        assert!((resolved.translation.y - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_observations_count_depth_twice() {
        let mut map = Map::new();
        let mono = map.create_keyframe(data(3, 0.0));
        let mut with_depth = data(3, 1.0);
        with_depth.points_cam = vec![Some(Vector3::new(0.0, 0.0, 5.0)), None, None];
        let stereo = map.create_keyframe(with_depth);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], mono);

        map.associate(stereo, 0, mp);
        assert_eq!(map.weighted_observations(mp), 2);
        map.associate(mono, 0, mp);
        assert_eq!(map.weighted_observations(mp), 3);
        assert_eq!(map.get_map_point(mp).unwrap().num_observations(), 2);

        // A slot without depth in a depth keyframe counts once.
        map.disassociate(stereo, 0);
        map.associate(stereo, 1, mp);
        assert_eq!(map.weighted_observations(mp), 2);
        assert_eq!(map.weighted_observations(MapPointId(999)), 0);
    }

    #[test]
    fn test_erase_map_point_clears_slots() {
        let (mut map, kfs, mps) = shared_map(2, 3);
        assert!(map.erase_map_point(mps[0]));
        for &kf in &kfs {
            assert_eq!(map.get_keyframe(kf).unwrap().get_map_point(0), None);
        }
        assert_eq!(map.num_map_points(), 2);
    }

    #[test]
    fn test_clear_keeps_change_index_monotonic() {
        let (mut map, _, _) = shared_map(2, 3);
        let before = map.change_index();
        map.clear();
        assert!(map.change_index() > before);
        assert_eq!(map.num_keyframes(), 0);
        assert_eq!(map.num_map_points(), 0);
        assert!(map.last_keyframe_id().is_none());
    }

    #[test]
    fn test_adopt_invalidates_both_change_indices() {
        let (mut live, _, _) = shared_map(3, 4);
        let (loaded, kfs, _) = shared_map(2, 2);
        let stale = live.change_index().max(loaded.change_index());

        live.adopt(loaded);
        assert!(live.change_index() > stale);
        assert_eq!(live.num_keyframes(), 2);
        assert_eq!(live.num_map_points(), 2);
        assert_eq!(live.origin_keyframe_id(), Some(kfs[0]));
    }
}
