//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Each MapPoint tracks which KeyFrames observe it, keeps the counters used
//! for culling, and stores the viewing geometry (mean normal and the
//! scale-invariance distance range) used by projection searches.

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::tracking::frame::{descriptor_distance, level_scale, Descriptor, N_LEVELS};

use super::types::{KeyFrameId, MapPointId};

#[derive(Clone, Serialize, Deserialize)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor: the observation with the least median
    /// distance to all others.
    pub descriptor: Descriptor,

    /// observation[kf_id] = feature index of this point in that KeyFrame.
    pub(crate) observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance range.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Frames in which the point was predicted to be visible.
    pub visible_count: u32,

    /// Frames in which it was actually matched.
    pub found_count: u32,

    /// KeyFrame that created this MapPoint.
    pub first_kf_id: KeyFrameId,

    /// KeyFrame whose pose anchors this point during loop correction.
    pub ref_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            first_kf_id,
            ref_kf_id: first_kf_id,
            is_bad: false,
        }
    }

    pub fn observations(&self) -> &HashMap<KeyFrameId, usize> {
        &self.observations
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// `found / visible`; 1.0 until the point has been predicted visible.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    /// Distance check with the usual 0.8 / 1.2 tolerance on the bounds.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }

    /// Recompute mean normal and distance bounds.
    ///
    /// `observers` yields each observing KeyFrame's camera center together
    /// with the pyramid level the point was detected at; `reference` is the
    /// reference KeyFrame's entry from the same set.
    pub fn update_normal_and_depth(
        &mut self,
        observers: &[(Vector3<f64>, i32)],
        reference: (Vector3<f64>, i32),
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;
        for (center, _) in observers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n > 0 {
            let norm = normal_sum.norm();
            if norm > 1e-10 {
                self.normal = normal_sum / norm;
            }
        }

        let (ref_center, ref_level) = reference;
        let dist = (self.position - ref_center).norm();
        let level_factor = level_scale(ref_level);
        self.max_distance = dist * level_factor;
        self.min_distance = self.max_distance / level_scale(N_LEVELS - 1);
    }

    /// Pick the observation descriptor with the least median distance to the
    /// other observation descriptors.
    pub fn compute_distinctive_descriptor(&mut self, candidates: &[Descriptor]) {
        if candidates.is_empty() {
            return;
        }
        let n = candidates.len();
        let mut best_median = u32::MAX;
        let mut best_idx = 0;
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n)
                .map(|j| descriptor_distance(&candidates[i], &candidates[j]))
                .collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }
        self.descriptor = candidates[best_idx];
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
