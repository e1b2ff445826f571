//! Loop detection using Bag-of-Words with temporal consistency checking.
//!
//! This module implements the first stage of loop closing: detecting potential
//! loop candidates based on visual similarity (BoW) and keeping only those
//! that are detected again by the following keyframes.

use std::collections::HashSet;

use tracing::debug;

use crate::config::LoopClosingSection;
use crate::map::{KeyFrameId, Map, PlaceRecognitionIndex};
use crate::vocabulary::OrbVocabulary;

/// Configuration for loop detection.
#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// No detection while the map has fewer keyframes than this.
    pub min_keyframes: usize,
    /// Keyframes (by id) that must pass after a closed loop.
    pub min_keyframes_since_loop: u64,
    /// Consecutive detections needed to accept a candidate.
    pub consistency_threshold: usize,
    /// Absolute floor on shared words for a candidate.
    pub min_common_words: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            min_keyframes: 10,
            min_keyframes_since_loop: 10,
            consistency_threshold: 3,
            min_common_words: 10,
        }
    }
}

impl LoopDetectorConfig {
    pub fn from_settings(section: &LoopClosingSection) -> Self {
        Self {
            min_keyframes: section.min_keyframes,
            min_keyframes_since_loop: section.min_keyframes_since_loop as u64,
            consistency_threshold: section.consistency_threshold,
            min_common_words: section.min_common_words,
        }
    }
}

/// A candidate returned by the index together with its covisibility group.
#[derive(Debug, Clone)]
pub struct LoopCandidate {
    pub loop_kf_id: KeyFrameId,
    /// The candidate and its covisible keyframes.
    pub group: HashSet<KeyFrameId>,
}

#[derive(Debug, Clone)]
struct ConsistentGroup {
    members: HashSet<KeyFrameId>,
    consistency: usize,
}

/// Tracks temporal consistency of loop detections.
///
/// Each candidate expands to a group (candidate plus covisibles). A group is
/// consistent with a group of the previous keyframe when the two share a
/// member; its counter then continues from the previous one. A candidate is
/// accepted once its counter reaches the threshold.
pub struct ConsistencyChecker {
    threshold: usize,
    groups: Vec<ConsistentGroup>,
}

impl ConsistencyChecker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            groups: Vec::new(),
        }
    }

    /// Feed the candidates of one keyframe. Returns the accepted ones.
    pub fn check(&mut self, candidates: &[LoopCandidate]) -> Vec<KeyFrameId> {
        let mut accepted = Vec::new();
        let mut current: Vec<ConsistentGroup> = Vec::new();
        let mut previous_used = vec![false; self.groups.len()];

        for candidate in candidates {
            let mut enough = false;
            let mut consistent_for_some = false;

            for (i, previous) in self.groups.iter().enumerate() {
                if previous.members.is_disjoint(&candidate.group) {
                    continue;
                }
                consistent_for_some = true;
                let consistency = previous.consistency + 1;
                if !previous_used[i] {
                    current.push(ConsistentGroup {
                        members: candidate.group.clone(),
                        consistency,
                    });
                    previous_used[i] = true;
                }
                if consistency >= self.threshold && !enough {
                    accepted.push(candidate.loop_kf_id);
                    enough = true;
                }
            }

            if !consistent_for_some {
                current.push(ConsistentGroup {
                    members: candidate.group.clone(),
                    consistency: 0,
                });
            }
        }

        self.groups = current;
        accepted
    }

    /// Number of groups carried to the next keyframe.
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// Loop detection state kept by the loop closer between keyframes.
pub struct LoopDetector {
    config: LoopDetectorConfig,
    checker: ConsistencyChecker,
    last_loop_kf_id: Option<KeyFrameId>,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        let checker = ConsistencyChecker::new(config.consistency_threshold);
        Self {
            config,
            checker,
            last_loop_kf_id: None,
        }
    }

    /// Detect consistent loop candidates for `kf_id`.
    pub fn detect(&mut self, map: &Map, index: &PlaceRecognitionIndex, kf_id: KeyFrameId) -> Vec<KeyFrameId> {
        if map.num_keyframes() < self.config.min_keyframes {
            return Vec::new();
        }
        if let Some(last) = self.last_loop_kf_id {
            if kf_id.0 < last.0 + self.config.min_keyframes_since_loop {
                return Vec::new();
            }
        }

        let candidates = detect_loop_candidates(map, index, kf_id, self.config.min_common_words);
        if candidates.is_empty() {
            self.checker.clear();
            return Vec::new();
        }
        debug!("[LoopDetector] {}: {} raw candidates", kf_id, candidates.len());

        self.checker.check(&candidates)
    }

    /// Remember the keyframe that closed a loop.
    pub fn mark_loop_closed(&mut self, kf_id: KeyFrameId) {
        self.last_loop_kf_id = Some(kf_id);
        self.checker.clear();
    }

    pub fn reset(&mut self) {
        self.last_loop_kf_id = None;
        self.checker.clear();
    }
}

/// Query the index for loop candidates of `kf_id`.
///
/// 1. The minimum score is the lowest BoW score against covisible keyframes
/// 2. Covisible keyframes and `kf_id` itself are excluded
/// 3. Each returned candidate carries its covisibility group
pub fn detect_loop_candidates(
    map: &Map,
    index: &PlaceRecognitionIndex,
    kf_id: KeyFrameId,
    min_common_words: usize,
) -> Vec<LoopCandidate> {
    let Some(kf) = map.get_keyframe(kf_id) else {
        return Vec::new();
    };

    let mut exclude: HashSet<KeyFrameId> = kf.ordered_covisibles().collect();
    exclude.insert(kf_id);

    let min_score = kf
        .ordered_covisibles()
        .filter_map(|id| map.get_keyframe(id))
        .filter(|other| !other.is_bad)
        .map(|other| OrbVocabulary::score(&kf.bow_vector, &other.bow_vector))
        .fold(1.0_f64, f64::min);

    index
        .detect_loop_candidates(map, kf_id, &exclude, min_common_words, min_score)
        .into_iter()
        .filter_map(|id| {
            let candidate = map.get_keyframe(id)?;
            let mut group: HashSet<KeyFrameId> = candidate.ordered_covisibles().collect();
            group.insert(id);
            Some(LoopCandidate { loop_kf_id: id, group })
        })
        .collect()
}
