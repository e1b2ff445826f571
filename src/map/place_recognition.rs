//! PlaceRecognitionIndex - inverted index from visual word to keyframes.
//!
//! Candidate retrieval follows the DBoW2 keyframe database: count shared
//! words, keep keyframes close to the best count, score them, then
//! accumulate scores over covisibility groups so that a single lucky
//! keyframe does not win over a consistently similar neighborhood.

use std::collections::{HashMap, HashSet};

use crate::vocabulary::{BowVector, OrbVocabulary};

use super::types::KeyFrameId;
use super::Map;

/// Neighbors used to accumulate a candidate's group score.
const GROUP_SIZE: usize = 10;

/// Keyframes retained relative to the best shared-word count.
const COMMON_WORDS_RATIO: f64 = 0.8;

/// Groups retained relative to the best accumulated score.
const GROUP_SCORE_RATIO: f64 = 0.75;

#[derive(Debug, Default)]
pub struct PlaceRecognitionIndex {
    /// word_id -> keyframes containing it.
    inverted: HashMap<u32, HashSet<KeyFrameId>>,

    /// Registered keyframes and their BoW vectors.
    entries: HashMap<KeyFrameId, BowVector>,
}

impl PlaceRecognitionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the keyframe into every word bucket it contributes to.
    /// Re-adding a keyframe replaces its previous entry.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        if self.entries.contains_key(&kf_id) {
            self.erase(kf_id);
        }
        for &word in bow.keys() {
            self.inverted.entry(word).or_default().insert(kf_id);
        }
        self.entries.insert(kf_id, bow.clone());
    }

    /// Remove the keyframe from all buckets; empty buckets are dropped.
    pub fn erase(&mut self, kf_id: KeyFrameId) {
        let Some(bow) = self.entries.remove(&kf_id) else {
            return;
        };
        for word in bow.keys() {
            if let Some(bucket) = self.inverted.get_mut(word) {
                bucket.remove(&kf_id);
                if bucket.is_empty() {
                    self.inverted.remove(word);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.inverted.clear();
        self.entries.clear();
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.entries.contains_key(&kf_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_words(&self) -> usize {
        self.inverted.len()
    }

    /// Whether any bucket still references `kf_id`.
    pub fn references(&self, kf_id: KeyFrameId) -> bool {
        self.inverted.values().any(|bucket| bucket.contains(&kf_id))
    }

    /// Rebuild from every keyframe currently in the map.
    pub fn rebuild(&mut self, map: &Map) {
        self.clear();
        for kf in map.keyframes() {
            self.add(kf.id, &kf.bow_vector);
        }
    }

    /// Loop candidates for `kf_id`, best first. Members of `exclude` are
    /// never returned.
    pub fn detect_loop_candidates(
        &self,
        map: &Map,
        kf_id: KeyFrameId,
        exclude: &HashSet<KeyFrameId>,
        min_common_words: usize,
        min_score: f64,
    ) -> Vec<KeyFrameId> {
        let Some(query) = self.entries.get(&kf_id) else {
            return Vec::new();
        };
        self.retrieve(map, query, Some((kf_id, exclude)), min_common_words, Some(min_score))
    }

    /// Relocalization candidates for a frame with no local context.
    pub fn detect_relocalization_candidates(&self, map: &Map, bow: &BowVector) -> Vec<KeyFrameId> {
        self.retrieve(map, bow, None, 0, None)
    }

    fn retrieve(
        &self,
        map: &Map,
        query: &BowVector,
        exclusion: Option<(KeyFrameId, &HashSet<KeyFrameId>)>,
        min_common_words: usize,
        min_score: Option<f64>,
    ) -> Vec<KeyFrameId> {
        let is_excluded = |id: &KeyFrameId| {
            exclusion.is_some_and(|(query_id, exclude)| *id == query_id || exclude.contains(id))
        };

        // 1. Shared-word counts.
        let mut common: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in query.keys() {
            let Some(bucket) = self.inverted.get(word) else {
                continue;
            };
            for id in bucket {
                if !is_excluded(id) {
                    *common.entry(*id).or_insert(0) += 1;
                }
            }
        }
        let Some(&max_common) = common.values().max() else {
            return Vec::new();
        };
        let threshold = ((COMMON_WORDS_RATIO * max_common as f64) as usize).max(min_common_words);

        // 2. Score survivors.
        let mut scores: HashMap<KeyFrameId, f64> = HashMap::new();
        for (id, count) in common {
            if count < threshold {
                continue;
            }
            let Some(bow) = self.entries.get(&id) else {
                continue;
            };
            let score = OrbVocabulary::score(query, bow);
            if min_score.map_or(true, |min| score >= min) {
                scores.insert(id, score);
            }
        }
        if scores.is_empty() {
            return Vec::new();
        }

        // 3. Accumulate over covisibility groups.
        let mut groups: Vec<(KeyFrameId, f64)> = Vec::with_capacity(scores.len());
        for (&id, &score) in &scores {
            let mut best_id = id;
            let mut best_score = score;
            let mut acc = score;
            if let Some(kf) = map.get_keyframe(id) {
                for neighbor in kf.get_best_covisibles(GROUP_SIZE) {
                    if let Some(&s) = scores.get(&neighbor) {
                        acc += s;
                        if s > best_score {
                            best_score = s;
                            best_id = neighbor;
                        }
                    }
                }
            }
            groups.push((best_id, acc));
        }

        let best_acc = groups.iter().map(|(_, acc)| *acc).fold(0.0, f64::max);
        let min_acc = GROUP_SCORE_RATIO * best_acc;

        groups.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut seen = HashSet::new();
        groups
            .into_iter()
            .filter(|(id, acc)| *acc >= min_acc && !is_excluded(id))
            .filter_map(|(id, _)| seen.insert(id).then_some(id))
            .collect()
    }
}
