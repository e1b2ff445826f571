//! ORB Vocabulary for Bag-of-Words place recognition.
//!
//! Loads a DBoW2-format vocabulary tree and quantizes binary descriptors into
//! visual words. The vocabulary is read-only once loaded and is shared by the
//! tracker, the local mapper and the loop closer behind an `Arc`.
//!
//! # Key Types
//!
//! - [`BowVector`]: word id -> L1-normalized TF-IDF weight (place recognition)
//! - [`FeatureVector`]: tree node -> feature indices (accelerated matching)
//! - [`OrbVocabulary`]: the tree with its quantization methods

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::tracking::frame::{descriptor_distance, Descriptor};

/// Bag-of-Words vector: word_id -> TF-IDF weight, L1-normalized.
pub type BowVector = HashMap<u32, f64>;

/// Feature vector: node_id -> indices of the features under that node.
///
/// Only features sharing a node are compared by BoW-guided matching.
pub type FeatureVector = HashMap<u32, Vec<usize>>;

/// Tree levels above the leaves used for [`FeatureVector`] grouping.
pub const FEATURE_VECTOR_LEVELS_UP: usize = 4;

const ROOT_PARENT: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct VocabNode {
    parent: u32,
    children: Vec<u32>,
    descriptor: Descriptor,
    weight: f64,
    word_id: Option<u32>,
    depth: usize,
}

impl VocabNode {
    fn new(parent: u32, depth: usize) -> Self {
        Self {
            parent,
            children: Vec::new(),
            descriptor: [0u8; 32],
            weight: 0.0,
            word_id: None,
            depth,
        }
    }
}

/// ORB Vocabulary tree (DBoW2 text format).
#[derive(Debug)]
pub struct OrbVocabulary {
    /// All nodes in the tree (nodes[0] is root)
    nodes: Vec<VocabNode>,
    /// Word id -> node id
    words: Vec<u32>,
    /// Branching factor
    k: usize,
    /// Depth levels
    l: usize,
}

impl OrbVocabulary {
    /// Load vocabulary from a DBoW2 text file.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] desc[1] ... desc[31] weight
    /// ...
    /// ```
    ///
    /// One line per node excluding the root; `parent_id` 0 is the root.
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let file = File::open(path.as_ref()).map_err(|e| {
            VocabularyError::Io(format!(
                "Failed to open vocabulary file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse a DBoW2 text vocabulary from any buffered reader.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, VocabularyError> {
        let mut lines = reader.lines();

        let header = lines
            .next()
            .ok_or_else(|| VocabularyError::Parse("Empty vocabulary file".to_string()))?
            .map_err(|e| VocabularyError::Io(e.to_string()))?;

        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            return Err(VocabularyError::Parse(
                "Invalid header format, expected: k L [scoring weighting]".to_string(),
            ));
        }

        let k: usize = header_parts[0]
            .parse()
            .map_err(|_| VocabularyError::Parse("Invalid k value".to_string()))?;
        let l: usize = header_parts[1]
            .parse()
            .map_err(|_| VocabularyError::Parse("Invalid L value".to_string()))?;

        let mut nodes = vec![VocabNode::new(ROOT_PARENT, 0)];
        let mut words = Vec::new();

        for (line_num, line_result) in lines.enumerate() {
            let line = line_result.map_err(|e| VocabularyError::Io(e.to_string()))?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            // parent + is_leaf + 32 bytes + weight
            if parts.len() < 35 {
                return Err(VocabularyError::Parse(format!(
                    "Truncated node at line {}",
                    line_num + 2
                )));
            }

            let parent_id: u32 = parts[0].parse().map_err(|_| {
                VocabularyError::Parse(format!("Invalid parent_id at line {}", line_num + 2))
            })?;
            if parent_id as usize >= nodes.len() {
                return Err(VocabularyError::Parse(format!(
                    "Unknown parent {} at line {}",
                    parent_id,
                    line_num + 2
                )));
            }
            let is_leaf = parts[1] == "1";

            let mut descriptor = [0u8; 32];
            for (i, byte_str) in parts[2..34].iter().enumerate() {
                descriptor[i] = byte_str.parse().map_err(|_| {
                    VocabularyError::Parse(format!(
                        "Invalid descriptor byte at line {}",
                        line_num + 2
                    ))
                })?;
            }

            let weight: f64 = parts[34].parse().map_err(|_| {
                VocabularyError::Parse(format!("Invalid weight at line {}", line_num + 2))
            })?;

            let node_id = nodes.len() as u32;
            let depth = nodes[parent_id as usize].depth + 1;
            let mut node = VocabNode::new(parent_id, depth);
            node.descriptor = descriptor;
            node.weight = weight;

            if is_leaf {
                node.word_id = Some(words.len() as u32);
                words.push(node_id);
            }

            nodes[parent_id as usize].children.push(node_id);
            nodes.push(node);
        }

        if words.is_empty() {
            return Err(VocabularyError::Parse("Vocabulary has no words".to_string()));
        }

        tracing::info!(
            "Loaded vocabulary: k={}, L={}, {} nodes, {} words",
            k,
            l,
            nodes.len(),
            words.len()
        );

        Ok(Self { nodes, words, k, l })
    }

    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Descend to the closest leaf. Returns `(word_id, leaf_node_id)`.
    fn transform_descriptor(&self, desc: &Descriptor) -> (u32, u32) {
        let mut node_id = 0usize;

        while let Some((&first, rest)) = self.nodes[node_id].children.split_first() {
            let mut best_child = first;
            let mut best_dist = descriptor_distance(desc, &self.nodes[first as usize].descriptor);

            for &child in rest {
                let dist = descriptor_distance(desc, &self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best_child = child;
                }
            }

            node_id = best_child as usize;
        }

        let word_id = self.nodes[node_id].word_id.unwrap_or(0);
        (word_id, node_id as u32)
    }

    /// Word id of a single descriptor.
    pub fn word_of(&self, desc: &Descriptor) -> u32 {
        self.transform_descriptor(desc).0
    }

    /// Ancestor of `leaf_id` at tree depth `L - levels_up`.
    ///
    /// The target depth never goes above the root's children, so shallow
    /// vocabularies still split features into groups.
    fn node_at_levels_up(&self, leaf_id: u32, levels_up: usize) -> u32 {
        let target_depth = self.l.saturating_sub(levels_up).max(1);
        let mut node_id = leaf_id;
        while self.nodes[node_id as usize].depth > target_depth {
            let parent = self.nodes[node_id as usize].parent;
            if parent == ROOT_PARENT {
                break;
            }
            node_id = parent;
        }
        node_id
    }

    /// Transform descriptors to a BowVector and a FeatureVector.
    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut feat = FeatureVector::new();

        for (i, desc) in descriptors.iter().enumerate() {
            let (word_id, leaf_id) = self.transform_descriptor(desc);
            *bow.entry(word_id).or_insert(0.0) += self.nodes[leaf_id as usize].weight;

            let group = self.node_at_levels_up(leaf_id, levels_up);
            feat.entry(group).or_default().push(i);
        }

        normalize_l1(&mut bow);
        (bow, feat)
    }

    /// BowVector only, when no FeatureVector is needed.
    pub fn transform_bow_only(&self, descriptors: &[Descriptor]) -> BowVector {
        let mut bow = BowVector::new();
        for desc in descriptors {
            let (word_id, leaf_id) = self.transform_descriptor(desc);
            *bow.entry(word_id).or_insert(0.0) += self.nodes[leaf_id as usize].weight;
        }
        normalize_l1(&mut bow);
        bow
    }

    /// L1 similarity: `1 - 0.5 * ||v1 - v2||_1`, in [0, 1].
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff_sum = 0.0;

        for (word_id, w1) in v1 {
            let w2 = v2.get(word_id).copied().unwrap_or(0.0);
            diff_sum += (w1 - w2).abs();
        }
        for (word_id, w2) in v2 {
            if !v1.contains_key(word_id) {
                diff_sum += w2.abs();
            }
        }

        1.0 - 0.5 * diff_sum
    }
}

impl Default for OrbVocabulary {
    /// A tree with only the root: every descriptor maps to word 0.
    fn default() -> Self {
        Self {
            nodes: vec![VocabNode::new(ROOT_PARENT, 0)],
            words: Vec::new(),
            k: 0,
            l: 0,
        }
    }
}

fn normalize_l1(bow: &mut BowVector) {
    let sum: f64 = bow.values().map(|v| v.abs()).sum();
    if sum > 0.0 {
        for v in bow.values_mut() {
            *v /= sum;
        }
    }
}

/// Errors that can occur when loading or using vocabulary.
#[derive(Debug)]
pub enum VocabularyError {
    /// I/O error reading vocabulary file
    Io(String),
    /// Parse error in vocabulary format
    Parse(String),
}

impl std::fmt::Display for VocabularyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VocabularyError::Io(msg) => write!(f, "Vocabulary I/O error: {}", msg),
            VocabularyError::Parse(msg) => write!(f, "Vocabulary parse error: {}", msg),
        }
    }
}

impl std::error::Error for VocabularyError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc_line(parent: u32, leaf: bool, fill: u8, weight: f64) -> String {
        let bytes: Vec<String> = std::iter::repeat(fill.to_string()).take(32).collect();
        format!("{} {} {} {}", parent, u8::from(leaf), bytes.join(" "), weight)
    }

    /// Two branches (fill 0x00 and 0xFF), two leaves each.
    fn two_level_vocab() -> OrbVocabulary {
        let lines = [
            "2 2 0 0".to_string(),
            desc_line(0, false, 0x00, 0.0),
            desc_line(0, false, 0xFF, 0.0),
            desc_line(1, true, 0x01, 1.0),
            desc_line(1, true, 0x03, 2.0),
            desc_line(2, true, 0xFE, 1.0),
            desc_line(2, true, 0xFC, 1.0),
        ];
        OrbVocabulary::from_reader(lines.join("\n").as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_tree() {
        let vocab = two_level_vocab();
        assert_eq!(vocab.params(), (2, 2));
        assert_eq!(vocab.num_nodes(), 7);
        assert_eq!(vocab.num_words(), 4);
    }

    #[test]
    fn test_descriptor_quantization() {
        let vocab = two_level_vocab();
        assert_eq!(vocab.word_of(&[0x01; 32]), 0);
        assert_eq!(vocab.word_of(&[0x03; 32]), 1);
        assert_eq!(vocab.word_of(&[0xFC; 32]), 3);
    }

    #[test]
    fn test_transform_groups_and_normalizes() {
        let vocab = two_level_vocab();
        let descs = [[0x01; 32], [0x03; 32], [0xFE; 32]];
        let (bow, feat) = vocab.transform(&descs, FEATURE_VECTOR_LEVELS_UP);

        let total: f64 = bow.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!((bow[&1] - 0.5).abs() < 1e-12);

        // Grouped under the two depth-1 branch nodes.
        assert_eq!(feat.len(), 2);
        assert_eq!(feat[&1], vec![0, 1]);
        assert_eq!(feat[&2], vec![2]);
    }

    #[test]
    fn test_bow_score() {
        let mut v1 = BowVector::new();
        v1.insert(0, 0.5);
        v1.insert(1, 0.5);
        assert!((OrbVocabulary::score(&v1, &v1) - 1.0).abs() < 1e-10);

        let mut v3 = BowVector::new();
        v3.insert(2, 0.5);
        v3.insert(3, 0.5);
        assert!(OrbVocabulary::score(&v1, &v3) < 0.01);
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(
            OrbVocabulary::from_reader("".as_bytes()),
            Err(VocabularyError::Parse(_))
        ));
        assert!(matches!(
            OrbVocabulary::from_reader("10 6 0 0\n0 1 12 13".as_bytes()),
            Err(VocabularyError::Parse(_))
        ));
        assert!(matches!(
            OrbVocabulary::load_from_text("/nonexistent/voc.txt"),
            Err(VocabularyError::Io(_))
        ));
    }
}
