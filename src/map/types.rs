//! Identifier types for map entities.
//!
//! Keyframes and map points live in id-indexed arenas inside [`super::Map`];
//! everything else (tracker, optimizers, place recognition, messages) holds
//! these ids and re-resolves them after taking the map lock.

use serde::{Deserialize, Serialize};

/// Unique identifier for a KeyFrame within a Map.
///
/// Ids are assigned sequentially and never reused, so ordering by id is
/// ordering by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a MapPoint within a Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}
