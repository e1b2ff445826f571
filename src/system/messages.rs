//! Inter-thread message types.
//!
//! These types are sent between threads via channels to coordinate
//! SLAM processing.

use crate::map::{KeyFrameData, KeyFrameId, MapPointId};

/// Message sent from Tracking to Local Mapping when a new keyframe is needed.
#[derive(Debug)]
pub enum NewKeyFrameMsg {
    /// A keyframe built by Tracking. Local Mapping inserts it into the map,
    /// associates `matched_map_points` and triangulates new points.
    Create {
        data: Box<KeyFrameData>,
        /// `matched_map_points[i] = Some(mp_id)` if feature i was tracked
        /// to an existing map point (outliers already removed).
        matched_map_points: Vec<Option<MapPointId>>,
    },

    /// A keyframe already inserted by map initialization. Its observations
    /// are in place; covisibility and indexing are still missing.
    Inserted(KeyFrameId),
}

impl NewKeyFrameMsg {
    pub fn create(data: KeyFrameData, matched_map_points: Vec<Option<MapPointId>>) -> Self {
        Self::Create {
            data: Box::new(data),
            matched_map_points,
        }
    }
}
