//! Map module - Core SLAM map data structures.
//!
//! This module contains:
//! - [`KeyFrame`] - Selected frames with poses and feature observations
//! - [`MapPoint`] - 3D landmarks observed by KeyFrames
//! - [`Map`] - Container managing KeyFrames, MapPoints, and their relationships
//! - [`PlaceRecognitionIndex`] - Inverted word index for loop and relocalization queries
//! - [`persistence`] - Versioned binary snapshots
//!
//! # Architecture
//!
//! The map forms a bipartite graph structure:
//! - KeyFrames observe MapPoints (KF → MP via per-feature slots)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! KeyFrames also maintain two graph structures:
//! - **Covisibility Graph**: Edges weighted by shared MapPoint count
//! - **Spanning Tree**: Minimal connected structure for loop closure
//!
//! # Example
//!
//! ```ignore
//! use vslam_pipeline::map::Map;
//!
//! let mut map = Map::new();
//! let kf_id = map.create_keyframe(data);
//! let mp_id = map.create_map_point(position, descriptor, kf_id);
//!
//! // Bidirectional association
//! map.associate(kf_id, feature_idx, mp_id);
//! map.update_connections(kf_id);
//!
//! let local_kfs = map.get_local_keyframes(kf_id, 10);
//! ```

pub mod keyframe;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod persistence;
pub mod place_recognition;
pub mod types;

pub use keyframe::{KeyFrame, KeyFrameData};
pub use map::{Map, COVISIBILITY_THRESHOLD};
pub use map_point::MapPoint;
pub use place_recognition::PlaceRecognitionIndex;
pub use types::{KeyFrameId, MapPointId};
