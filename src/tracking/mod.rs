//! Tracking: estimates the camera pose of every incoming frame against the
//! shared map and decides when a frame becomes a keyframe.
//!
//! - Map initialization (stereo/RGB-D single frame, monocular two-view)
//! - Motion-model and reference-keyframe tracking
//! - Local map tracking (projection-based search)
//! - Relocalization through the place recognition index
//! - New KeyFrame decision

pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod matching;
pub mod motion_model;
pub mod result;
pub mod state;
pub mod tracker;
pub mod tracking_frame;

pub use result::{TrackingMetrics, TrackingResult};
pub use state::TrackingState;
pub use tracker::{FrameRecord, Tracker};
pub use tracking_frame::{FeatureGrid, Frame};
