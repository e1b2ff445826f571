//! Tracking results and diagnostics structures.
//!
//! These types describe what happened during processing of a single frame:
//! the high level tracking state, the pose estimate and correspondence
//! counts.

use nalgebra::Matrix4;

use crate::geometry::SE3;
use crate::map::KeyFrameId;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub state: TrackingState,
    /// Estimated T_wc; `None` when no valid pose was found for this frame.
    pub pose: Option<SE3>,
    pub reference_kf_id: Option<KeyFrameId>,
    pub metrics: TrackingMetrics,
    /// A keyframe message was queued for Local Mapping.
    pub keyframe_sent: bool,
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingMetrics {
    pub n_features: usize,
    pub n_map_point_matches: usize,
    pub n_inliers: usize,
}

impl TrackingResult {
    /// Homogeneous camera-from-world transform (`T_cw`).
    pub fn pose_cw_matrix(&self) -> Option<Matrix4<f64>> {
        self.pose.as_ref().map(|pose| pose.inverse().to_matrix())
    }

    pub fn is_ok(&self) -> bool {
        self.state == TrackingState::Ok && self.pose.is_some()
    }
}
