//! Velocity-based motion model for pose prediction.

use crate::geometry::SE3;

/// Constant velocity motion model.
///
/// The velocity is the relative motion between the last two tracked frames,
/// `V = T_cw(k) * T_wc(k-1)`, so the prediction for frame k+1 is
/// `T_cw(k+1) = V * T_cw(k)`.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    /// Previous pose (T_wc).
    prev_pose: Option<SE3>,
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the model with a new tracked pose (T_wc).
    pub fn update(&mut self, pose_wc: &SE3) {
        if let Some(prev) = &self.prev_pose {
            self.velocity = Some(pose_wc.inverse().compose(prev));
        }
        self.prev_pose = Some(pose_wc.clone());
    }

    /// Replace the last pose without touching the velocity, e.g. after the
    /// map under the last frame was corrected.
    pub fn set_last_pose(&mut self, pose_wc: &SE3) {
        self.prev_pose = Some(pose_wc.clone());
    }

    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    /// Predicted T_wc of the next frame.
    pub fn predict(&self) -> Option<SE3> {
        let prev = self.prev_pose.as_ref()?;
        let velocity = self.velocity.as_ref()?;
        Some(velocity.compose(&prev.inverse()).inverse())
    }

    /// Forget the velocity (tracking lost, relocalized or reset).
    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.velocity = None;
    }
}
