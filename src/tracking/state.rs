//! Tracking state machine.

use std::fmt;

/// State of the tracking thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No frame has been processed since construction or reset.
    #[default]
    NoImagesYet,
    /// Waiting for enough features to build the initial map.
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Tracking failed, relocalization is attempted on every frame.
    Lost,
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackingState::NoImagesYet => "NO_IMAGES_YET",
            TrackingState::NotInitialized => "NOT_INITIALIZED",
            TrackingState::Ok => "OK",
            TrackingState::Lost => "LOST",
        };
        f.write_str(name)
    }
}
