//! Deferred commands, applied by the tracking thread at the next frame
//! boundary.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    /// Stop local mapping and track against the existing map only.
    ActivateLocalizationMode,
    /// Release local mapping and resume keyframe creation.
    DeactivateLocalizationMode,
    /// Clear the map and start over.
    Reset,
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemCommand::ActivateLocalizationMode => write!(f, "activate localization mode"),
            SystemCommand::DeactivateLocalizationMode => write!(f, "deactivate localization mode"),
            SystemCommand::Reset => write!(f, "reset"),
        }
    }
}
