//! Error types for the SLAM pipeline.
//!
//! Per-frame tracking failures are not errors: they surface as `Ok(None)`
//! from the tracking entry points.

use crate::config::Sensor;
use crate::vocabulary::VocabularyError;

/// Result type alias
pub type Result<T> = std::result::Result<T, SlamError>;

#[derive(Debug, thiserror::Error)]
pub enum SlamError {
    /// Vocabulary could not be read or parsed
    #[error("Vocabulary error: {0}")]
    Vocabulary(#[from] VocabularyError),

    /// Settings file missing, malformed or inconsistent
    #[error("Settings error: {0}")]
    Settings(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted map is corrupt or has an incompatible version
    #[error("Map format error: {0}")]
    MapFormat(String),

    /// Entry point does not match the sensor chosen at construction
    #[error("Sensor mismatch: system runs {expected}, call requires {got}")]
    SensorMismatch { expected: Sensor, got: Sensor },

    /// Operation that the configured sensor cannot support
    #[error("{operation} is not available for {sensor} input")]
    UnsupportedSensor { operation: &'static str, sensor: Sensor },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A worker thread could not be started
    #[error("Thread spawn failed: {0}")]
    ThreadSpawn(String),
}

impl From<bincode::Error> for SlamError {
    fn from(e: bincode::Error) -> Self {
        SlamError::Serialization(e.to_string())
    }
}

impl From<csv::Error> for SlamError {
    fn from(e: csv::Error) -> Self {
        SlamError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for SlamError {
    fn from(e: serde_yaml::Error) -> Self {
        SlamError::Settings(e.to_string())
    }
}
