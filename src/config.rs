//! Settings loaded from YAML: camera calibration plus per-stage thresholds.
//!
//! Only `camera` is mandatory; every other section falls back to its
//! `Default` when omitted.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};
use crate::tracking::frame::CameraModel;

/// Input modality, fixed when the system is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensor {
    Monocular,
    Stereo,
    Rgbd,
}

impl Sensor {
    pub fn is_monocular(self) -> bool {
        matches!(self, Sensor::Monocular)
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sensor::Monocular => write!(f, "monocular"),
            Sensor::Stereo => write!(f, "stereo"),
            Sensor::Rgbd => write!(f, "RGB-D"),
        }
    }
}

/// Full settings file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub camera: CameraSection,

    #[serde(default)]
    pub tracker: TrackerSection,

    #[serde(default)]
    pub local_mapping: LocalMappingSection,

    #[serde(default)]
    pub loop_closing: LoopClosingSection,

    #[serde(default)]
    pub map: MapSection,
}

/// Pinhole calibration of the (left) camera.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraSection {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Stereo baseline times fx. Required for stereo and RGB-D.
    #[serde(default)]
    pub bf: f64,
    /// Raw depth value divided by this gives meters (RGB-D only).
    #[serde(default = "default_depth_map_factor")]
    pub depth_map_factor: f64,
    /// Close/far threshold in baselines: points farther than
    /// `th_depth * baseline` are not trusted for single-view initialization.
    #[serde(default = "default_th_depth")]
    pub th_depth: f64,
}

fn default_fps() -> f64 {
    30.0
}

fn default_depth_map_factor() -> f64 {
    1.0
}

fn default_th_depth() -> f64 {
    40.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    /// Valid-depth features needed for stereo/RGB-D initialization.
    pub min_init_points: usize,
    /// Tracked landmarks below which tracking is declared lost.
    pub min_tracked_inliers: usize,
    /// Inliers a relocalization candidate must reach.
    pub min_reloc_inliers: usize,
    /// Losing tracking with at most this many keyframes resets the map.
    pub lost_reset_keyframes: usize,
    /// Keyframe decision: tracked/reference ratio (stereo and RGB-D).
    pub ref_ratio: f64,
    /// Keyframe decision: tracked/reference ratio for monocular.
    pub mono_ref_ratio: f64,
    /// Minimum frames between keyframes.
    pub min_frames: usize,
    /// Maximum frames between keyframes; 0 means the camera fps.
    pub max_frames: usize,
    /// Seed for RANSAC sampling. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            min_init_points: 500,
            min_tracked_inliers: 30,
            min_reloc_inliers: 50,
            lost_reset_keyframes: 5,
            ref_ratio: 0.75,
            mono_ref_ratio: 0.9,
            min_frames: 0,
            max_frames: 0,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMappingSection {
    /// Gauss-Newton iterations of local bundle adjustment.
    pub local_ba_iterations: usize,
    /// Fraction of redundant landmarks that makes a keyframe redundant.
    pub redundant_keyframe_ratio: f64,
    /// Recently created landmarks are culled below this found ratio.
    pub recent_found_ratio: f64,
    /// Covisible neighbors searched for new triangulations (stereo/RGB-D).
    pub triangulation_neighbors: usize,
    /// Same, for monocular.
    pub mono_triangulation_neighbors: usize,
    /// Keyframe creation is suppressed while more messages are queued.
    pub max_queue: usize,
}

impl Default for LocalMappingSection {
    fn default() -> Self {
        Self {
            local_ba_iterations: 5,
            redundant_keyframe_ratio: 0.9,
            recent_found_ratio: 0.25,
            triangulation_neighbors: 10,
            mono_triangulation_neighbors: 20,
            max_queue: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosingSection {
    pub enabled: bool,
    /// Map size below which no loop is searched.
    pub min_keyframes: usize,
    /// Keyframes that must pass after a closed loop.
    pub min_keyframes_since_loop: usize,
    /// Consecutive consistent detections needed to accept a loop.
    pub consistency_threshold: usize,
    /// Lower bound on shared words for a candidate.
    pub min_common_words: usize,
    /// BoW matches required to attempt a Sim3 estimate.
    pub min_bow_matches: usize,
    /// Matched landmarks required after guided projection.
    pub min_loop_matches: usize,
    /// Covisibility weight for an edge to join the essential graph.
    pub essential_graph_weight: usize,
    pub pose_graph_iterations: usize,
    pub global_ba_iterations: usize,
}

impl Default for LoopClosingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            min_keyframes: 10,
            min_keyframes_since_loop: 10,
            consistency_threshold: 3,
            min_common_words: 10,
            min_bow_matches: 20,
            min_loop_matches: 40,
            essential_graph_weight: 100,
            pose_graph_iterations: 20,
            global_ba_iterations: 10,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MapSection {
    /// Start from this saved map, in relocalization mode.
    pub load_path: Option<PathBuf>,
    /// Write the map here during shutdown.
    pub save_on_shutdown_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SlamError::Settings(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reject settings that cannot work for the given sensor.
    pub fn validate(&self, sensor: Sensor) -> Result<()> {
        let cam = &self.camera;
        if !(cam.fx > 0.0 && cam.fy > 0.0) {
            return Err(SlamError::Settings(format!(
                "focal lengths must be positive (fx={}, fy={})",
                cam.fx, cam.fy
            )));
        }
        if cam.width == 0 || cam.height == 0 {
            return Err(SlamError::Settings("image size must be non-zero".into()));
        }
        if !cam.fps.is_finite() || cam.fps <= 0.0 {
            return Err(SlamError::Settings(format!("invalid fps {}", cam.fps)));
        }
        if matches!(sensor, Sensor::Stereo | Sensor::Rgbd) && cam.bf <= 0.0 {
            return Err(SlamError::Settings(format!(
                "{} requires a positive camera.bf",
                sensor
            )));
        }
        if sensor == Sensor::Rgbd && cam.depth_map_factor == 0.0 {
            return Err(SlamError::Settings("depth_map_factor must be non-zero".into()));
        }
        Ok(())
    }

    pub fn camera_model(&self) -> CameraModel {
        let c = &self.camera;
        CameraModel {
            fx: c.fx,
            fy: c.fy,
            cx: c.cx,
            cy: c.cy,
            k1: c.k1,
            k2: c.k2,
            p1: c.p1,
            p2: c.p2,
            width: c.width as f64,
            height: c.height as f64,
            bf: c.bf,
        }
    }

    /// Depth beyond which a stereo/RGB-D measurement is considered far.
    pub fn th_depth(&self) -> f64 {
        self.camera.th_depth * self.camera.bf / self.camera.fx
    }

    /// Maximum frames between keyframes after resolving the fps default.
    pub fn max_frames(&self) -> usize {
        if self.tracker.max_frames > 0 {
            self.tracker.max_frames
        } else {
            self.camera.fps.round().max(1.0) as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
camera:
  fx: 435.2
  fy: 435.2
  cx: 367.4
  cy: 252.2
  width: 752
  height: 480
  bf: 47.9
"#;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let settings = Settings::from_yaml(MINIMAL).unwrap();

        assert_eq!(settings.tracker.min_init_points, 500);
        assert_eq!(settings.loop_closing.consistency_threshold, 3);
        assert_eq!(settings.local_mapping.max_queue, 3);
        assert!(settings.map.load_path.is_none());
        assert_eq!(settings.max_frames(), 30);
        settings.validate(Sensor::Stereo).unwrap();
    }

    #[test]
    fn test_partial_section_override() {
        let yaml = format!("{MINIMAL}tracker:\n  min_init_points: 100\n  seed: 7\n");
        let settings = Settings::from_yaml(&yaml).unwrap();

        assert_eq!(settings.tracker.min_init_points, 100);
        assert_eq!(settings.tracker.seed, Some(7));
        assert_eq!(settings.tracker.min_tracked_inliers, 30);
    }

    #[test]
    fn test_missing_camera_is_error() {
        let err = Settings::from_yaml("tracker:\n  min_init_points: 10\n").unwrap_err();
        assert!(matches!(err, SlamError::Settings(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::from_yaml(MINIMAL).unwrap();
        settings.camera.bf = 0.0;
        assert!(settings.validate(Sensor::Monocular).is_ok());
        assert!(settings.validate(Sensor::Stereo).is_err());

        settings.camera.fx = -1.0;
        assert!(settings.validate(Sensor::Monocular).is_err());

        let mut settings = Settings::from_yaml(MINIMAL).unwrap();
        settings.camera.width = 0;
        assert!(settings.validate(Sensor::Stereo).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Settings::load(Path::new("/nonexistent/settings.yaml")).unwrap_err();
        assert!(matches!(err, SlamError::Settings(_)));
    }
}
