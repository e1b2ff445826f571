//! Map initialization from the first frames.
//!
//! Stereo and RGB-D build the map from a single frame: every feature with a
//! valid depth becomes a map point. Monocular needs two views with enough
//! parallax; the relative motion comes from a RANSAC essential matrix and
//! the map is scaled so the first keyframe's median depth is 1.
//!
//! The keyframes are inserted without covisibility connections; Local
//! Mapping computes those when it ingests them.

use nalgebra::Vector2;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::geometry::{reconstruct_two_view, TwoViewConfig, SE3};
use crate::map::{KeyFrameId, Map};
use crate::optimizer::{apply_global_ba, collect_global_ba, solve_global_ba, GlobalBAConfig};
use crate::tracking::frame::CameraModel;
use crate::tracking::matching::search_for_initialization;
use crate::tracking::Frame;

/// Features a monocular frame needs to take part in initialization.
const MIN_MONO_FEATURES: usize = 100;

/// Matches and tracked points needed to accept a monocular map.
const MIN_MONO_MATCHES: usize = 100;

/// Search window around the last matched position, in pixels.
const INIT_WINDOW: f64 = 100.0;

const INIT_NN_RATIO: f64 = 0.9;

/// Bundle adjustment iterations run on the two-view map before scaling.
const INIT_BA_ITERATIONS: usize = 20;

/// Build the map from a single stereo/RGB-D frame.
///
/// On success the frame's pose is the identity and its matches point at the
/// new map points. Returns `None` (and leaves the map untouched) with fewer
/// than `min_points` valid depths.
pub fn initialize_stereo(map: &mut Map, frame: &mut Frame, min_points: usize) -> Option<KeyFrameId> {
    let n_depths = frame.num_valid_depths();
    if n_depths < min_points {
        debug!(
            "[Init] {} features with depth, {} needed",
            n_depths, min_points
        );
        return None;
    }

    frame.pose = Some(SE3::identity());
    let pose_wc = SE3::identity();
    let kf_id = map.create_keyframe(frame.to_keyframe_data()?);

    for (idx, p_cam) in frame.points_cam.iter().enumerate() {
        let Some(p_cam) = p_cam else { continue };
        let mp_id = map.create_map_point(
            pose_wc.transform_point(p_cam),
            frame.features.descriptors[idx],
            kf_id,
        );
        map.associate(kf_id, idx, mp_id);
        map.update_map_point_normal_and_depth(mp_id);
        frame.map_point_matches[idx] = Some(mp_id);
    }

    info!(
        "[Init] Stereo map created: {} with {} map points",
        kf_id,
        map.num_map_points()
    );
    Some(kf_id)
}

/// Outcome of feeding one frame to the monocular initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonoInitOutcome {
    /// The frame became the new reference.
    ReferenceSet,
    /// Too few features or matches; the reference was dropped.
    Restart,
    /// Matches were found but the reconstruction was rejected.
    Failed,
    /// Both keyframes are in the map.
    Initialized { first: KeyFrameId, second: KeyFrameId },
}

/// Two-view initializer for monocular tracking.
#[derive(Debug, Default)]
pub struct MonocularInitializer {
    reference: Option<Frame>,
    /// Last matched position of every reference feature.
    prev_positions: Vec<Vector2<f64>>,
    config: TwoViewConfig,
}

impl MonocularInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.prev_positions.clear();
    }

    /// Feed one frame. On [`MonoInitOutcome::Initialized`] the map holds two
    /// keyframes and `current` carries the pose and matches of the second.
    pub fn process(
        &mut self,
        map: &mut Map,
        current: &mut Frame,
        camera: &CameraModel,
        rng: &mut StdRng,
    ) -> MonoInitOutcome {
        let Some(reference) = self.reference.as_ref() else {
            if current.num_features() > MIN_MONO_FEATURES {
                self.prev_positions = current
                    .keypoints()
                    .iter()
                    .map(|kp| Vector2::new(kp.x, kp.y))
                    .collect();
                self.reference = Some(current.clone());
                return MonoInitOutcome::ReferenceSet;
            }
            return MonoInitOutcome::Restart;
        };

        if current.num_features() <= MIN_MONO_FEATURES {
            self.reset();
            return MonoInitOutcome::Restart;
        }

        let (matches, n_matches) = search_for_initialization(
            reference,
            current,
            &mut self.prev_positions,
            INIT_WINDOW,
            INIT_NN_RATIO,
        );
        if n_matches < MIN_MONO_MATCHES {
            debug!("[Init] {} initialization matches, restarting", n_matches);
            self.reset();
            return MonoInitOutcome::Restart;
        }

        let pairs: Vec<(usize, usize)> = matches
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect();
        let pixels1: Vec<Vector2<f64>> = pairs
            .iter()
            .map(|&(i1, _)| {
                let kp = &reference.features.keypoints[i1];
                Vector2::new(kp.x, kp.y)
            })
            .collect();
        let pixels2: Vec<Vector2<f64>> = pairs
            .iter()
            .map(|&(_, i2)| {
                let kp = &current.features.keypoints[i2];
                Vector2::new(kp.x, kp.y)
            })
            .collect();

        let Some(two_view) = reconstruct_two_view(&pixels1, &pixels2, camera, &self.config, rng) else {
            return MonoInitOutcome::Failed;
        };

        let Some(reference) = self.reference.take() else {
            return MonoInitOutcome::Failed;
        };
        let triangulated: Vec<(usize, usize, nalgebra::Vector3<f64>)> = pairs
            .iter()
            .zip(two_view.points.iter())
            .filter_map(|(&(i1, i2), p)| p.map(|p| (i1, i2, p)))
            .collect();

        match create_monocular_map(map, reference, current, &two_view.pose_21, &triangulated, camera) {
            Some((first, second)) => {
                self.reset();
                MonoInitOutcome::Initialized { first, second }
            }
            None => {
                self.reset();
                MonoInitOutcome::Restart
            }
        }
    }
}

/// Insert both keyframes and the triangulated points, refine them and fix
/// the scale. The map is cleared again if the result is degenerate.
fn create_monocular_map(
    map: &mut Map,
    mut reference: Frame,
    current: &mut Frame,
    pose_21: &SE3,
    triangulated: &[(usize, usize, nalgebra::Vector3<f64>)],
    camera: &CameraModel,
) -> Option<(KeyFrameId, KeyFrameId)> {
    reference.pose = Some(SE3::identity());
    current.pose = Some(pose_21.inverse());
    current.clear_matches();

    let first = map.create_keyframe(reference.to_keyframe_data()?);
    let second = map.create_keyframe(current.to_keyframe_data()?);

    for &(i1, i2, p) in triangulated {
        let mp_id = map.create_map_point(p, reference.features.descriptors[i1], first);
        map.associate(first, i1, mp_id);
        map.associate(second, i2, mp_id);
        map.compute_distinctive_descriptor(mp_id);
        map.update_map_point_normal_and_depth(mp_id);
        current.map_point_matches[i2] = Some(mp_id);
    }

    if let Some(mut snapshot) = collect_global_ba(map, camera) {
        let config = GlobalBAConfig {
            max_iterations: INIT_BA_ITERATIONS,
            ..GlobalBAConfig::default()
        };
        solve_global_ba(&mut snapshot, camera, &config, &|| false);
        apply_global_ba(map, &snapshot);
    }

    let tracked = map
        .get_keyframe(second)
        .map_or(0, |kf| kf.num_map_points());
    let median_depth = map.median_scene_depth(first).unwrap_or(-1.0);
    if median_depth <= 0.0 || tracked < MIN_MONO_MATCHES {
        debug!(
            "[Init] Rejected monocular map (median depth {:.3}, {} tracked)",
            median_depth, tracked
        );
        map.clear();
        current.clear_matches();
        current.pose = None;
        return None;
    }

    // First keyframe at the origin, so scaling world coordinates scales
    // every depth.
    let inv_median = 1.0 / median_depth;
    if let Some(kf) = map.get_keyframe_mut(second) {
        kf.pose.translation *= inv_median;
        current.pose = Some(kf.pose.clone());
    }
    for mp_id in map.map_point_ids() {
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position *= inv_median;
        }
        map.update_map_point_normal_and_depth(mp_id);
    }

    info!(
        "[Init] Monocular map created: {} and {} with {} map points",
        first,
        second,
        map.num_map_points()
    );
    Some((first, second))
}
