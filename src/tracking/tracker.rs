//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! The tracker runs in the caller's thread:
//! - Reads the shared `Map` through its RwLock, never changing its structure
//!   outside initialization
//! - Tracks `MapPoint`s with the motion model or the reference keyframe,
//!   then refines against the local map
//! - Relocalizes through the place recognition index when lost
//! - Sends new keyframes to Local Mapping via channel

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::{Sensor, Settings, TrackerSection};
use crate::geometry::{solve_pnp_ransac, PnPConfig, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::optimizer::{optimize_pose, optimize_pose_with_points};
use crate::system::commands::SystemCommand;
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;
use crate::tracking::frame::{
    descriptor_distance, level_scale, CameraModel, Descriptor, TH_HIGH,
};
use crate::tracking::initializer::{initialize_stereo, MonoInitOutcome, MonocularInitializer};
use crate::tracking::keyframe_decision::{KeyFrameContext, KeyFrameDecision};
use crate::tracking::matching::{
    search_by_bow_frame, search_by_projection_keyframe, search_by_projection_last_frame,
    search_local_points,
};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::result::{TrackingMetrics, TrackingResult};
use crate::tracking::tracking_frame::Frame;
use crate::tracking::TrackingState;

/// Upper bound on the local keyframe window.
const MAX_LOCAL_KEYFRAMES: usize = 80;

/// Matches needed before a pose is optimized (motion model and reference).
const MIN_SEARCH_MATCHES: usize = 20;
const MIN_BOW_MATCHES: usize = 15;
/// Map inliers that keep motion-model / reference tracking alive.
const MIN_MAP_INLIERS: usize = 10;

/// Close stereo features kept as visual-odometry points when there are
/// not enough below the depth threshold.
const MIN_VO_POINTS: usize = 100;

/// One entry of the per-frame trajectory, relative to a keyframe so that
/// later keyframe corrections carry over.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub timestamp: f64,
    pub reference_kf: KeyFrameId,
    /// Camera pose in the reference keyframe's frame (`T_rc`).
    pub relative_pose: SE3,
    pub lost: bool,
}

/// Temporary point from the last frame's depth, used in localization mode
/// when too few map points are visible.
#[derive(Debug, Clone)]
struct VoPoint {
    position: Vector3<f64>,
    descriptor: Descriptor,
    octave: i32,
}

/// Main tracking structure.
pub struct Tracker {
    camera: CameraModel,
    sensor: Sensor,
    params: TrackerSection,
    th_depth: f64,
    max_frames: usize,

    /// Tracking state machine (NoImagesYet, NotInitialized, Ok, Lost).
    state: TrackingState,

    /// Shared state (map, index, flags) - thread-safe access.
    shared: Arc<SharedState>,

    /// Channel to send keyframes to Local Mapping.
    kf_sender: Sender<NewKeyFrameMsg>,

    /// Deferred commands, used here to request a reset.
    commands: Sender<SystemCommand>,

    /// Keyframe creation decision logic.
    kf_decision: KeyFrameDecision,

    motion_model: MotionModel,
    mono_initializer: MonocularInitializer,
    last_frame: Option<Frame>,

    /// Reference keyframe: the local keyframe sharing most points.
    reference_kf: Option<KeyFrameId>,
    local_keyframes: Vec<KeyFrameId>,
    local_map_points: Vec<MapPointId>,

    /// Running frame counter.
    frame_count: usize,
    last_reloc_frame: usize,

    localization_mode: bool,
    /// Localization mode with too few map matches.
    vo_mode: bool,
    vo_points: Vec<VoPoint>,

    history: Vec<FrameRecord>,
    rng: StdRng,
}

impl Tracker {
    pub fn new(
        settings: &Settings,
        sensor: Sensor,
        shared: Arc<SharedState>,
        kf_sender: Sender<NewKeyFrameMsg>,
        commands: Sender<SystemCommand>,
    ) -> Self {
        Self {
            camera: settings.camera_model(),
            sensor,
            params: settings.tracker.clone(),
            th_depth: settings.th_depth(),
            max_frames: settings.max_frames(),
            state: TrackingState::NoImagesYet,
            shared,
            kf_sender,
            commands,
            kf_decision: KeyFrameDecision::new(sensor, settings),
            motion_model: MotionModel::new(),
            mono_initializer: MonocularInitializer::new(),
            last_frame: None,
            reference_kf: None,
            local_keyframes: Vec::new(),
            local_map_points: Vec::new(),
            frame_count: 0,
            last_reloc_frame: 0,
            localization_mode: false,
            vo_mode: false,
            vo_points: Vec::new(),
            history: Vec::new(),
            rng: seeded_rng(settings.tracker.seed),
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn history(&self) -> &[FrameRecord] {
        &self.history
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.reference_kf
    }

    pub fn is_localization_mode(&self) -> bool {
        self.localization_mode
    }

    pub fn set_localization_mode(&mut self, enabled: bool) {
        self.localization_mode = enabled;
        self.vo_mode = false;
        self.vo_points.clear();
    }

    /// Map points tracked in the last processed frame.
    pub fn tracked_map_points(&self) -> Vec<MapPointId> {
        self.last_frame.as_ref().map_or_else(Vec::new, |frame| {
            frame
                .map_point_matches
                .iter()
                .zip(frame.outliers.iter())
                .filter(|(_, &out)| !out)
                .filter_map(|(m, _)| *m)
                .collect()
        })
    }

    /// Back to the post-construction state. The localization mode flag is
    /// kept.
    pub fn reset(&mut self) {
        self.state = TrackingState::NoImagesYet;
        self.kf_decision.reset();
        self.motion_model.reset();
        self.mono_initializer.reset();
        self.last_frame = None;
        self.reference_kf = None;
        self.local_keyframes.clear();
        self.local_map_points.clear();
        self.frame_count = 0;
        self.last_reloc_frame = 0;
        self.vo_mode = false;
        self.vo_points.clear();
        self.history.clear();
        self.rng = seeded_rng(self.params.seed);
    }

    /// Start over against a map that was loaded from disk: the first frames
    /// relocalize.
    pub fn start_lost(&mut self) {
        self.reset();
        self.state = TrackingState::Lost;
    }

    /// Process a frame and return a `TrackingResult` with the pose (if any)
    /// and correspondence counts.
    pub fn process_frame(&mut self, mut frame: Frame) -> TrackingResult {
        self.frame_count += 1;
        frame.compute_bow(&self.shared.vocabulary);

        if self.state == TrackingState::NoImagesYet {
            self.state = TrackingState::NotInitialized;
        }

        let mut keyframe_sent = false;
        let mut n_inliers = 0;
        let mut pose = None;

        if self.state == TrackingState::NotInitialized {
            if self.initialize(&mut frame) {
                self.state = TrackingState::Ok;
                n_inliers = frame.num_tracked();
                if let Some(p) = frame.pose.clone() {
                    self.motion_model.reset();
                    self.motion_model.update(&p);
                    pose = Some(p);
                }
                self.record(&frame, false);
            }
        } else {
            let was_ok = self.state == TrackingState::Ok;
            let (ok, inliers) = self.track(&mut frame);
            n_inliers = inliers;

            if ok {
                self.state = TrackingState::Ok;
                if let Some(p) = frame.pose.clone() {
                    self.motion_model.update(&p);
                    pose = Some(p);
                }
                keyframe_sent = self.maybe_create_keyframe(&frame, n_inliers);
                frame.discard_outliers();
                if self.localization_mode && !self.sensor.is_monocular() {
                    self.vo_points = self.collect_vo_points(&frame);
                }
                self.record(&frame, false);
            } else {
                self.state = TrackingState::Lost;
                self.motion_model.reset();
                frame.pose = None;
                self.record(&frame, true);

                let n_keyframes = self.shared.map.read().num_keyframes();
                if was_ok && !self.localization_mode && n_keyframes <= self.params.lost_reset_keyframes {
                    warn!(
                        "[Tracking] Lost with only {} keyframes, requesting reset",
                        n_keyframes
                    );
                    let _ = self.commands.send(SystemCommand::Reset);
                }
            }
        }

        let metrics = TrackingMetrics {
            n_features: frame.num_features(),
            n_map_point_matches: frame.map_point_matches.iter().flatten().count(),
            n_inliers,
        };
        self.last_frame = Some(frame);

        TrackingResult {
            state: self.state,
            pose,
            reference_kf_id: self.reference_kf,
            metrics,
            keyframe_sent,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Build the initial map. The new keyframes are handed to Local Mapping
    /// to get their connections.
    fn initialize(&mut self, frame: &mut Frame) -> bool {
        let shared = Arc::clone(&self.shared);
        let inserted: Vec<KeyFrameId> = {
            let mut map = shared.map.write();
            if self.sensor.is_monocular() {
                match self
                    .mono_initializer
                    .process(&mut map, frame, &self.camera, &mut self.rng)
                {
                    MonoInitOutcome::Initialized { first, second } => vec![first, second],
                    _ => return false,
                }
            } else {
                match initialize_stereo(&mut map, frame, self.params.min_init_points) {
                    Some(kf_id) => vec![kf_id],
                    None => return false,
                }
            }
        };

        for &kf_id in &inserted {
            if self.kf_sender.send(NewKeyFrameMsg::Inserted(kf_id)).is_err() {
                warn!("[Tracking] Local Mapping is gone, {} not connected", kf_id);
            }
        }

        self.reference_kf = inserted.last().copied();
        self.local_map_points = shared.map.read().map_point_ids();
        self.local_keyframes = inserted;
        self.kf_decision.reset();
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────────

    /// Estimate the frame pose. Returns (success, inliers).
    fn track(&mut self, frame: &mut Frame) -> (bool, usize) {
        let shared = Arc::clone(&self.shared);
        let (ok, inliers, visible) = {
            let map = shared.map.read();
            self.refresh_last_frame_pose(&map);

            let mut ok = if self.state == TrackingState::Lost {
                self.relocalize(&map, frame)
            } else if !self.vo_mode {
                let mut ok = false;
                if self.motion_model.has_velocity() && self.frame_count > self.last_reloc_frame + 2 {
                    ok = self.track_with_motion_model(&map, frame);
                }
                ok || self.track_reference_keyframe(&map, frame)
            } else {
                // Few map points in view: prefer relocalization in the map.
                let mut candidate = frame.clone();
                if self.relocalize(&map, &mut candidate) {
                    *frame = candidate;
                    self.vo_mode = false;
                    true
                } else {
                    self.track_with_motion_model(&map, frame)
                }
            };

            let mut inliers = frame.num_tracked();
            let mut visible = Vec::new();
            if ok && !self.vo_mode {
                let (local_ok, n, seen) = self.track_local_map(&map, frame);
                ok = local_ok;
                inliers = n;
                visible = seen;
            }
            (ok, inliers, visible)
        };

        if !visible.is_empty() {
            let mut map = shared.map.write();
            for mp_id in &visible {
                if let Some(mp) = map.get_map_point_mut(*mp_id) {
                    mp.increase_visible(1);
                }
            }
            for (m, &outlier) in frame.map_point_matches.iter().zip(frame.outliers.iter()) {
                if let (Some(mp_id), false) = (m, outlier) {
                    if let Some(mp) = map.get_map_point_mut(*mp_id) {
                        mp.increase_found(1);
                    }
                }
            }
        }

        (ok, inliers)
    }

    /// The last frame's pose follows corrections of its reference keyframe.
    fn refresh_last_frame_pose(&mut self, map: &Map) {
        let Some(record) = self.history.last() else {
            return;
        };
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        if last.pose.is_none() {
            return;
        }
        if let Some(pose_wr) = map.resolve_keyframe_pose(record.reference_kf) {
            let pose_wc = pose_wr.compose(&record.relative_pose);
            self.motion_model.set_last_pose(&pose_wc);
            last.pose = Some(pose_wc);
        }
    }

    fn track_with_motion_model(&mut self, map: &Map, frame: &mut Frame) -> bool {
        let Some(predicted) = self.motion_model.predict() else {
            return false;
        };
        let Some(last) = self.last_frame.as_ref() else {
            return false;
        };

        frame.clear_matches();
        frame.pose = Some(predicted);
        let th = if self.sensor == Sensor::Stereo { 7.0 } else { 15.0 };

        let mut n_matches = search_by_projection_last_frame(frame, last, map, &self.camera, th);
        if n_matches < MIN_SEARCH_MATCHES {
            frame.clear_matches();
            n_matches = search_by_projection_last_frame(frame, last, map, &self.camera, 2.0 * th);
        }

        let vo_matches = if self.localization_mode {
            self.match_vo_points(frame, th)
        } else {
            Vec::new()
        };
        if n_matches + vo_matches.len() < MIN_SEARCH_MATCHES {
            debug!("[Tracking] Motion model: only {} matches", n_matches);
            return false;
        }

        optimize_pose_with_points(frame, map, &self.camera, &vo_matches);
        let vo_inliers = vo_matches
            .iter()
            .filter(|(idx, _)| !frame.outliers[*idx])
            .count();
        frame.discard_outliers();
        let map_inliers = count_map_inliers(frame, map);

        if self.localization_mode {
            self.vo_mode = map_inliers < MIN_MAP_INLIERS;
            return map_inliers + vo_inliers >= MIN_SEARCH_MATCHES;
        }
        map_inliers >= MIN_MAP_INLIERS
    }

    fn track_reference_keyframe(&mut self, map: &Map, frame: &mut Frame) -> bool {
        let reference = self
            .reference_kf
            .filter(|id| map.contains_keyframe(*id))
            .or_else(|| map.last_keyframe_id());
        let Some(kf) = reference.and_then(|id| map.get_keyframe(id)) else {
            return false;
        };

        frame.clear_matches();
        let n_matches = search_by_bow_frame(kf, frame, map, 0.7);
        if n_matches < MIN_BOW_MATCHES {
            debug!("[Tracking] Reference {}: only {} BoW matches", kf.id, n_matches);
            return false;
        }

        frame.pose = self
            .last_frame
            .as_ref()
            .and_then(|last| last.pose.clone())
            .or_else(|| Some(kf.pose.clone()));
        optimize_pose(frame, map, &self.camera);
        frame.discard_outliers();
        count_map_inliers(frame, map) >= MIN_MAP_INLIERS
    }

    /// Refine against every point of the local map. Returns (success,
    /// inliers, points predicted visible).
    fn track_local_map(&mut self, map: &Map, frame: &mut Frame) -> (bool, usize, Vec<MapPointId>) {
        self.update_local_keyframes(map, frame);
        self.update_local_points(map);

        let mut visible: Vec<MapPointId> = frame.map_point_matches.iter().flatten().copied().collect();
        let th = if self.frame_count < self.last_reloc_frame + 2 {
            5.0
        } else if self.sensor == Sensor::Rgbd {
            3.0
        } else {
            1.0
        };
        let search = search_local_points(frame, map, &self.local_map_points, &self.camera, th);
        visible.extend(search.visible);

        optimize_pose(frame, map, &self.camera);
        let inliers = if self.localization_mode {
            frame.num_tracked()
        } else {
            count_map_inliers(frame, map)
        };

        let recently_relocalized = self.frame_count < self.last_reloc_frame + self.max_frames;
        let ok = if recently_relocalized && self.last_reloc_frame > 0 {
            inliers >= self.params.min_reloc_inliers
        } else {
            inliers >= self.params.min_tracked_inliers
        };
        if !ok {
            debug!("[Tracking] Local map: {} inliers", inliers);
        }
        (ok, inliers, visible)
    }

    /// Keyframes observing the frame's points, plus their neighborhood. The
    /// one sharing most points becomes the reference.
    fn update_local_keyframes(&mut self, map: &Map, frame: &mut Frame) {
        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for slot in frame.map_point_matches.iter_mut() {
            let Some(mp_id) = *slot else { continue };
            match map.get_map_point(mp_id) {
                Some(mp) => {
                    for kf_id in mp.observations().keys() {
                        *counter.entry(*kf_id).or_insert(0) += 1;
                    }
                }
                None => *slot = None,
            }
        }
        if counter.is_empty() {
            return;
        }

        let mut ranked: Vec<(KeyFrameId, usize)> = counter.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut local: Vec<KeyFrameId> = ranked
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| map.get_keyframe(*id).is_some_and(|kf| !kf.is_bad))
            .collect();
        if local.is_empty() {
            return;
        }
        self.reference_kf = Some(local[0]);

        let mut included: HashSet<KeyFrameId> = local.iter().copied().collect();
        let first_ring = local.clone();
        for kf_id in first_ring {
            if local.len() >= MAX_LOCAL_KEYFRAMES {
                break;
            }
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            let mut children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
            children.sort_unstable();
            let neighbor = kf.get_best_covisibles(10).into_iter().find(|id| !included.contains(id));
            let child = children.into_iter().find(|id| !included.contains(id));
            let parent = kf.parent_id.filter(|id| !included.contains(id));
            for id in [neighbor, child, parent].into_iter().flatten() {
                if map.contains_keyframe(id) && included.insert(id) {
                    local.push(id);
                }
            }
        }
        self.local_keyframes = local;
    }

    fn update_local_points(&mut self, map: &Map) {
        let mut seen: HashSet<MapPointId> = HashSet::new();
        let mut points = Vec::new();
        for kf_id in &self.local_keyframes {
            let Some(kf) = map.get_keyframe(*kf_id) else {
                continue;
            };
            for (_, mp_id) in kf.get_map_point_indices() {
                if seen.insert(mp_id) && map.get_map_point(mp_id).is_some_and(|mp| !mp.is_bad) {
                    points.push(mp_id);
                }
            }
        }
        self.local_map_points = points;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relocalization
    // ─────────────────────────────────────────────────────────────────────────

    /// Query the place recognition index and accept the first candidate
    /// that reaches `min_reloc_inliers` after PnP and pose refinement.
    fn relocalize(&mut self, map: &Map, frame: &mut Frame) -> bool {
        let candidates = self
            .shared
            .index
            .read()
            .detect_relocalization_candidates(map, &frame.bow_vector);
        if candidates.is_empty() {
            return false;
        }
        let min_inliers = self.params.min_reloc_inliers;
        let pnp_config = PnPConfig::default();

        for kf_id in candidates {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            frame.clear_matches();
            if search_by_bow_frame(kf, frame, map, 0.75) < MIN_BOW_MATCHES {
                continue;
            }

            let mut indices = Vec::new();
            let mut points3d = Vec::new();
            let mut points2d = Vec::new();
            for (idx, m) in frame.map_point_matches.iter().enumerate() {
                let Some(mp) = m.and_then(|id| map.get_map_point(id)) else {
                    continue;
                };
                let kp = &frame.features.keypoints[idx];
                indices.push(idx);
                points3d.push(mp.position);
                points2d.push(Vector2::new(kp.x, kp.y));
            }
            let Some(pnp) = solve_pnp_ransac(&points3d, &points2d, &self.camera, &pnp_config, &mut self.rng)
            else {
                continue;
            };

            frame.pose = Some(pnp.pose_cw.inverse());
            for (k, &idx) in indices.iter().enumerate() {
                if !pnp.inlier_mask.get(k).copied().unwrap_or(false) {
                    frame.map_point_matches[idx] = None;
                }
            }

            let mut n_good = optimize_pose(frame, map, &self.camera);
            if n_good < MIN_MAP_INLIERS {
                continue;
            }
            frame.discard_outliers();

            // Few inliers: look for more points of the candidate by projection.
            if n_good < min_inliers {
                let found: HashSet<MapPointId> = frame.map_point_matches.iter().flatten().copied().collect();
                let additional = search_by_projection_keyframe(frame, kf, map, &self.camera, &found, 10.0, 100);
                if additional + n_good >= min_inliers {
                    n_good = optimize_pose(frame, map, &self.camera);
                    if n_good > 30 && n_good < min_inliers {
                        let found: HashSet<MapPointId> = frame
                            .map_point_matches
                            .iter()
                            .zip(frame.outliers.iter())
                            .filter(|(_, &out)| !out)
                            .filter_map(|(m, _)| *m)
                            .collect();
                        let additional =
                            search_by_projection_keyframe(frame, kf, map, &self.camera, &found, 3.0, 64);
                        if n_good + additional >= min_inliers {
                            n_good = optimize_pose(frame, map, &self.camera);
                        }
                    }
                    frame.discard_outliers();
                }
            }

            if n_good >= min_inliers {
                info!(
                    "[Tracking] Relocalized against {} with {} inliers",
                    kf_id, n_good
                );
                self.reference_kf = Some(kf_id);
                self.last_reloc_frame = self.frame_count;
                return true;
            }
        }

        frame.clear_matches();
        frame.pose = None;
        false
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Visual odometry (localization mode)
    // ─────────────────────────────────────────────────────────────────────────

    /// Close features of a tracked frame that have no map point.
    fn collect_vo_points(&self, frame: &Frame) -> Vec<VoPoint> {
        let Some(pose_wc) = frame.pose.as_ref() else {
            return Vec::new();
        };
        let mut by_depth: Vec<(f64, usize)> = frame
            .points_cam
            .iter()
            .enumerate()
            .filter(|(idx, _)| frame.map_point_matches[*idx].is_none())
            .filter_map(|(idx, p)| p.map(|p| (p.z, idx)))
            .collect();
        by_depth.sort_by(|a, b| a.0.total_cmp(&b.0));

        by_depth
            .iter()
            .enumerate()
            .take_while(|(n, (z, _))| *z < self.th_depth || *n < MIN_VO_POINTS)
            .filter_map(|(_, &(_, idx))| {
                let p_cam = frame.points_cam[idx]?;
                Some(VoPoint {
                    position: pose_wc.transform_point(&p_cam),
                    descriptor: frame.features.descriptors[idx],
                    octave: frame.features.keypoints[idx].octave,
                })
            })
            .collect()
    }

    /// Project the visual-odometry points into the frame and match them to
    /// free features.
    fn match_vo_points(&self, frame: &Frame, th: f64) -> Vec<(usize, Vector3<f64>)> {
        let Some(pose_cw) = frame.pose_cw() else {
            return Vec::new();
        };
        let mut used: HashSet<usize> = HashSet::new();
        let mut matches = Vec::new();
        for point in &self.vo_points {
            let p_cam = pose_cw.transform_point(&point.position);
            let Some(uv) = self.camera.project(&p_cam) else {
                continue;
            };
            if !self.camera.is_in_image(uv.x, uv.y) {
                continue;
            }
            let radius = th * level_scale(point.octave);
            let best = frame
                .get_features_in_area(uv.x, uv.y, radius, Some(point.octave - 1), Some(point.octave + 1))
                .into_iter()
                .filter(|idx| frame.map_point_matches[*idx].is_none() && !used.contains(idx))
                .map(|idx| (idx, descriptor_distance(&point.descriptor, &frame.features.descriptors[idx])))
                .min_by_key(|(_, dist)| *dist);
            if let Some((idx, dist)) = best {
                if dist <= TH_HIGH {
                    used.insert(idx);
                    matches.push((idx, point.position));
                }
            }
        }
        matches
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframes
    // ─────────────────────────────────────────────────────────────────────────

    /// Decide whether to create a new keyframe, and if so, send it to Local
    /// Mapping without blocking.
    fn maybe_create_keyframe(&mut self, frame: &Frame, n_inliers: usize) -> bool {
        self.kf_decision.tick();
        if self.localization_mode {
            return false;
        }

        let ctx = {
            let map = self.shared.map.read();
            let n_keyframes = map.num_keyframes();
            if self.last_reloc_frame > 0
                && self.frame_count < self.last_reloc_frame + self.max_frames
                && n_keyframes > self.max_frames
            {
                return false;
            }

            let min_obs = if n_keyframes <= 2 { 2 } else { 3 };
            let reference_tracked = self
                .reference_kf
                .and_then(|id| map.get_keyframe(id))
                .map_or(0, |kf| {
                    kf.get_map_point_indices()
                        .filter(|(_, mp_id)| map.weighted_observations(*mp_id) >= min_obs)
                        .count()
                });

            let (mut tracked_close, mut untracked_close) = (0, 0);
            if !self.sensor.is_monocular() {
                for (idx, p) in frame.points_cam.iter().enumerate() {
                    let Some(p) = p else { continue };
                    if p.z <= 0.0 || p.z >= self.th_depth {
                        continue;
                    }
                    if frame.map_point_matches[idx].is_some() && !frame.outliers[idx] {
                        tracked_close += 1;
                    } else {
                        untracked_close += 1;
                    }
                }
            }

            KeyFrameContext {
                tracked: n_inliers,
                reference_tracked,
                tracked_close,
                untracked_close,
                mapper_idle: self.shared.accepts_keyframes(),
                mapper_stopped: self.shared.is_mapper_stop_requested() || self.shared.is_mapper_stopped(),
                queue_len: self.kf_sender.len(),
                map_keyframes: n_keyframes,
            }
        };

        if !self.kf_decision.should_create_keyframe(&ctx) {
            if !ctx.mapper_idle {
                self.shared.request_abort_ba();
            }
            return false;
        }

        let Some(data) = frame.to_keyframe_data() else {
            return false;
        };
        let matched: Vec<Option<MapPointId>> = frame
            .map_point_matches
            .iter()
            .zip(frame.outliers.iter())
            .map(|(m, &out)| if out { None } else { *m })
            .collect();

        // Signal Local Mapping that a new keyframe is coming (abort current BA)
        self.shared.request_abort_ba();
        match self.kf_sender.try_send(NewKeyFrameMsg::create(data, matched)) {
            Ok(()) => {
                debug!(
                    "[Tracking] Keyframe requested at t={:.3} ({} tracked, reference {})",
                    frame.timestamp, n_inliers, ctx.reference_tracked
                );
                self.kf_decision.reset();
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("[Tracking] Keyframe queue full, frame skipped");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("[Tracking] Local Mapping is gone, keyframe dropped");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trajectory
    // ─────────────────────────────────────────────────────────────────────────

    fn record(&mut self, frame: &Frame, lost: bool) {
        if lost {
            if let Some(last) = self.history.last().cloned() {
                self.history.push(FrameRecord {
                    timestamp: frame.timestamp,
                    lost: true,
                    ..last
                });
            }
            return;
        }

        let (Some(reference), Some(pose_wc)) = (self.reference_kf, frame.pose.as_ref()) else {
            return;
        };
        let Some(pose_wr) = self.shared.map.read().resolve_keyframe_pose(reference) else {
            return;
        };
        self.history.push(FrameRecord {
            timestamp: frame.timestamp,
            reference_kf: reference,
            relative_pose: pose_wr.inverse().compose(pose_wc),
            lost: false,
        });
    }
}

/// Map matches (not outliers) whose point is still observed by a keyframe.
fn count_map_inliers(frame: &Frame, map: &Map) -> usize {
    frame
        .map_point_matches
        .iter()
        .zip(frame.outliers.iter())
        .filter(|(m, &out)| {
            !out && m
                .and_then(|id| map.get_map_point(id))
                .is_some_and(|mp| mp.num_observations() > 0)
        })
        .count()
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::{FeatureSet, KeyPoint};
    use crate::vocabulary::OrbVocabulary;
    use crossbeam_channel::{bounded, unbounded, Receiver};
    use rand::Rng;

    const YAML: &str = "camera:\n  fx: 400\n  fy: 400\n  cx: 320\n  cy: 240\n  width: 640\n  height: 480\n  bf: 40\n  fps: 10\ntracker:\n  min_init_points: 100\n  seed: 3\n";

    fn desc(i: usize) -> Descriptor {
        StdRng::seed_from_u64(i as u64).gen()
    }

    fn scene() -> Vec<Vector3<f64>> {
        (0..300)
            .map(|i| {
                let f = i as f64;
                Vector3::new((f * 0.37).sin() * 3.0, (f * 0.71).cos() * 2.0, 5.0 + 3.0 * (f * 0.13).sin().abs())
            })
            .collect()
    }

    fn stereo_frame(cam: &CameraModel, t: f64, x: f64) -> Frame {
        let pose_cw = SE3::from_rt(nalgebra::Matrix3::identity(), Vector3::new(-x, 0.0, 0.0));
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let mut points = Vec::new();
        for (i, p) in scene().iter().enumerate() {
            let pc = pose_cw.transform_point(p);
            if let Some(uv) = cam.project(&pc) {
                if cam.is_in_image(uv.x, uv.y) {
                    keypoints.push(KeyPoint::new(uv.x, uv.y, 0));
                    descriptors.push(desc(i));
                    points.push(Some(pc));
                }
            }
        }
        Frame::new(t, FeatureSet::new(keypoints, descriptors), points, cam)
    }

    fn tracker() -> (Tracker, Receiver<NewKeyFrameMsg>, Receiver<SystemCommand>) {
        let settings = Settings::from_yaml(YAML).unwrap();
        let shared = SharedState::new(Arc::new(OrbVocabulary::default()));
        let (kf_tx, kf_rx) = bounded(8);
        let (cmd_tx, cmd_rx) = unbounded();
        (Tracker::new(&settings, Sensor::Stereo, shared, kf_tx, cmd_tx), kf_rx, cmd_rx)
    }

    #[test]
    fn test_stereo_initialization_then_motion_model() {
        let (mut tracker, kf_rx, _cmd_rx) = tracker();
        let cam = *tracker.camera();
        assert_eq!(tracker.state(), TrackingState::NoImagesYet);

        let first = tracker.process_frame(stereo_frame(&cam, 0.0, 0.0));
        assert_eq!(first.state, TrackingState::Ok);
        assert!(matches!(kf_rx.try_recv(), Ok(NewKeyFrameMsg::Inserted(_))));

        for k in 1..4 {
            let x = 0.02 * k as f64;
            let result = tracker.process_frame(stereo_frame(&cam, k as f64 * 0.1, x));
            assert_eq!(result.state, TrackingState::Ok);
            let pose = result.pose.unwrap();
            assert!((pose.translation.x - x).abs() < 1e-3);
        }
        assert_eq!(tracker.history().len(), 4);
    }

    #[test]
    fn test_lost_with_small_map_requests_reset() {
        let (mut tracker, _kf_rx, cmd_rx) = tracker();
        let cam = *tracker.camera();
        tracker.process_frame(stereo_frame(&cam, 0.0, 0.0));

        let empty = Frame::new(0.1, FeatureSet::default(), vec![], &cam);
        let result = tracker.process_frame(empty);
        assert_eq!(result.state, TrackingState::Lost);
        assert!(result.pose.is_none());
        assert_eq!(cmd_rx.try_recv(), Ok(SystemCommand::Reset));
        assert!(tracker.history().last().unwrap().lost);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let (mut tracker, _kf_rx, _cmd_rx) = tracker();
        let cam = *tracker.camera();
        tracker.process_frame(stereo_frame(&cam, 0.0, 0.0));
        tracker.reset();
        assert_eq!(tracker.state(), TrackingState::NoImagesYet);
        assert!(tracker.history().is_empty());
        assert!(tracker.reference_keyframe().is_none());
        assert!(tracker.tracked_map_points().is_empty());
    }
}
