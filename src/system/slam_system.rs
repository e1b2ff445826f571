//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with.
//! It owns the shared state, runs the Tracker in the caller's thread and
//! spawns the Local Mapping and Loop Closing threads.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use nalgebra::{Matrix4, Vector3};
use parking_lot::RwLockReadGuard;
use tracing::{debug, info, warn};

use crate::config::{Sensor, Settings};
use crate::error::{Result, SlamError};
use crate::io::trajectory::{frame_trajectory, keyframe_trajectory, save_kitti, save_tum};
use crate::local_mapping::LocalMapper;
use crate::loop_closing::{keyframe_queue, LoopCloser};
use crate::map::{persistence, KeyFrameId, Map, MapPointId};
use crate::tracking::frame::{back_project_depths, match_stereo, FeatureSet};
use crate::tracking::{Frame, Tracker, TrackingResult, TrackingState};
use crate::vocabulary::OrbVocabulary;

use super::commands::SystemCommand;
use super::messages::NewKeyFrameMsg;
use super::shared_state::{SharedState, WAIT_POLL};

/// Capacity of the keyframe channel between Tracking and Local Mapping.
/// Tracking checks the queue length before deciding on a new keyframe.
const KEYFRAME_CHANNEL_CAPACITY: usize = 8;

/// Main SLAM system orchestrating Tracking, Local Mapping and Loop Closing.
pub struct SlamSystem {
    sensor: Sensor,
    settings: Settings,

    /// Shared state (map, index, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// The tracker runs in the caller's thread.
    tracker: Tracker,

    /// Deferred commands, drained at the start of every tracking call.
    command_tx: Sender<SystemCommand>,
    command_rx: Receiver<SystemCommand>,

    local_mapping_handle: Option<JoinHandle<()>>,
    loop_closing_handle: Option<JoinHandle<()>>,

    last_result: Option<TrackingResult>,
    is_shutdown: bool,
}

impl SlamSystem {
    /// Load the vocabulary and settings from disk and start the system.
    pub fn new(vocabulary_path: &Path, settings_path: &Path, sensor: Sensor) -> Result<Self> {
        info!("[System] Loading vocabulary from {}", vocabulary_path.display());
        let vocabulary = OrbVocabulary::load_from_text(vocabulary_path)?;
        let settings = Settings::load(settings_path)?;
        Self::with_vocabulary(Arc::new(vocabulary), settings, sensor)
    }

    /// Start the system with an already loaded vocabulary.
    ///
    /// Spawns the Local Mapping thread, and the Loop Closing thread unless
    /// loop closing is disabled. When `map.load_path` is set, the system
    /// starts from that map with tracking lost.
    pub fn with_vocabulary(
        vocabulary: Arc<OrbVocabulary>,
        settings: Settings,
        sensor: Sensor,
    ) -> Result<Self> {
        settings.validate(sensor)?;
        let shared = SharedState::new(vocabulary);

        let (kf_sender, kf_receiver) = bounded::<NewKeyFrameMsg>(KEYFRAME_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = unbounded::<SystemCommand>();

        let mut tracker = Tracker::new(
            &settings,
            sensor,
            Arc::clone(&shared),
            kf_sender,
            command_tx.clone(),
        );

        if let Some(path) = settings.map.load_path.as_deref() {
            let loaded = persistence::load_map(path)?;
            let mut map = shared.map.write();
            let mut index = shared.index.write();
            map.adopt(loaded);
            index.rebuild(&map);
            tracker.start_lost();
        }

        let (lc_sender, lc_receiver) = if settings.loop_closing.enabled {
            let (tx, rx) = keyframe_queue();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let local_mapping_handle =
            Self::spawn_local_mapping(&settings, sensor, Arc::clone(&shared), kf_receiver, lc_sender)?;

        let loop_closing_handle = match lc_receiver {
            Some(rx) => match Self::spawn_loop_closing(&settings, sensor, Arc::clone(&shared), rx) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    shared.request_shutdown();
                    let _ = local_mapping_handle.join();
                    return Err(e);
                }
            },
            None => {
                info!("[System] Loop closing disabled");
                shared.set_loop_closer_finished();
                None
            }
        };

        info!("[System] Started ({} sensor)", sensor);

        Ok(Self {
            sensor,
            settings,
            shared,
            tracker,
            command_tx,
            command_rx,
            local_mapping_handle: Some(local_mapping_handle),
            loop_closing_handle,
            last_result: None,
            is_shutdown: false,
        })
    }

    /// Spawn the Local Mapping thread.
    fn spawn_local_mapping(
        settings: &Settings,
        sensor: Sensor,
        shared: Arc<SharedState>,
        kf_receiver: Receiver<NewKeyFrameMsg>,
        lc_sender: Option<Sender<KeyFrameId>>,
    ) -> Result<JoinHandle<()>> {
        let mut local_mapper = LocalMapper::new(settings, sensor, lc_sender);
        thread::Builder::new()
            .name("local-mapping".into())
            .spawn(move || local_mapper.run(kf_receiver, shared))
            .map_err(|e| SlamError::ThreadSpawn(format!("local mapping: {}", e)))
    }

    /// Spawn the Loop Closing thread.
    fn spawn_loop_closing(
        settings: &Settings,
        sensor: Sensor,
        shared: Arc<SharedState>,
        kf_receiver: Receiver<KeyFrameId>,
    ) -> Result<JoinHandle<()>> {
        let mut loop_closer = LoopCloser::new(settings, sensor, shared);
        thread::Builder::new()
            .name("loop-closing".into())
            .spawn(move || loop_closer.run(kf_receiver))
            .map_err(|e| SlamError::ThreadSpawn(format!("loop closing: {}", e)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking entry points
    // ─────────────────────────────────────────────────────────────────────────

    /// Track a monocular frame. Returns `T_cw`, or `None` when tracking
    /// failed for this frame.
    pub fn track_monocular(
        &mut self,
        features: FeatureSet,
        timestamp: f64,
    ) -> Result<Option<Matrix4<f64>>> {
        self.check_sensor(Sensor::Monocular)?;
        let points_cam = vec![None; features.len()];
        Ok(self.track(features, points_cam, timestamp))
    }

    /// Track a rectified stereo pair. Depth comes from matching `left`
    /// against `right` along image rows.
    pub fn track_stereo(
        &mut self,
        left: FeatureSet,
        right: &FeatureSet,
        timestamp: f64,
    ) -> Result<Option<Matrix4<f64>>> {
        self.check_sensor(Sensor::Stereo)?;
        let points_cam = match_stereo(&left, right, self.tracker.camera());
        Ok(self.track(left, points_cam, timestamp))
    }

    /// Track an RGB-D frame. `depths[i]` is the raw registered depth at
    /// keypoint `i`, scaled by `camera.depth_map_factor`.
    pub fn track_rgbd(
        &mut self,
        features: FeatureSet,
        depths: &[f64],
        timestamp: f64,
    ) -> Result<Option<Matrix4<f64>>> {
        self.check_sensor(Sensor::Rgbd)?;
        let points_cam = back_project_depths(
            &features.keypoints,
            depths,
            self.settings.camera.depth_map_factor,
            self.tracker.camera(),
        );
        Ok(self.track(features, points_cam, timestamp))
    }

    fn check_sensor(&self, got: Sensor) -> Result<()> {
        if self.sensor != got {
            return Err(SlamError::SensorMismatch {
                expected: self.sensor,
                got,
            });
        }
        Ok(())
    }

    fn track(
        &mut self,
        features: FeatureSet,
        points_cam: Vec<Option<Vector3<f64>>>,
        timestamp: f64,
    ) -> Option<Matrix4<f64>> {
        if self.is_shutdown {
            debug!("[System] Frame {:.6} ignored after shutdown", timestamp);
            return None;
        }
        self.apply_pending_commands();

        let frame = Frame::new(timestamp, features, points_cam, self.tracker.camera());
        let result = self.tracker.process_frame(frame);
        let pose = if result.is_ok() {
            result.pose_cw_matrix()
        } else {
            None
        };
        self.last_result = Some(result);
        pose
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deferred commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop Local Mapping and track against the existing map only.
    pub fn activate_localization_mode(&self) {
        self.push_command(SystemCommand::ActivateLocalizationMode);
    }

    /// Resume Local Mapping and keyframe creation.
    pub fn deactivate_localization_mode(&self) {
        self.push_command(SystemCommand::DeactivateLocalizationMode);
    }

    /// Clear the map and start over at the next frame.
    pub fn reset(&self) {
        self.push_command(SystemCommand::Reset);
    }

    fn push_command(&self, command: SystemCommand) {
        debug!("[System] Queued {}", command);
        // The receiver lives in `self`, so the channel cannot be closed.
        let _ = self.command_tx.send(command);
    }

    fn apply_pending_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            info!("[System] Applying {}", command);
            match command {
                SystemCommand::ActivateLocalizationMode => {
                    if self.tracker.is_localization_mode() {
                        continue;
                    }
                    self.shared.request_mapper_stop();
                    if !self.shared.wait_for_mapper_stop() {
                        warn!("[System] Local Mapping exited before stopping");
                    }
                    self.tracker.set_localization_mode(true);
                }
                SystemCommand::DeactivateLocalizationMode => {
                    if !self.tracker.is_localization_mode() {
                        continue;
                    }
                    self.tracker.set_localization_mode(false);
                    self.shared.release_mapper();
                }
                SystemCommand::Reset => self.reset_now(),
            }
        }
    }

    /// Reset handshake: both workers drop their queues and state, then the
    /// map, the index and the tracker are cleared.
    fn reset_now(&mut self) {
        info!("[System] Resetting");
        self.shared.request_worker_reset();
        self.shared.wait_for_worker_reset();
        self.abort_global_ba();

        {
            let mut map = self.shared.map.write();
            let mut index = self.shared.index.write();
            map.clear();
            index.clear();
        }
        self.tracker.reset();
        self.last_result = None;
        info!("[System] Reset done");
    }

    /// Abort a running Global BA and wait until it has released its slot.
    fn abort_global_ba(&self) {
        if !self.shared.is_global_ba_running() {
            return;
        }
        self.shared.request_global_ba_abort();
        while self.shared.is_global_ba_running() {
            thread::sleep(WAIT_POLL);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop every worker and wait for them. Safe to call more than once.
    ///
    /// When `map.save_on_shutdown_path` is set the map is saved once all
    /// workers have exited.
    pub fn shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        info!("[System] Shutting down");

        self.shared.request_global_ba_abort();
        self.shared.request_shutdown();

        if let Some(handle) = self.local_mapping_handle.take() {
            if handle.join().is_err() {
                warn!("[LocalMapping] Thread panicked");
            }
        }
        // Loop Closing joins its own Global BA thread before exiting.
        if let Some(handle) = self.loop_closing_handle.take() {
            if handle.join().is_err() {
                warn!("[LoopClosing] Thread panicked");
            }
        }
        self.is_shutdown = true;

        if let Some(path) = self.settings.map.save_on_shutdown_path.clone() {
            if let Err(e) = self.save_map(&path) {
                warn!("[System] Could not save map to {}: {}", path.display(), e);
            }
        }
        info!("[System] Shutdown complete");
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map persistence
    // ─────────────────────────────────────────────────────────────────────────

    pub fn save_map(&self, path: &Path) -> Result<()> {
        let map = self.shared.map.read();
        persistence::save_map(&map, path)
    }

    /// Replace the live map with one from disk. On error the live map is
    /// untouched. On success tracking starts lost and relocalizes against
    /// the loaded map.
    pub fn load_map(&mut self, path: &Path) -> Result<()> {
        let loaded = persistence::load_map(path)?;

        if !self.is_shutdown {
            self.shared.request_worker_reset();
            self.shared.wait_for_worker_reset();
            self.abort_global_ba();
        }
        {
            let mut map = self.shared.map.write();
            let mut index = self.shared.index.write();
            map.adopt(loaded);
            index.rebuild(&map);
        }
        self.tracker.start_lost();
        self.last_result = None;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trajectory export
    // ─────────────────────────────────────────────────────────────────────────

    /// Every tracked frame in TUM format. Not available for monocular.
    pub fn save_trajectory_tum(&self, path: &Path) -> Result<()> {
        self.reject_monocular("Per-frame TUM trajectory")?;
        let entries = frame_trajectory(&self.shared.map.read(), self.tracker.history());
        save_tum(&entries, path)
    }

    /// Keyframe poses in TUM format. Works for every sensor.
    pub fn save_keyframe_trajectory_tum(&self, path: &Path) -> Result<()> {
        let entries = keyframe_trajectory(&self.shared.map.read());
        save_tum(&entries, path)
    }

    /// Every tracked frame in KITTI format. Not available for monocular.
    pub fn save_trajectory_kitti(&self, path: &Path) -> Result<()> {
        self.reject_monocular("KITTI trajectory")?;
        let entries = frame_trajectory(&self.shared.map.read(), self.tracker.history());
        save_kitti(&entries, path)
    }

    fn reject_monocular(&self, operation: &'static str) -> Result<()> {
        if self.sensor.is_monocular() {
            return Err(SlamError::UnsupportedSensor {
                operation,
                sensor: self.sensor,
            });
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    pub fn sensor(&self) -> Sensor {
        self.sensor
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.tracker.state()
    }

    /// Result of the last processed frame, with correspondence counts.
    pub fn last_tracking_result(&self) -> Option<&TrackingResult> {
        self.last_result.as_ref()
    }

    /// Get a reference to the shared state.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Read access to the map. The guard must be dropped before the next
    /// tracking call.
    pub fn map(&self) -> RwLockReadGuard<'_, Map> {
        self.shared.map.read()
    }

    pub fn num_keyframes(&self) -> usize {
        self.shared.map.read().num_keyframes()
    }

    pub fn num_map_points(&self) -> usize {
        self.shared.map.read().num_map_points()
    }

    /// Map points matched as inliers in the last frame.
    pub fn tracked_map_points(&self) -> Vec<MapPointId> {
        self.tracker.tracked_map_points()
    }

    pub fn is_localization_mode(&self) -> bool {
        self.tracker.is_localization_mode()
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
