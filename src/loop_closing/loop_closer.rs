//! LoopCloser - Main loop closing thread.
//!
//! This module implements the main loop closing thread that:
//! 1. Receives keyframes from LocalMapping
//! 2. Detects consistent loop candidates using BoW
//! 3. Verifies candidates with Sim3 RANSAC
//! 4. Corrects the map via pose graph optimization (Local Mapping stopped)
//! 5. Launches Global BA in the background

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::{Sensor, Settings};
use crate::map::KeyFrameId;
use crate::optimizer::{apply_global_ba, collect_global_ba, solve_global_ba, GlobalBAConfig, PoseGraphConfig};
use crate::system::shared_state::SharedState;
use crate::tracking::frame::CameraModel;

use super::corrector::{correct_loop, verify_loop_candidate, LoopVerificationConfig, VerifiedLoop};
use super::detector::{LoopDetector, LoopDetectorConfig};

/// Timeout for receiving keyframes from the channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Queue from Local Mapping to Loop Closing.
///
/// Unbounded, so every processed keyframe reaches loop detection, in
/// processing order. Local Mapping never blocks on it while Loop Closing
/// holds it stopped for a correction.
pub fn keyframe_queue() -> (Sender<KeyFrameId>, Receiver<KeyFrameId>) {
    unbounded()
}

/// Configuration for the LoopCloser.
#[derive(Debug, Clone)]
pub struct LoopCloserConfig {
    pub detector: LoopDetectorConfig,
    pub verification: LoopVerificationConfig,
    pub pose_graph: PoseGraphConfig,
    pub global_ba: GlobalBAConfig,
    /// Whether to run Global BA after loop correction.
    pub run_global_ba: bool,
    pub seed: Option<u64>,
}

impl LoopCloserConfig {
    pub fn from_settings(settings: &Settings, sensor: Sensor) -> Self {
        Self {
            detector: LoopDetectorConfig::from_settings(&settings.loop_closing),
            verification: LoopVerificationConfig::from_settings(&settings.loop_closing, sensor),
            pose_graph: PoseGraphConfig::from_settings(settings, sensor),
            global_ba: GlobalBAConfig::from_settings(settings),
            run_global_ba: settings.loop_closing.global_ba_iterations > 0,
            seed: settings.tracker.seed,
        }
    }
}

/// Statistics for the loop closer.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    pub keyframes_processed: usize,
    pub candidates_detected: usize,
    pub loops_corrected: usize,
    pub global_ba_launched: usize,
}

/// The LoopCloser thread handler.
pub struct LoopCloser {
    shared: Arc<SharedState>,
    camera: CameraModel,
    config: LoopCloserConfig,
    detector: LoopDetector,
    rng: StdRng,
    stats: LoopCloserStats,
    /// The background Global BA thread, if one was launched.
    global_ba_handle: Option<JoinHandle<()>>,
}

impl LoopCloser {
    pub fn new(settings: &Settings, sensor: Sensor, shared: Arc<SharedState>) -> Self {
        let config = LoopCloserConfig::from_settings(settings, sensor);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            shared,
            camera: settings.camera_model(),
            detector: LoopDetector::new(config.detector.clone()),
            config,
            rng,
            stats: LoopCloserStats::default(),
            global_ba_handle: None,
        }
    }

    /// Run the main loop closing thread.
    ///
    /// This function blocks and processes keyframes until the channel is closed
    /// or shutdown is requested. A launched Global BA is aborted and joined
    /// before returning.
    pub fn run(&mut self, kf_receiver: Receiver<KeyFrameId>) {
        info!("[LoopClosing] Started");

        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            if self.shared.is_loop_closer_reset_requested() {
                let dropped = kf_receiver.try_iter().count();
                self.detector.reset();
                self.shared.acknowledge_loop_closer_reset();
                info!("[LoopClosing] Reset ({} queued keyframes dropped)", dropped);
                continue;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => self.process_keyframe(kf_id),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Some(handle) = self.global_ba_handle.take() {
            self.shared.request_global_ba_abort();
            if handle.join().is_err() {
                warn!("[GlobalBA] Thread panicked");
            }
        }
        self.shared.set_loop_closer_finished();

        info!(
            "[LoopClosing] Finished: processed={}, candidates={}, corrected={}, global BA runs={}",
            self.stats.keyframes_processed,
            self.stats.candidates_detected,
            self.stats.loops_corrected,
            self.stats.global_ba_launched
        );
    }

    /// Detect, verify and close a loop for one keyframe.
    pub fn process_keyframe(&mut self, kf_id: KeyFrameId) {
        self.stats.keyframes_processed += 1;

        let candidates = {
            let map = self.shared.map.read();
            let index = self.shared.index.read();
            self.detector.detect(&map, &index, kf_id)
        };
        if candidates.is_empty() {
            return;
        }
        self.stats.candidates_detected += candidates.len();

        let verified = {
            let map = self.shared.map.read();
            candidates.iter().find_map(|&candidate| {
                verify_loop_candidate(
                    &map,
                    kf_id,
                    candidate,
                    &self.camera,
                    &self.config.verification,
                    &mut self.rng,
                )
            })
        };

        match verified {
            Some(verified) => self.close_loop(&verified),
            None => debug!("[LoopClosing] {}: no candidate passed verification", kf_id),
        }
    }

    fn close_loop(&mut self, verified: &VerifiedLoop) {
        info!(
            "[LoopClosing] Loop detected: {} -> {} ({} matches)",
            verified.current_kf_id,
            verified.loop_kf_id,
            verified.num_matches()
        );

        self.shared.request_mapper_stop();
        if !self.shared.wait_for_mapper_stop() {
            self.shared.release_mapper();
            return;
        }

        // A running Global BA works on pre-loop poses; drop its result.
        if self.shared.is_global_ba_running() {
            info!("[LoopClosing] Aborting running Global BA");
            self.shared.request_global_ba_abort();
        }
        if let Some(handle) = self.global_ba_handle.take() {
            if handle.join().is_err() {
                warn!("[GlobalBA] Thread panicked");
            }
        }

        let shared = Arc::clone(&self.shared);
        let should_stop = || shared.is_shutdown_requested();
        if correct_loop(
            &self.shared.map,
            verified,
            &self.camera,
            &self.config.pose_graph,
            &should_stop,
        )
        .is_some()
        {
            self.stats.loops_corrected += 1;
            self.detector.mark_loop_closed(verified.current_kf_id);
            if self.config.run_global_ba {
                self.launch_global_ba();
            }
        }

        self.shared.release_mapper();
    }

    /// Launch Global BA in a background thread if none is in flight.
    fn launch_global_ba(&mut self) {
        if !self.shared.try_start_global_ba() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let camera = self.camera;
        let config = self.config.global_ba.clone();

        match thread::Builder::new()
            .name("global-ba".into())
            .spawn(move || run_global_ba(&shared, &camera, &config))
        {
            Ok(handle) => {
                self.global_ba_handle = Some(handle);
                self.stats.global_ba_launched += 1;
            }
            Err(e) => {
                warn!("[GlobalBA] Failed to spawn thread: {}", e);
                self.shared.finish_global_ba();
            }
        }
    }

    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }
}

/// Body of the Global BA thread: snapshot, solve without locks, then patch
/// the map with Local Mapping stopped.
fn run_global_ba(shared: &SharedState, camera: &CameraModel, config: &GlobalBAConfig) {
    info!("[GlobalBA] Started");
    let snapshot = {
        let map = shared.map.read();
        collect_global_ba(&map, camera)
    };
    let Some(mut snapshot) = snapshot else {
        shared.finish_global_ba();
        return;
    };

    let should_stop = || shared.should_abort_global_ba() || shared.is_shutdown_requested();
    let result = solve_global_ba(&mut snapshot, camera, config, &should_stop);
    if result.aborted {
        info!("[GlobalBA] Aborted after {} iterations", result.iterations);
        shared.finish_global_ba();
        return;
    }

    shared.request_mapper_stop();
    if shared.wait_for_mapper_stop() && !should_stop() {
        let mut map = shared.map.write();
        let updated = apply_global_ba(&mut map, &snapshot);
        shared.record_global_ba_applied();
        info!(
            "[GlobalBA] Finished: {} entities updated, error {:.4} -> {:.4}",
            updated, result.initial_error, result.final_error
        );
    }
    shared.release_mapper();
    shared.finish_global_ba();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::OrbVocabulary;
    use crossbeam_channel::bounded;
    use std::time::Instant;

    const YAML: &str = "camera:\n  fx: 400\n  fy: 400\n  cx: 320\n  cy: 240\n  width: 640\n  height: 480\n  bf: 40\ntracker:\n  seed: 1\n";

    #[test]
    fn test_small_map_is_skipped() {
        let settings = Settings::from_yaml(YAML).unwrap();
        let shared = SharedState::new(Arc::new(OrbVocabulary::default()));
        let mut closer = LoopCloser::new(&settings, Sensor::Stereo, Arc::clone(&shared));

        closer.process_keyframe(KeyFrameId(3));

        assert_eq!(closer.stats().keyframes_processed, 1);
        assert_eq!(closer.stats().candidates_detected, 0);
        assert!(!shared.is_global_ba_running());
    }

    #[test]
    fn test_reset_and_shutdown_handshake() {
        let settings = Settings::from_yaml(YAML).unwrap();
        let shared = SharedState::new(Arc::new(OrbVocabulary::default()));
        let (tx, rx) = bounded::<KeyFrameId>(4);
        let mut closer = LoopCloser::new(&settings, Sensor::Stereo, Arc::clone(&shared));
        let handle = thread::spawn(move || closer.run(rx));

        tx.send(KeyFrameId(0)).unwrap();
        shared.request_worker_reset();
        shared.acknowledge_mapper_reset();
        shared.wait_for_worker_reset();
        assert!(!shared.is_loop_closer_reset_requested());

        let start = Instant::now();
        shared.request_shutdown();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
