//! Shared state between the Tracking, Local Mapping and Loop Closing threads.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads, protected by appropriate synchronization primitives.
//! Lock order is always `map` before `index`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::map::{Map, PlaceRecognitionIndex};
use crate::vocabulary::OrbVocabulary;

/// Poll interval of every handshake wait.
pub const WAIT_POLL: Duration = Duration::from_millis(5);

/// Shared state accessible by all threads.
pub struct SharedState {
    /// Keyframes and map points. Tracking reads, Local Mapping and Loop
    /// Closing write.
    pub map: RwLock<Map>,

    /// Inverted word index, kept in step with `map` by Local Mapping.
    pub index: RwLock<PlaceRecognitionIndex>,

    pub vocabulary: Arc<OrbVocabulary>,

    /// Set by Local Mapping while it waits for work.
    accept_keyframes: AtomicBool,

    /// Signal to abort Local BA early when a new keyframe arrives.
    abort_ba: AtomicBool,

    /// Request every worker to finish and exit.
    shutdown_requested: AtomicBool,

    /// Outstanding stop requests on Local Mapping (localization mode, loop
    /// correction, global BA). The mapper stays stopped while non-zero.
    stop_requests: AtomicUsize,
    mapper_stopped: AtomicBool,

    mapper_reset_requested: AtomicBool,
    loop_closer_reset_requested: AtomicBool,

    mapper_finished: AtomicBool,
    loop_closer_finished: AtomicBool,

    global_ba_running: AtomicBool,
    global_ba_abort: AtomicBool,
    /// Global BA runs whose result was written to the map.
    global_ba_applied: AtomicUsize,
}

impl SharedState {
    /// Create a new SharedState with an empty map.
    pub fn new(vocabulary: Arc<OrbVocabulary>) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(Map::new()),
            index: RwLock::new(PlaceRecognitionIndex::new()),
            vocabulary,
            accept_keyframes: AtomicBool::new(true),
            abort_ba: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            stop_requests: AtomicUsize::new(0),
            mapper_stopped: AtomicBool::new(false),
            mapper_reset_requested: AtomicBool::new(false),
            loop_closer_reset_requested: AtomicBool::new(false),
            mapper_finished: AtomicBool::new(false),
            loop_closer_finished: AtomicBool::new(false),
            global_ba_running: AtomicBool::new(false),
            global_ba_abort: AtomicBool::new(false),
            global_ba_applied: AtomicUsize::new(0),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Flow control
    // ─────────────────────────────────────────────────────────────────────────

    pub fn accepts_keyframes(&self) -> bool {
        self.accept_keyframes.load(Ordering::SeqCst)
    }

    pub fn set_accept_keyframes(&self, value: bool) {
        self.accept_keyframes.store(value, Ordering::SeqCst);
    }

    /// The abort flag polled by Local BA.
    pub fn abort_ba_flag(&self) -> &AtomicBool {
        &self.abort_ba
    }

    /// Signal that BA should be aborted (new keyframe arriving).
    pub fn request_abort_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.global_ba_abort.store(true, Ordering::SeqCst);
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn set_mapper_finished(&self) {
        self.mapper_finished.store(true, Ordering::SeqCst);
    }

    pub fn set_loop_closer_finished(&self) {
        self.loop_closer_finished.store(true, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Mapping stop/release
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask Local Mapping to stop at its next iteration boundary. Every call
    /// must be paired with [`SharedState::release_mapper`].
    pub fn request_mapper_stop(&self) {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn release_mapper(&self) {
        let _ = self
            .stop_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn is_mapper_stop_requested(&self) -> bool {
        self.stop_requests.load(Ordering::SeqCst) > 0
    }

    pub fn set_mapper_stopped(&self, value: bool) {
        self.mapper_stopped.store(value, Ordering::SeqCst);
    }

    pub fn is_mapper_stopped(&self) -> bool {
        self.mapper_stopped.load(Ordering::SeqCst)
    }

    /// Block until Local Mapping reports stopped. Returns false if shutdown
    /// was requested or the mapper exited first.
    pub fn wait_for_mapper_stop(&self) -> bool {
        while !self.is_mapper_stopped() {
            if self.is_shutdown_requested() || self.mapper_finished.load(Ordering::SeqCst) {
                return false;
            }
            thread::sleep(WAIT_POLL);
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reset handshake
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_worker_reset(&self) {
        self.mapper_reset_requested.store(true, Ordering::SeqCst);
        self.loop_closer_reset_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_mapper_reset_requested(&self) -> bool {
        self.mapper_reset_requested.load(Ordering::SeqCst)
    }

    pub fn acknowledge_mapper_reset(&self) {
        self.mapper_reset_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_loop_closer_reset_requested(&self) -> bool {
        self.loop_closer_reset_requested.load(Ordering::SeqCst)
    }

    pub fn acknowledge_loop_closer_reset(&self) {
        self.loop_closer_reset_requested.store(false, Ordering::SeqCst);
    }

    /// Block until both workers acknowledged the reset. A worker that has
    /// exited counts as acknowledged.
    pub fn wait_for_worker_reset(&self) {
        loop {
            let mapper_done = !self.is_mapper_reset_requested()
                || self.mapper_finished.load(Ordering::SeqCst);
            let closer_done = !self.is_loop_closer_reset_requested()
                || self.loop_closer_finished.load(Ordering::SeqCst);
            if mapper_done && closer_done {
                return;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Global BA
    // ─────────────────────────────────────────────────────────────────────────

    /// Claim the single global BA slot. Returns false if one is in flight.
    pub fn try_start_global_ba(&self) -> bool {
        let started = self
            .global_ba_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if started {
            self.global_ba_abort.store(false, Ordering::SeqCst);
        }
        started
    }

    pub fn finish_global_ba(&self) {
        self.global_ba_running.store(false, Ordering::SeqCst);
    }

    pub fn is_global_ba_running(&self) -> bool {
        self.global_ba_running.load(Ordering::SeqCst)
    }

    pub fn request_global_ba_abort(&self) {
        self.global_ba_abort.store(true, Ordering::SeqCst);
    }

    pub fn should_abort_global_ba(&self) -> bool {
        self.global_ba_abort.load(Ordering::SeqCst)
    }

    pub fn record_global_ba_applied(&self) {
        self.global_ba_applied.fetch_add(1, Ordering::SeqCst);
    }

    /// Completed global BA runs since construction. Aborted runs do not count.
    pub fn num_global_ba_applied(&self) -> usize {
        self.global_ba_applied.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<SharedState> {
        SharedState::new(Arc::new(OrbVocabulary::default()))
    }

    #[test]
    fn test_stop_requests_are_counted() {
        let s = shared();
        s.request_mapper_stop();
        s.request_mapper_stop();
        s.release_mapper();
        assert!(s.is_mapper_stop_requested());
        s.release_mapper();
        assert!(!s.is_mapper_stop_requested());
        // Unpaired release is harmless
        s.release_mapper();
        assert!(!s.is_mapper_stop_requested());
    }

    #[test]
    fn test_single_global_ba_slot() {
        let s = shared();
        assert!(s.try_start_global_ba());
        assert!(!s.try_start_global_ba());
        s.request_global_ba_abort();
        assert!(s.should_abort_global_ba());
        s.finish_global_ba();
        assert!(s.try_start_global_ba());
        assert!(!s.should_abort_global_ba());
    }

    #[test]
    fn test_wait_for_stop_returns_on_shutdown() {
        let s = shared();
        s.request_mapper_stop();
        s.request_shutdown();
        assert!(!s.wait_for_mapper_stop());
    }
}
