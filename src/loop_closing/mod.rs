//! Loop Closing.
//!
//! This module implements loop detection, geometric verification, and pose graph correction
//! to eliminate accumulated drift over long trajectories.
//!
//! # Architecture
//!
//! The loop closing pipeline consists of:
//! 1. **Detection** (`detector.rs`): BoW-based loop candidate detection with consistency checking
//! 2. **Verification** (`sim3_solver.rs`, `corrector.rs`): Sim3 RANSAC and guided matching
//! 3. **Correction** (`corrector.rs`): Sim3 propagation, point fusion and pose graph optimization
//! 4. **Thread** (`loop_closer.rs`): Main loop closing thread receiving keyframes
//!
//! # Threading Model
//!
//! The LoopCloser runs in its own thread, receiving keyframes from LocalMapping via a channel.
//! Correction stops Local Mapping first. The pose graph and Global BA use the three-phase
//! locking pattern:
//! - Phase 1 (COLLECT): Read lock to gather data
//! - Phase 2 (SOLVE): No lock, pure computation
//! - Phase 3 (APPLY): Write lock to update the map

pub mod corrector;
pub mod detector;
pub mod loop_closer;
pub mod sim3_solver;

pub use corrector::{correct_loop, verify_loop_candidate, LoopCorrection, LoopVerificationConfig, VerifiedLoop};
pub use detector::{detect_loop_candidates, ConsistencyChecker, LoopCandidate, LoopDetector, LoopDetectorConfig};
pub use loop_closer::{keyframe_queue, LoopCloser, LoopCloserConfig, LoopCloserStats};
pub use sim3_solver::{compute_sim3_horn, solve_sim3_ransac, Sim3Correspondence, Sim3Result, Sim3SolverConfig};
