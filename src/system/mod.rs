//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that spawns and coordinates
//! the Tracking, Local Mapping and Loop Closing threads, along with shared
//! state, deferred commands and inter-thread messaging types.

pub mod commands;
pub mod messages;
pub mod shared_state;
mod slam_system;

pub use commands::SystemCommand;
pub use messages::NewKeyFrameMsg;
pub use shared_state::SharedState;
pub use slam_system::SlamSystem;
