//! File output: trajectory export in TUM and KITTI formats.

pub mod trajectory;

pub use trajectory::{
    frame_trajectory, keyframe_trajectory, read_tum, save_kitti, save_tum, write_kitti, write_tum,
    PoseEntry,
};
