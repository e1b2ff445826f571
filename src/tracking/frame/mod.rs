//! Frame-level inputs: camera model, caller-supplied ORB features, stereo
//! and RGB-D depth.

pub mod camera;
pub mod features;
pub mod stereo;

pub use camera::CameraModel;
pub use features::{
    descriptor_distance, level_scale, level_sigma2, predict_scale, Descriptor, FeatureSet,
    KeyPoint, N_LEVELS, SCALE_FACTOR,
};
pub use stereo::{back_project_depths, match_stereo, NN_RATIO, TH_HIGH, TH_LOW};
