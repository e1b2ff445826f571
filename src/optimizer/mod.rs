//! Nonlinear least-squares back end.
//!
//! - [`pose_only`]: motion-only refinement of a tracking frame
//! - [`local_ba`]: windowed bundle adjustment run by local mapping
//! - [`pose_graph`]: essential-graph Sim3 optimization after a loop
//! - [`global_ba`]: full bundle adjustment in the background

pub mod global_ba;
pub mod local_ba;
pub mod pose_graph;
pub mod pose_only;
pub mod reprojection;

pub use global_ba::{apply_global_ba, collect_global_ba, solve_global_ba, GlobalBAConfig, GlobalBAResult, GlobalBASnapshot};
pub use local_ba::{
    apply_local_ba, collect_local_ba, local_bundle_adjustment, solve_local_ba, LocalBAConfig,
    LocalBAProblem, LocalBAResult,
};
pub use pose_graph::{
    apply_pose_graph, collect_essential_graph, solve_pose_graph, EdgeType, EssentialGraph,
    PoseGraphConfig, PoseGraphResult,
};
pub use pose_only::{optimize_pose, optimize_pose_with_points};
pub use reprojection::{Measurement, CHI2_MONO, CHI2_STEREO};
