//! Local Mapping thread.
//!
//! The Local Mapping thread is responsible for:
//! - Inserting new keyframes into the map and the place recognition index
//! - Culling recently created map points that are not re-observed
//! - Triangulating new map points with covisible keyframes
//! - Fusing duplicated map points between neighbors
//! - Running local bundle adjustment
//! - Culling redundant keyframes

pub mod culling;
mod local_mapper;
pub mod search_in_neighbors;
pub mod triangulation;

pub use local_mapper::LocalMapper;
