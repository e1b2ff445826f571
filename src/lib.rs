pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod local_mapping;
pub mod loop_closing;
pub mod map;
pub mod optimizer;
pub mod synthetic;
pub mod system;
pub mod tracking;
pub mod vocabulary;

pub use config::{Sensor, Settings};
pub use error::{Result, SlamError};
pub use system::SlamSystem;
