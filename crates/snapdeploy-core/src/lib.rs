//! Shared configuration and record types for SnapDeploy.

pub mod config;
pub mod duration;
pub mod types;

pub use config::{ConfigError, DeployConfig};
pub use duration::parse_duration;
pub use types::*;
