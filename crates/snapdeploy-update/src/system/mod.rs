//! Production collaborators backed by host tools: git, pip, SQLite,
//! systemd/supervisord, and nginx.

pub mod command;
pub mod git;
pub mod nginx;
pub mod pip;
pub mod service;
pub mod sqlite;

pub use git::GitFetcher;
pub use nginx::NginxProxy;
pub use pip::PipInstaller;
pub use service::{SupervisorService, SystemdService, service_control};
pub use sqlite::SqliteMaintainer;
