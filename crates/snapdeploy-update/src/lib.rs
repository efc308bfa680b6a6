//! SnapDeploy update orchestration.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator::run_update
//!   ├─ SnapshotStore      data store + code tree capture (tar.zst)
//!   ├─ SourceFetcher      git fetch + fast-forward
//!   ├─ DependencyInstaller  pip install -r requirements.txt
//!   ├─ DataStoreMaintainer  SQLite pragmas, indexes, ANALYZE
//!   ├─ ServiceControl     systemd / supervisord
//!   ├─ HealthProbe        verification polling
//!   └─ ProxyConfigurator  nginx config propagation on commit
//! ```
//!
//! The phases form an explicit state machine ([`UpdatePhase`]); a
//! [`DeployLock`] keeps concurrent runs against one target apart.

pub mod archive;
pub mod collaborators;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod phase;
pub mod snapshot;
pub mod system;

pub use collaborators::{
    DataStoreMaintainer, DependencyInstaller, ProxyConfigurator, ProxySync, ServiceControl,
    SourceFetcher,
};
pub use error::{SnapshotError, SnapshotResult, UpdateError, UpdateResult};
pub use lock::DeployLock;
pub use orchestrator::{Collaborators, Orchestrator, UpdateReport, UpdateSettings};
pub use phase::{Step, UpdatePhase};
pub use snapshot::{DataCopy, Snapshot, SnapshotLayout, SnapshotManifest, SnapshotStore};
