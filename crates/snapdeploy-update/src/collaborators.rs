//! Seams between the orchestrator and the host system.
//!
//! Each trait covers one side effect of an update. The `system` module
//! provides the implementations used in production; tests substitute
//! recording fakes.

use std::path::Path;

use anyhow::Result;

/// Fast-forwards the code tree to the configured upstream branch.
pub trait SourceFetcher: Send + Sync {
    /// Revision currently checked out, if it can be determined.
    fn current_revision(&self) -> Result<String>;

    /// Fetch and fast-forward. Returns the new revision.
    fn fetch(&self) -> Result<String>;
}

/// Brings the runtime environment in line with the declared dependencies.
pub trait DependencyInstaller: Send + Sync {
    fn sync(&self, manifest: &Path) -> Result<()>;
}

/// Idempotent data-store consistency pass.
pub trait DataStoreMaintainer: Send + Sync {
    fn optimize(&self) -> Result<()>;
}

/// Process-supervisor control for the deployed service.
pub trait ServiceControl: Send + Sync {
    /// Pick up new code: reload where supported, otherwise restart.
    fn activate(&self) -> Result<()>;

    /// Unconditional restart. Used after a rollback.
    fn force_restart(&self) -> Result<()>;
}

/// What happened to the proxy config during commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxySync {
    /// The code tree ships no proxy config.
    Absent,
    /// The live config already matches.
    Unchanged,
    /// The config was installed and the proxy reloaded.
    Applied,
}

/// Propagates the proxy config shipped with the code tree.
pub trait ProxyConfigurator: Send + Sync {
    fn propagate(&self) -> Result<ProxySync>;
}
