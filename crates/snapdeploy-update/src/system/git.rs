//! Source fetching via the git CLI.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{info, warn};

use snapdeploy_core::config::SourceConfig;

use super::command::{run_command, stdout_string};
use crate::collaborators::SourceFetcher;

const UNKNOWN_REVISION: &str = "unknown";

/// Fast-forward-only updates of a git working copy.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git: String,
    repo: PathBuf,
    remote: String,
    branch: String,
}

impl GitFetcher {
    pub fn new(repo: &Path, config: &SourceConfig) -> Self {
        Self {
            git: config.git.clone(),
            repo: repo.to_path_buf(),
            remote: config.remote.clone(),
            branch: config.branch.clone(),
        }
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new(&self.git);
        cmd.current_dir(&self.repo);
        cmd
    }
}

impl SourceFetcher for GitFetcher {
    fn current_revision(&self) -> Result<String> {
        let out = run_command(self.git().args(["rev-parse", "HEAD"]))
            .context("failed to read current revision")?;
        Ok(stdout_string(&out))
    }

    fn fetch(&self) -> Result<String> {
        run_command(self.git().args(["fetch", &self.remote, &self.branch]))
            .with_context(|| format!("git fetch {} {} failed", self.remote, self.branch))?;
        // Diverged history must stop the update, never be merged.
        let upstream = format!("{}/{}", self.remote, self.branch);
        run_command(self.git().args(["merge", "--ff-only", &upstream]))
            .context("working tree cannot be fast-forwarded")?;
        // The tree has moved; a missing revision must not hide that.
        let revision = self.current_revision().unwrap_or_else(|e| {
            warn!(error = %format!("{e:#}"), "fetched revision unknown");
            UNKNOWN_REVISION.to_string()
        });
        info!(remote = %self.remote, branch = %self.branch, %revision, "source fetched");
        Ok(revision)
    }
}
