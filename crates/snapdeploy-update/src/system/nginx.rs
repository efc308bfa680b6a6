//! Reverse-proxy config propagation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use snapdeploy_core::config::ProxyConfig;

use super::command::run_argv;
use crate::collaborators::{ProxyConfigurator, ProxySync};

/// Installs the proxy config shipped in the code tree, validates it, and
/// reloads the proxy. A config that fails validation is replaced by the
/// previous one before returning the error.
#[derive(Debug, Clone)]
pub struct NginxProxy {
    source: PathBuf,
    target: PathBuf,
    validate: Vec<String>,
    reload: Vec<String>,
}

impl NginxProxy {
    /// `code_dir` anchors a relative `source`.
    pub fn new(code_dir: &Path, config: &ProxyConfig) -> Self {
        let source = if config.source.is_absolute() {
            config.source.clone()
        } else {
            code_dir.join(&config.source)
        };
        Self {
            source,
            target: config.target.clone(),
            validate: config.validate.clone(),
            reload: config.reload.clone(),
        }
    }

    fn put_back(&self, previous: Option<&[u8]>) {
        let result = match previous {
            Some(bytes) => fs::write(&self.target, bytes),
            None => fs::remove_file(&self.target),
        };
        if let Err(e) = result {
            warn!(target_path = %self.target.display(), error = %e, "failed to restore previous proxy config");
        }
    }
}

impl ProxyConfigurator for NginxProxy {
    fn propagate(&self) -> Result<ProxySync> {
        if !self.source.is_file() {
            return Ok(ProxySync::Absent);
        }
        let candidate = fs::read(&self.source)
            .with_context(|| format!("read {}", self.source.display()))?;
        let previous = fs::read(&self.target).ok();
        if previous.as_deref() == Some(candidate.as_slice()) {
            return Ok(ProxySync::Unchanged);
        }

        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&self.target, &candidate)
            .with_context(|| format!("write {}", self.target.display()))?;

        if let Err(e) = run_argv(&self.validate, None) {
            self.put_back(previous.as_deref());
            return Err(e.context("proxy config rejected; previous config kept"));
        }
        run_argv(&self.reload, None).context("proxy reload failed")?;

        info!(target_path = %self.target.display(), "proxy config applied");
        Ok(ProxySync::Applied)
    }
}
