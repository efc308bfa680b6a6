//! Dependency sync into a Python virtual environment.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::info;

use super::command::run_command;
use crate::collaborators::DependencyInstaller;

/// Runs `<venv>/bin/pip install -r <manifest>` from the manifest's directory.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    venv: PathBuf,
}

impl PipInstaller {
    pub fn new(venv: &Path) -> Self {
        Self {
            venv: venv.to_path_buf(),
        }
    }

    fn pip(&self) -> PathBuf {
        self.venv.join("bin").join("pip")
    }
}

impl DependencyInstaller for PipInstaller {
    fn sync(&self, manifest: &Path) -> Result<()> {
        let pip = self.pip();
        if !pip.is_file() {
            bail!("no pip in virtual environment {}", self.venv.display());
        }
        if !manifest.is_file() {
            bail!("dependency manifest {} not found", manifest.display());
        }

        let mut cmd = Command::new(&pip);
        cmd.args(["install", "--disable-pip-version-check", "-q", "-r"])
            .arg(manifest);
        if let Some(dir) = manifest.parent() {
            cmd.current_dir(dir);
        }
        run_command(&mut cmd).context("dependency sync failed")?;

        info!(manifest = %manifest.display(), "dependencies synced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn fake_pip(venv: &Path, script: &str) {
        let bin = venv.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let pip = bin.join("pip");
        fs::write(&pip, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&pip, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn installs_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join("venv");
        let log = dir.path().join("pip.log");
        fake_pip(&venv, &format!("echo \"$@\" > {}", log.display()));
        let manifest = dir.path().join("requirements.txt");
        fs::write(&manifest, "fastapi\n").unwrap();

        PipInstaller::new(&venv).sync(&manifest).unwrap();

        let args = fs::read_to_string(&log).unwrap();
        assert!(args.starts_with("install"), "{args}");
        assert!(args.contains("-r"), "{args}");
        assert!(args.contains("requirements.txt"), "{args}");
    }

    #[test]
    fn pip_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join("venv");
        fake_pip(&venv, "echo 'No matching distribution' >&2; exit 1");
        let manifest = dir.path().join("requirements.txt");
        fs::write(&manifest, "nonexistent-pkg==99\n").unwrap();

        let err = PipInstaller::new(&venv).sync(&manifest).unwrap_err();
        assert!(format!("{err:#}").contains("No matching distribution"));
    }

    #[test]
    fn missing_venv_or_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join("venv");
        let manifest = dir.path().join("requirements.txt");
        assert!(PipInstaller::new(&venv).sync(&manifest).is_err());

        fake_pip(&venv, "exit 0");
        assert!(PipInstaller::new(&venv).sync(&manifest).is_err());
    }
}
