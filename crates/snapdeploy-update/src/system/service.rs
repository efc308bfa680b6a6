//! Service control through systemd or supervisord.

use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::info;

use snapdeploy_core::config::{ServiceConfig, ServiceManager};

use super::command::run_command;
use crate::collaborators::ServiceControl;

/// Build the production service controller for `config`.
pub fn service_control(config: &ServiceConfig) -> Box<dyn ServiceControl> {
    match config.manager {
        ServiceManager::Systemd => Box::new(SystemdService::new(config.unit())),
        ServiceManager::Supervisor => Box::new(SupervisorService::new(config.unit())),
    }
}

#[derive(Debug, Clone)]
pub struct SystemdService {
    program: String,
    unit: String,
}

impl SystemdService {
    pub fn new(unit: &str) -> Self {
        Self {
            program: "systemctl".to_string(),
            unit: unit.to_string(),
        }
    }

    /// Use a different `systemctl` binary.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    fn systemctl(&self, verb: &str) -> Result<()> {
        run_command(Command::new(&self.program).args([verb, &self.unit]))
            .with_context(|| format!("systemctl {verb} {} failed", self.unit))?;
        info!(unit = %self.unit, verb, "service control");
        Ok(())
    }
}

impl ServiceControl for SystemdService {
    fn activate(&self) -> Result<()> {
        self.systemctl("reload-or-restart")
    }

    fn force_restart(&self) -> Result<()> {
        self.systemctl("restart")
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorService {
    program: String,
    name: String,
}

impl SupervisorService {
    pub fn new(name: &str) -> Self {
        Self {
            program: "supervisorctl".to_string(),
            name: name.to_string(),
        }
    }

    /// Use a different `supervisorctl` binary.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    fn restart(&self) -> Result<()> {
        let output = run_command(Command::new(&self.program).args(["restart", &self.name]))
            .with_context(|| format!("supervisorctl restart {} failed", self.name))?;
        // Older supervisorctl releases exit 0 on failure and print ERROR.
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("ERROR") {
            bail!("supervisorctl restart {} failed: {}", self.name, stdout.trim());
        }
        info!(program = %self.name, "service restarted");
        Ok(())
    }
}

impl ServiceControl for SupervisorService {
    fn activate(&self) -> Result<()> {
        self.restart()
    }

    fn force_restart(&self) -> Result<()> {
        self.restart()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn fake_bin(dir: &Path, name: &str, script: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn systemd_verbs() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls");
        let bin = fake_bin(dir.path(), "systemctl", &format!("echo \"$@\" >> {}", log.display()));
        let service = SystemdService::new("snapped-ai").with_program(&bin);

        service.activate().unwrap();
        service.force_restart().unwrap();

        let calls = fs::read_to_string(&log).unwrap();
        assert_eq!(calls, "reload-or-restart snapped-ai\nrestart snapped-ai\n");
    }

    #[test]
    fn systemd_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_bin(dir.path(), "systemctl", "echo 'Unit not found' >&2; exit 5");
        let err = SystemdService::new("nope").with_program(&bin).force_restart().unwrap_err();
        assert!(format!("{err:#}").contains("Unit not found"));
    }

    #[test]
    fn supervisor_error_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_bin(dir.path(), "supervisorctl", "echo 'snapped-ai: ERROR (spawn error)'");
        let service = SupervisorService::new("snapped-ai").with_program(&bin);
        assert!(service.activate().is_err());

        let ok = fake_bin(dir.path(), "supervisorctl-ok", "echo 'snapped-ai: started'");
        SupervisorService::new("snapped-ai")
            .with_program(&ok)
            .force_restart()
            .unwrap();
    }
}
