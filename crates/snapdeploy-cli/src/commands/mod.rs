pub mod health;
pub mod snapshots;
pub mod update;

use std::path::{Path, PathBuf};

use anyhow::Context;

use snapdeploy_core::DeployConfig;
use snapdeploy_health::HttpProbe;
use snapdeploy_state::StateStore;
use snapdeploy_update::system::{GitFetcher, NginxProxy, PipInstaller, SqliteMaintainer, service_control};
use snapdeploy_update::{
    Collaborators, Orchestrator, ProxyConfigurator, SnapshotLayout, SnapshotStore, UpdateSettings,
};

const HISTORY_FILE: &str = "history.redb";

pub fn load_config(path: &Path) -> anyhow::Result<DeployConfig> {
    DeployConfig::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

pub fn history_path(config: &DeployConfig) -> PathBuf {
    config.state_dir().join(HISTORY_FILE)
}

pub fn open_history(config: &DeployConfig) -> anyhow::Result<StateStore> {
    let path = history_path(config);
    StateStore::open(&path).with_context(|| format!("failed to open history {}", path.display()))
}

pub fn snapshot_store(config: &DeployConfig) -> SnapshotStore {
    SnapshotStore::new(SnapshotLayout::from_config(config))
}

/// Wire the production collaborators for the configured target.
pub fn collaborators(config: &DeployConfig) -> Collaborators {
    let code_dir = &config.paths.app_dir;
    Collaborators {
        fetcher: Box::new(GitFetcher::new(code_dir, &config.source)),
        installer: Box::new(PipInstaller::new(&config.venv_dir())),
        maintainer: Box::new(SqliteMaintainer::new(&config.data_store_path(), &config.maintenance)),
        service: service_control(&config.service),
        proxy: config
            .proxy
            .as_ref()
            .map(|proxy| Box::new(NginxProxy::new(code_dir, proxy)) as Box<dyn ProxyConfigurator>),
    }
}

pub fn orchestrator(config: &DeployConfig) -> anyhow::Result<Orchestrator<HttpProbe>> {
    let settings = UpdateSettings::from_config(config)?;
    let probe = HttpProbe::from_config(&config.health, &config.verify.path)?;
    Ok(Orchestrator::new(
        settings,
        snapshot_store(config),
        collaborators(config),
        probe,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_lives_in_state_dir() {
        let mut config = DeployConfig::default();
        config.paths.state_dir = PathBuf::from("/srv/state");
        assert_eq!(history_path(&config), PathBuf::from("/srv/state/history.redb"));
    }

    #[test]
    fn load_config_reports_path() {
        let err = load_config(Path::new("/nonexistent/deploy.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/deploy.toml"));
    }

    #[test]
    fn orchestrator_builds_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        std::fs::write(
            &path,
            format!(
                "[paths]\napp_dir = \"{}\"\n\n[proxy]\n",
                dir.path().join("app").display()
            ),
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        let orch = orchestrator(&config).unwrap();
        assert_eq!(orch.settings().max_attempts, 30);
        assert_eq!(orch.settings().target, "snapped-ai");
    }
}
