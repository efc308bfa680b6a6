//! deploy.toml configuration parser.
//!
//! Every section is optional; missing sections and fields fall back to the
//! values the Snapped AI deployment uses (port 12000, SQLite `app.db`,
//! `venv/`, branch `main`, ten retained snapshots).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;

/// Errors raised while loading or validating `deploy.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub service: ServiceConfig,
    pub paths: PathsConfig,
    pub source: SourceConfig,
    pub dependencies: DependenciesConfig,
    pub maintenance: MaintenanceConfig,
    pub health: HealthConfig,
    pub verify: VerifyConfig,
    pub monitor: MonitorConfig,
    pub retention: RetentionConfig,
    pub proxy: Option<ProxyConfig>,
}

/// Process supervisor in charge of the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceManager {
    #[default]
    Systemd,
    Supervisor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Deployment target name; also names the deploy lock.
    pub name: String,
    pub manager: ServiceManager,
    /// systemd unit or supervisor program. Defaults to `name`.
    pub unit: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "snapped-ai".to_string(),
            manager: ServiceManager::Systemd,
            unit: None,
        }
    }
}

impl ServiceConfig {
    pub fn unit(&self) -> &str {
        self.unit.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the code tree (the git working copy).
    pub app_dir: PathBuf,
    /// SQLite data-store file.
    pub data_store: PathBuf,
    pub backup_root: PathBuf,
    /// Attempt history and deploy locks.
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            app_dir: PathBuf::from("/opt/snapped-ai"),
            data_store: PathBuf::from("app.db"),
            backup_root: PathBuf::from("/var/backups/snapped-ai"),
            state_dir: PathBuf::from("/var/lib/snapdeploy"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub remote: String,
    pub branch: String,
    /// git executable.
    pub git: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: "main".to_string(),
            git: "git".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependenciesConfig {
    /// Virtual environment holding the runtime dependencies.
    pub venv: PathBuf,
    pub manifest: PathBuf,
    /// Directories left out of code snapshots, matched by name anywhere in the tree.
    pub cache_dirs: Vec<String>,
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        Self {
            venv: PathBuf::from("venv"),
            manifest: PathBuf::from("requirements.txt"),
            cache_dirs: ["venv", ".venv", "__pycache__", "node_modules"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// An index ensured by the consistency pass when `table` exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub table: String,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub pragmas: Vec<String>,
    pub indexes: Vec<IndexSpec>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        let pragmas = [
            "PRAGMA journal_mode=WAL",
            "PRAGMA synchronous=NORMAL",
            "PRAGMA foreign_keys=ON",
            "PRAGMA busy_timeout=30000",
            "PRAGMA temp_store=MEMORY",
        ];
        let indexes = [
            (
                "image_searches",
                "CREATE INDEX IF NOT EXISTS idx_image_searches_recent \
                 ON image_searches (search_time DESC, id DESC)",
            ),
            (
                "search_results",
                "CREATE INDEX IF NOT EXISTS idx_search_results_search_price \
                 ON search_results (search_id, price)",
            ),
            (
                "search_results",
                "CREATE INDEX IF NOT EXISTS idx_search_results_brand \
                 ON search_results (brand) WHERE brand IS NOT NULL",
            ),
            (
                "search_results",
                "CREATE INDEX IF NOT EXISTS idx_search_results_composite \
                 ON search_results (search_id, brand, price)",
            ),
        ];
        Self {
            enabled: true,
            pragmas: pragmas.into_iter().map(String::from).collect(),
            indexes: indexes
                .into_iter()
                .map(|(table, sql)| IndexSpec {
                    table: table.to_string(),
                    sql: sql.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Listen address of the service (ip:port).
    pub address: String,
    pub endpoint: String,
    pub timeout: String,
    pub expected_status: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:12000".to_string(),
            endpoint: "/health".to_string(),
            timeout: "5s".to_string(),
            expected_status: 200,
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("health.timeout", &self.timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Path probed after activation.
    pub path: String,
    pub max_attempts: u32,
    /// Constant delay between probes.
    pub interval: String,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            max_attempts: 30,
            interval: "2s".to_string(),
        }
    }
}

impl VerifyConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        duration_field("verify.interval", &self.interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval: String,
    /// Consecutive failed probes before alerting.
    pub unhealthy_threshold: u32,
    /// JSON-lines alert log; alerts only go to the log output when unset.
    pub alert_log: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: "60s".to_string(),
            unhealthy_threshold: 3,
            alert_log: None,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        duration_field("monitor.interval", &self.interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_snapshots: usize,
    /// Update attempts kept in the history store.
    pub max_history: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 10,
            max_history: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Candidate config shipped in the code tree.
    pub source: PathBuf,
    /// Live config read by the proxy.
    pub target: PathBuf,
    pub validate: Vec<String>,
    pub reload: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("deploy/nginx.conf"),
            target: PathBuf::from("/etc/nginx/sites-available/snapped-ai"),
            validate: vec!["nginx".to_string(), "-t".to_string()],
            reload: vec![
                "systemctl".to_string(),
                "reload".to_string(),
                "nginx".to_string(),
            ],
        }
    }
}

impl DeployConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DeployConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges and that every duration string parses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::Invalid("service.name must not be empty".into()));
        }
        if self.source.branch.trim().is_empty() {
            return Err(ConfigError::Invalid("source.branch must not be empty".into()));
        }
        if self.verify.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "verify.max_attempts must be at least 1".into(),
            ));
        }
        if self.retention.max_snapshots == 0 {
            return Err(ConfigError::Invalid(
                "retention.max_snapshots must be at least 1".into(),
            ));
        }
        if self.monitor.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "monitor.unhealthy_threshold must be at least 1".into(),
            ));
        }
        if !self.health.endpoint.starts_with('/') || !self.verify.path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "health.endpoint and verify.path must start with '/'".into(),
            ));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.validate.is_empty() || proxy.reload.is_empty() {
                return Err(ConfigError::Invalid(
                    "proxy.validate and proxy.reload must name a command".into(),
                ));
            }
        }
        self.health.timeout()?;
        self.verify.interval()?;
        self.monitor.interval()?;
        Ok(())
    }

    /// Resolve a configured path against the application directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths.app_dir.join(path)
        }
    }

    pub fn data_store_path(&self) -> PathBuf {
        self.resolve(&self.paths.data_store)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.resolve(&self.paths.backup_root)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.paths.state_dir)
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.resolve(&self.dependencies.venv)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.resolve(&self.dependencies.manifest)
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_service() {
        let config = DeployConfig::default();
        assert_eq!(config.health.address, "127.0.0.1:12000");
        assert_eq!(config.health.expected_status, 200);
        assert_eq!(config.verify.max_attempts, 30);
        assert_eq!(config.verify.interval().unwrap(), Duration::from_secs(2));
        assert_eq!(config.retention.max_snapshots, 10);
        assert_eq!(config.source.branch, "main");
        assert_eq!(config.service.unit(), "snapped-ai");
        assert!(config.proxy.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[service]
name = "api"
manager = "supervisor"

[paths]
app_dir = "/srv/api"
"#;
        let config: DeployConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.service.name, "api");
        assert_eq!(config.service.manager, ServiceManager::Supervisor);
        assert_eq!(config.data_store_path(), PathBuf::from("/srv/api/app.db"));
        assert_eq!(config.manifest_path(), PathBuf::from("/srv/api/requirements.txt"));
        assert_eq!(
            config.backup_root(),
            PathBuf::from("/var/backups/snapped-ai")
        );
    }

    #[test]
    fn proxy_section_takes_defaults() {
        let config: DeployConfig = toml::from_str("[proxy]\n").unwrap();
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.validate, vec!["nginx", "-t"]);
        assert_eq!(proxy.source, PathBuf::from("deploy/nginx.conf"));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut config = DeployConfig::default();
        config.verify.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_zero_retention() {
        let mut config = DeployConfig::default();
        config.retention.max_snapshots = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_bad_duration() {
        let mut config = DeployConfig::default();
        config.verify.interval = "often".to_string();
        match config.validate() {
            Err(ConfigError::Duration { field, .. }) => assert_eq!(field, "verify.interval"),
            other => panic!("expected duration error, got {other:?}"),
        }
    }

    #[test]
    fn from_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        std::fs::write(&path, "[verify]\nmax_attempts = 5\ninterval = \"500ms\"\n").unwrap();
        let config = DeployConfig::from_file(&path).unwrap();
        assert_eq!(config.verify.max_attempts, 5);
        assert_eq!(config.verify.interval().unwrap(), Duration::from_millis(500));

        std::fs::write(&path, "[retention]\nmax_snapshots = 0\n").unwrap();
        assert!(DeployConfig::from_file(&path).is_err());
    }

    #[test]
    fn rendered_config_parses_back() {
        let config = DeployConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("snapped-ai"));
        let back: DeployConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.verify.max_attempts, 30);
    }
}
