//! Alert delivery for the periodic health monitor.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The target crossed the failure threshold.
    Unhealthy,
    /// The target answered healthy again after an alert.
    Recovered,
}

/// A health transition worth telling an operator about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub target: String,
    pub kind: AlertKind,
    /// Last observed status code (0 when unreachable).
    pub status_code: u16,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

/// Destination for monitor alerts.
pub trait AlertSink: Send + Sync {
    fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Emits alerts through the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.kind {
            AlertKind::Unhealthy => error!(
                target_name = %alert.target,
                status = alert.status_code,
                failures = alert.consecutive_failures,
                "health check failing"
            ),
            AlertKind::Recovered => info!(
                target_name = %alert.target,
                status = alert.status_code,
                "health check recovered"
            ),
        }
        Ok(())
    }
}

/// Appends alerts as JSON lines to a file.
#[derive(Debug, Clone)]
pub struct FileAlertSink {
    path: PathBuf,
}

impl FileAlertSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlertSink for FileAlertSink {
    fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}
