//! Records shared between the orchestrator, the state store, and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final result of one update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    /// Verified healthy and committed.
    Success,
    /// Failed before any service-affecting change; nothing to undo.
    Aborted,
    /// Failed after mutation; the snapshot was restored.
    RolledBack,
    /// Failed after mutation and the restore failed too.
    FailedNoRollbackPath,
}

impl AttemptOutcome {
    /// Process exit code reported by the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            AttemptOutcome::Success => 0,
            AttemptOutcome::Aborted => 1,
            AttemptOutcome::RolledBack => 2,
            AttemptOutcome::FailedNoRollbackPath => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Aborted => "aborted",
            AttemptOutcome::RolledBack => "rolled-back",
            AttemptOutcome::FailedNoRollbackPath => "failed-no-rollback-path",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One probe result gathered while verifying an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthObservation {
    /// 1-based probe index.
    pub attempt: u32,
    /// HTTP status, or 0 when the endpoint could not be reached.
    pub status_code: u16,
    pub observed_at: DateTime<Utc>,
}

/// Persisted record of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAttempt {
    /// Same as the snapshot key when a snapshot was taken.
    pub id: String,
    /// Deployment target (service name).
    pub target: String,
    pub snapshot_key: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub revision_before: Option<String>,
    pub revision_after: Option<String>,
    pub outcome: Option<AttemptOutcome>,
    /// Phase in which the attempt failed, if it did.
    pub failed_phase: Option<String>,
    pub reason: Option<String>,
    pub observations: Vec<HealthObservation>,
    /// Non-fatal post-commit problems.
    pub warnings: Vec<String>,
}

impl UpdateAttempt {
    pub fn new(id: &str, target: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            target: target.to_string(),
            snapshot_key: None,
            started_at,
            finished_at: None,
            revision_before: None,
            revision_after: None,
            outcome: None,
            failed_phase: None,
            reason: None,
            observations: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Key under which the attempt is stored: `{target}:{id}`.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.target, self.id)
    }
}
