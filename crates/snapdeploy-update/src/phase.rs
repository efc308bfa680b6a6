//! Update phases, the state machine driven by the orchestrator.
//!
//! Failures before any service-affecting mutation (snapshot, fetch) end in
//! `Failed` directly. Failures after it route through `RollingBack`.

use serde::{Deserialize, Serialize};

/// Result of executing the work of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeeded,
    Failed,
}

impl<T, E> From<&Result<T, E>> for Step {
    fn from(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Step::Succeeded
        } else {
            Step::Failed
        }
    }
}

/// Current phase of an update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    /// Capturing data store and code tree.
    Snapshotting,
    /// Fast-forwarding the working tree to the remote branch.
    Fetching,
    /// Installing declared dependencies into the runtime environment.
    SyncingDeps,
    /// Idempotent data-store maintenance.
    Optimizing,
    /// Reloading or restarting the service.
    Activating,
    /// Polling the liveness endpoint.
    Verifying,
    /// Post-verification housekeeping; cannot fail the attempt.
    Committing,
    /// Restoring the snapshot and force-restarting.
    RollingBack,
    /// Terminal: update verified and committed.
    Committed,
    /// Terminal: snapshot restored after a failure.
    RolledBack,
    /// Terminal: aborted before mutation, or rollback failed.
    Failed,
}

impl UpdatePhase {
    /// Transition out of this phase given the result of its work.
    pub fn next(self, step: Step) -> UpdatePhase {
        use UpdatePhase::*;

        match (self, step) {
            (Snapshotting, Step::Succeeded) => Fetching,
            (Snapshotting, Step::Failed) => Failed,

            (Fetching, Step::Succeeded) => SyncingDeps,
            (Fetching, Step::Failed) => Failed,

            (SyncingDeps, Step::Succeeded) => Optimizing,
            (Optimizing, Step::Succeeded) => Activating,
            (Activating, Step::Succeeded) => Verifying,
            (Verifying, Step::Succeeded) => Committing,
            (SyncingDeps | Optimizing | Activating | Verifying, Step::Failed) => RollingBack,

            // Post-commit issues are reported, never unwound.
            (Committing, _) => Committed,

            (RollingBack, Step::Succeeded) => RolledBack,
            (RollingBack, Step::Failed) => Failed,

            (terminal @ (Committed | RolledBack | Failed), _) => terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdatePhase::Committed | UpdatePhase::RolledBack | UpdatePhase::Failed
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            UpdatePhase::Snapshotting => "snapshotting",
            UpdatePhase::Fetching => "fetching",
            UpdatePhase::SyncingDeps => "syncing_deps",
            UpdatePhase::Optimizing => "optimizing",
            UpdatePhase::Activating => "activating",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::Committing => "committing",
            UpdatePhase::RollingBack => "rolling_back",
            UpdatePhase::Committed => "committed",
            UpdatePhase::RolledBack => "rolled_back",
            UpdatePhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
