//! Update orchestrator. Drives the update state machine.
//!
//! One attempt walks snapshot → fetch → dependency sync → consistency pass
//! → activate → verify → commit. Failures before the dependency sync abort
//! with nothing to undo; failures after it restore the snapshot and
//! force-restart the service.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use snapdeploy_core::{
    AttemptOutcome, ConfigError, DeployConfig, HealthObservation, UpdateAttempt,
};
use snapdeploy_health::HealthProbe;
use snapdeploy_state::StateStore;

use crate::collaborators::{
    DataStoreMaintainer, DependencyInstaller, ProxyConfigurator, ServiceControl, SourceFetcher,
};
use crate::error::{UpdateError, UpdateResult};
use crate::phase::{Step, UpdatePhase};
use crate::snapshot::{Snapshot, SnapshotStore};

/// Side-effecting collaborators for one deployment target.
pub struct Collaborators {
    pub fetcher: Box<dyn SourceFetcher>,
    pub installer: Box<dyn DependencyInstaller>,
    pub maintainer: Box<dyn DataStoreMaintainer>,
    pub service: Box<dyn ServiceControl>,
    pub proxy: Option<Box<dyn ProxyConfigurator>>,
}

/// Tunables for an update attempt.
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub target: String,
    /// Dependency manifest handed to the installer.
    pub manifest: PathBuf,
    /// Verification probes before giving up.
    pub max_attempts: u32,
    /// Delay between consecutive verification probes.
    pub interval: Duration,
    /// Snapshots kept after a successful update.
    pub retain_snapshots: usize,
    /// History records kept per target.
    pub retain_history: usize,
    pub run_maintenance: bool,
}

impl UpdateSettings {
    pub fn from_config(config: &DeployConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            target: config.service.name.clone(),
            manifest: config.manifest_path(),
            max_attempts: config.verify.max_attempts,
            interval: config.verify.interval()?,
            retain_snapshots: config.retention.max_snapshots,
            retain_history: config.retention.max_history,
            run_maintenance: config.maintenance.enabled,
        })
    }
}

/// Result of [`Orchestrator::run_update`].
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub attempt: UpdateAttempt,
    /// Every phase entered, in order.
    pub phases: Vec<UpdatePhase>,
}

impl UpdateReport {
    pub fn outcome(&self) -> AttemptOutcome {
        self.attempt.outcome.unwrap_or(AttemptOutcome::Aborted)
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome().exit_code()
    }
}

/// Per-attempt scratch state threaded through the phases.
struct Run {
    attempt: UpdateAttempt,
    snapshot: Option<Snapshot>,
    rollback_failed: bool,
}

pub struct Orchestrator<P> {
    settings: UpdateSettings,
    snapshots: SnapshotStore,
    collaborators: Collaborators,
    probe: P,
    history: Option<StateStore>,
}

impl<P: HealthProbe> Orchestrator<P> {
    pub fn new(
        settings: UpdateSettings,
        snapshots: SnapshotStore,
        collaborators: Collaborators,
        probe: P,
    ) -> Self {
        Self {
            settings,
            snapshots,
            collaborators,
            probe,
            history: None,
        }
    }

    /// Record attempts in `store`.
    pub fn with_history(mut self, store: StateStore) -> Self {
        self.history = Some(store);
        self
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    /// Run one full update attempt. Never returns an error: every failure
    /// is folded into the report's outcome.
    pub async fn run_update(&self) -> UpdateReport {
        let started_at = Utc::now();
        let id = started_at.format("%Y%m%d_%H%M%S").to_string();
        let mut run = Run {
            attempt: UpdateAttempt::new(&id, &self.settings.target, started_at),
            snapshot: None,
            rollback_failed: false,
        };
        info!(target_name = %self.settings.target, "update started");

        let mut phase = UpdatePhase::Snapshotting;
        let mut phases = vec![phase];
        while !phase.is_terminal() {
            let result = self.execute(phase, &mut run).await;
            if let Err(e) = &result {
                self.note_failure(phase, e, &mut run);
            }
            let next = phase.next(Step::from(&result));
            debug!(from = %phase, to = %next, "phase transition");
            phase = next;
            phases.push(phase);
        }

        let outcome = match phase {
            UpdatePhase::Committed => AttemptOutcome::Success,
            UpdatePhase::RolledBack => AttemptOutcome::RolledBack,
            _ if run.rollback_failed => AttemptOutcome::FailedNoRollbackPath,
            _ => AttemptOutcome::Aborted,
        };
        run.attempt.outcome = Some(outcome);
        run.attempt.finished_at = Some(Utc::now());
        self.record(&run.attempt);

        match outcome {
            AttemptOutcome::Success => info!(
                target_name = %self.settings.target,
                revision = run.attempt.revision_after.as_deref().unwrap_or("unknown"),
                probes = run.attempt.observations.len(),
                "update committed"
            ),
            AttemptOutcome::FailedNoRollbackPath => error!(
                target_name = %self.settings.target,
                reason = run.attempt.reason.as_deref().unwrap_or(""),
                "update failed and rollback failed; manual intervention required"
            ),
            _ => warn!(
                target_name = %self.settings.target,
                %outcome,
                reason = run.attempt.reason.as_deref().unwrap_or(""),
                "update did not complete"
            ),
        }

        UpdateReport {
            attempt: run.attempt,
            phases,
        }
    }

    async fn execute(&self, phase: UpdatePhase, run: &mut Run) -> anyhow::Result<()> {
        match phase {
            UpdatePhase::Snapshotting => self.take_snapshot(run),
            UpdatePhase::Fetching => {
                let revision = self.collaborators.fetcher.fetch().context("source fetch failed")?;
                run.attempt.revision_after = Some(revision);
                Ok(())
            }
            UpdatePhase::SyncingDeps => self
                .collaborators
                .installer
                .sync(&self.settings.manifest)
                .context("dependency sync failed"),
            UpdatePhase::Optimizing => {
                if !self.settings.run_maintenance {
                    debug!("data store maintenance disabled");
                    return Ok(());
                }
                self.collaborators
                    .maintainer
                    .optimize()
                    .context("data store consistency pass failed")
            }
            UpdatePhase::Activating => self
                .collaborators
                .service
                .activate()
                .context("service activation failed"),
            UpdatePhase::Verifying => self.verify(&mut run.attempt).await,
            UpdatePhase::Committing => {
                self.commit(run);
                Ok(())
            }
            UpdatePhase::RollingBack => {
                let result = self.roll_back(run);
                run.rollback_failed = result.is_err();
                result
            }
            UpdatePhase::Committed | UpdatePhase::RolledBack | UpdatePhase::Failed => Ok(()),
        }
    }

    fn take_snapshot(&self, run: &mut Run) -> anyhow::Result<()> {
        let revision = match self.collaborators.fetcher.current_revision() {
            Ok(rev) => Some(rev),
            Err(e) => {
                debug!(error = %e, "current revision unknown");
                None
            }
        };
        let snapshot = self
            .snapshots
            .create(revision.as_deref())
            .context("snapshot failed")?;

        run.attempt.id = snapshot.key().to_string();
        run.attempt.snapshot_key = Some(snapshot.key().to_string());
        run.attempt.revision_before = revision;
        run.snapshot = Some(snapshot);
        self.record(&run.attempt);
        Ok(())
    }

    /// Poll the verification path until healthy or out of attempts.
    async fn verify(&self, attempt: &mut UpdateAttempt) -> anyhow::Result<()> {
        let max = self.settings.max_attempts;
        let expected = self.probe.expected_status();
        let mut last = 0u16;

        for n in 1..=max {
            if n > 1 {
                tokio::time::sleep(self.settings.interval).await;
            }
            let outcome = self.probe.probe().await;
            last = outcome.status_code(expected);
            attempt.observations.push(HealthObservation {
                attempt: n,
                status_code: last,
                observed_at: Utc::now(),
            });
            if outcome.is_healthy() {
                info!(attempt = n, max, "service verified healthy");
                return Ok(());
            }
            debug!(attempt = n, max, status = last, "service not healthy yet");
        }
        bail!("service not healthy after {max} probes (last status {last:03})")
    }

    /// Post-verification housekeeping. Problems become warnings.
    fn commit(&self, run: &mut Run) {
        let warnings = &mut run.attempt.warnings;

        if let Some(proxy) = &self.collaborators.proxy {
            match proxy.propagate() {
                Ok(sync) => debug!(?sync, "proxy config propagated"),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "proxy config not applied");
                    warnings.push(format!("proxy config not applied: {e:#}"));
                }
            }
        }

        let protect = run.snapshot.as_ref().map(Snapshot::key);
        if let Err(e) = self.snapshots.prune(self.settings.retain_snapshots, protect) {
            warn!(error = %e, "snapshot pruning failed");
            warnings.push(format!("snapshot pruning failed: {e}"));
        }

        if let Some(store) = &self.history {
            if let Err(e) = store.prune_attempts(&self.settings.target, self.settings.retain_history) {
                warn!(error = %e, "history pruning failed");
            }
        }
    }

    /// Restore the attempt's snapshot, then force-restart exactly once.
    fn roll_back(&self, run: &mut Run) -> anyhow::Result<()> {
        let key = run
            .snapshot
            .as_ref()
            .map(|s| s.key().to_string())
            .ok_or_else(|| anyhow!("no snapshot to roll back to"))?;
        warn!(target_name = %self.settings.target, %key, "rolling back");

        self.snapshots
            .restore(&key)
            .with_context(|| format!("restore of snapshot {key} failed"))?;
        self.collaborators
            .service
            .force_restart()
            .context("restart after restore failed")?;
        info!(%key, "rollback complete");
        Ok(())
    }

    fn note_failure(&self, phase: UpdatePhase, err: &anyhow::Error, run: &mut Run) {
        let message = format!("{err:#}");
        if phase == UpdatePhase::RollingBack {
            error!(error = %message, "rollback failed");
            let reason = run.attempt.reason.take().unwrap_or_default();
            run.attempt.reason = Some(format!("{reason}; rollback failed: {message}"));
            return;
        }
        error!(%phase, error = %message, "update phase failed");
        run.attempt.failed_phase = Some(phase.label().to_string());
        run.attempt.reason = Some(message);
    }

    /// Best-effort history write.
    fn record(&self, attempt: &UpdateAttempt) {
        if let Some(store) = &self.history {
            if let Err(e) = store.put_attempt(attempt) {
                warn!(error = %e, "failed to record attempt history");
            }
        }
    }

    /// Take a snapshot outside an update and prune to retention.
    pub fn backup(&self) -> UpdateResult<(Snapshot, Vec<String>)> {
        let revision = self.collaborators.fetcher.current_revision().ok();
        let snapshot = self.snapshots.create(revision.as_deref())?;
        let pruned = self
            .snapshots
            .prune(self.settings.retain_snapshots, Some(snapshot.key()))?;
        Ok((snapshot, pruned))
    }

    /// Restore `key` and force-restart the service.
    pub fn restore(&self, key: &str) -> UpdateResult<Snapshot> {
        let snapshot = self.snapshots.restore(key)?;
        self.collaborators
            .service
            .force_restart()
            .map_err(UpdateError::Service)?;
        Ok(snapshot)
    }
}
