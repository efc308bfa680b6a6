//! Health monitor. Periodic probing that alerts rather than rolls back.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertKind, AlertSink};
use crate::checker::{HealthProbe, HealthStatus, HealthTracker, ProbeOutcome};

/// Probes one target on a fixed interval and reports status transitions.
pub struct HealthMonitor<P> {
    target: String,
    probe: P,
    tracker: HealthTracker,
    interval: Duration,
    sinks: Vec<Box<dyn AlertSink>>,
}

impl<P: HealthProbe> HealthMonitor<P> {
    pub fn new(target: &str, probe: P, interval: Duration, unhealthy_threshold: u32) -> Self {
        Self {
            target: target.to_string(),
            probe,
            tracker: HealthTracker::new(unhealthy_threshold),
            interval,
            sinks: Vec::new(),
        }
    }

    /// Add an alert destination.
    pub fn with_sink(mut self, sink: Box<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn status(&self) -> HealthStatus {
        self.tracker.status()
    }

    /// Probe once, update the tracker, and alert on a status transition.
    pub async fn check_once(&mut self) -> HealthStatus {
        let outcome = self.probe.probe().await;
        let previous = self.tracker.status();
        let current = self.tracker.record(outcome);
        debug!(target_name = %self.target, ?outcome, ?current, "health check");

        let kind = match (previous, current) {
            (HealthStatus::Unhealthy, HealthStatus::Unhealthy) => None,
            (_, HealthStatus::Unhealthy) => Some(AlertKind::Unhealthy),
            (HealthStatus::Unhealthy, HealthStatus::Healthy) => Some(AlertKind::Recovered),
            _ => None,
        };
        if let Some(kind) = kind {
            self.dispatch(kind, outcome);
        }
        current
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target_name = %self.target,
            interval_ms = self.interval.as_millis() as u64,
            "health monitor started"
        );
        loop {
            self.check_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(target_name = %self.target, "health monitor stopped");
    }

    fn dispatch(&self, kind: AlertKind, outcome: ProbeOutcome) {
        let alert = Alert {
            target: self.target.clone(),
            kind,
            status_code: outcome.status_code(self.probe.expected_status()),
            consecutive_failures: self.tracker.consecutive_failures(),
            at: Utc::now(),
        };
        for sink in &self.sinks {
            if let Err(e) = sink.send(&alert) {
                warn!(error = %e, "failed to deliver health alert");
            }
        }
    }
}
