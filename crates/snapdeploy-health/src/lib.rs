//! Liveness probes and periodic health monitoring.
//!
//! # Architecture
//!
//! ```text
//! HealthProbe (trait)
//!   └── HttpProbe: one bounded GET, no internal retries → ProbeOutcome
//!
//! HealthMonitor (periodic, alerts only)
//!   ├── HealthProbe::probe() every interval
//!   ├── HealthTracker (consecutive failures vs. threshold)
//!   └── AlertSink on each status transition
//! ```
//!
//! Retry policy belongs to callers: the update orchestrator polls a probe a
//! bounded number of times and rolls back, the monitor polls forever and
//! raises alerts.

pub mod alert;
pub mod checker;
pub mod monitor;

pub use alert::{Alert, AlertKind, AlertSink, FileAlertSink, LogAlertSink};
pub use checker::{HealthProbe, HealthStatus, HealthTracker, HttpProbe, ProbeOutcome, http_probe};
pub use monitor::HealthMonitor;
