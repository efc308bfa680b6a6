//! Health check probe logic.
//!
//! A probe issues exactly one bounded-timeout HTTP request. Connection
//! failures and timeouts are reported as [`ProbeOutcome::Unreachable`],
//! which callers treat like any other non-matching status.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use snapdeploy_core::config::HealthConfig;
use snapdeploy_core::ConfigError;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint answered with the expected status code.
    Healthy,
    /// The endpoint answered with any other status code.
    Unhealthy(u16),
    /// The probe could not complete (connection error or timeout).
    Unreachable,
}

impl ProbeOutcome {
    pub fn is_healthy(self) -> bool {
        self == ProbeOutcome::Healthy
    }

    /// Observed status code; `0` for an unreachable endpoint.
    pub fn status_code(self, expected: u16) -> u16 {
        match self {
            ProbeOutcome::Healthy => expected,
            ProbeOutcome::Unhealthy(code) => code,
            ProbeOutcome::Unreachable => 0,
        }
    }
}

/// A single liveness check. Implementations never retry.
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> impl Future<Output = ProbeOutcome> + Send;

    /// Status code counted as healthy.
    fn expected_status(&self) -> u16 {
        200
    }
}

impl<P: HealthProbe> HealthProbe for &P {
    fn probe(&self) -> impl Future<Output = ProbeOutcome> + Send {
        (**self).probe()
    }

    fn expected_status(&self) -> u16 {
        (**self).expected_status()
    }
}

/// HTTP/1.1 probe against a fixed local endpoint.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    address: String,
    path: String,
    timeout: Duration,
    expected_status: u16,
}

impl HttpProbe {
    pub fn new(address: &str, path: &str, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            path: path.to_string(),
            timeout,
            expected_status: 200,
        }
    }

    /// Build a probe for `path` using the `[health]` address and timeout.
    pub fn from_config(config: &HealthConfig, path: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(&config.address, path, config.timeout()?)
            .with_expected_status(config.expected_status))
    }

    pub fn with_expected_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl HealthProbe for HttpProbe {
    fn probe(&self) -> impl Future<Output = ProbeOutcome> + Send {
        http_probe(&self.address, &self.path, self.timeout, self.expected_status)
    }

    fn expected_status(&self) -> u16 {
        self.expected_status
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` only on an exact `expected` status match.
pub async fn http_probe(address: &str, path: &str, timeout: Duration, expected: u16) -> ProbeOutcome {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeOutcome::Unreachable;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeOutcome::Unreachable;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", address)
            .header("user-agent", "snapdeploy-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, %uri, "health probe request is malformed");
                return ProbeOutcome::Unreachable;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if status == expected {
                    ProbeOutcome::Healthy
                } else {
                    debug!(status, %uri, "health probe status mismatch");
                    ProbeOutcome::Unhealthy(status)
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeOutcome::Unreachable
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeOutcome::Unreachable
        }
    }
}

/// Aggregate health of a target as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Tracks consecutive probe results for a single target.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Failures before marking unhealthy.
    unhealthy_threshold: u32,
    /// Successes needed to recover from unhealthy.
    healthy_threshold: u32,
}

impl HealthTracker {
    /// A tracker that recovers on a single success.
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self::with_thresholds(unhealthy_threshold, 1)
    }

    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeOutcome) -> HealthStatus {
        if result.is_healthy() {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;

            if self.consecutive_successes >= self.healthy_threshold {
                if self.status == HealthStatus::Unhealthy {
                    debug!(successes = self.consecutive_successes, "target recovered");
                }
                self.status = HealthStatus::Healthy;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;

            if self.consecutive_failures >= self.unhealthy_threshold {
                if self.status != HealthStatus::Unhealthy {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "target marked unhealthy"
                    );
                }
                self.status = HealthStatus::Unhealthy;
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned HTTP response and return the request line seen.
    async fn serve_once(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            request.lines().next().unwrap_or_default().to_string()
        });
        (address, handle)
    }

    #[tokio::test]
    async fn http_probe_healthy_on_200() {
        let (address, server) = serve_once("HTTP/1.1 200 OK").await;
        let probe = HttpProbe::new(&address, "/health", Duration::from_secs(2));
        assert_eq!(probe.probe().await, ProbeOutcome::Healthy);
        assert_eq!(server.await.unwrap(), "GET /health HTTP/1.1");
    }

    #[tokio::test]
    async fn http_probe_reports_other_codes() {
        let (address, _server) = serve_once("HTTP/1.1 500 Internal Server Error").await;
        let outcome = http_probe(&address, "/", Duration::from_secs(2), 200).await;
        assert_eq!(outcome, ProbeOutcome::Unhealthy(500));
    }

    #[tokio::test]
    async fn http_probe_requires_exact_match() {
        let (address, _server) = serve_once("HTTP/1.1 204 No Content").await;
        let outcome = http_probe(&address, "/", Duration::from_secs(2), 200).await;
        assert_eq!(outcome, ProbeOutcome::Unhealthy(204));
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_is_unreachable() {
        let outcome = http_probe("127.0.0.1:1", "/health", Duration::from_millis(100), 200).await;
        assert_eq!(outcome, ProbeOutcome::Unreachable);
        assert_eq!(outcome.status_code(200), 0);
    }

    #[tokio::test]
    async fn http_probe_times_out_as_unreachable() {
        // Accepts the connection but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });
        let outcome = http_probe(&address, "/", Duration::from_millis(100), 200).await;
        assert_eq!(outcome, ProbeOutcome::Unreachable);
    }

    #[test]
    fn probe_from_config() {
        let config = HealthConfig::default();
        let probe = HttpProbe::from_config(&config, "/").unwrap();
        assert_eq!(probe.address(), "127.0.0.1:12000");
        assert_eq!(probe.path(), "/");
        assert_eq!(probe.expected_status(), 200);
    }

    #[test]
    fn tracker_starts_unknown() {
        let tracker = HealthTracker::new(3);
        assert_eq!(tracker.status(), HealthStatus::Unknown);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_becomes_healthy_on_first_success() {
        let mut tracker = HealthTracker::new(3);
        assert_eq!(tracker.record(ProbeOutcome::Healthy), HealthStatus::Healthy);
    }

    #[test]
    fn tracker_stays_healthy_under_threshold() {
        let mut tracker = HealthTracker::new(3);
        tracker.record(ProbeOutcome::Healthy);

        tracker.record(ProbeOutcome::Unhealthy(502));
        tracker.record(ProbeOutcome::Unreachable);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.consecutive_failures(), 2);
    }

    #[test]
    fn tracker_treats_unreachable_like_any_failure() {
        let mut tracker = HealthTracker::new(3);
        tracker.record(ProbeOutcome::Healthy);
        for _ in 0..3 {
            tracker.record(ProbeOutcome::Unreachable);
        }
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn tracker_recovers_on_success() {
        let mut tracker = HealthTracker::new(3);
        for _ in 0..3 {
            tracker.record(ProbeOutcome::Unhealthy(500));
        }
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);

        assert_eq!(tracker.record(ProbeOutcome::Healthy), HealthStatus::Healthy);
    }

    #[test]
    fn custom_thresholds() {
        let mut tracker = HealthTracker::with_thresholds(5, 3);

        for _ in 0..4 {
            tracker.record(ProbeOutcome::Unhealthy(500));
        }
        assert_ne!(tracker.status(), HealthStatus::Unhealthy);

        tracker.record(ProbeOutcome::Unhealthy(500));
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);

        // Need 3 successes to recover.
        tracker.record(ProbeOutcome::Healthy);
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
        tracker.record(ProbeOutcome::Healthy);
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
        tracker.record(ProbeOutcome::Healthy);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
    }
}
