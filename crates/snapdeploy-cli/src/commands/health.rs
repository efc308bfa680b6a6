use tokio::sync::watch;
use tracing::info;

use snapdeploy_core::DeployConfig;
use snapdeploy_health::{FileAlertSink, HealthMonitor, HealthProbe, HealthStatus, HttpProbe, LogAlertSink};

pub async fn probe(config: &DeployConfig, path: Option<&str>) -> anyhow::Result<u8> {
    let path = path.unwrap_or(config.health.endpoint.as_str());
    let probe = HttpProbe::from_config(&config.health, path)?;
    let outcome = probe.probe().await;
    println!(
        "http://{}{} -> {:03}",
        probe.address(),
        probe.path(),
        outcome.status_code(probe.expected_status())
    );
    Ok(if outcome.is_healthy() { 0 } else { 1 })
}

pub async fn monitor(config: &DeployConfig, once: bool) -> anyhow::Result<u8> {
    let probe = HttpProbe::from_config(&config.health, &config.health.endpoint)?;
    // A single cron-driven check has no streak to count.
    let threshold = if once { 1 } else { config.monitor.unhealthy_threshold };
    let mut monitor = HealthMonitor::new(&config.service.name, probe, config.monitor.interval()?, threshold)
        .with_sink(Box::new(LogAlertSink));
    if let Some(path) = &config.monitor.alert_log {
        monitor = monitor.with_sink(Box::new(FileAlertSink::new(config.resolve(path))));
    }

    if once {
        let status = monitor.check_once().await;
        return Ok(if status == HealthStatus::Healthy { 0 } else { 1 });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });
    monitor.run(shutdown_rx).await;
    Ok(0)
}
