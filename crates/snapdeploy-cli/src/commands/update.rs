use snapdeploy_core::DeployConfig;
use snapdeploy_update::DeployLock;
use tracing::warn;

use super::{open_history, orchestrator};

pub async fn update(config: &DeployConfig) -> anyhow::Result<u8> {
    let _lock = DeployLock::acquire(&config.state_dir(), &config.service.name)?;

    let mut orch = orchestrator(config)?;
    match open_history(config) {
        Ok(store) => orch = orch.with_history(store),
        Err(e) => warn!(error = %format!("{e:#}"), "attempt history unavailable"),
    }

    let report = orch.run_update().await;
    let attempt = &report.attempt;

    println!("outcome:   {}", report.outcome());
    if let Some(key) = &attempt.snapshot_key {
        println!("snapshot:  {key}");
    }
    if let (Some(before), Some(after)) = (&attempt.revision_before, &attempt.revision_after) {
        println!("revision:  {before} -> {after}");
    }
    if !attempt.observations.is_empty() {
        let codes: Vec<String> = attempt
            .observations
            .iter()
            .map(|o| format!("{:03}", o.status_code))
            .collect();
        println!("probes:    {}", codes.join(" "));
    }
    if let Some(reason) = &attempt.reason {
        println!("reason:    {reason}");
    }
    for warning in &attempt.warnings {
        println!("warning:   {warning}");
    }

    // Exit codes are 0..=3.
    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

pub fn history(config: &DeployConfig, limit: usize, format: &str) -> anyhow::Result<u8> {
    let store = open_history(config)?;
    let attempts = store.list_attempts(&config.service.name, limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&attempts)?),
        _ => {
            if attempts.is_empty() {
                println!("no recorded updates for {}", config.service.name);
            }
            for a in &attempts {
                let outcome = a.outcome.map(|o| o.label()).unwrap_or("in-progress");
                println!(
                    "{:<20} {:<24} {:<10} {}",
                    a.id,
                    outcome,
                    a.revision_after.as_deref().map(short_rev).unwrap_or("-"),
                    a.reason.as_deref().unwrap_or(""),
                );
            }
        }
    }
    Ok(0)
}

fn short_rev(rev: &str) -> &str {
    rev.get(..10).unwrap_or(rev)
}
