use serde::Serialize;

use snapdeploy_core::DeployConfig;
use snapdeploy_update::DeployLock;

use super::{orchestrator, snapshot_store};

#[derive(Serialize)]
struct SnapshotRow<'a> {
    key: &'a str,
    created_at: String,
    revision: Option<&'a str>,
    data_bytes: Option<u64>,
    archive_bytes: u64,
    path: String,
}

pub fn backup(config: &DeployConfig) -> anyhow::Result<u8> {
    let _lock = DeployLock::acquire(&config.state_dir(), &config.service.name)?;
    let (snapshot, pruned) = orchestrator(config)?.backup()?;
    println!("snapshot {} written to {}", snapshot.key(), snapshot.path.display());
    for key in pruned {
        println!("pruned {key}");
    }
    Ok(0)
}

pub fn list(config: &DeployConfig, format: &str) -> anyhow::Result<u8> {
    let snapshots = snapshot_store(config).list()?;
    let rows: Vec<SnapshotRow<'_>> = snapshots
        .iter()
        .map(|s| SnapshotRow {
            key: s.key(),
            created_at: s.manifest.created_at.to_rfc3339(),
            revision: s.manifest.revision.as_deref(),
            data_bytes: s.manifest.data.as_ref().map(|d| d.size),
            archive_bytes: s.manifest.archive_size,
            path: s.path.display().to_string(),
        })
        .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            if rows.is_empty() {
                println!("no snapshots in {}", config.backup_root().display());
            }
            for row in &rows {
                println!(
                    "{:<20} {:<12} data={:<10} code={}",
                    row.key,
                    row.revision.map(|r| r.get(..10).unwrap_or(r)).unwrap_or("-"),
                    row.data_bytes.map_or_else(|| "none".to_string(), |b| b.to_string()),
                    row.archive_bytes,
                );
            }
        }
    }
    Ok(0)
}

pub fn restore(config: &DeployConfig, key: &str) -> anyhow::Result<u8> {
    let _lock = DeployLock::acquire(&config.state_dir(), &config.service.name)?;
    let snapshot = orchestrator(config)?.restore(key)?;
    println!("restored {} and restarted {}", snapshot.key(), config.service.unit());
    Ok(0)
}
