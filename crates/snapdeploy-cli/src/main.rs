//! snapdeploy: snapshot, update, verify, and roll back a deployment.
//!
//! # Usage
//!
//! ```text
//! snapdeploy --config /etc/snapdeploy/deploy.toml update
//! snapdeploy snapshots
//! snapdeploy restore 20260301_120000
//! snapdeploy monitor --once
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "snapdeploy",
    about = "Snapshot-guarded updates with health verification and rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to deploy.toml
    #[arg(
        short,
        long,
        global = true,
        env = "SNAPDEPLOY_CONFIG",
        default_value = "/etc/snapdeploy/deploy.toml"
    )]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot, fetch, sync, activate, verify; roll back on failure.
    ///
    /// Exit codes: 0 success, 1 aborted, 2 rolled back,
    /// 3 failed with no rollback path.
    Update,
    /// Take a snapshot without touching the service.
    Backup,
    /// List snapshots, newest first.
    Snapshots {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Restore a snapshot and force-restart the service.
    Restore {
        /// Snapshot key, e.g. 20260301_120000
        key: String,
    },
    /// Show recorded update attempts.
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Probe the liveness endpoint once. Exits 0 only when healthy.
    Probe {
        /// Path to probe instead of the configured health endpoint
        #[arg(short, long)]
        path: Option<String>,
    },
    /// Probe periodically and raise alerts on status changes.
    Monitor {
        /// Check once and exit (for cron).
        #[arg(long)]
        once: bool,
    },
    /// Print the effective configuration.
    Config,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,snapdeploy=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "snapdeploy failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = commands::load_config(&cli.config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Update => runtime.block_on(commands::update::update(&config)),
        Commands::Backup => commands::snapshots::backup(&config),
        Commands::Snapshots { format } => commands::snapshots::list(&config, &format),
        Commands::Restore { key } => commands::snapshots::restore(&config, &key),
        Commands::History { limit, format } => commands::update::history(&config, limit, &format),
        Commands::Probe { path } => runtime.block_on(commands::health::probe(&config, path.as_deref())),
        Commands::Monitor { once } => runtime.block_on(commands::health::monitor(&config, once)),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_restore_with_global_flags() {
        let cli = Cli::try_parse_from([
            "snapdeploy",
            "restore",
            "20260301_120000",
            "--config",
            "/tmp/deploy.toml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/deploy.toml"));
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(cli.command, Commands::Restore { key } if key == "20260301_120000"));
    }

    #[test]
    fn monitor_once_flag() {
        let cli = Cli::try_parse_from(["snapdeploy", "monitor", "--once"]).unwrap();
        assert!(matches!(cli.command, Commands::Monitor { once: true }));
    }
}
