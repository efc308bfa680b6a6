//! Subprocess helpers shared by the system collaborators.

use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Run `cmd` to completion, failing on a non-zero exit.
///
/// Returns the captured output so callers can inspect stdout.
pub fn run_command(cmd: &mut Command) -> Result<Output> {
    debug!("Running: {:?}", cmd);
    let program = cmd.get_program().to_string_lossy().to_string();

    let output = cmd
        .output()
        .with_context(|| format!("failed to execute {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        bail!(
            "{program} failed (exit code: {}).\n\nStderr:\n{}\n\nStdout:\n{}",
            output.status.code().unwrap_or(-1),
            stderr.trim(),
            stdout.trim(),
        );
    }
    Ok(output)
}

/// Run a configured argv (`[program, args...]`), optionally inside `dir`.
pub fn run_argv(argv: &[String], dir: Option<&Path>) -> Result<Output> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    run_command(&mut cmd)
}

/// Trimmed stdout as a string.
pub fn stdout_string(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
