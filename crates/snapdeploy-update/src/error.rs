//! Error types for snapshots and update orchestration.

use std::path::PathBuf;

use thiserror::Error;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors raised while writing, reading, restoring, or pruning snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("snapshot {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("invalid snapshot manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Build a closure that wraps an `io::Error` with a description of the operation.
pub(crate) fn io_context(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> SnapshotError {
    let context = context.into();
    move |source| SnapshotError::Io { context, source }
}

/// Errors from operations outside the update state machine.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("deployment {target} is locked by {holder}; remove {path} if no update is running")]
    Locked {
        target: String,
        holder: String,
        path: PathBuf,
    },

    #[error("failed to manage deploy lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("service restart failed: {0}")]
    Service(#[source] anyhow::Error),
}

pub type UpdateResult<T> = Result<T, UpdateError>;
