//! SQLite consistency pass.
//!
//! Applies connection pragmas, ensures indexes on tables that exist, then
//! refreshes planner statistics. Individual statements that fail are
//! logged and skipped; only failing to open the database fails the pass.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use snapdeploy_core::config::{IndexSpec, MaintenanceConfig};

use crate::collaborators::DataStoreMaintainer;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SqliteMaintainer {
    path: PathBuf,
    pragmas: Vec<String>,
    indexes: Vec<IndexSpec>,
}

impl SqliteMaintainer {
    pub fn new(path: &Path, config: &MaintenanceConfig) -> Self {
        Self {
            path: path.to_path_buf(),
            pragmas: config.pragmas.clone(),
            indexes: config.indexes.clone(),
        }
    }

    fn open(&self) -> Result<Connection> {
        // Never create the store; the service owns its schema.
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db {}", self.path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

impl DataStoreMaintainer for SqliteMaintainer {
    fn optimize(&self) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no data store yet; skipping consistency pass");
            return Ok(());
        }
        let conn = self.open()?;

        let mut skipped = 0u32;
        for pragma in &self.pragmas {
            if !run_statement(&conn, pragma) {
                skipped += 1;
            }
        }

        for index in &self.indexes {
            match table_exists(&conn, &index.table) {
                Ok(true) => {
                    if !run_statement(&conn, &index.sql) {
                        skipped += 1;
                    }
                }
                Ok(false) => debug!(table = %index.table, "table absent; index skipped"),
                Err(e) => {
                    warn!(table = %index.table, error = %e, "table lookup failed");
                    skipped += 1;
                }
            }
        }

        for stmt in ["ANALYZE", "PRAGMA optimize"] {
            if !run_statement(&conn, stmt) {
                skipped += 1;
            }
        }

        info!(path = %self.path.display(), skipped, "data store consistency pass complete");
        Ok(())
    }
}

/// Execute one statement, draining any rows it returns. Failures are logged.
fn run_statement(conn: &Connection, sql: &str) -> bool {
    let result = conn.prepare(sql).and_then(|mut stmt| {
        let mut rows = stmt.query([])?;
        while rows.next()?.is_some() {}
        Ok(())
    });
    match result {
        Ok(()) => {
            debug!(sql, "statement applied");
            true
        }
        Err(e) => {
            warn!(sql, error = %e, "statement failed; continuing");
            false
        }
    }
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}
