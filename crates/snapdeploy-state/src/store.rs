//! Redb-backed history of update attempts.
//!
//! Supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use snapdeploy_core::UpdateAttempt;

use crate::error::{StateError, StateResult};
use crate::tables::ATTEMPTS;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe history store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "history store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory history store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ATTEMPTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or update an attempt record.
    pub fn put_attempt(&self, attempt: &UpdateAttempt) -> StateResult<()> {
        let key = attempt.table_key();
        let value = serde_json::to_vec(attempt).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ATTEMPTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, outcome = ?attempt.outcome, "attempt stored");
        Ok(())
    }

    /// Get an attempt by `{target}:{id}` key.
    pub fn get_attempt(&self, key: &str) -> StateResult<Option<UpdateAttempt>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ATTEMPTS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let attempt: UpdateAttempt =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(attempt))
            }
            None => Ok(None),
        }
    }

    /// List a target's attempts, newest first, up to `limit`.
    pub fn list_attempts(&self, target: &str, limit: usize) -> StateResult<Vec<UpdateAttempt>> {
        let prefix = format!("{target}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ATTEMPTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            if results.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let attempt: UpdateAttempt =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(attempt);
            }
        }
        Ok(results)
    }

    /// Most recent attempt for a target.
    pub fn latest_attempt(&self, target: &str) -> StateResult<Option<UpdateAttempt>> {
        Ok(self.list_attempts(target, 1)?.into_iter().next())
    }

    /// Delete all but the newest `keep` attempts of a target. Returns number deleted.
    pub fn prune_attempts(&self, target: &str, keep: usize) -> StateResult<u32> {
        let prefix = format!("{target}:");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(ATTEMPTS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))?.rev() {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let k = key.value().to_string();
                if k.starts_with(&prefix) {
                    keys.push(k);
                }
            }
            keys.into_iter().skip(keep).collect()
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(ATTEMPTS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%target, count, "old attempts pruned");
        Ok(count)
    }
}
