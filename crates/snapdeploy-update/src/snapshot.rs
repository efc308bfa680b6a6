//! Snapshot store: point-in-time captures of the data store and code tree.
//!
//! Layout under the backup root:
//!
//! ```text
//! <backup_root>/<key>/
//!     manifest.json
//!     data.db          copy of the data-store file, if one existed
//!     data.db-wal      copy of its WAL sidecar, if one existed
//!     code.tar.zst     the code tree minus excluded paths
//! ```
//!
//! A snapshot is assembled in `<key>.partial/`, every file is fsynced, and
//! the directory is renamed into place last. Anything without a manifest or
//! still carrying the `.partial` suffix is not a snapshot.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use snapdeploy_core::DeployConfig;

use crate::archive::{TreeFilter, pack_tree, restore_tree};
use crate::error::{SnapshotError, SnapshotResult, io_context};

const MANIFEST_FILE: &str = "manifest.json";
const DATA_FILE: &str = "data.db";
const WAL_FILE: &str = "data.db-wal";
const CODE_ARCHIVE: &str = "code.tar.zst";
const PARTIAL_SUFFIX: &str = ".partial";
const KEY_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Sidecar suffixes SQLite keeps next to the main database file.
const SQLITE_SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];

/// What the snapshot store captures and where it keeps captures.
#[derive(Debug, Clone)]
pub struct SnapshotLayout {
    pub code_dir: PathBuf,
    pub data_store: PathBuf,
    pub backup_root: PathBuf,
    /// Directory names left out of the code archive anywhere in the tree.
    pub exclude_dirs: Vec<String>,
    /// Further absolute paths left out of the code archive.
    pub exclude_paths: Vec<PathBuf>,
}

impl SnapshotLayout {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            code_dir: config.paths.app_dir.clone(),
            data_store: config.data_store_path(),
            backup_root: config.backup_root(),
            exclude_dirs: config.dependencies.cache_dirs.clone(),
            exclude_paths: vec![config.state_dir()],
        }
    }

    fn tree_filter(&self) -> TreeFilter {
        let mut filter = TreeFilter::new(self.exclude_dirs.iter().cloned());
        filter.exclude_path(&self.code_dir, &self.data_store);
        for suffix in SQLITE_SIDECARS {
            filter.exclude_path(&self.code_dir, &sidecar(&self.data_store, suffix));
        }
        filter.exclude_path(&self.code_dir, &self.backup_root);
        for path in &self.exclude_paths {
            filter.exclude_path(&self.code_dir, path);
        }
        filter
    }
}

/// Data-store half of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCopy {
    pub size: u64,
    /// Hex SHA-256 of the copied file.
    pub sha256: String,
    /// Whether a WAL sidecar was captured alongside.
    pub wal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub key: String,
    pub created_at: DateTime<Utc>,
    /// Code revision live when the snapshot was taken.
    pub revision: Option<String>,
    /// `None` when no data-store file existed.
    pub data: Option<DataCopy>,
    pub archive_size: u64,
    pub archive_entries: u64,
    /// Paths left out of the code archive.
    #[serde(default)]
    pub excluded: Vec<String>,
}

/// A complete snapshot on disk.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub manifest: SnapshotManifest,
    pub path: PathBuf,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.manifest.key
    }
}

/// Creates, restores, lists, and prunes snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    layout: SnapshotLayout,
}

impl SnapshotStore {
    pub fn new(layout: SnapshotLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &SnapshotLayout {
        &self.layout
    }

    /// Capture the current data store and code tree.
    pub fn create(&self, revision: Option<&str>) -> SnapshotResult<Snapshot> {
        self.create_at(Utc::now(), revision)
    }

    /// Capture with an explicit timestamp (the key derives from it).
    pub fn create_at(&self, now: DateTime<Utc>, revision: Option<&str>) -> SnapshotResult<Snapshot> {
        let root = &self.layout.backup_root;
        fs::create_dir_all(root).map_err(io_context(format!("create {}", root.display())))?;

        let (key, partial) = self.reserve_key(now)?;
        match self.write_snapshot(&key, &partial, now, revision) {
            Ok(manifest) => {
                let path = root.join(&key);
                fs::rename(&partial, &path).map_err(io_context(format!(
                    "publish snapshot {}",
                    path.display()
                )))?;
                sync_dir(root)?;
                info!(
                    %key,
                    data = manifest.data.is_some(),
                    archive_bytes = manifest.archive_size,
                    "snapshot written"
                );
                Ok(Snapshot { manifest, path })
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&partial) {
                    warn!(error = %cleanup, path = %partial.display(), "failed to discard partial snapshot");
                }
                Err(e)
            }
        }
    }

    /// Pick an unused key for `now` and create its partial directory.
    fn reserve_key(&self, now: DateTime<Utc>) -> SnapshotResult<(String, PathBuf)> {
        let base = now.format(KEY_FORMAT).to_string();
        let root = &self.layout.backup_root;
        for n in 0u32.. {
            let key = if n == 0 { base.clone() } else { format!("{base}-{n}") };
            let partial = root.join(format!("{key}{PARTIAL_SUFFIX}"));
            if root.join(&key).exists() {
                continue;
            }
            match fs::create_dir(&partial) {
                Ok(()) => return Ok((key, partial)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(io_context(format!("create {}", partial.display()))(e));
                }
            }
        }
        unreachable!("u32 key suffixes exhausted")
    }

    fn write_snapshot(
        &self,
        key: &str,
        dir: &Path,
        now: DateTime<Utc>,
        revision: Option<&str>,
    ) -> SnapshotResult<SnapshotManifest> {
        let data = self.copy_data_store(dir)?;

        let filter = self.layout.tree_filter();
        let archive = dir.join(CODE_ARCHIVE);
        let archive_entries = pack_tree(&self.layout.code_dir, &filter, &archive)?;
        let archive_size = fs::metadata(&archive)
            .map_err(io_context(format!("stat {}", archive.display())))?
            .len();

        let manifest = SnapshotManifest {
            key: key.to_string(),
            created_at: now,
            revision: revision.map(String::from),
            data,
            archive_size,
            archive_entries,
            excluded: filter.describe(),
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        let mut file = File::create(&manifest_path)
            .map_err(io_context(format!("create {}", manifest_path.display())))?;
        file.write_all(&serde_json::to_vec_pretty(&manifest)?)
            .map_err(io_context(format!("write {}", manifest_path.display())))?;
        file.sync_all()
            .map_err(io_context(format!("sync {}", manifest_path.display())))?;
        sync_dir(dir)?;
        Ok(manifest)
    }

    fn copy_data_store(&self, dir: &Path) -> SnapshotResult<Option<DataCopy>> {
        let source = &self.layout.data_store;
        if !source.exists() {
            debug!(path = %source.display(), "no data store to capture");
            return Ok(None);
        }
        let dest = dir.join(DATA_FILE);
        let size = copy_durable(source, &dest)?;
        let sha256 = sha256_file(&dest)?;

        let wal_source = sidecar(source, "-wal");
        let wal = wal_source.exists();
        if wal {
            copy_durable(&wal_source, &dir.join(WAL_FILE))?;
        }
        Ok(Some(DataCopy { size, sha256, wal }))
    }

    /// All complete snapshots, newest first.
    pub fn list(&self) -> SnapshotResult<Vec<Snapshot>> {
        let root = &self.layout.backup_root;
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_context(format!("read {}", root.display()))(e)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_context(format!("read {}", root.display())))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(PARTIAL_SUFFIX) || !entry.path().is_dir() {
                continue;
            }
            match read_manifest(&entry.path()) {
                Ok(manifest) => snapshots.push(Snapshot {
                    manifest,
                    path: entry.path(),
                }),
                Err(e) => debug!(%name, error = %e, "ignoring directory without a valid manifest"),
            }
        }
        snapshots.sort_by(|a, b| key_order(b.key()).cmp(&key_order(a.key())));
        Ok(snapshots)
    }

    pub fn get(&self, key: &str) -> SnapshotResult<Snapshot> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(SnapshotError::NotFound(key.to_string()));
        }
        let path = self.layout.backup_root.join(key);
        if !path.join(MANIFEST_FILE).is_file() {
            return Err(SnapshotError::NotFound(key.to_string()));
        }
        let manifest = read_manifest(&path)?;
        Ok(Snapshot { manifest, path })
    }

    /// Put the data store and code tree back to their state at `key`.
    pub fn restore(&self, key: &str) -> SnapshotResult<Snapshot> {
        let snapshot = self.get(key)?;
        self.verify(&snapshot)?;

        let archive = snapshot.path.join(CODE_ARCHIVE);
        restore_tree(&archive, &self.layout.code_dir, &self.layout.tree_filter())?;
        self.restore_data_store(&snapshot)?;

        info!(%key, "snapshot restored");
        Ok(snapshot)
    }

    /// Check the captured data store against its recorded digest.
    fn verify(&self, snapshot: &Snapshot) -> SnapshotResult<()> {
        let key = snapshot.key();
        if !snapshot.path.join(CODE_ARCHIVE).is_file() {
            return Err(SnapshotError::Corrupt {
                key: key.to_string(),
                reason: "code archive missing".to_string(),
            });
        }
        if let Some(data) = &snapshot.manifest.data {
            let copy = snapshot.path.join(DATA_FILE);
            let actual = sha256_file(&copy)?;
            if actual != data.sha256 {
                return Err(SnapshotError::Corrupt {
                    key: key.to_string(),
                    reason: format!("data store digest {actual} != recorded {}", data.sha256),
                });
            }
        }
        Ok(())
    }

    fn restore_data_store(&self, snapshot: &Snapshot) -> SnapshotResult<()> {
        let target = &self.layout.data_store;
        for suffix in SQLITE_SIDECARS {
            remove_if_exists(&sidecar(target, suffix))?;
        }

        let Some(data) = &snapshot.manifest.data else {
            // No data store existed at snapshot time.
            return remove_if_exists(target);
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_context(format!("create {}", parent.display())))?;
        }
        let staged = sidecar(target, ".restore");
        copy_durable(&snapshot.path.join(DATA_FILE), &staged)?;
        fs::rename(&staged, target)
            .map_err(io_context(format!("replace {}", target.display())))?;
        if data.wal {
            copy_durable(&snapshot.path.join(WAL_FILE), &sidecar(target, "-wal"))?;
        }
        if let Some(parent) = target.parent() {
            sync_dir(parent)?;
        }
        Ok(())
    }

    /// Delete snapshots beyond the newest `keep`, oldest first.
    ///
    /// `protect` is never deleted and counts toward `keep`. Leftover partial
    /// directories from interrupted runs are removed as well. Returns the
    /// keys that were deleted.
    pub fn prune(&self, keep: usize, protect: Option<&str>) -> SnapshotResult<Vec<String>> {
        let snapshots = self.list()?;
        let mut budget = keep.saturating_sub(usize::from(protect.is_some()));
        let mut doomed = Vec::new();
        for snapshot in &snapshots {
            if Some(snapshot.key()) == protect {
                continue;
            }
            if budget > 0 {
                budget -= 1;
            } else {
                doomed.push(snapshot);
            }
        }

        // Oldest first.
        let mut deleted = Vec::new();
        for snapshot in doomed.into_iter().rev() {
            fs::remove_dir_all(&snapshot.path)
                .map_err(io_context(format!("remove {}", snapshot.path.display())))?;
            debug!(key = %snapshot.key(), "snapshot pruned");
            deleted.push(snapshot.key().to_string());
        }

        self.remove_partials()?;
        if !deleted.is_empty() {
            info!(count = deleted.len(), keep, "old snapshots pruned");
        }
        Ok(deleted)
    }

    fn remove_partials(&self) -> SnapshotResult<()> {
        let root = &self.layout.backup_root;
        let Ok(entries) = fs::read_dir(root) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                let path = entry.path();
                fs::remove_dir_all(&path).map_err(io_context(format!("remove {}", path.display())))?;
                warn!(path = %path.display(), "removed interrupted snapshot");
            }
        }
        Ok(())
    }
}

/// Sort key for snapshot keys: timestamp, then numeric collision suffix.
fn key_order(key: &str) -> (&str, u32) {
    match key.split_once('-') {
        Some((base, n)) => (base, n.parse().unwrap_or(0)),
        None => (key, 0),
    }
}

fn read_manifest(dir: &Path) -> SnapshotResult<SnapshotManifest> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path).map_err(io_context(format!("read {}", path.display())))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// `path` with `suffix` appended to its file name.
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn copy_durable(from: &Path, to: &Path) -> SnapshotResult<u64> {
    let context = || format!("copy {} to {}", from.display(), to.display());
    let size = fs::copy(from, to).map_err(io_context(context()))?;
    File::open(to)
        .and_then(|f| f.sync_all())
        .map_err(io_context(context()))?;
    Ok(size)
}

fn sync_dir(dir: &Path) -> SnapshotResult<()> {
    File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(io_context(format!("sync {}", dir.display())))
}

fn remove_if_exists(path: &Path) -> SnapshotResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_context(format!("remove {}", path.display()))(e)),
    }
}

/// Compute the SHA-256 of a file and return the hex digest.
pub(crate) fn sha256_file(path: &Path) -> SnapshotResult<String> {
    let mut file = File::open(path).map_err(io_context(format!("open {}", path.display())))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_context(format!("hash {}", path.display())))?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: SnapshotStore,
        code: PathBuf,
        db: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let code = dir.path().join("app");
        fs::create_dir_all(code.join("app")).unwrap();
        fs::create_dir_all(code.join("venv/bin")).unwrap();
        fs::write(code.join("run.py"), "v1\n").unwrap();
        fs::write(code.join("app/main.py"), "main v1\n").unwrap();
        fs::write(code.join("venv/bin/python"), "py\n").unwrap();
        let db = code.join("app.db");
        fs::write(&db, b"SQLite format 3\0 rows v1").unwrap();

        let layout = SnapshotLayout {
            code_dir: code.clone(),
            data_store: db.clone(),
            backup_root: code.join("backups"),
            exclude_dirs: vec!["venv".to_string()],
            exclude_paths: Vec::new(),
        };
        Fixture {
            _dir: dir,
            store: SnapshotStore::new(layout),
            code,
            db,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_780_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn create_writes_complete_snapshot() {
        let f = fixture();
        let snapshot = f.store.create_at(at(0), Some("abc123")).unwrap();

        assert_eq!(snapshot.key(), at(0).format(KEY_FORMAT).to_string());
        assert!(snapshot.path.join(MANIFEST_FILE).is_file());
        assert!(snapshot.path.join(DATA_FILE).is_file());
        assert!(snapshot.path.join(CODE_ARCHIVE).is_file());
        assert_eq!(snapshot.manifest.revision.as_deref(), Some("abc123"));
        assert!(snapshot.manifest.excluded.contains(&"app.db".to_string()));
        assert!(snapshot.manifest.excluded.contains(&"backups".to_string()));

        let data = snapshot.manifest.data.as_ref().unwrap();
        assert_eq!(data.sha256, sha256_file(&f.db).unwrap());
        assert!(!data.wal);
        assert_eq!(fs::read(snapshot.path.join(DATA_FILE)).unwrap(), fs::read(&f.db).unwrap());

        // Backups live inside the tree here but must not be archived into themselves.
        let listed = f.store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!f.store.layout().backup_root.join(format!("{}.partial", snapshot.key())).exists());
    }

    #[test]
    fn same_second_keys_get_suffixes() {
        let f = fixture();
        let a = f.store.create_at(at(0), None).unwrap();
        let b = f.store.create_at(at(0), None).unwrap();
        assert_eq!(b.key(), format!("{}-1", a.key()));

        let keys: Vec<_> = f.store.list().unwrap().iter().map(|s| s.key().to_string()).collect();
        assert_eq!(keys, [b.key(), a.key()]);
    }

    #[test]
    fn restore_is_byte_identical() {
        let f = fixture();
        let snapshot = f.store.create_at(at(0), None).unwrap();
        let db_before = fs::read(&f.db).unwrap();

        fs::write(f.code.join("run.py"), "v2\n").unwrap();
        fs::write(f.code.join("app/added.py"), "new\n").unwrap();
        fs::remove_file(f.code.join("app/main.py")).unwrap();
        fs::write(&f.db, b"SQLite format 3\0 rows v2 migrated").unwrap();
        fs::write(sidecar(&f.db, "-wal"), b"wal frames").unwrap();

        f.store.restore(snapshot.key()).unwrap();

        assert_eq!(fs::read(&f.db).unwrap(), db_before);
        assert!(!sidecar(&f.db, "-wal").exists());
        assert_eq!(fs::read_to_string(f.code.join("run.py")).unwrap(), "v1\n");
        assert_eq!(fs::read_to_string(f.code.join("app/main.py")).unwrap(), "main v1\n");
        assert!(!f.code.join("app/added.py").exists());
        assert!(f.code.join("venv/bin/python").exists());
        // The snapshot itself survives the restore.
        assert!(f.store.get(snapshot.key()).is_ok());
    }

    #[test]
    fn wal_sidecar_round_trips() {
        let f = fixture();
        fs::write(sidecar(&f.db, "-wal"), b"wal v1").unwrap();
        let snapshot = f.store.create_at(at(0), None).unwrap();
        assert!(snapshot.manifest.data.as_ref().unwrap().wal);

        fs::write(sidecar(&f.db, "-wal"), b"wal v2").unwrap();
        f.store.restore(snapshot.key()).unwrap();
        assert_eq!(fs::read(sidecar(&f.db, "-wal")).unwrap(), b"wal v1");
    }

    #[test]
    fn restore_without_data_store_removes_new_one() {
        let f = fixture();
        fs::remove_file(&f.db).unwrap();
        let snapshot = f.store.create_at(at(0), None).unwrap();
        assert!(snapshot.manifest.data.is_none());

        fs::write(&f.db, b"created by the update").unwrap();
        f.store.restore(snapshot.key()).unwrap();
        assert!(!f.db.exists());
    }

    #[test]
    fn restore_rejects_tampered_data() {
        let f = fixture();
        let snapshot = f.store.create_at(at(0), None).unwrap();
        fs::write(snapshot.path.join(DATA_FILE), b"bit rot").unwrap();
        fs::write(f.code.join("run.py"), "v2\n").unwrap();

        let err = f.store.restore(snapshot.key()).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt { .. }));
        // Nothing was touched.
        assert_eq!(fs::read_to_string(f.code.join("run.py")).unwrap(), "v2\n");
    }

    #[test]
    fn get_rejects_unknown_and_traversal_keys() {
        let f = fixture();
        assert!(matches!(f.store.get("20990101_000000"), Err(SnapshotError::NotFound(_))));
        assert!(matches!(f.store.get("../etc"), Err(SnapshotError::NotFound(_))));
        assert!(matches!(f.store.get(""), Err(SnapshotError::NotFound(_))));
    }

    #[test]
    fn create_fails_cleanly_when_backup_root_unwritable() {
        let f = fixture();
        // A regular file where the backup directory should be.
        fs::write(&f.store.layout().backup_root, b"not a dir").unwrap();
        let err = f.store.create_at(at(0), None).unwrap_err();
        assert!(matches!(err, SnapshotError::Io { .. }));
    }

    #[test]
    fn prune_keeps_newest_and_protected() {
        let f = fixture();
        let mut keys = Vec::new();
        for i in 0..5 {
            keys.push(f.store.create_at(at(i * 60), None).unwrap().key().to_string());
        }

        // Protect the oldest: it survives and counts toward the budget.
        let deleted = f.store.prune(3, Some(&keys[0])).unwrap();
        assert_eq!(deleted, [keys[1].clone(), keys[2].clone()]);

        let left: Vec<_> = f.store.list().unwrap().iter().map(|s| s.key().to_string()).collect();
        assert_eq!(left, [keys[4].clone(), keys[3].clone(), keys[0].clone()]);
    }

    #[test]
    fn prune_deletes_oldest_first() {
        let f = fixture();
        let mut keys = Vec::new();
        for i in 0..4 {
            keys.push(f.store.create_at(at(i), None).unwrap().key().to_string());
        }
        let deleted = f.store.prune(2, Some(&keys[3])).unwrap();
        assert_eq!(deleted, [keys[0].clone(), keys[1].clone()]);
        assert_eq!(f.store.prune(2, Some(&keys[3])).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn prune_removes_interrupted_partials() {
        let f = fixture();
        f.store.create_at(at(0), None).unwrap();
        let partial = f.store.layout().backup_root.join("20000101_000000.partial");
        fs::create_dir_all(&partial).unwrap();

        f.store.prune(10, None).unwrap();
        assert!(!partial.exists());
        assert_eq!(f.store.list().unwrap().len(), 1);
    }

    #[test]
    fn key_order_handles_multi_digit_suffixes() {
        assert!(key_order("20260101_000000-10") > key_order("20260101_000000-2"));
        assert!(key_order("20260101_000001") > key_order("20260101_000000-10"));
    }
}
