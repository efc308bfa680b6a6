//! Tar + zstd archives of the code tree.
//!
//! Archives are streamed straight to disk; excluded paths are pruned while
//! walking so dependency caches are never read.

use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{SnapshotResult, io_context};

const ZSTD_LEVEL: i32 = 3;

/// Decides which parts of the code tree belong to a snapshot.
#[derive(Debug, Clone, Default)]
pub struct TreeFilter {
    /// Directory names skipped anywhere in the tree.
    dir_names: Vec<String>,
    /// Paths relative to the tree root skipped along with everything below them.
    paths: Vec<PathBuf>,
}

impl TreeFilter {
    pub fn new(dir_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            dir_names: dir_names.into_iter().collect(),
            paths: Vec::new(),
        }
    }

    /// Exclude an absolute path if it lies inside `root`.
    pub fn exclude_path(&mut self, root: &Path, path: &Path) {
        if let Ok(relative) = path.strip_prefix(root) {
            if !relative.as_os_str().is_empty() {
                self.paths.push(relative.to_path_buf());
            }
        }
    }

    /// Whether `relative` (a path below the tree root) is left out.
    pub fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        if self.paths.iter().any(|p| relative.starts_with(p)) {
            return true;
        }
        if relative
            .components()
            .any(|c| self.dir_names.iter().any(|d| c.as_os_str() == d.as_str()))
        {
            return true;
        }
        !is_dir && relative.extension().is_some_and(|ext| ext == "pyc")
    }

    /// Human-readable exclusion list, recorded in snapshot manifests.
    pub fn describe(&self) -> Vec<String> {
        let mut out: Vec<String> = self.dir_names.iter().map(|d| format!("{d}/")).collect();
        out.extend(self.paths.iter().map(|p| p.display().to_string()));
        out.push("*.pyc".to_string());
        out
    }

    fn walk<'a>(&'a self, root: &'a Path) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> + 'a {
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| match entry.path().strip_prefix(root) {
                Ok(rel) if rel.as_os_str().is_empty() => true,
                Ok(rel) => !self.is_excluded(rel, entry.file_type().is_dir()),
                Err(_) => false,
            })
    }
}

/// Write `root` (minus excluded paths) to `dest` as a tar.zst archive.
///
/// Returns the number of entries archived.
pub fn pack_tree(root: &Path, filter: &TreeFilter, dest: &Path) -> SnapshotResult<u64> {
    let file = File::create(dest).map_err(io_context(format!("create {}", dest.display())))?;
    let encoder = zstd::Encoder::new(BufWriter::new(file), ZSTD_LEVEL)
        .map_err(io_context("start zstd stream"))?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries = 0u64;
    for entry in filter.walk(root) {
        let entry = entry.map_err(|e| {
            let context = format!("walk {}", root.display());
            io_context(context)(e.into())
        })?;
        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        let kind = entry.file_type();
        if kind.is_dir() {
            builder
                .append_dir(&relative, entry.path())
                .map_err(io_context(format!("archive {}", relative.display())))?;
        } else if kind.is_file() || kind.is_symlink() {
            builder
                .append_path_with_name(entry.path(), &relative)
                .map_err(io_context(format!("archive {}", relative.display())))?;
        } else {
            debug!(path = %relative.display(), "skipping special file");
            continue;
        }
        entries += 1;
    }

    let encoder = builder
        .into_inner()
        .map_err(io_context("finish tar stream"))?;
    let writer = encoder.finish().map_err(io_context("finish zstd stream"))?;
    let file = writer
        .into_inner()
        .map_err(|e| io_context("flush archive")(e.into_error()))?;
    file.sync_all()
        .map_err(io_context(format!("sync {}", dest.display())))?;

    debug!(entries, archive = %dest.display(), "code tree archived");
    Ok(entries)
}

/// Read every entry of an archive to make sure it is complete and decodable.
pub fn verify_archive(archive: &Path) -> SnapshotResult<u64> {
    let mut tar = open_archive(archive)?;
    let mut entries = 0u64;
    let mut sink = std::io::sink();
    for entry in tar
        .entries()
        .map_err(io_context(format!("read {}", archive.display())))?
    {
        let mut entry = entry.map_err(io_context(format!("read {}", archive.display())))?;
        std::io::copy(&mut entry, &mut sink)
            .map_err(io_context(format!("read {}", archive.display())))?;
        entries += 1;
    }
    Ok(entries)
}

/// Replace the non-excluded contents of `root` with the archive's contents.
///
/// Excluded paths (dependency caches, the data store) are left in place.
pub fn restore_tree(archive: &Path, root: &Path, filter: &TreeFilter) -> SnapshotResult<()> {
    // Refuse to touch the tree unless the archive reads back cleanly.
    verify_archive(archive)?;

    clear_tree(root, filter)?;

    let mut tar = open_archive(archive)?;
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(root)
        .map_err(io_context(format!("unpack into {}", root.display())))?;
    debug!(root = %root.display(), "code tree restored");
    Ok(())
}

fn clear_tree(root: &Path, filter: &TreeFilter) -> SnapshotResult<()> {
    if !root.exists() {
        return Ok(());
    }
    let mut entries: Vec<(PathBuf, bool)> = Vec::new();
    for entry in filter.walk(root) {
        let entry = entry.map_err(|e| {
            let context = format!("walk {}", root.display());
            io_context(context)(e.into())
        })?;
        if entry.path() != root {
            entries.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }

    // Deepest paths first so directories are empty by the time we reach them.
    for (path, is_dir) in entries.into_iter().rev() {
        if is_dir {
            remove_emptied_dir(&path)?;
        } else {
            std::fs::remove_file(&path)
                .map_err(io_context(format!("remove {}", path.display())))?;
        }
    }
    Ok(())
}

/// Remove a directory whose restorable contents are gone.
///
/// A directory that still holds excluded content stays.
fn remove_emptied_dir(path: &Path) -> SnapshotResult<()> {
    match std::fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => Ok(()),
        Err(e) => Err(io_context(format!("remove {}", path.display()))(e)),
    }
}

fn open_archive(archive: &Path) -> SnapshotResult<tar::Archive<impl Read>> {
    let file = File::open(archive).map_err(io_context(format!("open {}", archive.display())))?;
    let decoder = zstd::Decoder::new(file)
        .map_err(io_context(format!("decode {}", archive.display())))?;
    Ok(tar::Archive::new(decoder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn filter() -> TreeFilter {
        TreeFilter::new(["venv".to_string(), "__pycache__".to_string()])
    }

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("app/api")).unwrap();
        fs::create_dir_all(root.join("venv/lib")).unwrap();
        fs::create_dir_all(root.join("app/__pycache__")).unwrap();
        fs::write(root.join("run.py"), "print('v1')\n").unwrap();
        fs::write(root.join("app/main.py"), "app = 1\n").unwrap();
        fs::write(root.join("app/api/images.py"), "route = '/upload'\n").unwrap();
        fs::write(root.join("app/__pycache__/main.cpython-312.pyc"), [0u8; 4]).unwrap();
        fs::write(root.join("app/stale.pyc"), [0u8; 4]).unwrap();
        fs::write(root.join("venv/lib/site.py"), "site\n").unwrap();
    }

    #[test]
    fn filter_matches_names_paths_and_bytecode() {
        let mut f = filter();
        f.exclude_path(Path::new("/srv/app"), Path::new("/srv/app/app.db"));
        f.exclude_path(Path::new("/srv/app"), Path::new("/var/backups"));

        assert!(f.is_excluded(Path::new("venv"), true));
        assert!(f.is_excluded(Path::new("app/__pycache__/x.pyc"), false));
        assert!(f.is_excluded(Path::new("app.db"), false));
        assert!(f.is_excluded(Path::new("app/x.pyc"), false));
        assert!(!f.is_excluded(Path::new("app/main.py"), false));
        assert!(!f.is_excluded(Path::new("venvs.txt"), false));
        assert_eq!(f.describe(), ["venv/", "__pycache__/", "app.db", "*.pyc"]);
    }

    #[test]
    fn pack_skips_excluded_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        build_tree(&root);
        let archive = dir.path().join("code.tar.zst");

        pack_tree(&root, &filter(), &archive).unwrap();

        let mut tar = open_archive(&archive).unwrap();
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().trim_end_matches('/').to_string())
            .collect();
        assert!(names.contains(&"run.py".to_string()));
        assert!(names.contains(&"app/api/images.py".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("venv")));
        assert!(!names.iter().any(|n| n.contains("__pycache__")));
        assert!(!names.iter().any(|n| n.ends_with(".pyc")));
        assert_eq!(verify_archive(&archive).unwrap(), names.len() as u64);
    }

    #[test]
    fn restore_replaces_tree_but_keeps_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        build_tree(&root);
        let archive = dir.path().join("code.tar.zst");
        pack_tree(&root, &filter(), &archive).unwrap();

        // Simulate an update: modify, add, delete.
        fs::write(root.join("run.py"), "print('v2')\n").unwrap();
        fs::create_dir_all(root.join("app/new")).unwrap();
        fs::write(root.join("app/new/feature.py"), "x = 2\n").unwrap();
        fs::remove_file(root.join("app/api/images.py")).unwrap();
        fs::write(root.join("venv/lib/site.py"), "upgraded\n").unwrap();

        restore_tree(&archive, &root, &filter()).unwrap();

        assert_eq!(fs::read_to_string(root.join("run.py")).unwrap(), "print('v1')\n");
        assert_eq!(
            fs::read_to_string(root.join("app/api/images.py")).unwrap(),
            "route = '/upload'\n"
        );
        assert!(!root.join("app/new").exists());
        // Dependency cache untouched.
        assert_eq!(
            fs::read_to_string(root.join("venv/lib/site.py")).unwrap(),
            "upgraded\n"
        );
        assert!(root.join("app/__pycache__/main.cpython-312.pyc").exists());
    }

    #[test]
    fn emptied_dir_removal_keeps_excluded_content_and_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("app");
        fs::create_dir_all(kept.join("__pycache__")).unwrap();
        remove_emptied_dir(&kept).unwrap();
        assert!(kept.exists());

        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        remove_emptied_dir(&empty).unwrap();
        assert!(!empty.exists());

        // Anything other than "not empty" is a failed restore.
        let err = remove_emptied_dir(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, crate::SnapshotError::Io { .. }), "{err}");
    }

    #[test]
    fn restore_fails_when_tree_cannot_be_walked() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        build_tree(&root);
        let archive = dir.path().join("code.tar.zst");
        pack_tree(&root, &filter(), &archive).unwrap();

        let added = root.join("app/new");
        fs::create_dir_all(&added).unwrap();
        fs::write(added.join("feature.py"), "x = 2\n").unwrap();
        fs::set_permissions(&added, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&added).is_ok() {
            // Privileged user: permissions are not enforced.
            fs::set_permissions(&added, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = restore_tree(&archive, &root, &filter());
        fs::set_permissions(&added, fs::Permissions::from_mode(0o755)).unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("walk"), "{err}");
        assert!(added.join("feature.py").exists());
    }

    #[test]
    fn restore_refuses_truncated_archive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        build_tree(&root);
        let archive = dir.path().join("code.tar.zst");
        pack_tree(&root, &filter(), &archive).unwrap();

        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();

        assert!(restore_tree(&archive, &root, &filter()).is_err());
        // Tree left alone.
        assert!(root.join("run.py").exists());
    }
}
