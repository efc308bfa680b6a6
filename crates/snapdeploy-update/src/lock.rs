//! Per-target deploy lock.
//!
//! At most one update may run against a target at a time. The lock is a
//! file created exclusively under the state directory; it records the
//! holder and is removed when the guard drops. A lock whose recorded
//! process no longer exists is left over from a crashed run and is
//! reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{UpdateError, UpdateResult};

#[derive(Debug)]
pub struct DeployLock {
    path: PathBuf,
}

impl DeployLock {
    /// Take the lock for `target`, failing if another run holds it.
    pub fn acquire(state_dir: &Path, target: &str) -> UpdateResult<Self> {
        let lock_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| UpdateError::Lock { path, source }
        };

        fs::create_dir_all(state_dir).map_err(lock_err(state_dir))?;
        let path = state_dir.join(format!("{target}.lock"));

        let mut file = match create_lock_file(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".to_string());
                if !holder_is_stale(&holder) {
                    return Err(UpdateError::Locked {
                        target: target.to_string(),
                        holder,
                        path,
                    });
                }
                warn!(path = %path.display(), %holder, "reclaiming stale deploy lock");
                fs::remove_file(&path).map_err(lock_err(&path))?;
                match create_lock_file(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        return Err(UpdateError::Locked {
                            target: target.to_string(),
                            holder: "a concurrent run".to_string(),
                            path,
                        });
                    }
                    Err(e) => return Err(lock_err(&path)(e)),
                }
            }
            Err(e) => return Err(lock_err(&path)(e)),
        };

        let holder = format!("pid {} since {}", std::process::id(), Utc::now().to_rfc3339());
        if let Err(e) = file.write_all(holder.as_bytes()).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(&path);
            return Err(lock_err(&path)(e));
        }
        debug!(path = %path.display(), "deploy lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn create_lock_file(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// A holder is stale when it names a pid with no `/proc` entry.
///
/// Without procfs, or with an unparseable holder, the lock is assumed live.
fn holder_is_stale(holder: &str) -> bool {
    let Some(pid) = holder
        .strip_prefix("pid ")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|pid| pid.parse::<u32>().ok())
    else {
        return false;
    };
    let proc = Path::new("/proc");
    proc.join("self").exists() && !proc.join(pid.to_string()).exists()
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "deploy lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release deploy lock"),
        }
    }
}
