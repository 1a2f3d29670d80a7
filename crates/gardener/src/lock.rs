//! Per-key advisory locks for the graph store.
//!
//! Each store key gets a sidecar `<path>.lock` file holding JSON metadata
//! about the holder (PID, hostname, timestamp, key). The lock is advisory:
//! it serializes write scopes within and across cooperating processes, and a
//! stale lock left by a crashed worker is taken over after a timeout.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_SUFFIX: &str = "lock";

/// Default stale-lock takeover window. A cron worker that holds a write
/// scope for longer than this has crashed or hung.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Metadata stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub key: String,
}

/// Held advisory lock; released (file removed) on Drop.
#[derive(Debug)]
pub struct KeyLock {
    path: PathBuf,
}

/// The sidecar lock path for a record path.
pub fn lock_path(record_path: &Path) -> PathBuf {
    let mut os = record_path.as_os_str().to_os_string();
    os.push(".");
    os.push(LOCK_SUFFIX);
    PathBuf::from(os)
}

impl KeyLock {
    /// Acquire the lock for a record path, taking over stale locks older
    /// than `stale_after`. Fails if another live holder has it.
    pub fn acquire(record_path: &Path, key: &str, stale_after: Duration) -> Result<Self> {
        let path = lock_path(record_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
        }

        match Self::try_create(&path, key) {
            Ok(lock) => return Ok(lock),
            Err(first_err) => {
                // Contended. Take over only if the holder looks stale.
                match Self::read_info(&path) {
                    Ok(info) => {
                        let age = Utc::now() - info.acquired_at;
                        if age.num_seconds().unsigned_abs() > stale_after.as_secs() {
                            fs::remove_file(&path).with_context(|| {
                                format!("failed to remove stale lock {}", path.display())
                            })?;
                        } else {
                            bail!(
                                "key {key:?} locked by pid {} on {} since {}",
                                info.pid,
                                info.hostname,
                                info.acquired_at
                            );
                        }
                    }
                    Err(_) => {
                        // Corrupt or vanished lock file. If it still exists it
                        // is garbage; clear it and retry.
                        if path.exists() {
                            fs::remove_file(&path).with_context(|| {
                                format!("failed to remove corrupt lock {}", path.display())
                            })?;
                        } else if !matches!(
                            first_err.downcast_ref::<std::io::Error>().map(|e| e.kind()),
                            Some(std::io::ErrorKind::AlreadyExists)
                        ) {
                            return Err(first_err);
                        }
                    }
                }
            }
        }

        Self::try_create(&path, key)
    }

    fn try_create(path: &Path, key: &str) -> Result<Self> {
        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            key: key.to_string(),
        };
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;

        // create_new gives atomic mutual exclusion on every platform we run.
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("failed to create lock file {}", path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock file {}", path.display()))?;
        file.sync_all().context("failed to sync lock file")?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn read_info(path: &Path) -> Result<LockInfo> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read lock file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse lock file {}", path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn acquire_creates_and_drop_removes_the_sidecar() {
        let td = tempdir().expect("tempdir");
        let record = td.path().join("a/b/zlib.json");

        let lock = KeyLock::acquire(&record, "node_attrs/zlib", DEFAULT_STALE_AFTER)
            .expect("acquire");
        let sidecar = lock.path().to_path_buf();
        assert!(sidecar.exists());
        assert!(sidecar.to_string_lossy().ends_with("zlib.json.lock"));

        drop(lock);
        assert!(!sidecar.exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let td = tempdir().expect("tempdir");
        let record = td.path().join("zlib.json");

        let _held = KeyLock::acquire(&record, "node_attrs/zlib", DEFAULT_STALE_AFTER)
            .expect("acquire");
        let err = KeyLock::acquire(&record, "node_attrs/zlib", DEFAULT_STALE_AFTER)
            .expect_err("must be contended");
        assert!(format!("{err:#}").contains("locked by pid"));
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let td = tempdir().expect("tempdir");
        let record = td.path().join("zlib.json");
        let sidecar = lock_path(&record);

        let stale = LockInfo {
            pid: 1,
            hostname: "gone".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            key: "node_attrs/zlib".to_string(),
        };
        fs::write(&sidecar, serde_json::to_string(&stale).expect("json")).expect("write");

        let lock = KeyLock::acquire(&record, "node_attrs/zlib", Duration::from_secs(60))
            .expect("takeover");
        assert!(lock.path().exists());
    }

    #[test]
    fn corrupt_lock_file_is_cleared() {
        let td = tempdir().expect("tempdir");
        let record = td.path().join("zlib.json");
        fs::write(lock_path(&record), "not json").expect("write");

        let lock = KeyLock::acquire(&record, "node_attrs/zlib", DEFAULT_STALE_AFTER)
            .expect("acquire despite corrupt sidecar");
        assert!(lock.path().exists());
    }

    #[test]
    fn lock_info_records_the_key() {
        let td = tempdir().expect("tempdir");
        let record = td.path().join("numpy.json");

        let lock = KeyLock::acquire(&record, "versions/numpy", DEFAULT_STALE_AFTER)
            .expect("acquire");
        let info = KeyLock::read_info(lock.path()).expect("info");
        assert_eq!(info.key, "versions/numpy");
        assert_eq!(info.pid, std::process::id());
    }
}
