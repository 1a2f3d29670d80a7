//! Host resource sampling and scratch hygiene.
//!
//! The scheduler samples free memory and disk before every migration
//! attempt; below the configured floors it stops cleanly rather than
//! wedging a worker mid-clone. The scratch root (TMPDIR) is emptied at run
//! start and end so crashed runs cannot fill the disk across cron cycles.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sysinfo::{Disks, System};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// One point-in-time observation of the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    pub available_memory_gb: f64,
    pub available_disk_gb: f64,
}

impl ResourceSample {
    pub fn above_floors(&self, memory_floor_gb: u64, disk_floor_gb: u64) -> bool {
        self.available_memory_gb >= memory_floor_gb as f64
            && self.available_disk_gb >= disk_floor_gb as f64
    }
}

/// Sample free memory and the free space of the filesystem holding
/// `scratch`.
pub fn sample_resources(scratch: &Path) -> ResourceSample {
    let mut system = System::new();
    system.refresh_memory();
    let available_memory_gb = system.available_memory() as f64 / BYTES_PER_GB as f64;

    let disks = Disks::new_with_refreshed_list();
    // The disk whose mount point is the longest prefix of the scratch path
    // is the one migrations will fill.
    let available_disk_gb = disks
        .iter()
        .filter(|disk| scratch.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() as f64 / BYTES_PER_GB as f64)
        .unwrap_or(f64::MAX);

    ResourceSample {
        available_memory_gb,
        available_disk_gb,
    }
}

/// Identity of this bot process, injected into reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunFingerprint {
    pub bot_version: String,
    pub os: String,
    pub arch: String,
    pub hostname: String,
}

pub fn run_fingerprint() -> RunFingerprint {
    RunFingerprint {
        bot_version: env!("CARGO_PKG_VERSION").to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        hostname: gethostname::gethostname().to_string_lossy().to_string(),
    }
}

/// Empty the scratch root without removing the root itself.
pub fn scrub_scratch(scratch: &Path) -> Result<()> {
    if !scratch.exists() {
        fs::create_dir_all(scratch)
            .with_context(|| format!("failed to create scratch root {}", scratch.display()))?;
        return Ok(());
    }
    for entry in fs::read_dir(scratch)
        .with_context(|| format!("failed to read scratch root {}", scratch.display()))?
    {
        let entry = entry.context("failed to read scratch entry")?;
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.with_context(|| format!("failed to remove scratch entry {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn sample_reports_positive_numbers() {
        let td = tempdir().expect("tempdir");
        let sample = sample_resources(td.path());
        assert!(sample.available_memory_gb > 0.0);
        assert!(sample.available_disk_gb > 0.0);
    }

    #[test]
    fn floors_classify_samples() {
        let sample = ResourceSample {
            available_memory_gb: 8.0,
            available_disk_gb: 20.0,
        };
        assert!(sample.above_floors(7, 10));
        assert!(!sample.above_floors(9, 10));
        assert!(!sample.above_floors(7, 30));
    }

    #[test]
    fn run_fingerprint_is_populated() {
        let fp = run_fingerprint();
        assert!(!fp.bot_version.is_empty());
        assert!(!fp.os.is_empty());
        assert!(!fp.arch.is_empty());
    }

    #[test]
    fn scrub_empties_but_keeps_the_root() {
        let td = tempdir().expect("tempdir");
        fs::create_dir_all(td.path().join("work/deep")).expect("mkdir");
        fs::write(td.path().join("stale.tar"), b"x").expect("write");

        scrub_scratch(td.path()).expect("scrub");

        assert!(td.path().exists());
        assert_eq!(fs::read_dir(td.path()).expect("read").count(), 0);
    }

    #[test]
    fn scrub_creates_a_missing_root() {
        let td = tempdir().expect("tempdir");
        let scratch = td.path().join("not-yet");
        scrub_scratch(&scratch).expect("scrub");
        assert!(scratch.exists());
    }
}
