//! The PR tracker.
//!
//! Walks every stored PR fingerprint, asks the forge for the PR's current
//! state, refreshes the `pr_json/` mirror, and propagates closed/merged
//! transitions into the owning `pr_info/` entry. Work is sharded across
//! jobs by stable hash of the package name and fanned out over a bounded
//! worker pool inside the process; the per-key store lock is the only
//! cross-process coordination needed.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::mpsc;

use anyhow::Result;
use chrono::Utc;
use gardener_retry::CancelToken;

use crate::forge::{ForgeError, ForgeGateway};
use crate::scheduler::Reporter;
use crate::store::GraphStore;
use crate::types::{
    PR_INFO_PREFIX, PackageRecord, PrInfoRecord, PrState, node_key, pr_info_key, pr_json_key,
};
use crate::versions::shard_for;

pub const DEFAULT_TRACKER_WORKERS: usize = 4;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackStats {
    pub packages: u64,
    pub checked: u64,
    pub transitions: u64,
    pub errors: u64,
}

impl std::ops::AddAssign for TrackStats {
    fn add_assign(&mut self, other: Self) {
        self.packages += other.packages;
        self.checked += other.checked;
        self.transitions += other.transitions;
        self.errors += other.errors;
    }
}

/// Track this job's shard of all PR-info records.
pub fn update_prs(
    store: &GraphStore,
    forge: &dyn ForgeGateway,
    job: u32,
    n_jobs: u32,
    workers: usize,
    cancel: &CancelToken,
    reporter: &mut dyn Reporter,
) -> Result<TrackStats> {
    let prefix = format!("{PR_INFO_PREFIX}/");
    let packages: Vec<String> = store
        .keys_prefix(&prefix)?
        .into_iter()
        .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
        .filter(|name| shard_for(name, n_jobs) == job)
        .collect();

    let queue: Mutex<VecDeque<String>> = Mutex::new(packages.into_iter().collect());
    let (tx, rx) = mpsc::channel::<TrackStats>();
    let workers = workers.max(1);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let cancel = cancel.clone();
            scope.spawn(move || {
                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let Some(package) = queue.lock().expect("queue lock poisoned").pop_front()
                    else {
                        return;
                    };
                    let mut stats = TrackStats {
                        packages: 1,
                        ..TrackStats::default()
                    };
                    match track_package(store, forge, &package) {
                        Ok((checked, transitions)) => {
                            stats.checked = checked;
                            stats.transitions = transitions;
                        }
                        Err(TrackError::RateLimited) => {
                            cancel.cancel();
                        }
                        Err(TrackError::Other(_)) => {
                            stats.errors = 1;
                        }
                    }
                    if tx.send(stats).is_err() {
                        return;
                    }
                }
            });
        }
        drop(tx);

        let mut total = TrackStats::default();
        for stats in rx {
            total += stats;
        }
        reporter.info(&format!(
            "pr tracker: {} packages, {} PRs checked, {} transitions, {} errors",
            total.packages, total.checked, total.transitions, total.errors
        ));
        Ok(total)
    })
}

enum TrackError {
    RateLimited,
    Other(anyhow::Error),
}

impl From<anyhow::Error> for TrackError {
    fn from(error: anyhow::Error) -> Self {
        TrackError::Other(error)
    }
}

/// Refresh every open entry of one package. Returns (checked, transitions).
fn track_package(
    store: &GraphStore,
    forge: &dyn ForgeGateway,
    package: &str,
) -> Result<(u64, u64), TrackError> {
    let feedstock = store
        .load::<PackageRecord>(&node_key(package))
        .map_err(TrackError::Other)?
        .map(|record| record.feedstock_name)
        .unwrap_or_else(|| format!("{package}-feedstock"));

    let mut scope = store
        .write_scope::<PrInfoRecord>(&pr_info_key(package))
        .map_err(TrackError::Other)?;
    let info = scope.get_mut().map_err(TrackError::Other)?;

    let mut checked = 0;
    let mut transitions = 0;
    for entry in info.prs.iter_mut() {
        if entry.state != PrState::Open {
            continue;
        }
        let Some(number) = entry.number else { continue };
        checked += 1;

        let pr = match forge.pull_request(&feedstock, number) {
            Ok(pr) => pr,
            Err(ForgeError::RateLimited) => return Err(TrackError::RateLimited),
            Err(ForgeError::NotFound(_)) => {
                // The PR vanished (repo deleted, PR transferred); close the
                // entry so the node becomes attemptable after the window.
                entry.state = PrState::Closed;
                entry.closed_at = Some(Utc::now());
                transitions += 1;
                continue;
            }
            Err(e) => return Err(TrackError::Other(e.into())),
        };

        store
            .put(&pr_json_key(pr.id), &pr)
            .map_err(TrackError::Other)?;

        let new_state = pr.pr_state();
        if new_state != entry.state {
            entry.state = new_state;
            entry.closed_at = pr.closed_at.or(pr.merged_at).or_else(|| Some(Utc::now()));
            transitions += 1;
        }
    }

    scope.commit().map_err(TrackError::Other)?;
    Ok((checked, transitions))
}

/// Re-check exactly one fingerprint (the event reactor's path).
pub fn track_single(
    store: &GraphStore,
    forge: &dyn ForgeGateway,
    package: &str,
    fingerprint: &crate::types::Fingerprint,
) -> Result<bool> {
    let feedstock = store
        .load::<PackageRecord>(&node_key(package))?
        .map(|record| record.feedstock_name)
        .unwrap_or_else(|| format!("{package}-feedstock"));

    let mut scope = store.write_scope::<PrInfoRecord>(&pr_info_key(package))?;
    let info = scope.get_mut()?;
    let Some(entry) = info.entry_for_mut(fingerprint) else {
        return Ok(false);
    };
    let Some(number) = entry.number else {
        return Ok(false);
    };

    let pr = forge.pull_request(&feedstock, number)?;
    store.put(&pr_json_key(pr.id), &pr)?;

    let new_state = pr.pr_state();
    let changed = new_state != entry.state;
    if changed {
        entry.state = new_state;
        entry.closed_at = pr.closed_at.or(pr.merged_at);
    }
    scope.commit()?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use gardener_shard::ShardScheme;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::backends::FileBackend;
    use crate::forge::PullRequestSpec;
    use crate::forge::fake::FakeForge;
    use crate::scheduler::NullReporter;
    use crate::types::{Fingerprint, PrEntry};

    fn store_at(root: &Path) -> GraphStore {
        GraphStore::from_backends(
            vec![Box::new(FileBackend::new(root.to_path_buf(), ShardScheme::new(2)))],
            root.to_path_buf(),
            ShardScheme::new(2),
            None,
        )
        .expect("store")
    }

    fn open_pr_for(forge: &FakeForge, package: &str, store: &GraphStore) -> u64 {
        let feedstock = format!("{package}-feedstock");
        forge.seed_recipe(&feedstock, "build:\n  number: 0\n");
        let pr = forge
            .open_pull_request(
                &feedstock,
                &PullRequestSpec {
                    title: format!("{package} bump"),
                    body: "b".to_string(),
                    head: format!("bump-{package}"),
                    base: "main".to_string(),
                },
            )
            .expect("open");

        let record = PackageRecord::new(package);
        store.put(&node_key(package), &record).expect("seed record");

        let info = PrInfoRecord {
            prs: vec![PrEntry {
                fingerprint: Fingerprint::new(json!({"migrator": "version", "package": package})),
                state: PrState::Open,
                url: Some(pr.html_url.clone()),
                number: Some(pr.number),
                forge_id: Some(pr.id),
                opened_at: Utc::now(),
                closed_at: None,
            }],
            ..PrInfoRecord::default()
        };
        store.put(&pr_info_key(package), &info).expect("seed info");
        pr.number
    }

    #[test]
    fn merged_pr_propagates_into_pr_info_and_pr_json() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();
        let number = open_pr_for(&forge, "zlib", &store);
        forge.close_pr(number, true);

        let stats = update_prs(&store, &forge, 0, 1, 2, &CancelToken::new(), &mut NullReporter)
            .expect("track");

        assert_eq!(stats.packages, 1);
        assert_eq!(stats.checked, 1);
        assert_eq!(stats.transitions, 1);

        let info: PrInfoRecord = store.load(&pr_info_key("zlib")).expect("load").expect("present");
        assert_eq!(info.prs[0].state, PrState::Merged);
        assert!(info.prs[0].closed_at.is_some());

        let pr_id = info.prs[0].forge_id.expect("id");
        let mirrored: crate::types::PrJsonRecord =
            store.load(&pr_json_key(pr_id)).expect("load").expect("present");
        assert!(mirrored.merged);
    }

    #[test]
    fn still_open_pr_changes_nothing() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();
        open_pr_for(&forge, "zlib", &store);

        let stats = update_prs(&store, &forge, 0, 1, 2, &CancelToken::new(), &mut NullReporter)
            .expect("track");

        assert_eq!(stats.transitions, 0);
        let info: PrInfoRecord = store.load(&pr_info_key("zlib")).expect("load").expect("present");
        assert_eq!(info.prs[0].state, PrState::Open);
    }

    #[test]
    fn closed_unmerged_pr_is_recorded_as_closed() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();
        let number = open_pr_for(&forge, "zlib", &store);
        forge.close_pr(number, false);

        update_prs(&store, &forge, 0, 1, 1, &CancelToken::new(), &mut NullReporter)
            .expect("track");

        let info: PrInfoRecord = store.load(&pr_info_key("zlib")).expect("load").expect("present");
        assert_eq!(info.prs[0].state, PrState::Closed);
    }

    #[test]
    fn vanished_pr_closes_the_entry() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();

        let record = PackageRecord::new("ghost");
        store.put(&node_key("ghost"), &record).expect("seed");
        let info = PrInfoRecord {
            prs: vec![PrEntry {
                fingerprint: Fingerprint::new(json!({"migrator": "version"})),
                state: PrState::Open,
                url: None,
                number: Some(404),
                forge_id: None,
                opened_at: Utc::now(),
                closed_at: None,
            }],
            ..PrInfoRecord::default()
        };
        store.put(&pr_info_key("ghost"), &info).expect("seed");

        let stats = update_prs(&store, &forge, 0, 1, 1, &CancelToken::new(), &mut NullReporter)
            .expect("track");
        assert_eq!(stats.transitions, 1);

        let info: PrInfoRecord = store.load(&pr_info_key("ghost")).expect("load").expect("present");
        assert_eq!(info.prs[0].state, PrState::Closed);
    }

    #[test]
    fn sharding_partitions_packages_across_jobs() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();
        let names = ["a", "b", "c", "d", "e"];
        for name in names {
            open_pr_for(&forge, name, &store);
        }

        let mut total = TrackStats::default();
        for job in 0..3 {
            total += update_prs(&store, &forge, job, 3, 2, &CancelToken::new(), &mut NullReporter)
                .expect("track");
        }
        assert_eq!(total.packages, names.len() as u64);
        assert_eq!(total.checked, names.len() as u64);
    }

    #[test]
    fn many_workers_drain_the_queue_without_double_counting() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();
        for i in 0..12 {
            open_pr_for(&forge, &format!("pkg{i:02}"), &store);
        }

        let stats = update_prs(&store, &forge, 0, 1, 8, &CancelToken::new(), &mut NullReporter)
            .expect("track");
        assert_eq!(stats.packages, 12);
        assert_eq!(stats.checked, 12);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn track_single_updates_only_the_named_fingerprint() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();
        let number = open_pr_for(&forge, "zlib", &store);
        forge.close_pr(number, true);

        let fingerprint = Fingerprint::new(json!({"migrator": "version", "package": "zlib"}));
        let changed = track_single(&store, &forge, "zlib", &fingerprint).expect("track");
        assert!(changed);

        let info: PrInfoRecord = store.load(&pr_info_key("zlib")).expect("load").expect("present");
        assert_eq!(info.prs[0].state, PrState::Merged);

        let unknown = Fingerprint::new(json!({"migrator": "other"}));
        assert!(!track_single(&store, &forge, "zlib", &unknown).expect("no entry"));
    }
}
