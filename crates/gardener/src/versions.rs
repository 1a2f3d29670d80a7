//! The version-probing pipeline.
//!
//! Walks every package in the graph (sharded by stable hash across cron
//! jobs), asks the probe family for the latest upstream version, and
//! persists a fresh version record per package. `new_version` is monotone
//! non-decreasing under the ecosystem ordering; probe failures set `bad`
//! without resetting the last known good result.

use std::cmp::Ordering as CmpOrdering;
use std::time::Instant;

use anyhow::Result;
use gardener_retry::CancelToken;
use gardener_vercmp::compare;
use sha2::{Digest, Sha256};

use crate::graph::PackageGraph;
use crate::probes::{ProbeOutcome, ProbeSet};
use crate::scheduler::Reporter;
use crate::store::GraphStore;
use crate::types::{BadState, PackageRecord, VersionRecord, node_key, versions_key};

/// Stable shard assignment for a package name. The same name always lands
/// in the same slot, so concurrent `--job K --n-jobs N` workers partition
/// the graph without coordination.
pub fn shard_for(name: &str, n_jobs: u32) -> u32 {
    if n_jobs <= 1 {
        return 0;
    }
    let digest = Sha256::digest(name.as_bytes());
    let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    word % n_jobs
}

/// Counters for one pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeStats {
    pub probed: u64,
    pub found: u64,
    pub unchanged: u64,
    pub unavailable: u64,
    pub skipped: u64,
}

/// Run the probe pipeline over this job's shard of the graph.
pub fn update_upstream_versions(
    store: &GraphStore,
    graph: &PackageGraph,
    probes: &ProbeSet,
    job: u32,
    n_jobs: u32,
    deadline: Option<Instant>,
    cancel: &CancelToken,
    reporter: &mut dyn Reporter,
) -> Result<ProbeStats> {
    let mut stats = ProbeStats::default();

    for name in graph.node_names() {
        if cancel.is_cancelled() || matches!(deadline, Some(d) if Instant::now() >= d) {
            reporter.warn("version probe run stopped at its budget");
            break;
        }
        if shard_for(&name, n_jobs) != job {
            continue;
        }

        let record: Option<PackageRecord> = store.load(&node_key(&name))?;
        let Some(record) = record else {
            stats.skipped += 1;
            continue;
        };
        if record.archived {
            stats.skipped += 1;
            continue;
        }

        stats.probed += 1;
        let outcome = probes.probe(&record);
        apply_probe_outcome(store, &name, &record, outcome, &mut stats, reporter)?;
    }

    reporter.info(&format!(
        "version probes: {} probed, {} new, {} unchanged, {} unavailable",
        stats.probed, stats.found, stats.unchanged, stats.unavailable
    ));
    Ok(stats)
}

/// Persist one probe outcome, honoring monotonicity.
pub fn apply_probe_outcome(
    store: &GraphStore,
    name: &str,
    record: &PackageRecord,
    outcome: ProbeOutcome,
    stats: &mut ProbeStats,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let key = versions_key(name);
    let mut scope = store.write_scope::<VersionRecord>(&key)?;
    let version_record = scope.get_mut()?;

    match outcome {
        ProbeOutcome::Found(new_version) => {
            let keep_existing = version_record
                .new_version
                .as_deref()
                .is_some_and(|existing| compare(&new_version, existing) == CmpOrdering::Less);
            if keep_existing {
                // Downgrades only happen via operator reset of the record.
                reporter.warn(&format!(
                    "{name}: probe reported {new_version} below stored {}; keeping stored",
                    version_record.new_version.as_deref().unwrap_or("-")
                ));
            } else {
                reporter.info(&format!(
                    "{name}: {} -> {new_version}",
                    record.version.as_deref().unwrap_or("unversioned")
                ));
                version_record.new_version = Some(new_version);
            }
            version_record.bad = BadState::Clear;
            stats.found += 1;
        }
        ProbeOutcome::Unchanged => {
            version_record.bad = BadState::Clear;
            stats.unchanged += 1;
        }
        ProbeOutcome::Unavailable(reason) => {
            // new_version keeps its last good value.
            version_record.bad = BadState::flagged("version_probe", reason);
            stats.unavailable += 1;
        }
    }

    scope.commit()
}
