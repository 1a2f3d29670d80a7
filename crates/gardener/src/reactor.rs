//! The event reactor.
//!
//! External hints (a webhook relay, a manual nudge) trigger a narrow
//! re-evaluation instead of a full cron pass: a PR update re-tracks just
//! that PR's fingerprint; a push to a feedstock re-probes its upstream
//! version so the next tick sees fresh state.

use anyhow::{Context, Result, bail};

use crate::forge::ForgeGateway;
use crate::probes::ProbeSet;
use crate::scheduler::Reporter;
use crate::store::GraphStore;
use crate::tracker::track_single;
use crate::types::{
    PR_INFO_PREFIX, PackageRecord, PrInfoRecord, node_key, pr_json_key,
};
use crate::versions::{ProbeStats, apply_probe_outcome};

/// The two hint kinds the reactor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PrUpdate,
    Push,
}

impl std::str::FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "pr" | "pr_update" => Ok(EventKind::PrUpdate),
            "push" => Ok(EventKind::Push),
            other => bail!("unknown event kind {other:?} (expected pr or push)"),
        }
    }
}

/// What the reactor did in response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    PrTracked { package: String, changed: bool },
    PrUnknown,
    VersionReprobed { package: String },
    PackageUnknown,
}

pub fn react_to_event(
    store: &GraphStore,
    probes: &ProbeSet,
    forge: &dyn ForgeGateway,
    kind: EventKind,
    uid: &str,
    reporter: &mut dyn Reporter,
) -> Result<Reaction> {
    match kind {
        EventKind::PrUpdate => react_to_pr_update(store, forge, uid, reporter),
        EventKind::Push => react_to_push(store, probes, uid, reporter),
    }
}

fn react_to_pr_update(
    store: &GraphStore,
    forge: &dyn ForgeGateway,
    uid: &str,
    reporter: &mut dyn Reporter,
) -> Result<Reaction> {
    let pr_id: u64 = uid
        .parse()
        .with_context(|| format!("pr_update uid must be a forge PR id, got {uid:?}"))?;
    if !store.exists(&pr_json_key(pr_id))? {
        reporter.warn(&format!("no mirrored PR with id {pr_id}"));
        // Fall through: the PR may predate the mirror but still own an
        // entry somewhere.
    }

    // Find the owning package by scanning fingerprint entries. PR updates
    // are rare enough that the scan beats maintaining a reverse index.
    let prefix = format!("{PR_INFO_PREFIX}/");
    for key in store.keys_prefix(&prefix)? {
        let Some(package) = key.strip_prefix(&prefix) else { continue };
        let Some(info) = store.load::<PrInfoRecord>(&key).unwrap_or(None) else {
            continue;
        };
        if let Some(entry) = info.prs.iter().find(|e| e.forge_id == Some(pr_id)) {
            let changed = track_single(store, forge, package, &entry.fingerprint)?;
            reporter.info(&format!(
                "re-tracked PR {pr_id} on {package} (changed: {changed})"
            ));
            return Ok(Reaction::PrTracked {
                package: package.to_string(),
                changed,
            });
        }
    }
    Ok(Reaction::PrUnknown)
}

fn react_to_push(
    store: &GraphStore,
    probes: &ProbeSet,
    uid: &str,
    reporter: &mut dyn Reporter,
) -> Result<Reaction> {
    // The uid names a feedstock; the package drops the conventional suffix.
    let package = uid.strip_suffix("-feedstock").unwrap_or(uid);
    let Some(record) = store.load::<PackageRecord>(&node_key(package))? else {
        reporter.warn(&format!("push hint for unknown package {package}"));
        return Ok(Reaction::PackageUnknown);
    };

    let outcome = probes.probe(&record);
    let mut stats = ProbeStats::default();
    apply_probe_outcome(store, package, &record, outcome, &mut stats, reporter)?;
    reporter.info(&format!("re-probed {package} after push"));
    Ok(Reaction::VersionReprobed {
        package: package.to_string(),
    })
}
