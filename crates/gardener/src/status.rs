//! The status reporter.
//!
//! Classifies every (migrator, package) pair into the migration state
//! machine's vocabulary and serializes one deterministic JSON document for
//! downstream dashboards. Determinism matters: the report is committed to
//! the store and reviewed as diffs, so every map is ordered and no
//! wall-clock noise is included.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::backends::StoreError;
use crate::graph::PackageGraph;
use crate::migrators::Migrator;
use crate::store::GraphStore;
use crate::types::{NodeStatus, PackageRecord, PrInfoRecord, PrState, node_key, pr_info_key};

pub const STATUS_KEY: &str = "status/report";

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub status: NodeStatus,
    pub num_descendants: u64,
    pub immediate_children: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigratorReport {
    pub nodes: BTreeMap<String, NodeReport>,
    pub counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub migrators: BTreeMap<String, MigratorReport>,
    /// Keys whose records failed to parse; operators fix these by hand.
    pub corrupt_keys: Vec<String>,
}

/// Classify one (migrator, package) pair.
fn classify(
    migrator: &dyn Migrator,
    record: Option<&PackageRecord>,
    info: Option<&PrInfoRecord>,
    workable_parents_unlanded: bool,
    store: &GraphStore,
) -> (NodeStatus, Option<String>) {
    let Some(record) = record else {
        return (NodeStatus::BotError, Some("node_missing".to_string()));
    };
    if let Some(bad) = record.bad.info() {
        return (NodeStatus::BotError, Some(bad.kind.clone()));
    }
    if record.archived {
        return (NodeStatus::Done, Some("archived".to_string()));
    }

    let fingerprint = migrator.fingerprint(record, store);
    if let Some(entry) = info.and_then(|info| info.entry_for(&fingerprint)) {
        return match entry.state {
            PrState::Open => (NodeStatus::InPr, None),
            PrState::Merged => (NodeStatus::Done, None),
            PrState::Closed => (NodeStatus::AwaitingPr, Some("closed unmerged".to_string())),
        };
    }

    if migrator.filter(record, store) {
        return (NodeStatus::Done, Some("nothing to do".to_string()));
    }
    if workable_parents_unlanded {
        return (NodeStatus::AwaitingParents, None);
    }
    (NodeStatus::AwaitingPr, None)
}

/// Build the full report across all migrators.
pub fn make_status_report(
    store: &GraphStore,
    graph: &PackageGraph,
    migrators: &[Box<dyn Migrator>],
) -> Result<StatusReport> {
    let mut report = StatusReport::default();

    // Load records and PR-info once; corrupt keys are reported, not fatal.
    let mut records: BTreeMap<String, Option<PackageRecord>> = BTreeMap::new();
    let mut infos: BTreeMap<String, Option<PrInfoRecord>> = BTreeMap::new();
    for name in graph.node_names() {
        records.insert(name.clone(), load_or_corrupt(store, &node_key(&name), &mut report)?);
        infos.insert(name.clone(), load_or_corrupt(store, &pr_info_key(&name), &mut report)?);
    }

    for migrator in migrators {
        let mut migrator_report = MigratorReport::default();
        let scope = migrator
            .scope(graph)
            .unwrap_or_else(|| graph.node_names().into_iter().collect());

        // Which packages could this migrator ever touch (for parent gating).
        let workable: BTreeMap<&String, bool> = scope
            .iter()
            .map(|name| {
                let workable = records
                    .get(name)
                    .and_then(Option::as_ref)
                    .map(|record| {
                        !record.archived
                            && record.bad.is_clear()
                            && !migrator.filter(record, store)
                    })
                    .unwrap_or(false);
                (name, workable)
            })
            .collect();

        for name in &scope {
            if !graph.contains(name) {
                continue;
            }
            let record = records.get(name).and_then(Option::as_ref);
            let info = infos.get(name).and_then(Option::as_ref);

            let parents_unlanded = graph.predecessors(name).iter().any(|parent| {
                workable.get(parent).copied().unwrap_or(false)
                    && !graph.descendants(name).contains(parent)
                    && !parent_landed(migrator.as_ref(), parent, &records, &infos, store)
            });

            let (status, detail) =
                classify(migrator.as_ref(), record, info, parents_unlanded, store);

            let mut children = graph.successors(name);
            children.sort();
            migrator_report.nodes.insert(
                name.clone(),
                NodeReport {
                    status,
                    num_descendants: graph.descendants(name).len() as u64,
                    immediate_children: children,
                    detail,
                },
            );
            *migrator_report.counts.entry(status.to_string()).or_default() += 1;
        }

        report
            .migrators
            .insert(migrator.name().to_string(), migrator_report);
    }

    report.corrupt_keys.sort();
    report.corrupt_keys.dedup();
    Ok(report)
}

fn parent_landed(
    migrator: &dyn Migrator,
    parent: &str,
    records: &BTreeMap<String, Option<PackageRecord>>,
    infos: &BTreeMap<String, Option<PrInfoRecord>>,
    store: &GraphStore,
) -> bool {
    let Some(record) = records.get(parent).and_then(Option::as_ref) else {
        return false;
    };
    let fingerprint = migrator.fingerprint(record, store);
    infos
        .get(parent)
        .and_then(Option::as_ref)
        .and_then(|info| info.entry_for(&fingerprint))
        .is_some_and(|entry| entry.state == PrState::Merged)
}

fn load_or_corrupt<T: serde::de::DeserializeOwned>(
    store: &GraphStore,
    key: &str,
    report: &mut StatusReport,
) -> Result<Option<T>> {
    match store.load::<T>(key) {
        Ok(value) => Ok(value),
        Err(e)
            if e.downcast_ref::<StoreError>()
                .is_some_and(|e| matches!(e, StoreError::CorruptRecord { .. })) =>
        {
            report.corrupt_keys.push(key.to_string());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Serialize the report with the store's canonical formatting and persist
/// it under `status/report`.
pub fn write_status_report(store: &GraphStore, report: &StatusReport) -> Result<()> {
    store.put(STATUS_KEY, report)
}
