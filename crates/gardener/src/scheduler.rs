//! The migration engine.
//!
//! One `auto-tick` walks every configured migrator in registration order.
//! Per migrator: prune the graph to the nodes it can change right now, walk
//! them in the migrator's order, gate each attempt on the wall-clock
//! budget, the forge rate floor, the per-cycle PR limit, and the host
//! resource floors, de-duplicate by fingerprint, and execute the migration
//! under the package's write scope. The record is flushed at scope exit
//! whether the attempt succeeded or not; nothing is lost to a crash
//! between nodes.
//!
//! State machine per (migrator, package):
//!
//! ```text
//! awaiting-parents -> awaiting-pr -> in-pr -> done
//!                        ^             |
//!                        +-- closed ---+  (after the retry window)
//! ```
//!
//! `bot-error` (the record's `bad` slot) is recoverable: operators clear
//! the slot and the node returns to `awaiting-pr`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use gardener_retry::CancelToken;

use crate::backends::StoreError;
use crate::config::{BotConfig, RunFlags};
use crate::environment::sample_resources;
use crate::events::{BotEventKind, EventLog, events_path};
use crate::forge::{ForgeError, ForgeGateway, PullRequestSpec};
use crate::graph::PackageGraph;
use crate::migrators::{Migrator, RerenderPolicy};
use crate::rerender::{Rerenderer, ToolingVersions};
use crate::store::GraphStore;
use crate::types::{
    BadState, Fingerprint, PackageRecord, PrEntry, PrInfoRecord, PrState, node_key, pr_info_key,
    pr_json_key,
};

/// Output sink threaded through every long-running operation.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that swallows everything; tests and sharded batch jobs use it.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Counters for one auto-tick run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub attempted: u64,
    pub prs_opened: u64,
    pub skipped_in_pr: u64,
    pub skipped_done: u64,
    pub skipped_retry_window: u64,
    pub migration_errors: u64,
    pub stopped_early: bool,
}

/// Why the walk of one migrator ended.
enum WalkEnd {
    Exhausted,
    Gated(&'static str),
    RateLimited,
}

enum Dedup {
    FreshAttempt,
    InPr,
    Done,
    InRetryWindow,
}

pub struct Scheduler<'a> {
    pub store: &'a GraphStore,
    pub graph: &'a PackageGraph,
    pub forge: &'a dyn ForgeGateway,
    pub rerenderer: &'a dyn Rerenderer,
    pub config: &'a BotConfig,
    pub flags: RunFlags,
}

impl<'a> Scheduler<'a> {
    /// Run every migrator until budgets run out.
    pub fn auto_tick(
        &self,
        migrators: &[Box<dyn Migrator>],
        cancel: &CancelToken,
        reporter: &mut dyn Reporter,
    ) -> Result<TickStats> {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut stats = TickStats::default();
        let mut events = EventLog::new();
        let events_file = events_path(&self.config.store_root);

        crate::environment::scrub_scratch(&self.config.tmpdir)?;
        events.record(
            "all",
            BotEventKind::RunStarted {
                command: "auto-tick".to_string(),
            },
        );

        let tooling = match self.rerenderer.current_tooling() {
            Ok(tooling) => Some(tooling),
            Err(e) => {
                reporter.warn(&format!("re-render tooling unavailable: {e:#}"));
                None
            }
        };

        let records = self.load_records(reporter)?;

        'migrators: for migrator in migrators {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                stats.stopped_early = true;
                break;
            }
            reporter.info(&format!("migrator {}: building subgraph", migrator.name()));

            let order = self.eligible_order(migrator.as_ref(), &records)?;
            if order.is_empty() {
                continue;
            }
            reporter.info(&format!(
                "migrator {}: {} eligible nodes",
                migrator.name(),
                order.len()
            ));

            let mut opened_this_cycle: usize = 0;
            for name in order {
                if cancel.is_cancelled() {
                    stats.stopped_early = true;
                    break 'migrators;
                }
                match self.gate(migrator.as_ref(), opened_this_cycle, deadline, reporter) {
                    Ok(()) => {}
                    Err(WalkEnd::Gated(why)) => {
                        reporter.warn(&format!(
                            "migrator {}: stopping ({why})",
                            migrator.name()
                        ));
                        stats.stopped_early = true;
                        break;
                    }
                    Err(WalkEnd::RateLimited) => {
                        reporter.warn("forge rate budget exhausted; stopping all migrators");
                        stats.stopped_early = true;
                        break 'migrators;
                    }
                    Err(WalkEnd::Exhausted) => break,
                }

                let Some(record) = records.get(&name) else { continue };
                let fingerprint = migrator.fingerprint(record, self.store);

                match self.dedup(&name, &fingerprint)? {
                    Dedup::FreshAttempt => {}
                    Dedup::InPr => {
                        stats.skipped_in_pr += 1;
                        continue;
                    }
                    Dedup::Done => {
                        stats.skipped_done += 1;
                        continue;
                    }
                    Dedup::InRetryWindow => {
                        stats.skipped_retry_window += 1;
                        continue;
                    }
                }

                stats.attempted += 1;
                match self.execute(
                    migrator.as_ref(),
                    record,
                    &fingerprint,
                    tooling.as_ref(),
                    &mut events,
                    reporter,
                ) {
                    Ok(true) => {
                        opened_this_cycle += 1;
                        stats.prs_opened += 1;
                    }
                    Ok(false) => {}
                    Err(WalkEnd::RateLimited) => {
                        stats.stopped_early = true;
                        events.flush_to(&events_file)?;
                        break 'migrators;
                    }
                    Err(WalkEnd::Gated(why)) => {
                        reporter.warn(&format!("{name}: {why}"));
                        stats.migration_errors += 1;
                    }
                    Err(WalkEnd::Exhausted) => break,
                }
                events.flush_to(&events_file)?;
            }
        }

        events.record(
            "all",
            BotEventKind::RunFinished {
                command: "auto-tick".to_string(),
                ok: true,
            },
        );
        events.flush_to(&events_file)?;
        crate::environment::scrub_scratch(&self.config.tmpdir)?;

        for warning in self.store.take_warnings() {
            reporter.warn(&warning);
        }
        Ok(stats)
    }

    fn load_records(
        &self,
        reporter: &mut dyn Reporter,
    ) -> Result<BTreeMap<String, PackageRecord>> {
        let mut records = BTreeMap::new();
        for name in self.graph.node_names() {
            match self.store.load::<PackageRecord>(&node_key(&name)) {
                Ok(Some(record)) => {
                    records.insert(name, record);
                }
                Ok(None) => {
                    // Graph node without a record: surfaced by the status
                    // report as node_missing; the scheduler just skips it.
                    reporter.warn(&format!("{name}: graph node has no package record"));
                }
                Err(e) if is_corrupt(&e) => {
                    reporter.error(&format!("{name}: corrupt package record: {e:#}"));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Subgraph construction and ordering for one migrator: scope, minus
    /// archived, minus bot-error, minus filtered, minus awaiting-parents.
    fn eligible_order(
        &self,
        migrator: &dyn Migrator,
        records: &BTreeMap<String, PackageRecord>,
    ) -> Result<Vec<String>> {
        let scope: BTreeSet<String> = match migrator.scope(self.graph) {
            Some(scope) => scope,
            None => records.keys().cloned().collect(),
        };

        let mut workable: BTreeSet<String> = BTreeSet::new();
        for name in &scope {
            let Some(record) = records.get(name) else { continue };
            if record.archived || !record.bad.is_clear() {
                continue;
            }
            if migrator.filter(record, self.store) {
                continue;
            }
            workable.insert(name.clone());
        }

        // Awaiting-parents: a node waits for in-subgraph predecessors that
        // have not landed this migrator, unless the predecessor shares a
        // cycle with it (otherwise cycles would deadlock forever).
        let mut ready: BTreeSet<String> = BTreeSet::new();
        'nodes: for name in &workable {
            for parent in self.graph.predecessors(name) {
                if !workable.contains(&parent) {
                    continue;
                }
                if self.graph.descendants(name).contains(&parent) {
                    continue; // same cycle
                }
                let Some(parent_record) = records.get(&parent) else { continue };
                let parent_fp = migrator.fingerprint(parent_record, self.store);
                if !self.landed(&parent, &parent_fp)? {
                    continue 'nodes;
                }
            }
            ready.insert(name.clone());
        }

        let subgraph = self.graph.prune(|name| ready.contains(name));
        Ok(migrator.order(&subgraph, self.graph))
    }

    fn landed(&self, package: &str, fingerprint: &Fingerprint) -> Result<bool> {
        let info: Option<PrInfoRecord> = match self.store.load(&pr_info_key(package)) {
            Ok(info) => info,
            Err(e) if is_corrupt(&e) => None,
            Err(e) => return Err(e),
        };
        Ok(info
            .and_then(|info| {
                info.entry_for(fingerprint)
                    .map(|entry| entry.state == PrState::Merged)
            })
            .unwrap_or(false))
    }

    fn gate(
        &self,
        migrator: &dyn Migrator,
        opened_this_cycle: usize,
        deadline: Instant,
        reporter: &mut dyn Reporter,
    ) -> Result<(), WalkEnd> {
        if Instant::now() >= deadline {
            return Err(WalkEnd::Gated("wall-clock budget exhausted"));
        }
        if opened_this_cycle >= migrator.pr_limit() {
            return Err(WalkEnd::Gated("per-cycle PR limit reached"));
        }

        match self.forge.refresh_rate_budget() {
            Ok(_) => {}
            Err(ForgeError::RateLimited) => return Err(WalkEnd::RateLimited),
            Err(e) => {
                reporter.warn(&format!("rate budget refresh failed: {e}"));
            }
        }
        if self.forge.rate_budget().remaining() <= self.config.rate_floor {
            return Err(WalkEnd::Gated("forge rate budget at the safety floor"));
        }

        let sample = sample_resources(&self.config.tmpdir);
        if !sample.above_floors(self.config.memory_floor_gb, self.config.disk_floor_gb) {
            return Err(WalkEnd::Gated("host below memory/disk floors"));
        }
        Ok(())
    }

    fn dedup(&self, package: &str, fingerprint: &Fingerprint) -> Result<Dedup> {
        let info: Option<PrInfoRecord> = match self.store.load(&pr_info_key(package)) {
            Ok(info) => info,
            Err(e) if is_corrupt(&e) => return Ok(Dedup::FreshAttempt),
            Err(e) => return Err(e),
        };
        let Some(entry) = info.as_ref().and_then(|i| i.entry_for(fingerprint)) else {
            return Ok(Dedup::FreshAttempt);
        };
        Ok(match entry.state {
            PrState::Open => Dedup::InPr,
            PrState::Merged => Dedup::Done,
            PrState::Closed => {
                let age = entry
                    .closed_at
                    .map(|closed| Utc::now() - closed)
                    .unwrap_or_else(chrono::Duration::zero);
                let window =
                    chrono::Duration::from_std(self.config.pr_retry_window).unwrap_or_default();
                if age > window {
                    Dedup::FreshAttempt
                } else {
                    Dedup::InRetryWindow
                }
            }
        })
    }

    /// One migration attempt. `Ok(true)` means a PR was opened (counts
    /// against the migrator's limit), `Ok(false)` means the node was
    /// handled without a new PR (error recorded, archived, duplicate).
    fn execute(
        &self,
        migrator: &dyn Migrator,
        record: &PackageRecord,
        fingerprint: &Fingerprint,
        tooling: Option<&ToolingVersions>,
        events: &mut EventLog,
        reporter: &mut dyn Reporter,
    ) -> Result<bool, WalkEnd> {
        let name = record.name.clone();
        let branch = migrator.remote_branch(record, self.store);

        let mut scope = self
            .store
            .write_scope::<PackageRecord>(&node_key(&name))
            .map_err(|e| {
                // Another worker holds this node; it will finish the job.
                WalkEnd::Gated(log_static(reporter, format!("{name}: {e:#}")))
            })?;
        scope.set(record.clone());

        if let Err(e) = self.forge.ensure_fork(&record.feedstock_name) {
            return self.handle_forge_error(&name, migrator, e, &mut scope, events, reporter);
        }
        let work_dir = match self.forge.checkout_branch(
            &record.feedstock_name,
            &branch,
            &self.config.tmpdir,
        ) {
            Ok(dir) => dir,
            Err(e) => {
                return self.handle_forge_error(&name, migrator, e, &mut scope, events, reporter);
            }
        };

        if let Err(migration_error) = migrator.migrate(&work_dir, record, self.store) {
            reporter.warn(&format!("{name}: migration refused: {migration_error}"));
            events.record(
                &name,
                BotEventKind::MigrationFailed {
                    migrator: migrator.name().to_string(),
                    reason: migration_error.reason.clone(),
                },
            );
            if let Ok(stored) = scope.get_mut() {
                stored.bad = match migration_error.traceback {
                    Some(traceback) => {
                        BadState::with_traceback("migrate", migration_error.reason, traceback)
                    }
                    None => BadState::flagged("migrate", migration_error.reason),
                };
            }
            let _ = scope.commit();
            return Ok(false);
        }

        // Re-render when the policy demands it or the tooling moved on.
        if self.needs_rerender(migrator, &name, tooling)? {
            if let Err(e) = self.rerenderer.rerender(&work_dir) {
                reporter.warn(&format!("{name}: re-render failed: {e:#}"));
                if let Ok(stored) = scope.get_mut() {
                    stored.bad = BadState::flagged("rerender", format!("{e:#}"));
                }
                let _ = scope.commit();
                return Ok(false);
            }
        }

        if self.flags.dry_run {
            reporter.info(&format!(
                "{name}: dry-run, would open PR on branch {branch}"
            ));
            let _ = scope.commit();
            return Ok(false);
        }

        let message = migrator.commit_message(record, self.store);
        if let Err(e) = self.forge.commit_and_push(&work_dir, &branch, &message) {
            return self.handle_forge_error(&name, migrator, e, &mut scope, events, reporter);
        }

        let spec = PullRequestSpec {
            title: migrator.pr_title(record, self.store),
            body: migrator.pr_body(record, self.store, self.config.run_url.as_deref()),
            head: branch.clone(),
            base: "main".to_string(),
        };
        let pr = match self.forge.open_pull_request(&record.feedstock_name, &spec) {
            Ok(pr) => Some(pr),
            Err(ForgeError::ValidationFailed(detail)) => {
                // Duplicate PR: someone (often a previous crash of this very
                // worker) already opened it. Treat as open and carry on.
                reporter.info(&format!("{name}: PR already exists ({detail})"));
                None
            }
            Err(e) => {
                return self.handle_forge_error(&name, migrator, e, &mut scope, events, reporter);
            }
        };

        if let Some(pr) = &pr {
            let _ = self.forge.add_labels(&record.feedstock_name, pr.number, &[migrator.name()]);
            self.store
                .put(&pr_json_key(pr.id), pr)
                .map_err(|e| WalkEnd::Gated(log_static(reporter, format!("{name}: {e:#}"))))?;
            events.record(
                &name,
                BotEventKind::PrOpened {
                    migrator: migrator.name().to_string(),
                    number: pr.number,
                },
            );
        }

        // Append (or refresh) the fingerprint entry and advance the tooling
        // versions, all under the pr_info write scope.
        {
            let mut info_scope = self
                .store
                .write_scope::<PrInfoRecord>(&pr_info_key(&name))
                .map_err(|e| WalkEnd::Gated(log_static(reporter, format!("{name}: {e:#}"))))?;
            let info = info_scope
                .get_mut()
                .map_err(|e| WalkEnd::Gated(log_static(reporter, format!("{name}: {e:#}"))))?;

            let entry = PrEntry {
                fingerprint: fingerprint.clone(),
                state: PrState::Open,
                url: pr.as_ref().map(|p| p.html_url.clone()),
                number: pr.as_ref().map(|p| p.number),
                forge_id: pr.as_ref().map(|p| p.id),
                opened_at: Utc::now(),
                closed_at: None,
            };
            match info.entry_for_mut(fingerprint) {
                Some(existing) => *existing = entry,
                None => info.prs.push(entry),
            }
            if let Some(tooling) = tooling {
                info.smithy_version = Some(tooling.smithy_version.clone());
                info.pinning_version = Some(tooling.pinning_version.clone());
            }
            info_scope
                .commit()
                .map_err(|e| WalkEnd::Gated(log_static(reporter, format!("{name}: {e:#}"))))?;
        }

        if let Some(pr) = &pr {
            if let Err(e) = migrator.record_success(record, self.store, pr) {
                reporter.warn(&format!("{name}: success bookkeeping failed: {e:#}"));
            }
            reporter.info(&format!("{name}: opened PR #{}", pr.number));
        }

        scope
            .commit()
            .map_err(|e| WalkEnd::Gated(log_static(reporter, format!("{name}: {e:#}"))))?;
        Ok(pr.is_some())
    }

    fn needs_rerender(
        &self,
        migrator: &dyn Migrator,
        package: &str,
        tooling: Option<&ToolingVersions>,
    ) -> Result<bool, WalkEnd> {
        match migrator.rerender_policy() {
            RerenderPolicy::Always => Ok(true),
            RerenderPolicy::Never => Ok(false),
            RerenderPolicy::IfToolingChanged => {
                let Some(current) = tooling else { return Ok(false) };
                let info: Option<PrInfoRecord> =
                    self.store.load(&pr_info_key(package)).unwrap_or(None);
                Ok(match info {
                    None => true,
                    Some(info) => {
                        info.smithy_version.as_deref() != Some(current.smithy_version.as_str())
                            || info.pinning_version.as_deref()
                                != Some(current.pinning_version.as_str())
                    }
                })
            }
        }
    }

    fn handle_forge_error(
        &self,
        name: &str,
        migrator: &dyn Migrator,
        error: ForgeError,
        scope: &mut crate::store::WriteScope<'_, PackageRecord>,
        events: &mut EventLog,
        reporter: &mut dyn Reporter,
    ) -> Result<bool, WalkEnd> {
        match error {
            ForgeError::RateLimited => Err(WalkEnd::RateLimited),
            ForgeError::Archived(which) => {
                reporter.warn(&format!("{name}: feedstock archived ({which})"));
                if let Ok(stored) = scope.get_mut() {
                    stored.archived = true;
                }
                Ok(false)
            }
            ForgeError::AuthFailed => {
                // Nothing else will work this run either.
                Err(WalkEnd::Gated("forge authentication failed"))
            }
            ForgeError::ValidationFailed(detail) => {
                reporter.info(&format!("{name}: treated as already open ({detail})"));
                Ok(false)
            }
            ForgeError::NotFound(what) => {
                reporter.warn(&format!("{name}: missing on the forge: {what}"));
                events.record(
                    name,
                    BotEventKind::MigrationFailed {
                        migrator: migrator.name().to_string(),
                        reason: format!("not found: {what}"),
                    },
                );
                Ok(false)
            }
            ForgeError::Transient(detail) => {
                // The next cron run reconciles; nothing recorded as bad.
                reporter.warn(&format!("{name}: transient forge failure: {detail}"));
                Ok(false)
            }
        }
    }
}

fn is_corrupt(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<StoreError>()
        .is_some_and(|e| matches!(e, StoreError::CorruptRecord { .. }))
}

fn log_static(reporter: &mut dyn Reporter, message: String) -> &'static str {
    reporter.warn(&message);
    "see warning above"
}
