//! Migrators: polymorphic transformations over feedstock recipes.
//!
//! A migrator decides which packages it can change right now (`filter`), in
//! what order (`order`), and how (`migrate` on a checked-out working tree),
//! and describes the resulting PR (`pr_title`, `pr_body`, `remote_branch`,
//! `commit_message`). Its `fingerprint` is the canonical JSON identity of
//! the intended change; the scheduler de-duplicates on it, and every PR
//! body embeds it in a fenced block so the history is recoverable from the
//! forge alone.
//!
//! The version migrator lives in [`crate::migrator_version`]; this module
//! holds the trait, the shared helpers, and the remaining variants.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::graph::PackageGraph;
use crate::migrator_version::VersionMigrator;
use crate::recipe;
use crate::store::GraphStore;
use crate::types::{Fingerprint, PackageRecord, PrJsonRecord};

/// When the external re-renderer must run after a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerenderPolicy {
    Always,
    #[default]
    IfToolingChanged,
    Never,
}

/// A migration refused by the recipe or its working tree. Recorded on the
/// package as `bad = {kind: "migrate", ...}` and retried only when the
/// migrator's fingerprint changes.
#[derive(Debug, Clone)]
pub struct MigrationError {
    pub reason: String,
    pub traceback: Option<String>,
}

impl MigrationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(reason: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            traceback: Some(traceback.into()),
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for MigrationError {}

/// The migrator capability set.
pub trait Migrator: Send + Sync {
    fn name(&self) -> &str;

    /// True iff there is nothing to do for this package right now.
    fn filter(&self, package: &PackageRecord, store: &GraphStore) -> bool;

    /// The sequence in which eligible packages are attempted. Default:
    /// cyclic topological sort over the subgraph.
    fn order(&self, subgraph: &PackageGraph, _full_graph: &PackageGraph) -> Vec<String> {
        let nodes: BTreeSet<String> = subgraph.node_names().into_iter().collect();
        subgraph.cyclic_topological_sort(&nodes)
    }

    /// The migrator's graph scope; `None` means the full graph.
    fn scope(&self, _graph: &PackageGraph) -> Option<BTreeSet<String>> {
        None
    }

    /// Mutate a checked-out working tree. Idempotent: a second call on an
    /// already-migrated tree returns the same fingerprint without changes.
    fn migrate(
        &self,
        recipe_dir: &Path,
        package: &PackageRecord,
        store: &GraphStore,
    ) -> Result<Fingerprint, MigrationError>;

    /// Canonical identity of the intended change.
    fn fingerprint(&self, package: &PackageRecord, store: &GraphStore) -> Fingerprint;

    fn pr_title(&self, package: &PackageRecord, store: &GraphStore) -> String;

    fn pr_body(&self, package: &PackageRecord, store: &GraphStore, run_url: Option<&str>) -> String;

    /// Must uniquely identify the attempt.
    fn remote_branch(&self, package: &PackageRecord, store: &GraphStore) -> String;

    fn commit_message(&self, package: &PackageRecord, store: &GraphStore) -> String {
        self.pr_title(package, store)
    }

    fn rerender_policy(&self) -> RerenderPolicy {
        RerenderPolicy::IfToolingChanged
    }

    /// Max PRs this migrator may open per scheduler cycle.
    fn pr_limit(&self) -> usize {
        5
    }

    /// Hook invoked after a PR opened successfully; variants with extra
    /// bookkeeping (the version migrator's per-version tables) override it.
    fn record_success(
        &self,
        _package: &PackageRecord,
        _store: &GraphStore,
        _pr: &PrJsonRecord,
    ) -> Result<()> {
        Ok(())
    }
}

const FINGERPRINT_FENCE: &str = "```json";

/// Assemble a PR body: narrative, optional run link, and the fingerprint in
/// a fenced JSON block.
pub fn pr_body_with_fingerprint(
    narrative: &str,
    fingerprint: &Fingerprint,
    run_url: Option<&str>,
) -> String {
    let mut body = narrative.trim_end().to_string();
    if let Some(url) = run_url {
        body.push_str(&format!("\n\nThis change was produced by run {url}."));
    }
    let pretty = serde_json::to_string_pretty(fingerprint)
        .unwrap_or_else(|_| fingerprint.canonical());
    body.push_str(&format!(
        "\n\n<sub>bot metadata, do not edit</sub>\n{FINGERPRINT_FENCE}\n{pretty}\n```\n"
    ));
    body
}

/// Recover the fingerprint from a PR body written by
/// [`pr_body_with_fingerprint`].
pub fn fingerprint_from_pr_body(body: &str) -> Option<Fingerprint> {
    let start = body.rfind(FINGERPRINT_FENCE)?;
    let after = &body[start + FINGERPRINT_FENCE.len()..];
    let end = after.find("```")?;
    serde_json::from_str(after[..end].trim()).ok()
}

/// Rebuild every descendant of an anchor package by bumping build numbers.
pub struct RebuildMigrator {
    pub anchor: String,
    pub reason: String,
    pub migration_id: String,
}

impl Migrator for RebuildMigrator {
    fn name(&self) -> &str {
        "rebuild"
    }

    fn scope(&self, graph: &PackageGraph) -> Option<BTreeSet<String>> {
        Some(graph.descendants(&self.anchor))
    }

    fn filter(&self, package: &PackageRecord, _store: &GraphStore) -> bool {
        // Everything in scope gets a rebuild; archived and already-done
        // nodes are the scheduler's business.
        package.name == self.anchor
    }

    fn migrate(
        &self,
        recipe_dir: &Path,
        package: &PackageRecord,
        store: &GraphStore,
    ) -> Result<Fingerprint, MigrationError> {
        // The target number comes from the stored record, so re-running on
        // an already-bumped tree settles on the same value.
        let target = package.recipe.build.number + 1;
        recipe::edit_recipe(recipe_dir, |content| {
            recipe::set_mapping_value(content, "number", &target.to_string())
        })
        .map_err(|e| MigrationError::with_traceback("build number bump refused", format!("{e:#}")))?;
        Ok(self.fingerprint(package, store))
    }

    fn fingerprint(&self, package: &PackageRecord, _store: &GraphStore) -> Fingerprint {
        Fingerprint::new(json!({
            "migrator": "rebuild",
            "id": self.migration_id,
            "package": package.name,
            "build_number": package.recipe.build.number + 1,
        }))
    }

    fn pr_title(&self, package: &PackageRecord, _store: &GraphStore) -> String {
        format!("Rebuild {} for {}", package.name, self.reason)
    }

    fn pr_body(&self, package: &PackageRecord, store: &GraphStore, run_url: Option<&str>) -> String {
        let narrative = format!(
            "This PR rebuilds `{}` (build number bump, no recipe change) for {}.",
            package.name, self.reason
        );
        pr_body_with_fingerprint(&narrative, &self.fingerprint(package, store), run_url)
    }

    fn remote_branch(&self, package: &PackageRecord, store: &GraphStore) -> String {
        format!("rebuild-{}-{}", self.migration_id, self.fingerprint(package, store).digest())
    }

    fn rerender_policy(&self) -> RerenderPolicy {
        RerenderPolicy::Always
    }
}

/// Edit pinning sections: replace or remove a dependency across recipes.
pub struct PinReplacementMigrator {
    pub old_dep: String,
    /// Empty string removes the dependency instead of renaming it.
    pub new_dep: String,
}

impl PinReplacementMigrator {
    fn rewrite(&self, content: &mut String) -> bool {
        let mut changed = false;
        let lines: Vec<String> = content
            .lines()
            .filter_map(|line| {
                let trimmed = line.trim_start();
                let is_dep_line = trimmed.strip_prefix("- ").is_some_and(|dep| {
                    dep.split_whitespace().next() == Some(self.old_dep.as_str())
                });
                if !is_dep_line {
                    return Some(line.to_string());
                }
                changed = true;
                if self.new_dep.is_empty() {
                    None
                } else {
                    Some(line.replacen(&self.old_dep, &self.new_dep, 1))
                }
            })
            .collect();
        if changed {
            *content = lines.join("\n");
            content.push('\n');
        }
        changed
    }
}

impl Migrator for PinReplacementMigrator {
    fn name(&self) -> &str {
        "pin-replacement"
    }

    fn filter(&self, package: &PackageRecord, _store: &GraphStore) -> bool {
        let reqs = &package.requirements;
        ![&reqs.build, &reqs.host, &reqs.run, &reqs.test]
            .iter()
            .any(|section| section.contains(&self.old_dep))
    }

    fn migrate(
        &self,
        recipe_dir: &Path,
        package: &PackageRecord,
        store: &GraphStore,
    ) -> Result<Fingerprint, MigrationError> {
        recipe::edit_recipe(recipe_dir, |content| self.rewrite(content))
            .map_err(|e| MigrationError::with_traceback("dependency rewrite refused", format!("{e:#}")))?;
        Ok(self.fingerprint(package, store))
    }

    fn fingerprint(&self, package: &PackageRecord, _store: &GraphStore) -> Fingerprint {
        Fingerprint::new(json!({
            "migrator": "pin-replacement",
            "package": package.name,
            "old": self.old_dep,
            "new": self.new_dep,
        }))
    }

    fn pr_title(&self, package: &PackageRecord, _store: &GraphStore) -> String {
        if self.new_dep.is_empty() {
            format!("Drop {} from {}", self.old_dep, package.name)
        } else {
            format!("Replace {} with {} in {}", self.old_dep, self.new_dep, package.name)
        }
    }

    fn pr_body(&self, package: &PackageRecord, store: &GraphStore, run_url: Option<&str>) -> String {
        let narrative = format!(
            "This PR updates the pinned dependency `{}` in `{}`.",
            self.old_dep, package.name
        );
        pr_body_with_fingerprint(&narrative, &self.fingerprint(package, store), run_url)
    }

    fn remote_branch(&self, package: &PackageRecord, store: &GraphStore) -> String {
        format!("pin-{}", self.fingerprint(package, store).digest())
    }
}

const FEEDSTOCK_CONFIG: &str = "feedstock.yml";

/// Add architecture entries to a feedstock's build configuration.
pub struct ArchMigrator {
    pub arches: Vec<String>,
}

impl ArchMigrator {
    fn configured_arches(package: &PackageRecord) -> BTreeSet<String> {
        package
            .extra
            .get("platforms")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn missing_arches(&self, package: &PackageRecord) -> Vec<String> {
        let configured = Self::configured_arches(package);
        self.arches
            .iter()
            .filter(|arch| !configured.contains(*arch))
            .cloned()
            .collect()
    }
}

impl Migrator for ArchMigrator {
    fn name(&self) -> &str {
        "arch"
    }

    fn filter(&self, package: &PackageRecord, _store: &GraphStore) -> bool {
        self.missing_arches(package).is_empty()
    }

    fn migrate(
        &self,
        recipe_dir: &Path,
        package: &PackageRecord,
        store: &GraphStore,
    ) -> Result<Fingerprint, MigrationError> {
        let mut all: BTreeSet<String> = Self::configured_arches(package);
        all.extend(self.arches.iter().cloned());

        let config_path = recipe_dir.join(FEEDSTOCK_CONFIG);
        let mut lines = vec!["build_platforms:".to_string()];
        lines.extend(all.iter().map(|arch| format!("  - {arch}")));
        // Writing the full sorted set makes a re-run byte-identical.
        std::fs::write(&config_path, lines.join("\n") + "\n")
            .map_err(|e| MigrationError::with_traceback("config write refused", e.to_string()))?;
        Ok(self.fingerprint(package, store))
    }

    fn fingerprint(&self, package: &PackageRecord, _store: &GraphStore) -> Fingerprint {
        Fingerprint::new(json!({
            "migrator": "arch",
            "package": package.name,
            "arches": self.arches,
        }))
    }

    fn pr_title(&self, package: &PackageRecord, _store: &GraphStore) -> String {
        format!("Add {} builds for {}", self.arches.join(", "), package.name)
    }

    fn pr_body(&self, package: &PackageRecord, store: &GraphStore, run_url: Option<&str>) -> String {
        let narrative = format!(
            "This PR enables the `{}` platforms for `{}`.",
            self.arches.join("`, `"),
            package.name
        );
        pr_body_with_fingerprint(&narrative, &self.fingerprint(package, store), run_url)
    }

    fn remote_branch(&self, package: &PackageRecord, store: &GraphStore) -> String {
        format!("arch-{}", self.fingerprint(package, store).digest())
    }

    fn rerender_policy(&self) -> RerenderPolicy {
        RerenderPolicy::Always
    }
}

/// The canonical compiler stanza the cross-compile scaffolding needs in the
/// build section.
const CROSS_COMPILE_LINES: [&str; 2] = [
    "    - cross-compiler_{{ build_platform }}",
    "    - sysroot_{{ target_platform }}",
];

/// Inject canonical cross-compilation scaffolding into the build section.
pub struct CrossCompileMigrator;

impl CrossCompileMigrator {
    fn inject(content: &mut String) -> bool {
        if CROSS_COMPILE_LINES.iter().all(|line| content.contains(line.trim())) {
            return false;
        }
        let mut out: Vec<String> = Vec::new();
        let mut injected = false;
        for line in content.lines() {
            out.push(line.to_string());
            if !injected && line.trim() == "build:" {
                for extra in CROSS_COMPILE_LINES {
                    if !content.contains(extra.trim()) {
                        out.push(extra.to_string());
                    }
                }
                injected = true;
            }
        }
        if !injected {
            return false;
        }
        *content = out.join("\n");
        content.push('\n');
        true
    }
}

impl Migrator for CrossCompileMigrator {
    fn name(&self) -> &str {
        "cross-compile"
    }

    fn filter(&self, package: &PackageRecord, _store: &GraphStore) -> bool {
        // Noarch recipes never cross-compile.
        package.recipe.build.noarch.is_some()
    }

    fn migrate(
        &self,
        recipe_dir: &Path,
        package: &PackageRecord,
        store: &GraphStore,
    ) -> Result<Fingerprint, MigrationError> {
        recipe::edit_recipe(recipe_dir, |content| Self::inject(content))
            .map_err(|e| MigrationError::with_traceback("scaffolding injection refused", format!("{e:#}")))?;
        Ok(self.fingerprint(package, store))
    }

    fn fingerprint(&self, package: &PackageRecord, _store: &GraphStore) -> Fingerprint {
        Fingerprint::new(json!({
            "migrator": "cross-compile",
            "package": package.name,
        }))
    }

    fn pr_title(&self, package: &PackageRecord, _store: &GraphStore) -> String {
        format!("Enable cross-compilation for {}", package.name)
    }

    fn pr_body(&self, package: &PackageRecord, store: &GraphStore, run_url: Option<&str>) -> String {
        let narrative = format!(
            "This PR injects the canonical cross-compilation scaffolding into `{}`.",
            package.name
        );
        pr_body_with_fingerprint(&narrative, &self.fingerprint(package, store), run_url)
    }

    fn remote_branch(&self, package: &PackageRecord, store: &GraphStore) -> String {
        format!("cross-compile-{}", self.fingerprint(package, store).digest())
    }
}

/// Re-render feedstocks whose CI scaffolding was generated by outdated
/// tooling. The tree mutation itself is the scheduler's re-render step;
/// this migrator only selects targets and identifies the attempt.
pub struct RerenderMigrator {
    pub tooling: crate::rerender::ToolingVersions,
}

impl Migrator for RerenderMigrator {
    fn name(&self) -> &str {
        "rerender"
    }

    fn filter(&self, package: &PackageRecord, store: &GraphStore) -> bool {
        let stored: Option<crate::types::PrInfoRecord> =
            store.load(&crate::types::pr_info_key(&package.name)).ok().flatten();
        match stored {
            // Never touched: nothing to refresh yet.
            None => true,
            Some(info) => {
                info.smithy_version.as_deref() == Some(self.tooling.smithy_version.as_str())
                    && info.pinning_version.as_deref() == Some(self.tooling.pinning_version.as_str())
            }
        }
    }

    fn migrate(
        &self,
        _recipe_dir: &Path,
        package: &PackageRecord,
        store: &GraphStore,
    ) -> Result<Fingerprint, MigrationError> {
        // The diff comes from the external re-renderer, which the scheduler
        // always invokes for this migrator.
        Ok(self.fingerprint(package, store))
    }

    fn fingerprint(&self, _package: &PackageRecord, _store: &GraphStore) -> Fingerprint {
        Fingerprint::new(json!({
            "migrator": "rerender",
            "tooling": self.tooling.smithy_version,
        }))
    }

    fn pr_title(&self, package: &PackageRecord, _store: &GraphStore) -> String {
        format!("Regenerate CI scaffolding for {}", package.name)
    }

    fn pr_body(&self, package: &PackageRecord, store: &GraphStore, run_url: Option<&str>) -> String {
        let narrative = format!(
            "This PR regenerates `{}`'s CI scaffolding with tooling `{}`.",
            package.name, self.tooling.smithy_version
        );
        pr_body_with_fingerprint(&narrative, &self.fingerprint(package, store), run_url)
    }

    fn remote_branch(&self, package: &PackageRecord, store: &GraphStore) -> String {
        format!("rerender-{}", self.fingerprint(package, store).digest())
    }

    fn rerender_policy(&self) -> RerenderPolicy {
        RerenderPolicy::Always
    }
}

/// Persisted migrator configuration, stored under `migrations/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigratorSpec {
    Rebuild {
        anchor: String,
        reason: String,
        id: String,
    },
    PinReplacement {
        old_dep: String,
        new_dep: String,
    },
    Arch {
        arches: Vec<String>,
    },
    CrossCompile,
}

impl MigratorSpec {
    pub fn build(self) -> Box<dyn Migrator> {
        match self {
            MigratorSpec::Rebuild { anchor, reason, id } => Box::new(RebuildMigrator {
                anchor,
                reason,
                migration_id: id,
            }),
            MigratorSpec::PinReplacement { old_dep, new_dep } => {
                Box::new(PinReplacementMigrator { old_dep, new_dep })
            }
            MigratorSpec::Arch { arches } => Box::new(ArchMigrator { arches }),
            MigratorSpec::CrossCompile => Box::new(CrossCompileMigrator),
        }
    }
}

pub const MIGRATIONS_PREFIX: &str = "migrations";

/// Initialize migrator objects from pin/configuration state: the version
/// migrator always runs first, then whatever `migrations/<id>` records
/// configure (in key order), then the tooling re-render sweep when the
/// current tooling versions are known.
pub fn load_migrators(
    store: &GraphStore,
    tooling: Option<&crate::rerender::ToolingVersions>,
) -> Result<Vec<Box<dyn Migrator>>> {
    let mut migrators: Vec<Box<dyn Migrator>> = vec![Box::new(VersionMigrator::standard())];
    for key in store.keys_prefix(&format!("{MIGRATIONS_PREFIX}/"))? {
        let spec: MigratorSpec = store
            .load(&key)?
            .with_context(|| format!("migration spec vanished: {key}"))?;
        migrators.push(spec.build());
    }
    if let Some(tooling) = tooling {
        migrators.push(Box::new(RerenderMigrator {
            tooling: tooling.clone(),
        }));
    }
    Ok(migrators)
}
