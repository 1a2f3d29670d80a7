//! The version migrator.
//!
//! Rewrites a recipe to the latest discovered upstream version: the version
//! template variable, the source integrity hash (computed from the freshly
//! resolved tarball URL), and a build number reset to zero. Per-version
//! attempt counters cap how often one target version is retried, and the
//! head branch used for each attempted version is recorded in the
//! version-PR-info specialization.

use std::path::Path;

use anyhow::{Context, Result};
use gardener_vercmp::compare;
use reqwest::blocking::Client;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::migrators::{MigrationError, Migrator, RerenderPolicy, pr_body_with_fingerprint};
use crate::recipe;
use crate::store::GraphStore;
use crate::types::{
    Fingerprint, PackageRecord, PrJsonRecord, VersionPrInfoRecord, VersionRecord, version_pr_info_key,
    versions_key,
};

/// How many times one target version is attempted before the bot waits for
/// an operator or a newer upstream release.
pub const DEFAULT_MAX_ATTEMPTS_PER_VERSION: u32 = 3;

pub struct VersionMigrator {
    http: Client,
    max_attempts_per_version: u32,
    pr_limit: usize,
}

impl VersionMigrator {
    pub fn standard() -> Self {
        Self::with_limits(DEFAULT_MAX_ATTEMPTS_PER_VERSION, 10)
    }

    pub fn with_limits(max_attempts_per_version: u32, pr_limit: usize) -> Self {
        Self {
            http: Client::new(),
            max_attempts_per_version,
            pr_limit,
        }
    }

    /// The version this migrator would move the package to, if any.
    fn target_version(&self, package: &PackageRecord, store: &GraphStore) -> Option<String> {
        let record: VersionRecord = store.load(&versions_key(&package.name)).ok()??;
        let new_version = record.new_version?;
        match package.version.as_deref() {
            Some(current) if compare(&new_version, current) != std::cmp::Ordering::Greater => None,
            _ => Some(new_version),
        }
    }

    fn attempts_for(&self, package: &PackageRecord, store: &GraphStore, version: &str) -> u32 {
        store
            .load::<VersionRecord>(&versions_key(&package.name))
            .ok()
            .flatten()
            .map(|record| record.new_version_attempts.get(version).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn fetch_and_hash(&self, url: &str) -> Result<String, MigrationError> {
        let resp = self
            .http
            .get(url)
            .send()
            .map_err(|e| MigrationError::new(format!("tarball fetch failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(MigrationError::new(format!(
                "tarball fetch returned {} for {url}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .map_err(|e| MigrationError::new(format!("tarball body read failed: {e}")))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

impl Migrator for VersionMigrator {
    fn name(&self) -> &str {
        "version"
    }

    fn filter(&self, package: &PackageRecord, store: &GraphStore) -> bool {
        let Some(target) = self.target_version(package, store) else {
            return true;
        };
        self.attempts_for(package, store, &target) >= self.max_attempts_per_version
    }

    fn migrate(
        &self,
        recipe_dir: &Path,
        package: &PackageRecord,
        store: &GraphStore,
    ) -> Result<Fingerprint, MigrationError> {
        let target = self
            .target_version(package, store)
            .ok_or_else(|| MigrationError::new("no newer upstream version on record"))?;

        let url = package
            .recipe
            .resolved_source_url(&target)
            .ok_or_else(|| MigrationError::new("recipe has no source url to re-resolve"))?;
        let hash = self.fetch_and_hash(&url)?;
        let hash_kind = package.hash_kind.clone();

        let changed = recipe::edit_recipe(recipe_dir, |content| {
            let mut changed = recipe::set_template_var(content, "version", &target);
            changed |= recipe::set_mapping_value(content, &hash_kind, &hash);
            changed |= recipe::set_mapping_value(content, "number", "0");
            changed
        })
        .map_err(|e| MigrationError::with_traceback("recipe rewrite refused", format!("{e:#}")))?;

        // Attempts count tree mutations, so re-running on an already-bumped
        // tree stays a no-op.
        if changed {
            let mut scope = store
                .write_scope::<VersionRecord>(&versions_key(&package.name))
                .map_err(|e| MigrationError::new(format!("versions record locked: {e:#}")))?;
            let record = scope
                .get_mut()
                .map_err(|e| MigrationError::new(format!("versions record unreadable: {e:#}")))?;
            *record.new_version_attempts.entry(target.clone()).or_insert(0) += 1;
            scope
                .commit()
                .map_err(|e| MigrationError::new(format!("versions record flush failed: {e:#}")))?;
        }

        Ok(self.fingerprint(package, store))
    }

    fn fingerprint(&self, package: &PackageRecord, store: &GraphStore) -> Fingerprint {
        Fingerprint::new(json!({
            "migrator": "version",
            "target": self.target_version(package, store),
        }))
    }

    fn pr_title(&self, package: &PackageRecord, store: &GraphStore) -> String {
        let target = self
            .target_version(package, store)
            .unwrap_or_else(|| "latest".to_string());
        format!("{} v{target}", package.name)
    }

    fn pr_body(&self, package: &PackageRecord, store: &GraphStore, run_url: Option<&str>) -> String {
        let target = self
            .target_version(package, store)
            .unwrap_or_else(|| "latest".to_string());
        let narrative = format!(
            "This PR updates `{}` from `{}` to `{target}`: new source version, \
             refreshed integrity hash, build number reset.",
            package.name,
            package.version.as_deref().unwrap_or("unversioned"),
        );
        pr_body_with_fingerprint(&narrative, &self.fingerprint(package, store), run_url)
    }

    fn remote_branch(&self, package: &PackageRecord, store: &GraphStore) -> String {
        let target = self
            .target_version(package, store)
            .unwrap_or_else(|| "latest".to_string());
        format!("bump-{target}-{}", self.fingerprint(package, store).digest())
    }

    fn rerender_policy(&self) -> RerenderPolicy {
        RerenderPolicy::IfToolingChanged
    }

    fn pr_limit(&self) -> usize {
        self.pr_limit
    }

    fn record_success(
        &self,
        package: &PackageRecord,
        store: &GraphStore,
        pr: &PrJsonRecord,
    ) -> Result<()> {
        let Some(target) = self.target_version(package, store) else {
            return Ok(());
        };
        let attempts = self.attempts_for(package, store, &target);

        let mut scope = store
            .write_scope::<VersionPrInfoRecord>(&version_pr_info_key(&package.name))
            .context("version PR info locked")?;
        let record = scope.get_mut()?;
        record.attempts.insert(target.clone(), attempts.max(1));
        record.branches.insert(target, pr.head_ref.clone());
        scope.commit()
    }
}
