//! # Gardener
//!
//! The core library of the gardener feedstock-maintenance bot.
//!
//! Gardener tends a community package ecosystem of thousands of independent
//! feedstock repositories: it discovers feedstocks, builds the global
//! dependency graph, watches upstream releases, decides which feedstocks
//! each migrator may change right now, opens pull requests, and follows
//! them to completion. It is built to run as a fleet of cron-triggered
//! workers sharing state through a content-addressed JSON store; every
//! invocation is resumable and every record flush is atomic, so a killed
//! worker loses nothing but time.
//!
//! ## Pipeline
//!
//! The steady-state flow is **probe → tick → track**:
//!
//! 1. [`feedstocks::gather_all_feedstocks`] refreshes the known-feedstock
//!    list and tombstones archived ones.
//! 2. [`feedstocks::make_graph`] rebuilds the dependency graph from the
//!    package records.
//! 3. [`versions::update_upstream_versions`] probes upstream for every
//!    package in this worker's shard and persists version records.
//! 4. [`scheduler::Scheduler::auto_tick`] walks every migrator in
//!    registration order, opening PRs subject to rate, time, and resource
//!    budgets.
//! 5. [`tracker::update_prs`] reconciles open PRs with the forge and
//!    propagates merges back into the records.
//!
//! ## Key Types
//!
//! - `GraphStore` — the lazy key→JSON facade over the configured backends
//! - `PackageGraph` — the cyclic-tolerant dependency graph
//! - `Migrator` — the capability set a transformation implements
//! - `ForgeGateway` — everything the bot does against the code forge
//! - `BotConfig` — process-wide configuration from the environment
//!
//! ## Modules
//!
//! - [`backends`] — file, mirror, and database store backends
//! - [`store`] — the graph store facade: lazy handles, write scopes, cache
//! - [`lock`] — per-key sidecar advisory locks
//! - [`graph`] — the package dependency graph
//! - [`probes`] — upstream release probes
//! - [`versions`] — the sharded version-probing pipeline
//! - [`migrators`] — the migrator trait and its non-version variants
//! - [`migrator_version`] — the version-bump migrator
//! - [`scheduler`] — the migration engine
//! - [`tracker`] — the PR tracker
//! - [`forge`] — the forge gateway and rate budget
//! - [`status`] — the status reporter
//! - [`reactor`] — narrow re-evaluation on external events
//! - [`feedstocks`] — discovery and graph refresh
//! - [`mappings`] — import-name mapping tables
//! - [`recipe`] — the typed recipe tree and working-copy edits
//! - [`rerender`] — the external re-render collaborator interface
//! - [`events`] — the append-only JSONL audit log
//! - [`config`] — environment configuration
//! - [`environment`] — resource floors and scratch hygiene
//! - [`process`] — subprocess execution with timeouts
//!
//! Version ordering, retry/backoff policies, and the sharded key layout
//! live in the `gardener-vercmp`, `gardener-retry`, and `gardener-shard`
//! microcrates.

/// Storage backends with the pluggable `Backend` trait.
pub mod backends;

/// Environment configuration, read once at process start.
pub mod config;

/// Host resource sampling and scratch hygiene.
pub mod environment;

/// Append-only JSONL audit log.
pub mod events;

/// Feedstock discovery and graph refresh.
pub mod feedstocks;

/// The forge gateway: clones, forks, pushes, PRs, rate budget.
pub mod forge;

/// The package dependency graph.
pub mod graph;

/// Per-key sidecar advisory locks.
pub mod lock;

/// Import-name to package-name mapping tables.
pub mod mappings;

/// The version-bump migrator.
pub mod migrator_version;

/// The migrator trait, PR-body fingerprints, and the non-version variants.
pub mod migrators;

/// Upstream release probes.
pub mod probes;

/// Subprocess execution with timeout support.
pub mod process;

/// The event reactor.
pub mod reactor;

/// The typed recipe tree and working-copy edits.
pub mod recipe;

/// Interface to the external re-render collaborator.
pub mod rerender;

/// The migration engine.
pub mod scheduler;

/// The status reporter.
pub mod status;

/// The graph store facade.
pub mod store;

/// The PR tracker.
pub mod tracker;

/// Domain types: records, fingerprints, PR entries, store keys.
pub mod types;

/// The sharded version-probing pipeline.
pub mod versions;

/// Retry strategies, backoff policies, and cancellation.
/// Re-exported from the gardener-retry microcrate.
pub use gardener_retry as retry;

/// Version total ordering. Re-exported from the gardener-vercmp microcrate.
pub use gardener_vercmp as vercmp;

/// Property-based tests for cross-module invariants.
#[cfg(test)]
mod property_tests;
