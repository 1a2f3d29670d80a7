//! The gardener command-line surface.
//!
//! A flat verb per cron job, exit code 0 on success, 1 on fatal error, and
//! 2 when `--skip-exit-code` is set and the verb found nothing to do. All
//! real work happens in the `gardener` library; this adapter parses flags,
//! assembles the store, forge, and probe family, and maps outcomes onto
//! exit codes.

mod progress;

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use gardener::config::{BackendKind, BotConfig, RunFlags};
use gardener::feedstocks;
use gardener::forge::HttpForge;
use gardener::mappings;
use gardener::probes::ProbeSet;
use gardener::reactor::{self, EventKind};
use gardener::rerender::{CommandRerenderer, Rerenderer};
use gardener::scheduler::{Reporter, Scheduler};
use gardener::status;
use gardener::store::GraphStore;
use gardener::tracker;
use gardener::versions;
use gardener_retry::CancelToken;

use crate::progress::CliReporter;

#[derive(Parser, Debug)]
#[command(name = "gardener", version)]
#[command(about = "Automated maintenance bot for feedstock ecosystems")]
struct Cli {
    /// Single-threaded, verbose output.
    #[arg(long, global = true)]
    debug: bool,

    /// Read the graph from the mirror backend rather than local files.
    #[arg(long, global = true)]
    online: bool,

    /// Disable sandboxed execution of external helpers.
    #[arg(long = "no-containers", global = true)]
    no_containers: bool,

    /// Make no writes against the forge.
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,

    /// Exit 2 instead of 0 when the verb had nothing to do.
    #[arg(long = "skip-exit-code", global = true)]
    skip_exit_code: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh the known-feedstock list from the forge.
    GatherAllFeedstocks,
    /// Build or refresh the dependency graph.
    MakeGraph {
        /// Rebuild nodes and edges from the package records.
        #[arg(long)]
        update_nodes_and_edges: bool,
    },
    /// Probe upstream versions for this worker's shard of the graph.
    UpdateUpstreamVersions {
        #[arg(long, default_value_t = 0)]
        job: u32,
        #[arg(long = "n-jobs", default_value_t = 1)]
        n_jobs: u32,
    },
    /// Initialize migrator objects from pin/configuration state.
    MakeMigrators,
    /// Run every migrator until a budget runs out.
    AutoTick,
    /// Reconcile open PRs with the forge, sharded.
    UpdatePrs {
        #[arg(long, default_value_t = 0)]
        job: u32,
        #[arg(long = "n-jobs", default_value_t = 1)]
        n_jobs: u32,
        #[arg(long, default_value_t = tracker::DEFAULT_TRACKER_WORKERS)]
        workers: usize,
    },
    /// Emit the per-migrator status report.
    MakeStatusReport,
    /// Narrow re-evaluation after an external hint.
    ReactToEvent {
        /// Event kind: pr or push.
        #[arg(long)]
        event: String,
        /// Forge PR id (pr) or feedstock name (push).
        #[arg(long)]
        uid: String,
    },
    /// Force bidirectional reconciliation of all keys across backends.
    SyncLazyJsonAcrossBackends,
    /// Commit and push the mutated graph store.
    DeployToGithub,
    /// Rebuild the import-name to package-name table.
    MakeImportToPackageMapping,
    /// Rebuild every mapping table.
    MakeMappings,
    /// Emit shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Whether a verb found work to do; drives the exit-2 convention.
enum Outcome {
    Done,
    Skipped,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.cmd {
        clap_complete::generate(*shell, &mut Cli::command(), "gardener", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let skip_exit_code = cli.skip_exit_code;
    let mut reporter = CliReporter::new(cli.debug);
    let result = run(cli, &mut reporter);
    reporter.finish();

    match result {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::Skipped) => {
            if skip_exit_code {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("[error] {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, reporter: &mut dyn Reporter) -> Result<Outcome> {
    let mut config = BotConfig::from_env()?;
    let flags = RunFlags {
        debug: cli.debug,
        online: cli.online,
        no_containers: cli.no_containers,
        dry_run: cli.dry_run,
    };

    // `--online` consumers read from the mirror first. Writes through such
    // a store fail with ReadOnlyBackend, which is exactly what a read-only
    // online verb should do.
    if flags.online {
        config.backends.retain(|b| *b != BackendKind::Mirror);
        config.backends.insert(0, BackendKind::Mirror);
        if config.mirror_url.is_none() {
            anyhow::bail!("--online requires GRAPH_MIRROR_URL");
        }
    }

    let store = GraphStore::open(&config)?;
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        // Termination drains at the next suspension point; records in
        // flight are flushed by their write scopes.
        let _ = ctrlc::set_handler(move || cancel.cancel());
    }

    match cli.cmd {
        Commands::GatherAllFeedstocks => {
            let forge = build_forge(&config)?;
            let stats = feedstocks::gather_all_feedstocks(&store, &forge, reporter)?;
            Ok(if stats.known == 0 { Outcome::Skipped } else { Outcome::Done })
        }

        Commands::MakeGraph { update_nodes_and_edges } => {
            let graph = feedstocks::make_graph(&store, update_nodes_and_edges)?;
            reporter.info(&format!(
                "graph: {} nodes, {} edges",
                graph.node_count(),
                graph.edge_count()
            ));
            Ok(Outcome::Done)
        }

        Commands::UpdateUpstreamVersions { job, n_jobs } => {
            let graph = feedstocks::load_graph(&store)?;
            let probes = ProbeSet::standard()?;
            let deadline = std::time::Instant::now() + config.timeout;
            let stats = versions::update_upstream_versions(
                &store,
                &graph,
                &probes,
                job,
                n_jobs,
                Some(deadline),
                &cancel,
                reporter,
            )?;
            Ok(if stats.probed == 0 { Outcome::Skipped } else { Outcome::Done })
        }

        Commands::MakeMigrators => {
            let rerenderer = build_rerenderer(flags);
            let tooling = rerenderer.current_tooling().ok();
            let migrators = gardener::migrators::load_migrators(&store, tooling.as_ref())?;
            for migrator in &migrators {
                reporter.info(&format!(
                    "migrator {} (pr limit {})",
                    migrator.name(),
                    migrator.pr_limit()
                ));
            }
            Ok(Outcome::Done)
        }

        Commands::AutoTick => {
            let forge = build_forge(&config)?;
            let rerenderer = build_rerenderer(flags);
            let tooling = rerenderer.current_tooling().ok();
            let migrators = gardener::migrators::load_migrators(&store, tooling.as_ref())?;
            let graph = feedstocks::load_graph(&store)?;

            let scheduler = Scheduler {
                store: &store,
                graph: &graph,
                forge: &forge,
                rerenderer: &rerenderer,
                config: &config,
                flags,
            };
            let stats = scheduler.auto_tick(&migrators, &cancel, reporter)?;
            reporter.info(&format!(
                "auto-tick: {} attempted, {} PRs opened",
                stats.attempted, stats.prs_opened
            ));
            Ok(if stats.attempted == 0 { Outcome::Skipped } else { Outcome::Done })
        }

        Commands::UpdatePrs { job, n_jobs, workers } => {
            let forge = build_forge(&config)?;
            let workers = if flags.debug { 1 } else { workers };
            let stats =
                tracker::update_prs(&store, &forge, job, n_jobs, workers, &cancel, reporter)?;
            Ok(if stats.packages == 0 { Outcome::Skipped } else { Outcome::Done })
        }

        Commands::MakeStatusReport => {
            let rerenderer = build_rerenderer(flags);
            let tooling = rerenderer.current_tooling().ok();
            let migrators = gardener::migrators::load_migrators(&store, tooling.as_ref())?;
            let graph = feedstocks::load_graph(&store)?;

            let report = status::make_status_report(&store, &graph, &migrators)?;
            status::write_status_report(&store, &report)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(Outcome::Done)
        }

        Commands::ReactToEvent { event, uid } => {
            let forge = build_forge(&config)?;
            let probes = ProbeSet::standard()?;
            let kind: EventKind = event.parse()?;
            let reaction = reactor::react_to_event(&store, &probes, &forge, kind, &uid, reporter)?;
            reporter.info(&format!("reaction: {reaction:?}"));
            Ok(Outcome::Done)
        }

        Commands::SyncLazyJsonAcrossBackends => {
            let report = store.sync_across_backends(&[
                "node_attrs/",
                "versions/",
                "pr_info/",
                "version_pr_info/",
                "pr_json/",
                "mappings/",
                "migrations/",
            ])?;
            reporter.info(&format!(
                "sync: {} keys seen, {} conflicts resolved",
                report.keys_seen, report.conflicts_resolved
            ));
            Ok(Outcome::Done)
        }

        Commands::DeployToGithub => {
            if flags.dry_run {
                reporter.info("dry-run: not pushing the store");
                return Ok(Outcome::Skipped);
            }
            deploy_store(&config, reporter)
        }

        Commands::MakeImportToPackageMapping => {
            let map = mappings::make_import_to_package_mapping(&store)?;
            reporter.info(&format!("import mapping: {} entries", map.len()));
            Ok(Outcome::Done)
        }

        Commands::MakeMappings => {
            mappings::make_mappings(&store)?;
            Ok(Outcome::Done)
        }

        Commands::Completions { .. } => unreachable!("handled before run()"),
    }
}

fn build_forge(config: &BotConfig) -> Result<HttpForge> {
    HttpForge::new(
        &config.forge_api_base,
        &config.forge_host,
        &config.forge_org,
        &config.forge_bot_user,
        config.forge_token.clone(),
    )
}

fn build_rerenderer(flags: RunFlags) -> CommandRerenderer {
    let program = std::env::var("GARDENER_SMITHY_BIN")
        .unwrap_or_else(|_| "feedstock-smithy".to_string());
    CommandRerenderer::new(&program, !flags.no_containers)
}

/// Commit and push the mutated graph store. The store repository is the
/// deployment's store root; the push credential comes from FORGE_TOKEN.
fn deploy_store(config: &BotConfig, reporter: &mut dyn Reporter) -> Result<Outcome> {
    let root = &config.store_root;
    let env: BTreeMap<String, String> = BTreeMap::new();
    let timeout = Some(Duration::from_secs(600));

    let status = gardener::process::run_command_with_timeout(
        "git",
        &["status", "--porcelain"],
        root,
        &env,
        timeout,
    )
    .context("git status failed; is the store root a git checkout?")?;
    if status.stdout.trim().is_empty() {
        reporter.info("store is clean; nothing to deploy");
        return Ok(Outcome::Skipped);
    }

    for args in [
        vec!["add", "-A"],
        vec!["commit", "-m", "bot data update"],
        vec!["push"],
    ] {
        let out = gardener::process::run_command_with_timeout("git", &args, root, &env, timeout)?;
        if !out.success() {
            anyhow::bail!("git {} failed: {}", args.join(" "), out.stderr_tail(10));
        }
    }
    reporter.info("store deployed");
    Ok(Outcome::Done)
}
