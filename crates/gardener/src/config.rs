//! Environment configuration.
//!
//! The bot is configured through environment variables so that every worker
//! in a cron fleet sees the same deployment settings. `BotConfig::from_env`
//! is called once at process start; a bad value is a fatal configuration
//! error (exit 1) before the run loop is entered.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// A configured store backend, in fall-through order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    File,
    Mirror,
    Database,
}

impl BackendKind {
    fn parse(token: &str) -> Result<Self> {
        match token {
            "file" => Ok(BackendKind::File),
            "mirror" => Ok(BackendKind::Mirror),
            "database" => Ok(BackendKind::Database),
            other => bail!("unknown backend {other:?} in GRAPH_BACKENDS (expected file, mirror, or database)"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::File => write!(f, "file"),
            BackendKind::Mirror => write!(f, "mirror"),
            BackendKind::Database => write!(f, "database"),
        }
    }
}

/// Per-invocation flags from the CLI surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    /// Single-threaded, verbose.
    pub debug: bool,
    /// Fetch the graph from the mirror backend rather than local files.
    pub online: bool,
    /// Disable sandboxed execution of external helpers.
    pub no_containers: bool,
    /// No forge writes.
    pub dry_run: bool,
}

/// Process-wide configuration, read once from the environment.
#[derive(Clone)]
pub struct BotConfig {
    /// Ordered backend list; the first is the primary.
    pub backends: Vec<BackendKind>,
    pub use_file_cache: bool,
    pub database_url: Option<String>,
    pub mirror_url: Option<String>,
    /// Forge credential. Redacted from Debug output and never logged.
    pub forge_token: Option<String>,
    pub forge_api_base: String,
    /// Hostname git clones and pushes go to.
    pub forge_host: String,
    /// Organization the feedstock repositories live under.
    pub forge_org: String,
    /// Account holding the bot's forks.
    pub forge_bot_user: String,
    /// Wall-clock budget for one scheduler run.
    pub timeout: Duration,
    pub memory_floor_gb: u64,
    pub disk_floor_gb: u64,
    /// The forge rate budget below which the scheduler stops opening PRs.
    pub rate_floor: u64,
    /// Opaque identity of this run, injected into PR bodies.
    pub run_url: Option<String>,
    pub tmpdir: PathBuf,
    /// How long a closed-unmerged PR blocks re-attempts of its fingerprint.
    pub pr_retry_window: Duration,
    pub shard_depth: usize,
    pub store_root: PathBuf,
    pub cache_root: PathBuf,
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("backends", &self.backends)
            .field("use_file_cache", &self.use_file_cache)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("mirror_url", &self.mirror_url)
            .field("forge_token", &self.forge_token.as_ref().map(|_| "<redacted>"))
            .field("forge_api_base", &self.forge_api_base)
            .field("forge_host", &self.forge_host)
            .field("forge_org", &self.forge_org)
            .field("forge_bot_user", &self.forge_bot_user)
            .field("timeout", &self.timeout)
            .field("memory_floor_gb", &self.memory_floor_gb)
            .field("disk_floor_gb", &self.disk_floor_gb)
            .field("rate_floor", &self.rate_floor)
            .field("run_url", &self.run_url)
            .field("tmpdir", &self.tmpdir)
            .field("pr_retry_window", &self.pr_retry_window)
            .field("shard_depth", &self.shard_depth)
            .field("store_root", &self.store_root)
            .field("cache_root", &self.cache_root)
            .finish()
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendKind::File],
            use_file_cache: true,
            database_url: None,
            mirror_url: None,
            forge_token: None,
            forge_api_base: "https://api.github.com".to_string(),
            forge_host: "github.com".to_string(),
            forge_org: "feedstocks".to_string(),
            forge_bot_user: "gardener-bot".to_string(),
            timeout: Duration::from_secs(7200),
            memory_floor_gb: 7,
            disk_floor_gb: 10,
            rate_floor: 500,
            run_url: None,
            tmpdir: env::temp_dir(),
            pr_retry_window: Duration::from_secs(7 * 24 * 3600),
            shard_depth: gardener_shard::DEFAULT_DEPTH,
            store_root: PathBuf::from("."),
            cache_root: PathBuf::from(".gardener-cache"),
        }
    }
}

impl BotConfig {
    /// Read configuration from the process environment. Fails on the first
    /// malformed or missing-but-required value.
    pub fn from_env() -> Result<Self> {
        let mut config = BotConfig::default();

        if let Ok(raw) = env::var("GRAPH_BACKENDS") {
            let backends: Result<Vec<BackendKind>> =
                raw.split(':').filter(|t| !t.is_empty()).map(BackendKind::parse).collect();
            let backends = backends?;
            if backends.is_empty() {
                bail!("GRAPH_BACKENDS is set but names no backends");
            }
            config.backends = backends;
        }

        if let Ok(raw) = env::var("GRAPH_USE_FILE_CACHE") {
            config.use_file_cache = parse_bool("GRAPH_USE_FILE_CACHE", &raw)?;
        }

        config.database_url = env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
        if config.backends.contains(&BackendKind::Database) && config.database_url.is_none() {
            bail!("DATABASE_URL is required when the database backend is configured");
        }

        config.mirror_url = env::var("GRAPH_MIRROR_URL").ok().filter(|s| !s.is_empty());
        if config.backends.contains(&BackendKind::Mirror) && config.mirror_url.is_none() {
            bail!("GRAPH_MIRROR_URL is required when the mirror backend is configured");
        }

        config.forge_token = env::var("FORGE_TOKEN").ok().filter(|s| !s.is_empty());
        if config.forge_token.is_none() && env::var("PASSWORD").is_ok() {
            // The legacy variable is rejected rather than silently honored.
            bail!("the PASSWORD variable is no longer read; set FORGE_TOKEN instead");
        }

        if let Ok(raw) = env::var("FORGE_API_BASE") {
            if !raw.is_empty() {
                config.forge_api_base = raw.trim_end_matches('/').to_string();
            }
        }

        for (var, slot) in [
            ("FORGE_HOST", &mut config.forge_host),
            ("FORGE_ORG", &mut config.forge_org),
            ("FORGE_BOT_USER", &mut config.forge_bot_user),
        ] {
            if let Ok(raw) = env::var(var) {
                if !raw.is_empty() {
                    *slot = raw;
                }
            }
        }

        if let Ok(raw) = env::var("TIMEOUT") {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("TIMEOUT must be whole seconds, got {raw:?}"))?;
            config.timeout = Duration::from_secs(secs);
        }

        if let Ok(raw) = env::var("MEMORY_FLOOR_GB") {
            config.memory_floor_gb = raw
                .parse()
                .with_context(|| format!("MEMORY_FLOOR_GB must be an integer, got {raw:?}"))?;
        }

        if let Ok(raw) = env::var("DISK_FLOOR_GB") {
            config.disk_floor_gb = raw
                .parse()
                .with_context(|| format!("DISK_FLOOR_GB must be an integer, got {raw:?}"))?;
        }

        if let Ok(raw) = env::var("FORGE_RATE_FLOOR") {
            config.rate_floor = raw
                .parse()
                .with_context(|| format!("FORGE_RATE_FLOOR must be an integer, got {raw:?}"))?;
        }

        config.run_url = env::var("RUN_URL").ok().filter(|s| !s.is_empty());

        if let Ok(raw) = env::var("TMPDIR") {
            if !raw.is_empty() {
                config.tmpdir = PathBuf::from(raw);
            }
        }

        if let Ok(raw) = env::var("PR_RETRY_WINDOW") {
            config.pr_retry_window = humantime::parse_duration(&raw)
                .with_context(|| format!("PR_RETRY_WINDOW must be a duration like 7d, got {raw:?}"))?;
        }

        if let Ok(raw) = env::var("GRAPH_SHARD_DEPTH") {
            config.shard_depth = raw
                .parse()
                .with_context(|| format!("GRAPH_SHARD_DEPTH must be an integer, got {raw:?}"))?;
        }

        if let Ok(raw) = env::var("GRAPH_STORE_ROOT") {
            if !raw.is_empty() {
                config.store_root = PathBuf::from(raw);
            }
        }

        if let Ok(raw) = env::var("GRAPH_CACHE_ROOT") {
            if !raw.is_empty() {
                config.cache_root = PathBuf::from(raw);
            }
        }

        Ok(config)
    }

    /// The primary backend: first in the configured list.
    pub fn primary_backend(&self) -> BackendKind {
        self.backends[0]
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => bail!("{name} must be true or false, got {raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const ALL_VARS: [&str; 18] = [
        "GRAPH_BACKENDS",
        "GRAPH_USE_FILE_CACHE",
        "DATABASE_URL",
        "GRAPH_MIRROR_URL",
        "FORGE_TOKEN",
        "PASSWORD",
        "FORGE_API_BASE",
        "FORGE_HOST",
        "FORGE_ORG",
        "FORGE_BOT_USER",
        "TIMEOUT",
        "MEMORY_FLOOR_GB",
        "DISK_FLOOR_GB",
        "FORGE_RATE_FLOOR",
        "RUN_URL",
        "PR_RETRY_WINDOW",
        "GRAPH_SHARD_DEPTH",
        "GRAPH_STORE_ROOT",
    ];

    fn with_clean_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let mut pairs: Vec<(String, Option<String>)> = ALL_VARS
            .iter()
            .map(|k| ((*k).to_string(), None))
            .collect();
        for (k, v) in vars {
            if let Some(pair) = pairs.iter_mut().find(|(key, _)| key == k) {
                pair.1 = Some((*v).to_string());
            }
        }
        temp_env::with_vars(pairs, f);
    }

    #[test]
    #[serial]
    fn defaults_match_the_deployment_contract() {
        with_clean_env(&[], || {
            let config = BotConfig::from_env().expect("config");
            assert_eq!(config.backends, vec![BackendKind::File]);
            assert!(config.use_file_cache);
            assert_eq!(config.timeout, Duration::from_secs(7200));
            assert_eq!(config.memory_floor_gb, 7);
            assert_eq!(config.rate_floor, 500);
            assert_eq!(config.shard_depth, 5);
            assert_eq!(config.pr_retry_window, Duration::from_secs(7 * 24 * 3600));
        });
    }

    #[test]
    #[serial]
    fn backend_list_is_ordered_and_colon_separated() {
        with_clean_env(
            &[
                ("GRAPH_BACKENDS", "file:mirror:database"),
                ("DATABASE_URL", "https://db.test/kv"),
                ("GRAPH_MIRROR_URL", "https://mirror.test/graph"),
            ],
            || {
                let config = BotConfig::from_env().expect("config");
                assert_eq!(
                    config.backends,
                    vec![BackendKind::File, BackendKind::Mirror, BackendKind::Database]
                );
                assert_eq!(config.primary_backend(), BackendKind::File);
            },
        );
    }

    #[test]
    #[serial]
    fn unknown_backend_is_fatal() {
        with_clean_env(&[("GRAPH_BACKENDS", "file:cloud")], || {
            let err = BotConfig::from_env().expect_err("must fail");
            assert!(format!("{err:#}").contains("unknown backend"));
        });
    }

    #[test]
    #[serial]
    fn database_backend_requires_database_url() {
        with_clean_env(&[("GRAPH_BACKENDS", "database")], || {
            let err = BotConfig::from_env().expect_err("must fail");
            assert!(format!("{err:#}").contains("DATABASE_URL"));
        });
    }

    #[test]
    #[serial]
    fn mirror_backend_requires_mirror_url() {
        with_clean_env(&[("GRAPH_BACKENDS", "mirror")], || {
            let err = BotConfig::from_env().expect_err("must fail");
            assert!(format!("{err:#}").contains("GRAPH_MIRROR_URL"));
        });
    }

    #[test]
    #[serial]
    fn legacy_password_variable_is_rejected() {
        with_clean_env(&[("PASSWORD", "hunter2")], || {
            let err = BotConfig::from_env().expect_err("must fail");
            assert!(format!("{err:#}").contains("FORGE_TOKEN"));
        });
    }

    #[test]
    #[serial]
    fn forge_token_wins_over_legacy_password() {
        with_clean_env(&[("FORGE_TOKEN", "tok"), ("PASSWORD", "hunter2")], || {
            let config = BotConfig::from_env().expect("config");
            assert_eq!(config.forge_token.as_deref(), Some("tok"));
        });
    }

    #[test]
    #[serial]
    fn token_is_redacted_from_debug_output() {
        with_clean_env(&[("FORGE_TOKEN", "supersecret")], || {
            let config = BotConfig::from_env().expect("config");
            let debug = format!("{config:?}");
            assert!(!debug.contains("supersecret"));
            assert!(debug.contains("<redacted>"));
        });
    }

    #[test]
    #[serial]
    fn durations_and_floors_parse() {
        with_clean_env(
            &[
                ("TIMEOUT", "60"),
                ("MEMORY_FLOOR_GB", "3"),
                ("PR_RETRY_WINDOW", "2days"),
            ],
            || {
                let config = BotConfig::from_env().expect("config");
                assert_eq!(config.timeout, Duration::from_secs(60));
                assert_eq!(config.memory_floor_gb, 3);
                assert_eq!(config.pr_retry_window, Duration::from_secs(2 * 24 * 3600));
            },
        );
    }

    #[test]
    #[serial]
    fn forge_identity_is_overridable() {
        with_clean_env(
            &[("FORGE_HOST", "forge.example"), ("FORGE_ORG", "greenhouse")],
            || {
                let config = BotConfig::from_env().expect("config");
                assert_eq!(config.forge_host, "forge.example");
                assert_eq!(config.forge_org, "greenhouse");
                assert_eq!(config.forge_bot_user, "gardener-bot");
            },
        );
    }

    #[test]
    #[serial]
    fn malformed_timeout_is_fatal() {
        with_clean_env(&[("TIMEOUT", "2h")], || {
            let err = BotConfig::from_env().expect_err("must fail");
            assert!(format!("{err:#}").contains("TIMEOUT"));
        });
    }
}
