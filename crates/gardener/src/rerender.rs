//! Interface to the external re-render collaborator.
//!
//! Re-rendering regenerates a feedstock's CI scaffolding from the recipe
//! and the current pinning data. The work itself belongs to an external
//! tool; the bot only needs to know the tool's current versions (to detect
//! tooling drift) and to invoke it on a working tree. The helper runs
//! sandboxed unless `--no-containers` is given.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::process::run_command_with_timeout;

/// The tool versions observed at a successful migration. Drift against the
/// stored values forces a re-render even when the policy alone would not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolingVersions {
    pub smithy_version: String,
    pub pinning_version: String,
}

/// What a re-render did to the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerenderOutcome {
    Changed,
    NoChanges,
}

pub trait Rerenderer: Send + Sync {
    /// The collaborator's current tool versions.
    fn current_tooling(&self) -> Result<ToolingVersions>;

    /// Regenerate scaffolding in a working tree.
    fn rerender(&self, work_dir: &Path) -> Result<RerenderOutcome>;
}

/// Subprocess-backed re-renderer. Exit code contract: 0 means the tree
/// changed, 2 means nothing needed regenerating, anything else is an error.
pub struct CommandRerenderer {
    program: String,
    sandbox_program: Option<String>,
    timeout: Duration,
}

impl CommandRerenderer {
    pub fn new(program: &str, use_containers: bool) -> Self {
        Self {
            program: program.to_string(),
            sandbox_program: use_containers.then(|| "sandbox-run".to_string()),
            timeout: Duration::from_secs(1800),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn invocation<'a>(&'a self, args: &[&'a str]) -> (String, Vec<String>) {
        match &self.sandbox_program {
            Some(sandbox) => {
                let mut full = vec![self.program.clone()];
                full.extend(args.iter().map(|a| a.to_string()));
                (sandbox.clone(), full)
            }
            None => (
                self.program.clone(),
                args.iter().map(|a| a.to_string()).collect(),
            ),
        }
    }
}

impl Rerenderer for CommandRerenderer {
    fn current_tooling(&self) -> Result<ToolingVersions> {
        let (program, args) = self.invocation(&["tooling-versions"]);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = run_command_with_timeout(
            &program,
            &arg_refs,
            Path::new("."),
            &BTreeMap::new(),
            Some(Duration::from_secs(60)),
        )?;
        if !out.success() {
            bail!("tooling-versions query failed: {}", out.stderr_tail(5));
        }
        serde_json::from_str(&out.stdout).context("unparseable tooling-versions output")
    }

    fn rerender(&self, work_dir: &Path) -> Result<RerenderOutcome> {
        let (program, args) = self.invocation(&["rerender"]);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = run_command_with_timeout(
            &program,
            &arg_refs,
            work_dir,
            &BTreeMap::new(),
            Some(self.timeout),
        )?;
        match out.exit_code {
            0 => Ok(RerenderOutcome::Changed),
            2 => Ok(RerenderOutcome::NoChanges),
            _ => bail!("re-render failed: {}", out.stderr_tail(10)),
        }
    }
}
