//! Typed recipe tree and working-copy edits.
//!
//! Recipe files are templated YAML owned by an external parser; the bot sees
//! each recipe twice. At the store boundary it is a typed tree parsed from
//! the discovery pass's JSON (`Recipe`), with unknown keys preserved in
//! `extra`. In a checked-out working tree it is text, and migrators edit it
//! through the narrow helpers here: template variables, integrity hashes,
//! and the build number. Anything richer is the parser's job.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Requirements;

/// Requirement sections a recipe may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeSection {
    Build,
    Host,
    Run,
    Test,
}

impl RecipeSection {
    pub const ALL: [RecipeSection; 4] = [
        RecipeSection::Build,
        RecipeSection::Host,
        RecipeSection::Run,
        RecipeSection::Test,
    ];
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecipePackage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecipeSource {
    /// Tarball URL template; `{{ version }}` placeholders are substituted at
    /// migration time.
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecipeBuild {
    #[serde(default)]
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noarch: Option<String>,
    #[serde(default)]
    pub skip: bool,
}

/// The typed recipe tree stored on each package record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub package: RecipePackage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RecipeSource>,
    #[serde(default)]
    pub build: RecipeBuild,
    #[serde(default)]
    pub requirements: Requirements,
    /// Unknown keys survive round-trips so recipe evolution does not require
    /// code changes.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Recipe {
    /// Substitute the version into the source URL template.
    pub fn resolved_source_url(&self, version: &str) -> Option<String> {
        self.source
            .as_ref()
            .map(|s| substitute_version(&s.url, version))
    }
}

/// Replace `{{ version }}` placeholders (whitespace-insensitive) in a URL
/// template.
pub fn substitute_version(template: &str, version: &str) -> String {
    let mut out = template.to_string();
    for needle in ["{{ version }}", "{{version}}", "{{ version}}", "{{version }}"] {
        out = out.replace(needle, version);
    }
    out
}

/// Path of the recipe file inside a checked-out feedstock.
pub fn recipe_path(feedstock_dir: &Path) -> PathBuf {
    feedstock_dir.join("recipe").join("meta.yaml")
}

/// Rewrite a `{% set <name> = "<value>" %}` template line in place.
/// Returns true when a line changed.
pub fn set_template_var(content: &mut String, name: &str, value: &str) -> bool {
    let mut changed = false;
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let is_set_line = trimmed.starts_with("{%")
                && trimmed
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .windows(2)
                    .any(|w| w[0] == "set" && w[1] == name)
                && trimmed.contains('=');
            if is_set_line {
                let indent = &line[..line.len() - trimmed.len()];
                let new_line = format!("{indent}{{% set {name} = \"{value}\" %}}");
                if new_line != line {
                    changed = true;
                }
                new_line
            } else {
                line.to_string()
            }
        })
        .collect();

    if changed {
        *content = lines.join("\n");
        content.push('\n');
    }
    changed
}

/// Rewrite the first `<key>: <value>` mapping line (e.g. `sha256:` or
/// `number:`). Returns true when a line changed.
pub fn set_mapping_value(content: &mut String, key: &str, value: &str) -> bool {
    let prefix = format!("{key}:");
    let mut changed = false;
    let mut done = false;

    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if !done && trimmed.starts_with(&prefix) {
                done = true;
                let indent = &line[..line.len() - trimmed.len()];
                let new_line = format!("{indent}{key}: {value}");
                if new_line != line {
                    changed = true;
                }
                new_line
            } else {
                line.to_string()
            }
        })
        .collect();

    if changed {
        *content = lines.join("\n");
        content.push('\n');
    }
    changed
}

/// Read, edit, and atomically write back the recipe file of a working copy.
pub fn edit_recipe<F>(feedstock_dir: &Path, edit: F) -> Result<bool>
where
    F: FnOnce(&mut String) -> bool,
{
    let path = recipe_path(feedstock_dir);
    let mut content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read recipe {}", path.display()))?;

    let changed = edit(&mut content);
    if changed {
        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, content.as_bytes())
            .with_context(|| format!("failed to write recipe tmp {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace recipe {}", path.display()))?;
    }
    Ok(changed)
}

/// Parse the build number out of recipe text. The first `number:` mapping
/// wins, mirroring what the external parser reports.
pub fn read_build_number(content: &str) -> Result<u64> {
    for line in content.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("number:") {
            return rest
                .trim()
                .trim_matches(|c| c == '"' || c == '\'')
                .parse()
                .with_context(|| format!("unparseable build number line: {line}"));
        }
    }
    bail!("recipe has no build number line")
}
