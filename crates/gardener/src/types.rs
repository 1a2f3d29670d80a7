use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::recipe::Recipe;

/// Store key prefixes. Every record lives under one of these logical
/// directories; the file backend shards below them by content hash.
pub const NODE_PREFIX: &str = "node_attrs";
pub const VERSIONS_PREFIX: &str = "versions";
pub const PR_INFO_PREFIX: &str = "pr_info";
pub const VERSION_PR_INFO_PREFIX: &str = "version_pr_info";
pub const PR_JSON_PREFIX: &str = "pr_json";
pub const MAPPINGS_PREFIX: &str = "mappings";

pub fn node_key(package: &str) -> String {
    format!("{NODE_PREFIX}/{package}")
}

pub fn versions_key(package: &str) -> String {
    format!("{VERSIONS_PREFIX}/{package}")
}

pub fn pr_info_key(package: &str) -> String {
    format!("{PR_INFO_PREFIX}/{package}")
}

pub fn version_pr_info_key(package: &str) -> String {
    format!("{VERSION_PR_INFO_PREFIX}/{package}")
}

pub fn pr_json_key(pr_id: u64) -> String {
    format!("{PR_JSON_PREFIX}/{pr_id}")
}

/// Error slot carried by every record. Serializes as `false` when clear and
/// as an object otherwise, so operators can reset it by writing `false`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BadState {
    #[default]
    Clear,
    Flagged(BadInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadInfo {
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl BadState {
    pub fn flagged(kind: &str, reason: impl Into<String>) -> Self {
        BadState::Flagged(BadInfo {
            kind: kind.to_string(),
            reason: reason.into(),
            traceback: None,
        })
    }

    pub fn with_traceback(kind: &str, reason: impl Into<String>, traceback: impl Into<String>) -> Self {
        BadState::Flagged(BadInfo {
            kind: kind.to_string(),
            reason: reason.into(),
            traceback: Some(traceback.into()),
        })
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, BadState::Clear)
    }

    pub fn info(&self) -> Option<&BadInfo> {
        match self {
            BadState::Clear => None,
            BadState::Flagged(info) => Some(info),
        }
    }
}

impl Serialize for BadState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BadState::Clear => serializer.serialize_bool(false),
            BadState::Flagged(info) => info.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for BadState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Bool(false) | Value::Null => Ok(BadState::Clear),
            Value::Bool(true) => Ok(BadState::flagged("unknown", "")),
            // Legacy records store a bare descriptor string.
            Value::String(kind) => Ok(BadState::flagged(&kind, "")),
            Value::Object(_) => {
                let info: BadInfo = serde_json::from_value(value).map_err(D::Error::custom)?;
                Ok(BadState::Flagged(info))
            }
            other => Err(D::Error::custom(format!(
                "bad slot must be false, a string, or an object, got {other}"
            ))),
        }
    }
}

/// Declared requirements by recipe section.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub build: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub host: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub run: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub test: BTreeSet<String>,
}

impl Requirements {
    /// The names that induce graph edges: host (falling back to build when
    /// host is empty) unioned with test.
    pub fn edge_names(&self) -> BTreeSet<String> {
        let compile: &BTreeSet<String> = if self.host.is_empty() {
            &self.build
        } else {
            &self.host
        };
        compile.union(&self.run).cloned().chain(self.test.iter().cloned()).collect()
    }
}

/// One package record, keyed `node_attrs/<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub feedstock_name: String,
    #[serde(default)]
    pub recipe: Recipe,
    #[serde(default)]
    pub requirements: Requirements,
    /// Current published version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default = "default_hash_kind")]
    pub hash_kind: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub bad: BadState,
    /// Unknown keys are preserved so recipes can evolve without code changes.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_hash_kind() -> String {
    "sha256".to_string()
}

impl Default for PackageRecord {
    fn default() -> Self {
        Self::new("")
    }
}

impl PackageRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            feedstock_name: format!("{name}-feedstock"),
            recipe: Recipe::default(),
            requirements: Requirements::default(),
            version: None,
            hash_kind: default_hash_kind(),
            archived: false,
            bad: BadState::Clear,
            extra: BTreeMap::new(),
        }
    }
}

/// Per-package upstream probe result, keyed `versions/<name>`. Rewritten in
/// full on each probe cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub new_version_attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub bad: BadState,
}

/// Canonical JSON identity of a migrator's intended change on a package.
///
/// Two fingerprints are equal iff their canonical serializations are equal;
/// `digest()` gives a short stable id for branch names and sharding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Value);

impl Fingerprint {
    pub fn new(value: Value) -> Self {
        Fingerprint(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Canonical serialization: serde_json orders map keys, so this is
    /// stable across processes.
    pub fn canonical(&self) -> String {
        self.0.to_string()
    }

    pub fn digest(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        hex::encode(&digest[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Forge-side lifecycle of one PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

/// One PR the bot has opened, stored inside `PrInfoRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrEntry {
    pub fingerprint: Fingerprint,
    pub state: PrState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forge_id: Option<u64>,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

/// Per-package migration history, keyed `pr_info/<name>`. Append-mostly: new
/// fingerprints are appended; existing entries mutate only to mirror forge
/// state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrInfoRecord {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prs: Vec<PrEntry>,
    #[serde(default)]
    pub bad: BadState,
    /// Tooling versions observed at the last successful migration; drift
    /// forces a re-render.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smithy_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinning_version: Option<String>,
}

impl PrInfoRecord {
    pub fn entry_for(&self, fingerprint: &Fingerprint) -> Option<&PrEntry> {
        self.prs.iter().find(|e| &e.fingerprint == fingerprint)
    }

    pub fn entry_for_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut PrEntry> {
        self.prs.iter_mut().find(|e| &e.fingerprint == fingerprint)
    }
}

/// PR-info specialization for version bumps, keyed `version_pr_info/<name>`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VersionPrInfoRecord {
    #[serde(flatten)]
    pub info: PrInfoRecord,
    /// Attempt counter per attempted version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attempts: BTreeMap<String, u32>,
    /// PR head branch per attempted version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branches: BTreeMap<String, String>,
}

/// Minimal mirror of the forge's PR resource, keyed `pr_json/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrJsonRecord {
    pub id: u64,
    pub number: u64,
    pub state: String,
    pub head_ref: String,
    pub base_ref: String,
    pub html_url: String,
    #[serde(default)]
    pub merged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl PrJsonRecord {
    pub fn pr_state(&self) -> PrState {
        if self.merged {
            PrState::Merged
        } else if self.state == "closed" {
            PrState::Closed
        } else {
            PrState::Open
        }
    }
}

/// Where one (migrator, package) pair sits in the migration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    AwaitingParents,
    AwaitingPr,
    InPr,
    Done,
    BotError,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::AwaitingParents => "awaiting-parents",
            NodeStatus::AwaitingPr => "awaiting-pr",
            NodeStatus::InPr => "in-pr",
            NodeStatus::Done => "done",
            NodeStatus::BotError => "bot-error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bad_state_serializes_false_when_clear() {
        let json = serde_json::to_string(&BadState::Clear).expect("serialize");
        assert_eq!(json, "false");
    }

    #[test]
    fn bad_state_round_trips_flagged_info() {
        let bad = BadState::with_traceback("migrate", "recipe refused the edit", "at line 3");
        let json = serde_json::to_string(&bad).expect("serialize");
        let back: BadState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, bad);
    }

    #[test]
    fn bad_state_accepts_legacy_string_descriptor() {
        let back: BadState = serde_json::from_str("\"node_missing\"").expect("deserialize");
        assert_eq!(back.info().map(|i| i.kind.as_str()), Some("node_missing"));
    }

    #[test]
    fn bad_state_rejects_arrays() {
        let result: Result<BadState, _> = serde_json::from_str("[1, 2]");
        assert!(result.is_err());
    }

    #[test]
    fn edge_names_fall_back_to_build_when_host_is_empty() {
        let mut reqs = Requirements::default();
        reqs.build.insert("compiler".to_string());
        reqs.run.insert("libfoo".to_string());
        reqs.test.insert("pytest".to_string());

        let names = reqs.edge_names();
        assert!(names.contains("compiler"));
        assert!(names.contains("libfoo"));
        assert!(names.contains("pytest"));
    }

    #[test]
    fn edge_names_prefer_host_over_build() {
        let mut reqs = Requirements::default();
        reqs.build.insert("cross-compiler".to_string());
        reqs.host.insert("libhost".to_string());

        let names = reqs.edge_names();
        assert!(names.contains("libhost"));
        assert!(!names.contains("cross-compiler"));
    }

    #[test]
    fn fingerprint_digest_is_stable_under_key_order() {
        let a = Fingerprint::new(json!({"migrator": "version", "target": "1.0.1"}));
        let b = Fingerprint::new(json!({"target": "1.0.1", "migrator": "version"}));
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 16);
    }

    #[test]
    fn package_record_preserves_unknown_keys() {
        let raw = json!({
            "name": "zlib",
            "feedstock_name": "zlib-feedstock",
            "version": "1.3",
            "future_field": {"nested": true},
        });
        let record: PackageRecord = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(record.extra.get("future_field"), Some(&json!({"nested": true})));

        let back = serde_json::to_value(&record).expect("serialize");
        assert_eq!(back.get("future_field"), Some(&json!({"nested": true})));
    }

    #[test]
    fn pr_json_state_classification() {
        let mut pr = PrJsonRecord {
            id: 1,
            number: 7,
            state: "open".to_string(),
            head_ref: "bump-1.0.1".to_string(),
            base_ref: "main".to_string(),
            html_url: "https://forge.test/pr/7".to_string(),
            merged: false,
            merged_at: None,
            closed_at: None,
        };
        assert_eq!(pr.pr_state(), PrState::Open);

        pr.state = "closed".to_string();
        assert_eq!(pr.pr_state(), PrState::Closed);

        pr.merged = true;
        assert_eq!(pr.pr_state(), PrState::Merged);
    }

    #[test]
    fn node_status_display_matches_report_vocabulary() {
        assert_eq!(NodeStatus::AwaitingParents.to_string(), "awaiting-parents");
        assert_eq!(NodeStatus::InPr.to_string(), "in-pr");
        assert_eq!(NodeStatus::BotError.to_string(), "bot-error");
    }

    #[test]
    fn store_keys_are_prefixed() {
        assert_eq!(node_key("zlib"), "node_attrs/zlib");
        assert_eq!(versions_key("zlib"), "versions/zlib");
        assert_eq!(pr_info_key("zlib"), "pr_info/zlib");
        assert_eq!(pr_json_key(42), "pr_json/42");
    }
}
