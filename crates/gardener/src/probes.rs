//! Upstream release probes.
//!
//! Each probe is a strategy: given a package record, report the latest
//! upstream version, that nothing changed, or that upstream is unavailable.
//! Dispatch is by inspection of the recipe's source URL template, with an
//! explicit `feed_url` hint taking precedence. Probes filter pre-releases
//! unless the package opts in, and the dispatcher enforces the contract
//! that a probe never reports a candidate below the published version.

use anyhow::{Context, Result, bail};
use gardener_vercmp::{Version, compare, max_of};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::Value;

use crate::types::PackageRecord;

/// What a probe learned about upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found(String),
    Unchanged,
    Unavailable(String),
}

/// One probing strategy.
pub trait UpstreamProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Can this probe handle the record's source?
    fn matches(&self, record: &PackageRecord) -> bool;

    /// Raw candidate version strings, unfiltered.
    fn candidates(&self, record: &PackageRecord, http: &Client) -> Result<Vec<String>>;
}

fn source_url(record: &PackageRecord) -> Option<&str> {
    record.recipe.source.as_ref().map(|s| s.url.as_str())
}

fn wants_prereleases(record: &PackageRecord) -> bool {
    record
        .extra
        .get("include_prereleases")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Git-tag release feeds on a code forge, identified by hostname + path
/// pattern (`https://<forge-host>/<owner>/<repo>/...`).
pub struct ForgeTagsProbe {
    api_base: String,
    host: String,
}

impl ForgeTagsProbe {
    pub fn new(api_base: &str, host: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            host: host.to_string(),
        }
    }

    fn owner_repo(&self, url: &str) -> Option<(String, String)> {
        let rest = url.split_once(&format!("{}/", self.host))?.1;
        let mut parts = rest.split('/');
        let owner = parts.next()?.to_string();
        let repo = parts.next()?.to_string();
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        Some((owner, repo))
    }
}

impl UpstreamProbe for ForgeTagsProbe {
    fn name(&self) -> &'static str {
        "forge-tags"
    }

    fn matches(&self, record: &PackageRecord) -> bool {
        source_url(record).is_some_and(|url| url.contains(&format!("{}/", self.host)))
    }

    fn candidates(&self, record: &PackageRecord, http: &Client) -> Result<Vec<String>> {
        let url = source_url(record).context("record has no source url")?;
        let (owner, repo) = self
            .owner_repo(url)
            .with_context(|| format!("cannot extract owner/repo from {url}"))?;

        let tags_url = format!("{}/repos/{owner}/{repo}/tags", self.api_base);
        let resp = http.get(&tags_url).send().context("tag feed request failed")?;
        if resp.status() != StatusCode::OK {
            bail!("tag feed returned {}", resp.status());
        }
        let tags: Vec<Value> = resp.json().context("failed to parse tag feed JSON")?;
        Ok(tags
            .iter()
            .filter_map(|t| t.get("name").and_then(Value::as_str))
            .map(|name| name.to_string())
            .collect())
    }
}

/// Python-registry style JSON index, identified by pypi-style URLs.
pub struct PythonIndexProbe {
    api_base: String,
}

impl PythonIndexProbe {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn index_name(record: &PackageRecord) -> String {
        // The sdist filename carries the index name: .../<name>-<version>.tar.gz
        source_url(record)
            .and_then(|url| {
                let file = url.rsplit('/').next()?;
                let stem = file.split("-{{").next()?;
                if stem.is_empty() { None } else { Some(stem.to_string()) }
            })
            .unwrap_or_else(|| record.name.clone())
    }
}

impl UpstreamProbe for PythonIndexProbe {
    fn name(&self) -> &'static str {
        "python-index"
    }

    fn matches(&self, record: &PackageRecord) -> bool {
        source_url(record).is_some_and(|url| {
            url.contains("pypi.io/") || url.contains("pypi.org/") || url.contains("pythonhosted.org/")
        })
    }

    fn candidates(&self, record: &PackageRecord, http: &Client) -> Result<Vec<String>> {
        let name = Self::index_name(record);
        let url = format!("{}/pypi/{name}/json", self.api_base);
        let resp = http.get(&url).send().context("python index request failed")?;
        if resp.status() != StatusCode::OK {
            bail!("python index returned {}", resp.status());
        }
        let doc: Value = resp.json().context("failed to parse python index JSON")?;
        let releases = doc
            .get("releases")
            .and_then(Value::as_object)
            .context("python index response has no releases table")?;
        Ok(releases.keys().cloned().collect())
    }
}

/// Stable JSON endpoints published by language-specific registries. Opted
/// into per package via the `feed_url` hint; the endpoint returns either
/// `{"version": "..."}` or `{"versions": ["...", ...]}`.
pub struct JsonFeedProbe;

impl JsonFeedProbe {
    fn feed_url(record: &PackageRecord) -> Option<&str> {
        record.extra.get("feed_url").and_then(Value::as_str)
    }
}

impl UpstreamProbe for JsonFeedProbe {
    fn name(&self) -> &'static str {
        "json-feed"
    }

    fn matches(&self, record: &PackageRecord) -> bool {
        Self::feed_url(record).is_some()
    }

    fn candidates(&self, record: &PackageRecord, http: &Client) -> Result<Vec<String>> {
        let url = Self::feed_url(record).context("record has no feed_url hint")?;
        let resp = http.get(url).send().context("feed request failed")?;
        if resp.status() != StatusCode::OK {
            bail!("feed returned {}", resp.status());
        }
        let doc: Value = resp.json().context("failed to parse feed JSON")?;

        if let Some(version) = doc.get("version").and_then(Value::as_str) {
            return Ok(vec![version.to_string()]);
        }
        if let Some(versions) = doc.get("versions").and_then(Value::as_array) {
            return Ok(versions
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect());
        }
        bail!("feed JSON has neither version nor versions")
    }
}

/// Generic HTTP directory listings with version-bearing filenames. The
/// fallback for plain tarball mirrors: fetch the directory of the source
/// URL and scan hrefs shaped like `<name>-<version>.tar.*`.
pub struct DirectoryListingProbe;

impl DirectoryListingProbe {
    fn listing_url(record: &PackageRecord) -> Option<String> {
        let url = source_url(record)?;
        let (dir, _file) = url.rsplit_once('/')?;
        Some(format!("{dir}/"))
    }

    fn filename_prefix(record: &PackageRecord) -> Option<String> {
        let url = source_url(record)?;
        let file = url.rsplit('/').next()?;
        let prefix = file.split("{{").next()?.trim_end_matches('-');
        if prefix.is_empty() {
            None
        } else {
            Some(format!("{prefix}-"))
        }
    }

    /// Pull `<prefix><version>.tar*` occurrences out of a listing page.
    fn scan_versions(body: &str, prefix: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut rest = body;
        while let Some(pos) = rest.find(prefix) {
            let tail = &rest[pos + prefix.len()..];
            if let Some(end) = tail.find(".tar") {
                let candidate = &tail[..end];
                if !candidate.is_empty()
                    && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
                {
                    found.push(candidate.to_string());
                }
                rest = &tail[end..];
            } else {
                break;
            }
        }
        found.sort();
        found.dedup();
        found
    }
}

impl UpstreamProbe for DirectoryListingProbe {
    fn name(&self) -> &'static str {
        "dir-listing"
    }

    fn matches(&self, record: &PackageRecord) -> bool {
        source_url(record).is_some_and(|url| url.starts_with("http") && url.contains("{{"))
    }

    fn candidates(&self, record: &PackageRecord, http: &Client) -> Result<Vec<String>> {
        let url = Self::listing_url(record).context("record has no source url")?;
        let prefix =
            Self::filename_prefix(record).context("source url has no version-bearing filename")?;

        let resp = http.get(&url).send().context("listing request failed")?;
        if resp.status() != StatusCode::OK {
            bail!("listing returned {}", resp.status());
        }
        let body = resp.text().context("failed to read listing body")?;
        Ok(Self::scan_versions(&body, &prefix))
    }
}

/// The configured probe family plus dispatch and the shared HTTP client.
pub struct ProbeSet {
    http: Client,
    probes: Vec<Box<dyn UpstreamProbe>>,
}

impl ProbeSet {
    /// The standard probe family against public endpoints.
    pub fn standard() -> Result<Self> {
        Self::with_probes(vec![
            Box::new(JsonFeedProbe),
            Box::new(ForgeTagsProbe::new("https://api.github.com", "github.com")),
            Box::new(PythonIndexProbe::new("https://pypi.org")),
            Box::new(DirectoryListingProbe),
        ])
    }

    /// Explicit probe list; hint-driven probes should come first.
    pub fn with_probes(probes: Vec<Box<dyn UpstreamProbe>>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("gardener/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, probes })
    }

    /// Probe upstream for a record, applying pre-release filtering and the
    /// never-go-backwards guard.
    pub fn probe(&self, record: &PackageRecord) -> ProbeOutcome {
        let Some(probe) = self.probes.iter().find(|p| p.matches(record)) else {
            return ProbeOutcome::Unavailable("no probe matches the source url".to_string());
        };

        let candidates = match probe.candidates(record, &self.http) {
            Ok(candidates) => candidates,
            Err(e) => return ProbeOutcome::Unavailable(format!("{}: {e:#}", probe.name())),
        };

        let keep_prereleases = wants_prereleases(record);
        let filtered: Vec<&str> = candidates
            .iter()
            .map(String::as_str)
            .filter(|raw| {
                let version = Version::parse(raw);
                version.is_parseable() && (keep_prereleases || !version.is_prerelease())
            })
            .collect();

        let Some(best) = max_of(filtered.iter().copied()) else {
            return ProbeOutcome::Unavailable(format!(
                "{}: no usable candidates among {}",
                probe.name(),
                candidates.len()
            ));
        };
        // Normalize forge-tag style `v` prefixes away.
        let best = best.trim_start_matches('v').to_string();

        match record.version.as_deref() {
            Some(current) if compare(&best, current) == std::cmp::Ordering::Less => {
                // A probe must never report going backwards; treat it as
                // no-change and let the caller log it.
                ProbeOutcome::Unchanged
            }
            Some(current) if compare(&best, current) == std::cmp::Ordering::Equal => {
                ProbeOutcome::Unchanged
            }
            _ => ProbeOutcome::Found(best),
        }
    }
}
