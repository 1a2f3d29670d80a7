//! Storage backends for the graph store.
//!
//! A deployment configures an ordered list drawn from {file, mirror,
//! database}; the first is the primary. All three implement [`Backend`],
//! which the [`crate::store::GraphStore`] facade hides. The file backend is
//! the workhorse; the mirror is a read-only HTTP copy for `--online`
//! consumers; the database backend is a remote HTTP key-value service for
//! fleet-shared state.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use gardener_shard::ShardScheme;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{BackendKind, BotConfig};

/// Errors a backend can surface. The store facade maps these onto retry
/// classes; `Corrupt` is fatal for the key, `ReadOnly` is a caller bug.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend {backend} is read-only")]
    ReadOnly { backend: String },
    #[error("corrupt record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },
    #[error("{backend} I/O failure on {key}: {reason}")]
    Io {
        backend: String,
        key: String,
        reason: String,
    },
}

impl StoreError {
    pub fn io(backend: &str, key: &str, reason: impl ToString) -> Self {
        StoreError::Io {
            backend: backend.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Transient failures are retried and may mark a backend unhealthy;
    /// the other kinds are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io { .. })
    }
}

/// A concrete key-to-bytes mapping.
///
/// `put_bytes` must be atomic per key. `delete` is idempotent. `exists`
/// must not materialize the value.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> BackendKind;

    fn writable(&self) -> bool {
        true
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError>;
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn keys_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Batched small-map read. The default round-trips through
    /// `get_bytes`; backends with native map support override it.
    fn hashmap_read(&self, key: &str) -> Result<Option<BTreeMap<String, Value>>, StoreError> {
        match self.get_bytes(key)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::CorruptRecord {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    fn hashmap_write(
        &self,
        key: &str,
        map: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        let bytes = canonical_json_bytes(map)
            .map_err(|e| StoreError::io(self.name(), key, e))?;
        self.put_bytes(key, &bytes)
    }

    /// Opaque version token for cache staleness checks; `None` when the key
    /// is missing. The default hashes the value, which any backend can do.
    fn version_token(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get_bytes(key)?
            .map(|bytes| hex::encode(Sha256::digest(&bytes))))
    }
}

/// Serialize a value as the store's canonical on-disk JSON: stable key
/// order (serde_json maps are ordered), pretty-printed, trailing newline.
pub fn canonical_json_bytes<T: serde::Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Local filesystem backend with sharded paths.
pub struct FileBackend {
    root: PathBuf,
    scheme: ShardScheme,
}

impl FileBackend {
    pub fn new(root: PathBuf, scheme: ShardScheme) -> Self {
        Self { root, scheme }
    }

    pub fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(self.scheme.path_for(key))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io("file", &dir.display().to_string(), e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("file", &dir.display().to_string(), e))?;
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if path.extension().is_some_and(|e| e == "json") {
                let relative = path
                    .strip_prefix(&self.root)
                    .expect("walked path under root")
                    .to_string_lossy()
                    .replace('\\', "/");
                if let Some(key) = self.scheme.key_from_path(&relative) {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.record_path(key).exists())
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.record_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("file", key, e)),
        }
    }

    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.record_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io("file", key, e))?;
        }
        // Atomic per key: write a sibling tmp file, then rename over.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|e| StoreError::io("file", key, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io("file", key, e))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("file", key, e)),
        }
    }

    fn keys_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        self.walk(&self.root.clone(), &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn version_token(&self, key: &str) -> Result<Option<String>, StoreError> {
        // Hash of the bytes, same as the default, but without surfacing
        // transient read errors for missing files.
        match self.get_bytes(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(hex::encode(Sha256::digest(&bytes)))),
        }
    }
}

/// Read-only HTTP mirror of a sharded store. Enumeration comes from the
/// mirror's maintained `index.json` (an array of keys).
pub struct MirrorBackend {
    base_url: String,
    scheme: ShardScheme,
    http: Client,
}

impl MirrorBackend {
    pub fn new(base_url: &str, scheme: ShardScheme) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(format!("gardener/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            scheme,
            http,
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, self.scheme.path_for(key))
    }
}

impl Backend for MirrorBackend {
    fn name(&self) -> &str {
        "mirror"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Mirror
    }

    fn writable(&self) -> bool {
        false
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let resp = self
            .http
            .head(self.url_for(key))
            .send()
            .map_err(|e| StoreError::io("mirror", key, e))?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StoreError::io("mirror", key, format!("unexpected status {s}"))),
        }
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let resp = self
            .http
            .get(self.url_for(key))
            .send()
            .map_err(|e| StoreError::io("mirror", key, e))?;
        match resp.status() {
            StatusCode::OK => {
                let bytes = resp
                    .bytes()
                    .map_err(|e| StoreError::io("mirror", key, e))?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(StoreError::io("mirror", key, format!("unexpected status {s}"))),
        }
    }

    fn put_bytes(&self, _key: &str, _bytes: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly {
            backend: "mirror".to_string(),
        })
    }

    fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly {
            backend: "mirror".to_string(),
        })
    }

    fn keys_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let url = format!("{}/index.json", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .map_err(|e| StoreError::io("mirror", prefix, e))?;
        if resp.status() != StatusCode::OK {
            return Err(StoreError::io(
                "mirror",
                prefix,
                format!("index fetch returned {}", resp.status()),
            ));
        }
        let keys: Vec<String> = resp.json().map_err(|e| StoreError::CorruptRecord {
            key: "index.json".to_string(),
            reason: e.to_string(),
        })?;
        let mut keys: Vec<String> = keys.into_iter().filter(|k| k.starts_with(prefix)).collect();
        keys.sort();
        Ok(keys)
    }

    fn version_token(&self, key: &str) -> Result<Option<String>, StoreError> {
        // Prefer the mirror's ETag so staleness checks do not download the
        // record; fall back to hashing the body.
        let resp = self
            .http
            .head(self.url_for(key))
            .send()
            .map_err(|e| StoreError::io("mirror", key, e))?;
        match resp.status() {
            StatusCode::OK => {
                if let Some(etag) = resp.headers().get("etag") {
                    if let Ok(tag) = etag.to_str() {
                        return Ok(Some(tag.trim_matches('"').to_string()));
                    }
                }
                Ok(self
                    .get_bytes(key)?
                    .map(|bytes| hex::encode(Sha256::digest(&bytes))))
            }
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(StoreError::io("mirror", key, format!("unexpected status {s}"))),
        }
    }
}

/// Remote HTTP key-value service backend.
///
/// The wire surface is deliberately small: `GET/PUT/DELETE <base>/kv/<key>`,
/// `GET <base>/keys?prefix=<p>` returning a JSON array, and
/// `GET/PUT <base>/map/<key>` for the batched small-map operations.
pub struct DatabaseBackend {
    base_url: String,
    http: Client,
}

impl DatabaseBackend {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(format!("gardener/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, gardener_shard::escape_key(key))
    }

    fn map_url(&self, key: &str) -> String {
        format!("{}/map/{}", self.base_url, gardener_shard::escape_key(key))
    }
}

impl Backend for DatabaseBackend {
    fn name(&self) -> &str {
        "database"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Database
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let resp = self
            .http
            .head(self.kv_url(key))
            .send()
            .map_err(|e| StoreError::io("database", key, e))?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StoreError::io("database", key, format!("unexpected status {s}"))),
        }
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let resp = self
            .http
            .get(self.kv_url(key))
            .send()
            .map_err(|e| StoreError::io("database", key, e))?;
        match resp.status() {
            StatusCode::OK => {
                let bytes = resp
                    .bytes()
                    .map_err(|e| StoreError::io("database", key, e))?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(StoreError::io("database", key, format!("unexpected status {s}"))),
        }
    }

    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let resp = self
            .http
            .put(self.kv_url(key))
            .body(bytes.to_vec())
            .send()
            .map_err(|e| StoreError::io("database", key, e))?;
        if !resp.status().is_success() {
            return Err(StoreError::io(
                "database",
                key,
                format!("write returned {}", resp.status()),
            ));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let resp = self
            .http
            .delete(self.kv_url(key))
            .send()
            .map_err(|e| StoreError::io("database", key, e))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            s => Err(StoreError::io("database", key, format!("delete returned {s}"))),
        }
    }

    fn keys_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let url = format!("{}/keys?prefix={}", self.base_url, gardener_shard::escape_key(prefix));
        let resp = self
            .http
            .get(&url)
            .send()
            .map_err(|e| StoreError::io("database", prefix, e))?;
        if resp.status() != StatusCode::OK {
            return Err(StoreError::io(
                "database",
                prefix,
                format!("key listing returned {}", resp.status()),
            ));
        }
        let mut keys: Vec<String> = resp.json().map_err(|e| StoreError::CorruptRecord {
            key: format!("keys?prefix={prefix}"),
            reason: e.to_string(),
        })?;
        keys.sort();
        Ok(keys)
    }

    fn hashmap_read(&self, key: &str) -> Result<Option<BTreeMap<String, Value>>, StoreError> {
        let resp = self
            .http
            .get(self.map_url(key))
            .send()
            .map_err(|e| StoreError::io("database", key, e))?;
        match resp.status() {
            StatusCode::OK => resp.json().map(Some).map_err(|e| StoreError::CorruptRecord {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(StoreError::io("database", key, format!("unexpected status {s}"))),
        }
    }

    fn hashmap_write(
        &self,
        key: &str,
        map: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        let resp = self
            .http
            .put(self.map_url(key))
            .json(map)
            .send()
            .map_err(|e| StoreError::io("database", key, e))?;
        if !resp.status().is_success() {
            return Err(StoreError::io(
                "database",
                key,
                format!("map write returned {}", resp.status()),
            ));
        }
        Ok(())
    }
}

/// Build the configured backend list, primary first.
pub fn build_backends(config: &BotConfig) -> anyhow::Result<Vec<Box<dyn Backend>>> {
    let scheme = ShardScheme::new(config.shard_depth);
    let mut backends: Vec<Box<dyn Backend>> = Vec::with_capacity(config.backends.len());
    for kind in &config.backends {
        match kind {
            BackendKind::File => {
                backends.push(Box::new(FileBackend::new(config.store_root.clone(), scheme)));
            }
            BackendKind::Mirror => {
                let url = config
                    .mirror_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("mirror backend configured without GRAPH_MIRROR_URL"))?;
                backends.push(Box::new(MirrorBackend::new(url, scheme)?));
            }
            BackendKind::Database => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("database backend configured without DATABASE_URL"))?;
                backends.push(Box::new(DatabaseBackend::new(url)?));
            }
        }
    }
    Ok(backends)
}
