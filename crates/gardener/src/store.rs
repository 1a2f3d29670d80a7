//! The graph store: a lazy key-to-JSON facade over the configured backends.
//!
//! Reads fall through the backend list in order; writes commit to the
//! primary first and fan out to the rest. Records are only fetched and
//! parsed when a [`LazyHandle`] is first accessed, and only written back
//! when a [`WriteScope`] holding dirty state exits. A per-key sidecar
//! `.lock` file keeps write scopes exclusive, within the process and across
//! cooperating workers alike; readers never block.
//!
//! Failure semantics follow the deployment contract: transient backend I/O
//! is retried with exponential backoff; a backend that stays down is marked
//! unhealthy for the rest of the process and skipped on reads; writes to a
//! downed secondary are journaled and replayed at next process start.
//! Corrupt JSON is fatal for that key only.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use gardener_retry::{BackoffPolicy, GiveUp, RetryClass, RetryConfig, RetryLoop};
use gardener_shard::ShardScheme;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::backends::{Backend, StoreError, build_backends, canonical_json_bytes};
use crate::config::BotConfig;
use crate::lock::{DEFAULT_STALE_AFTER, KeyLock};

const JOURNAL_FILE: &str = ".gardener/pending_writes.jsonl";
const LOCKS_DIR: &str = ".gardener/locks";
const CACHE_TOKEN_SUFFIX: &str = "token";

#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
struct JournalEntry {
    backend: String,
    key: String,
}

/// Outcome of a cross-backend reconciliation pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    /// Keys copied into each backend, by backend name.
    pub copied: BTreeMap<String, u64>,
    /// Keys whose bytes differed from the primary and were overwritten.
    pub conflicts_resolved: u64,
    /// Total distinct keys observed.
    pub keys_seen: u64,
}

/// On-disk record cache, sharded like the file backend, with a sidecar
/// token per entry recording the primary's version token at fetch time.
#[derive(Debug)]
struct FileCache {
    root: PathBuf,
    scheme: ShardScheme,
}

impl FileCache {
    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(self.scheme.path_for(key))
    }

    fn token_path(&self, key: &str) -> PathBuf {
        let mut os = self.entry_path(key).into_os_string();
        os.push(".");
        os.push(CACHE_TOKEN_SUFFIX);
        PathBuf::from(os)
    }

    fn get(&self, key: &str, current_token: &str) -> Option<Vec<u8>> {
        let stored = fs::read_to_string(self.token_path(key)).ok()?;
        if stored.trim() != current_token {
            return None;
        }
        fs::read(self.entry_path(key)).ok()
    }

    fn put(&self, key: &str, token: &str, bytes: &[u8]) {
        let path = self.entry_path(key);
        let Some(parent) = path.parent() else { return };
        // Cache population is best-effort; a failed write only costs a refetch.
        if fs::create_dir_all(parent).is_err() {
            return;
        }
        if fs::write(&path, bytes).is_ok() {
            let _ = fs::write(self.token_path(key), token);
        }
    }

    fn invalidate(&self, key: &str) {
        let _ = fs::remove_file(self.token_path(key));
        let _ = fs::remove_file(self.entry_path(key));
    }
}

/// The process-global store facade.
pub struct GraphStore {
    backends: Vec<Box<dyn Backend>>,
    healthy: Vec<AtomicBool>,
    cache: Option<FileCache>,
    store_root: PathBuf,
    scheme: ShardScheme,
    stale_lock_after: Duration,
    retry: RetryConfig,
    warnings: Mutex<Vec<String>>,
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore")
            .field("backends", &self.backends.len())
            .field("healthy", &self.healthy)
            .field("cache", &self.cache)
            .field("store_root", &self.store_root)
            .field("scheme", &self.scheme)
            .field("stale_lock_after", &self.stale_lock_after)
            .field("retry", &self.retry)
            .field("warnings", &self.warnings)
            .finish()
    }
}

impl GraphStore {
    /// Open the store for this deployment: build backends, then replay any
    /// journaled writes left over from a previous process.
    pub fn open(config: &BotConfig) -> Result<Self> {
        let backends = build_backends(config)?;
        let store = Self::from_backends(
            backends,
            config.store_root.clone(),
            ShardScheme::new(config.shard_depth),
            config.use_file_cache.then(|| config.cache_root.clone()),
        )?;
        store.replay_journal();
        Ok(store)
    }

    /// Assemble a store from explicit backends. Used directly by tests and
    /// by the sync subcommand.
    pub fn from_backends(
        backends: Vec<Box<dyn Backend>>,
        store_root: PathBuf,
        scheme: ShardScheme,
        cache_root: Option<PathBuf>,
    ) -> Result<Self> {
        if backends.is_empty() {
            bail!("graph store needs at least one backend");
        }
        let healthy = backends.iter().map(|_| AtomicBool::new(true)).collect();
        Ok(Self {
            cache: cache_root.map(|root| FileCache { root, scheme }),
            healthy,
            backends,
            store_root,
            scheme,
            stale_lock_after: DEFAULT_STALE_AFTER,
            retry: BackoffPolicy::StoreIo.to_config(),
            warnings: Mutex::new(Vec::new()),
        })
    }

    /// Override the I/O retry configuration (tests use immediate retries).
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn primary(&self) -> &dyn Backend {
        self.backends[0].as_ref()
    }

    fn warn(&self, message: String) {
        self.warnings.lock().expect("warnings lock poisoned").push(message);
    }

    /// Drain warnings accumulated since the last call (secondary flush
    /// failures, unhealthy backends). The caller reports them.
    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.lock().expect("warnings lock poisoned"))
    }

    fn is_healthy(&self, idx: usize) -> bool {
        self.healthy[idx].load(Ordering::SeqCst)
    }

    fn mark_unhealthy(&self, idx: usize, why: &str) {
        if self.healthy[idx].swap(false, Ordering::SeqCst) {
            self.warn(format!(
                "backend {} marked unhealthy for the rest of this process: {why}",
                self.backends[idx].name()
            ));
        }
    }

    fn retry_backend<T>(
        &self,
        idx: usize,
        key: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let result = RetryLoop::new(self.retry.clone()).run(|_| {
            op().map_err(|e| {
                let class = if e.is_transient() {
                    RetryClass::Transient
                } else {
                    RetryClass::Permanent
                };
                (e, class)
            })
        });
        match result {
            Ok(value) => Ok(value),
            Err(GiveUp::Exhausted(e)) => {
                if e.is_transient() {
                    self.mark_unhealthy(idx, &e.to_string());
                }
                Err(e)
            }
            Err(GiveUp::Interrupted) => Err(StoreError::io(
                self.backends[idx].name(),
                key,
                "interrupted during backend retry",
            )),
        }
    }

    /// Does any backend hold this key? Never materializes the value.
    pub fn exists(&self, key: &str) -> Result<bool> {
        for (idx, backend) in self.backends.iter().enumerate() {
            if !self.is_healthy(idx) {
                continue;
            }
            match self.retry_backend(idx, key, || backend.exists(key)) {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Raw read: cache, then backends in order, skipping unhealthy ones.
    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(cache) = &self.cache {
            if self.is_healthy(0) {
                if let Ok(Some(token)) = self.retry_backend(0, key, || self.primary().version_token(key)) {
                    if let Some(bytes) = cache.get(key, &token) {
                        return Ok(Some(bytes));
                    }
                    // Primary has the key; fetch and refresh the cache.
                    if let Some(bytes) = self.retry_backend(0, key, || self.primary().get_bytes(key))? {
                        cache.put(key, &token, &bytes);
                        return Ok(Some(bytes));
                    }
                }
            }
        }

        for (idx, backend) in self.backends.iter().enumerate() {
            if !self.is_healthy(idx) {
                continue;
            }
            match self.retry_backend(idx, key, || backend.get_bytes(key)) {
                Ok(Some(bytes)) => {
                    if let (Some(cache), 0) = (&self.cache, idx) {
                        if let Ok(Some(token)) = backend.version_token(key) {
                            cache.put(key, &token, &bytes);
                        }
                    }
                    return Ok(Some(bytes));
                }
                Ok(None) => continue,
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Load and parse a record. Corrupt JSON is fatal for the key.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            None => Ok(None),
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    anyhow!(StoreError::CorruptRecord {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })
                })?;
                Ok(Some(value))
            }
        }
    }

    /// Serialize and write a record: primary first, then fan out. A failed
    /// secondary write is journaled and warned about; the primary write has
    /// already committed.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = canonical_json_bytes(value)?;
        self.put_raw(key, &bytes)
    }

    pub fn put_raw(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if !self.primary().writable() {
            bail!(StoreError::ReadOnly {
                backend: self.primary().name().to_string(),
            });
        }

        self.retry_backend(0, key, || self.primary().put_bytes(key, bytes))
            .with_context(|| format!("primary write failed for {key}"))?;
        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }

        for (idx, backend) in self.backends.iter().enumerate().skip(1) {
            if !backend.writable() {
                continue;
            }
            let attempt = if self.is_healthy(idx) {
                self.retry_backend(idx, key, || backend.put_bytes(key, bytes))
            } else {
                Err(StoreError::io(backend.name(), key, "backend unhealthy"))
            };
            if let Err(e) = attempt {
                self.warn(format!("secondary write to {} failed for {key}: {e}", backend.name()));
                self.journal_write(backend.name(), key);
            }
        }
        Ok(())
    }

    /// Delete a key from every writable backend. Idempotent.
    pub fn delete(&self, key: &str) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }
        for (idx, backend) in self.backends.iter().enumerate() {
            if !backend.writable() {
                continue;
            }
            if let Err(e) = self.retry_backend(idx, key, || backend.delete(key)) {
                self.warn(format!("delete on {} failed for {key}: {e}", backend.name()));
            }
        }
        Ok(())
    }

    /// Enumerate keys under a logical prefix, from the first backend that
    /// answers.
    pub fn keys_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut last_err: Option<StoreError> = None;
        for (idx, backend) in self.backends.iter().enumerate() {
            if !self.is_healthy(idx) {
                continue;
            }
            match self.retry_backend(idx, prefix, || backend.keys_prefix(prefix)) {
                Ok(keys) => return Ok(keys),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| anyhow!("no healthy backend could enumerate {prefix}")))
    }

    /// Batched small-map read from the primary.
    pub fn read_map(&self, key: &str) -> Result<Option<BTreeMap<String, Value>>> {
        Ok(self.retry_backend(0, key, || self.primary().hashmap_read(key))?)
    }

    /// Batched small-map write, fanned out like `put`.
    pub fn write_map(&self, key: &str, map: &BTreeMap<String, Value>) -> Result<()> {
        self.retry_backend(0, key, || self.primary().hashmap_write(key, map))?;
        for (idx, backend) in self.backends.iter().enumerate().skip(1) {
            if !backend.writable() {
                continue;
            }
            if let Err(e) = self.retry_backend(idx, key, || backend.hashmap_write(key, map)) {
                self.warn(format!("secondary map write to {} failed for {key}: {e}", backend.name()));
                self.journal_write(backend.name(), key);
            }
        }
        Ok(())
    }

    /// A read-only lazy handle. Nothing is fetched until first access.
    pub fn lazy<T: DeserializeOwned>(&self, key: &str) -> LazyHandle<'_, T> {
        LazyHandle {
            store: self,
            key: key.to_string(),
            value: None,
            loaded: false,
            dirty: false,
        }
    }

    /// Open an exclusive write scope for a key. Fails if another live
    /// holder has the lock; stale locks are taken over.
    pub fn write_scope<T: DeserializeOwned + Serialize>(&self, key: &str) -> Result<WriteScope<'_, T>> {
        let lock_target = self.lock_target(key);
        let lock = KeyLock::acquire(&lock_target, key, self.stale_lock_after)
            .with_context(|| format!("failed to lock {key}"))?;
        Ok(WriteScope {
            handle: self.lazy(key),
            _lock: lock,
            committed: false,
        })
    }

    fn lock_target(&self, key: &str) -> PathBuf {
        self.store_root.join(LOCKS_DIR).join(self.scheme.path_for(key))
    }

    fn journal_path(&self) -> PathBuf {
        self.store_root.join(JOURNAL_FILE)
    }

    fn journal_write(&self, backend: &str, key: &str) {
        let entry = JournalEntry {
            backend: backend.to_string(),
            key: key.to_string(),
        };
        let path = self.journal_path();
        let Some(parent) = path.parent() else { return };
        if fs::create_dir_all(parent).is_err() {
            return;
        }
        if let Ok(mut file) = OpenOptions::new().append(true).create(true).open(&path) {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    /// Replay journaled secondary writes from a previous process. Entries
    /// that succeed are dropped; the rest are kept for the next start.
    fn replay_journal(&self) {
        let path = self.journal_path();
        let Ok(content) = fs::read_to_string(&path) else {
            return;
        };
        let mut entries: Vec<JournalEntry> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        entries.dedup();

        let mut remaining = Vec::new();
        for entry in entries {
            let Some((idx, backend)) = self
                .backends
                .iter()
                .enumerate()
                .find(|(_, b)| b.name() == entry.backend)
            else {
                continue;
            };
            let replayed = match self.retry_backend(0, &entry.key, || self.primary().get_bytes(&entry.key)) {
                Ok(Some(bytes)) => self
                    .retry_backend(idx, &entry.key, || backend.put_bytes(&entry.key, &bytes))
                    .is_ok(),
                // The key is gone from the primary; nothing left to replay.
                Ok(None) => true,
                Err(_) => false,
            };
            if !replayed {
                remaining.push(entry);
            }
        }

        if remaining.is_empty() {
            let _ = fs::remove_file(&path);
        } else {
            let lines: Vec<String> = remaining
                .iter()
                .filter_map(|e| serde_json::to_string(e).ok())
                .collect();
            let _ = fs::write(&path, lines.join("\n") + "\n");
        }
    }

    /// Force bidirectional reconciliation of all keys across backends: keys
    /// missing from the primary are pulled in from wherever they exist,
    /// then every writable backend is brought up to the primary's bytes.
    pub fn sync_across_backends(&self, prefixes: &[&str]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut all_keys: Vec<String> = Vec::new();
        for prefix in prefixes {
            for (idx, backend) in self.backends.iter().enumerate() {
                if !self.is_healthy(idx) {
                    continue;
                }
                match self.retry_backend(idx, prefix, || backend.keys_prefix(prefix)) {
                    Ok(keys) => all_keys.extend(keys),
                    Err(e) => self.warn(format!(
                        "sync: enumeration on {} failed for {prefix}: {e}",
                        backend.name()
                    )),
                }
            }
        }
        all_keys.sort();
        all_keys.dedup();
        report.keys_seen = all_keys.len() as u64;

        for key in &all_keys {
            // Pull into the primary if it lacks the key.
            let mut primary_bytes = self.retry_backend(0, key, || self.primary().get_bytes(key))?;
            if primary_bytes.is_none() {
                for (idx, backend) in self.backends.iter().enumerate().skip(1) {
                    if !self.is_healthy(idx) {
                        continue;
                    }
                    if let Ok(Some(bytes)) = self.retry_backend(idx, key, || backend.get_bytes(key)) {
                        self.retry_backend(0, key, || self.primary().put_bytes(key, &bytes))?;
                        *report.copied.entry(self.primary().name().to_string()).or_default() += 1;
                        primary_bytes = Some(bytes);
                        break;
                    }
                }
            }
            let Some(bytes) = primary_bytes else { continue };

            // Push the primary's bytes everywhere else.
            for (idx, backend) in self.backends.iter().enumerate().skip(1) {
                if !backend.writable() || !self.is_healthy(idx) {
                    continue;
                }
                let theirs = self
                    .retry_backend(idx, key, || backend.get_bytes(key))
                    .unwrap_or(None);
                match theirs {
                    Some(existing) if existing == bytes => {}
                    Some(_) => {
                        self.retry_backend(idx, key, || backend.put_bytes(key, &bytes))?;
                        report.conflicts_resolved += 1;
                    }
                    None => {
                        self.retry_backend(idx, key, || backend.put_bytes(key, &bytes))?;
                        *report.copied.entry(backend.name().to_string()).or_default() += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}

/// A reference to a key whose value is fetched and parsed on first access.
#[derive(Debug)]
pub struct LazyHandle<'s, T> {
    store: &'s GraphStore,
    key: String,
    value: Option<T>,
    loaded: bool,
    dirty: bool,
}

impl<'s, T: DeserializeOwned> LazyHandle<'s, T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Fetch and parse if not yet loaded. `None` when the key is missing
    /// from every backend.
    pub fn load(&mut self) -> Result<Option<&T>> {
        if !self.loaded {
            self.value = self.store.load(&self.key)?;
            self.loaded = true;
        }
        Ok(self.value.as_ref())
    }

    /// Load, defaulting a missing record. Accessing mutably marks dirty.
    pub fn get_mut(&mut self) -> Result<&mut T>
    where
        T: Default,
    {
        if !self.loaded {
            self.value = self.store.load(&self.key)?;
            self.loaded = true;
        }
        self.dirty = true;
        Ok(self.value.get_or_insert_with(T::default))
    }

    /// Replace the value outright.
    pub fn set(&mut self, value: T) {
        self.value = Some(value);
        self.loaded = true;
        self.dirty = true;
    }
}

impl<'s, T: DeserializeOwned + Serialize> LazyHandle<'s, T> {
    /// Write back if dirty. Clears the dirty flag only when every configured
    /// backend accepted the bytes (a failed secondary leaves it set).
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let value = self
            .value
            .as_ref()
            .ok_or_else(|| anyhow!("dirty handle for {} has no value", self.key))?;
        let before = self.store.warnings.lock().expect("warnings lock poisoned").len();
        self.store.put(&self.key, value)?;
        let after = self.store.warnings.lock().expect("warnings lock poisoned").len();
        if after == before {
            self.dirty = false;
        }
        Ok(())
    }
}

/// An exclusive read-modify-write scope over one key. The record is flushed
/// at scope exit regardless of how the scope ends; `commit` surfaces flush
/// errors, Drop falls back to a best-effort flush plus a warning.
#[derive(Debug)]
pub struct WriteScope<'s, T: DeserializeOwned + Serialize> {
    handle: LazyHandle<'s, T>,
    _lock: KeyLock,
    committed: bool,
}

impl<'s, T: DeserializeOwned + Serialize> WriteScope<'s, T> {
    pub fn key(&self) -> &str {
        self.handle.key()
    }

    pub fn load(&mut self) -> Result<Option<&T>> {
        self.handle.load()
    }

    pub fn get_mut(&mut self) -> Result<&mut T>
    where
        T: Default,
    {
        self.handle.get_mut()
    }

    pub fn set(&mut self, value: T) {
        self.handle.set(value);
    }

    pub fn is_dirty(&self) -> bool {
        self.handle.is_dirty()
    }

    /// Flush and release the lock, surfacing any primary write error.
    pub fn commit(mut self) -> Result<()> {
        self.handle.flush()?;
        self.committed = true;
        Ok(())
    }
}

impl<'s, T: DeserializeOwned + Serialize> Drop for WriteScope<'s, T> {
    fn drop(&mut self) {
        if !self.committed && self.handle.is_dirty() {
            if let Err(e) = self.handle.flush() {
                self.handle
                    .store
                    .warn(format!("flush on scope exit failed for {}: {e}", self.handle.key));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use tempfile::tempdir;

    use super::*;
    use crate::backends::FileBackend;
    use crate::config::BackendKind;
    use crate::types::{PrInfoRecord, VersionRecord};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            kind: gardener_retry::BackoffKind::Immediate,
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    fn file_store(root: &Path) -> GraphStore {
        let backend = FileBackend::new(root.join("store"), ShardScheme::new(2));
        GraphStore::from_backends(
            vec![Box::new(backend)],
            root.join("store"),
            ShardScheme::new(2),
            None,
        )
        .expect("store")
        .with_retry_config(fast_retry())
    }

    /// A backend that can be told to fail writes, for journal tests.
    struct FlakyBackend {
        inner: FileBackend,
        name: String,
        fail_writes: AtomicBool,
        writes: AtomicU32,
    }

    impl FlakyBackend {
        fn new(root: PathBuf, name: &str) -> Self {
            Self {
                inner: FileBackend::new(root, ShardScheme::new(2)),
                name: name.to_string(),
                fail_writes: AtomicBool::new(false),
                writes: AtomicU32::new(0),
            }
        }
    }

    impl Backend for FlakyBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> BackendKind {
            BackendKind::File
        }

        fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.exists(key)
        }

        fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get_bytes(key)
        }

        fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::io(&self.name, key, "injected failure"));
            }
            self.inner.put_bytes(key, bytes)
        }

        fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key)
        }

        fn keys_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys_prefix(prefix)
        }
    }

    #[test]
    fn write_then_fresh_open_reads_identical_bytes() {
        let td = tempdir().expect("tempdir");

        let mut record = VersionRecord::default();
        record.new_version = Some("1.0.1".to_string());

        {
            let store = file_store(td.path());
            let mut scope: WriteScope<'_, VersionRecord> =
                store.write_scope("versions/zlib").expect("scope");
            scope.set(record.clone());
            scope.commit().expect("commit");
        }

        let reopened = file_store(td.path());
        let bytes = reopened.get_raw("versions/zlib").expect("read").expect("present");
        let expected = canonical_json_bytes(&record).expect("serialize");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn lazy_handle_defers_io_until_first_access() {
        let td = tempdir().expect("tempdir");
        let store = file_store(td.path());
        store
            .put("versions/zlib", &VersionRecord::default())
            .expect("put");

        let mut handle: LazyHandle<'_, VersionRecord> = store.lazy("versions/zlib");
        assert!(!handle.is_loaded());
        assert!(handle.load().expect("load").is_some());
        assert!(handle.is_loaded());
        assert!(!handle.is_dirty());
    }

    #[test]
    fn get_mut_marks_dirty_and_defaults_missing_records() {
        let td = tempdir().expect("tempdir");
        let store = file_store(td.path());

        let mut scope: WriteScope<'_, PrInfoRecord> =
            store.write_scope("pr_info/zlib").expect("scope");
        scope.get_mut().expect("default record").smithy_version = Some("2024.1".to_string());
        assert!(scope.is_dirty());
        scope.commit().expect("commit");

        let loaded: Option<PrInfoRecord> = store.load("pr_info/zlib").expect("load");
        assert_eq!(loaded.expect("present").smithy_version.as_deref(), Some("2024.1"));
    }

    #[test]
    fn uncommitted_dirty_scope_flushes_on_drop() {
        let td = tempdir().expect("tempdir");
        let store = file_store(td.path());

        {
            let mut scope: WriteScope<'_, PrInfoRecord> =
                store.write_scope("pr_info/zlib").expect("scope");
            scope.get_mut().expect("record").pinning_version = Some("7".to_string());
            // Dropped without commit: scheduler errors must not lose progress.
        }

        let loaded: Option<PrInfoRecord> = store.load("pr_info/zlib").expect("load");
        assert_eq!(loaded.expect("present").pinning_version.as_deref(), Some("7"));
    }

    #[test]
    fn reads_fall_through_to_secondary_backends() {
        let td = tempdir().expect("tempdir");
        let primary = FileBackend::new(td.path().join("primary"), ShardScheme::new(2));
        let secondary = FileBackend::new(td.path().join("secondary"), ShardScheme::new(2));
        secondary.put_bytes("versions/zlib", b"{\"new_version\": \"2.0\"}\n").expect("seed");

        let store = GraphStore::from_backends(
            vec![Box::new(primary), Box::new(secondary)],
            td.path().join("primary"),
            ShardScheme::new(2),
            None,
        )
        .expect("store")
        .with_retry_config(fast_retry());

        let loaded: Option<VersionRecord> = store.load("versions/zlib").expect("load");
        assert_eq!(loaded.expect("present").new_version.as_deref(), Some("2.0"));
    }

    #[test]
    fn corrupt_json_is_fatal_for_that_key_only() {
        let td = tempdir().expect("tempdir");
        let store = file_store(td.path());
        store.put_raw("versions/bad", b"{ not json").expect("seed");
        store.put("versions/good", &VersionRecord::default()).expect("seed");

        let err = store.load::<VersionRecord>("versions/bad").expect_err("corrupt");
        assert!(err.downcast_ref::<StoreError>().is_some_and(|e| matches!(
            e,
            StoreError::CorruptRecord { .. }
        )));

        // Other keys keep working.
        assert!(store.load::<VersionRecord>("versions/good").expect("load").is_some());
    }

    #[test]
    fn failed_secondary_write_warns_journals_and_keeps_primary() {
        let td = tempdir().expect("tempdir");
        let flaky = FlakyBackend::new(td.path().join("secondary"), "database");
        flaky.fail_writes.store(true, Ordering::SeqCst);
        let primary = FileBackend::new(td.path().join("primary"), ShardScheme::new(2));

        let store = GraphStore::from_backends(
            vec![Box::new(primary), Box::new(flaky)],
            td.path().join("primary"),
            ShardScheme::new(2),
            None,
        )
        .expect("store")
        .with_retry_config(fast_retry());

        store.put("versions/zlib", &VersionRecord::default()).expect("primary commits");

        let warnings = store.take_warnings();
        assert!(warnings.iter().any(|w| w.contains("secondary write")), "{warnings:?}");
        let journal = fs::read_to_string(store.journal_path()).expect("journal");
        assert!(journal.contains("versions/zlib"));

        // Primary committed regardless.
        assert!(store.get_raw("versions/zlib").expect("read").is_some());
    }

    #[test]
    fn journal_replays_on_next_open() {
        let td = tempdir().expect("tempdir");
        let primary_root = td.path().join("primary");
        let secondary_root = td.path().join("secondary");

        {
            let flaky = FlakyBackend::new(secondary_root.clone(), "database");
            flaky.fail_writes.store(true, Ordering::SeqCst);
            let primary = FileBackend::new(primary_root.clone(), ShardScheme::new(2));
            let store = GraphStore::from_backends(
                vec![Box::new(primary), Box::new(flaky)],
                primary_root.clone(),
                ShardScheme::new(2),
                None,
            )
            .expect("store")
            .with_retry_config(fast_retry());
            store.put("versions/zlib", &VersionRecord::default()).expect("put");
        }

        // Next process start: the secondary is healthy again.
        let healthy = FlakyBackend::new(secondary_root.clone(), "database");
        let primary = FileBackend::new(primary_root.clone(), ShardScheme::new(2));
        let store = GraphStore::from_backends(
            vec![Box::new(primary), Box::new(healthy)],
            primary_root.clone(),
            ShardScheme::new(2),
            None,
        )
        .expect("store")
        .with_retry_config(fast_retry());
        store.replay_journal();

        assert!(!store.journal_path().exists(), "journal should drain");
        let secondary = FileBackend::new(secondary_root, ShardScheme::new(2));
        assert!(secondary.exists("versions/zlib").expect("exists"));
    }

    #[test]
    fn file_cache_serves_fresh_entries_and_refetches_stale_ones() {
        let td = tempdir().expect("tempdir");
        let backend = FileBackend::new(td.path().join("store"), ShardScheme::new(2));
        let store = GraphStore::from_backends(
            vec![Box::new(backend)],
            td.path().join("store"),
            ShardScheme::new(2),
            Some(td.path().join("cache")),
        )
        .expect("store")
        .with_retry_config(fast_retry());

        store.put_raw("versions/zlib", b"first").expect("put");
        assert_eq!(store.get_raw("versions/zlib").expect("read"), Some(b"first".to_vec()));

        // Overwrite through a second store sharing the same root; the first
        // store's cache token no longer matches and must refetch.
        let other = file_store(td.path());
        other.put_raw("versions/zlib", b"second").expect("put");

        assert_eq!(store.get_raw("versions/zlib").expect("read"), Some(b"second".to_vec()));
    }

    #[test]
    fn second_write_scope_on_same_key_is_refused() {
        let td = tempdir().expect("tempdir");
        let store = file_store(td.path());

        let _held: WriteScope<'_, VersionRecord> =
            store.write_scope("versions/zlib").expect("first scope");
        let err = store
            .write_scope::<VersionRecord>("versions/zlib")
            .expect_err("second scope must fail");
        assert!(format!("{err:#}").contains("failed to lock"));
    }

    #[test]
    fn sync_copies_missing_keys_both_ways() {
        let td = tempdir().expect("tempdir");
        let primary = FileBackend::new(td.path().join("a"), ShardScheme::new(2));
        let secondary = FileBackend::new(td.path().join("b"), ShardScheme::new(2));
        primary.put_bytes("versions/only-a", b"a").expect("seed");
        secondary.put_bytes("versions/only-b", b"b").expect("seed");

        let store = GraphStore::from_backends(
            vec![Box::new(primary), Box::new(secondary)],
            td.path().join("a"),
            ShardScheme::new(2),
            None,
        )
        .expect("store")
        .with_retry_config(fast_retry());

        let report = store.sync_across_backends(&["versions/"]).expect("sync");
        assert_eq!(report.keys_seen, 2);

        let a = FileBackend::new(td.path().join("a"), ShardScheme::new(2));
        let b = FileBackend::new(td.path().join("b"), ShardScheme::new(2));
        assert!(a.exists("versions/only-b").expect("exists"));
        assert!(b.exists("versions/only-a").expect("exists"));
    }

    #[test]
    fn empty_backend_list_is_rejected() {
        let err = GraphStore::from_backends(
            Vec::new(),
            PathBuf::from("."),
            ShardScheme::default(),
            None,
        )
        .expect_err("must fail");
        assert!(format!("{err:#}").contains("at least one backend"));
    }
}
