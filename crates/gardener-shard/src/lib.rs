//! Sharded key-to-path layout for the gardener graph store.
//!
//! Store revisions contain well over 10^5 records, so the file backend never
//! puts them all in one directory. Each key lands at
//! `h0/h1/.../h{N-1}/<key>.json`, where `h0..h{N-1}` are the first N hex
//! characters of the key's SHA-256 digest and N is fixed once per deployment
//! (typical: 5).
//!
//! Keys are logical names like `pr_info/some-feedstock`; characters outside
//! a conservative filesystem-safe set are percent-escaped so the mapping
//! round-trips.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default shard depth. Five hex characters spread 10^5 records to roughly
/// one file per directory.
pub const DEFAULT_DEPTH: usize = 5;

/// The shard layout for one deployment. Changing the depth of an existing
/// store orphans every record, so this is configured once and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardScheme {
    depth: usize,
}

impl Default for ShardScheme {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
        }
    }
}

impl ShardScheme {
    /// A scheme with an explicit depth. Depth 0 is allowed and produces a
    /// flat layout (useful in tests).
    pub fn new(depth: usize) -> Self {
        Self { depth }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The shard directory components for a key: the first `depth` hex
    /// characters of its SHA-256 digest, one directory per character.
    pub fn shard_components(&self, key: &str) -> Vec<String> {
        let digest = Sha256::digest(key.as_bytes());
        let hexed = hex::encode(digest);
        hexed
            .chars()
            .take(self.depth)
            .map(|c| c.to_string())
            .collect()
    }

    /// The full relative path for a key, `h0/h1/.../<escaped-key>.json`.
    pub fn path_for(&self, key: &str) -> String {
        let mut parts = self.shard_components(key);
        parts.push(format!("{}.json", escape_key(key)));
        parts.join("/")
    }

    /// Recover the logical key from a relative path produced by
    /// [`ShardScheme::path_for`]. Returns `None` for paths that do not fit
    /// the layout (wrong depth, missing `.json`, bad escape).
    pub fn key_from_path(&self, path: &str) -> Option<String> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.depth + 1 {
            return None;
        }
        let file = parts.last()?;
        let escaped = file.strip_suffix(".json")?;
        let key = unescape_key(escaped)?;
        // Reject paths filed under the wrong shard.
        if self.shard_components(&key) != parts[..self.depth] {
            return None;
        }
        Some(key)
    }
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Escape a key for use as a single filename component. Safe characters pass
/// through; everything else becomes `%XX` per byte.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if is_safe(c) && c != '%' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Invert [`escape_key`]. Returns `None` on malformed escapes.
pub fn unescape_key(escaped: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
            bytes.push(byte);
        } else if is_safe(c) {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        } else {
            return None;
        }
    }
    String::from_utf8(bytes).ok()
}
