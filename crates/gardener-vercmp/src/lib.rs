//! Total ordering over ecosystem version strings.
//!
//! The ecosystem's convention is dot-separated numeric segments with optional
//! pre-release suffixes (`dev`, `a`, `b`, `rc`), an optional post-release, and
//! an optional local segment after `+`. The ordering is:
//!
//! - numeric segments compare numerically, with missing trailing segments
//!   treated as zero (`1.0` == `1.0.0`);
//! - pre-release phases order `dev < a < b < rc < (final release) < post`;
//! - local segments compare lexicographically and beat the absence of one;
//! - strings that do not parse sort strictly below every parseable version
//!   and among themselves by raw string, equal only on identity.
//!
//! # Example
//!
//! ```
//! use gardener_vercmp::Version;
//!
//! let old = Version::parse("1.2.0rc1");
//! let new = Version::parse("1.2.0");
//! assert!(old < new);
//! assert!(new.is_parseable());
//! assert!(old.is_prerelease());
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Pre-release phase, ordered `Dev < Alpha < Beta < Rc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Dev,
    Alpha,
    Beta,
    Rc,
}

impl Phase {
    fn from_token(token: &str) -> Option<Phase> {
        match token {
            "dev" => Some(Phase::Dev),
            "a" | "alpha" => Some(Phase::Alpha),
            "b" | "beta" => Some(Phase::Beta),
            "rc" | "c" | "pre" | "preview" => Some(Phase::Rc),
            _ => None,
        }
    }
}

/// Structured form of a version that matched the ecosystem grammar.
#[derive(Debug, Clone)]
pub struct ParsedVersion {
    release: Vec<u64>,
    pre: Option<(Phase, u64)>,
    post: Option<u64>,
    local: Option<String>,
    raw: String,
}

impl ParsedVersion {
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn pre(&self) -> Option<(Phase, u64)> {
        self.pre
    }

    pub fn post(&self) -> Option<u64> {
        self.post
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    fn release_segment(&self, idx: usize) -> u64 {
        self.release.get(idx).copied().unwrap_or(0)
    }

    fn cmp_parsed(&self, other: &ParsedVersion) -> Ordering {
        let segments = self.release.len().max(other.release.len());
        for idx in 0..segments {
            let ord = self.release_segment(idx).cmp(&other.release_segment(idx));
            if ord != Ordering::Equal {
                return ord;
            }
        }

        // A final release outranks any pre-release of the same number.
        let ord = match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        };
        if ord != Ordering::Equal {
            return ord;
        }

        // Post-releases outrank the bare release.
        let ord = match (&self.post, &other.post) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        };
        if ord != Ordering::Equal {
            return ord;
        }

        match (&self.local, &other.local) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

/// A version string under the ecosystem's total order.
///
/// `Opaque` holds strings that did not match the grammar; they sort below
/// every `Parsed` version.
#[derive(Debug, Clone)]
pub enum Version {
    Parsed(ParsedVersion),
    Opaque(String),
}

impl Version {
    /// Parse a version string. Never fails: strings outside the grammar are
    /// retained as `Opaque`.
    pub fn parse(raw: &str) -> Version {
        match parse_grammar(raw) {
            Some(parsed) => Version::Parsed(parsed),
            None => Version::Opaque(raw.to_string()),
        }
    }

    /// The original string, regardless of parse outcome.
    pub fn raw(&self) -> &str {
        match self {
            Version::Parsed(p) => &p.raw,
            Version::Opaque(s) => s,
        }
    }

    pub fn is_parseable(&self) -> bool {
        matches!(self, Version::Parsed(_))
    }

    /// True for `dev`/`a`/`b`/`rc` versions. Opaque versions are not
    /// considered pre-releases.
    pub fn is_prerelease(&self) -> bool {
        matches!(self, Version::Parsed(p) if p.pre.is_some())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Version::Parsed(a), Version::Parsed(b)) => a.cmp_parsed(b),
            (Version::Parsed(_), Version::Opaque(_)) => Ordering::Greater,
            (Version::Opaque(_), Version::Parsed(_)) => Ordering::Less,
            (Version::Opaque(a), Version::Opaque(b)) => a.cmp(b),
        }
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.raw())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Version::parse(&raw))
    }
}

/// Compare two raw version strings under the total order.
pub fn compare(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

/// Pick the maximum among candidate strings, or `None` on an empty input.
pub fn max_of<'a, I: IntoIterator<Item = &'a str>>(candidates: I) -> Option<&'a str> {
    candidates
        .into_iter()
        .max_by(|a, b| compare(a, b))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(u64),
    Word(String),
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c == '.' || c == '-' || c == '_' {
            chars.next();
        } else if c.is_ascii_digit() {
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    digits.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Number(digits.parse().ok()?));
        } else if c.is_ascii_alphabetic() {
            let mut word = String::new();
            while let Some(&a) = chars.peek() {
                if a.is_ascii_alphabetic() {
                    word.push(a.to_ascii_lowercase());
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else {
            return None;
        }
    }

    Some(tokens)
}

fn parse_grammar(raw: &str) -> Option<ParsedVersion> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Local segment: everything after the first '+', compared lexicographically.
    let (main, local) = match trimmed.split_once('+') {
        Some((main, local)) if !local.is_empty() => (main, Some(local.to_ascii_lowercase())),
        Some(_) => return None,
        None => (trimmed, None),
    };

    // A leading `v` prefix is tolerated (common in forge tags).
    let main = main.strip_prefix('v').unwrap_or(main);

    let tokens = tokenize(main)?;
    let mut iter = tokens.into_iter().peekable();

    let mut release = Vec::new();
    while let Some(Token::Number(n)) = iter.peek() {
        release.push(*n);
        iter.next();
    }
    if release.is_empty() {
        return None;
    }

    let mut pre: Option<(Phase, u64)> = None;
    let mut post: Option<u64> = None;

    while let Some(token) = iter.next() {
        let word = match token {
            Token::Word(w) => w,
            Token::Number(_) => return None,
        };
        let number = match iter.peek() {
            Some(Token::Number(n)) => {
                let n = *n;
                iter.next();
                n
            }
            _ => 0,
        };

        if let Some(phase) = Phase::from_token(&word) {
            if pre.is_some() || post.is_some() {
                return None;
            }
            pre = Some((phase, number));
        } else if word == "post" || word == "rev" || word == "r" {
            if post.is_some() {
                return None;
            }
            post = Some(number);
        } else {
            return None;
        }
    }

    Some(ParsedVersion {
        release,
        pre,
        post,
        local,
        raw: raw.to_string(),
    })
}
