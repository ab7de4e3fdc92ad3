//! Query keys: canonical encoding, hashing, and prefix matching.
//!
//! A [`QueryKey`] is an ordered sequence of primitive values and nested
//! keys. Two keys are equal iff their canonical encoding matches, and a key
//! is a *prefix* of another iff its elements equal the other's leading
//! elements (`matches_prefix`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single element of a [`QueryKey`].
///
/// Primitives are type-tagged during encoding so that `KeyPart::Int(1)` and
/// `KeyPart::Str("1".into())` never collide.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KeyPart {
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
    Seq(Vec<KeyPart>),
    Map(Vec<(String, KeyPart)>),
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Str(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Str(s)
    }
}

impl From<i64> for KeyPart {
    fn from(v: i64) -> Self {
        KeyPart::Int(v)
    }
}

impl From<u32> for KeyPart {
    fn from(v: u32) -> Self {
        KeyPart::Int(v as i64)
    }
}

impl From<u64> for KeyPart {
    fn from(v: u64) -> Self {
        KeyPart::Int(v as i64)
    }
}

impl From<bool> for KeyPart {
    fn from(v: bool) -> Self {
        KeyPart::Bool(v)
    }
}

/// An ordered sequence of [`KeyPart`]s identifying a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct QueryKey {
    parts: Vec<KeyPart>,
}

impl QueryKey {
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
        }
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// True iff `self`'s elements equal `other`'s leading elements.
    pub fn matches_prefix(&self, other: &QueryKey) -> bool {
        self.parts.len() <= other.parts.len() && self.parts == other.parts[..self.parts.len()]
    }

    /// Canonically encode and hash this key into a stable [`QueryHash`].
    pub fn hash(&self) -> Result<QueryHash, EncodingError> {
        let mut out = String::new();
        encode_parts(&self.parts, &mut out)?;
        Ok(QueryHash(out))
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(segments: [&str; N]) -> Self {
        QueryKey::new(segments.into_iter().map(KeyPart::from))
    }
}

impl From<&[&str]> for QueryKey {
    fn from(segments: &[&str]) -> Self {
        QueryKey::new(segments.iter().map(|s| KeyPart::from(*s)))
    }
}

impl From<&str> for QueryKey {
    fn from(segment: &str) -> Self {
        QueryKey::new([KeyPart::from(segment)])
    }
}

impl From<Vec<KeyPart>> for QueryKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        QueryKey::new(parts)
    }
}

/// A stable string derived from a [`QueryKey`] by canonical recursive
/// serialization. Uniquely identifies a `Query` inside a cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryHash(String);

impl QueryHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compose a persistence-record hash per §4.11: `prefix:hash` when a
    /// `keyPrefix` is configured, the bare hash otherwise.
    pub fn with_prefix(&self, prefix: Option<&str>) -> String {
        match prefix {
            Some(p) => format!("{p}:{}", self.0),
            None => self.0.clone(),
        }
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure encoding a [`QueryKey`]: cycles or non-encodable values. Always a
/// programmer error, never retried.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EncodingError {
    #[error("query key nesting exceeds the supported depth")]
    TooDeep,
}

const MAX_DEPTH: usize = 64;

fn encode_parts(parts: &[KeyPart], out: &mut String) -> Result<(), EncodingError> {
    encode_seq(parts, out, 0)
}

fn encode_seq(parts: &[KeyPart], out: &mut String, depth: usize) -> Result<(), EncodingError> {
    if depth > MAX_DEPTH {
        return Err(EncodingError::TooDeep);
    }
    out.push('[');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        encode_part(part, out, depth + 1)?;
    }
    out.push(']');
    Ok(())
}

fn encode_part(part: &KeyPart, out: &mut String, depth: usize) -> Result<(), EncodingError> {
    if depth > MAX_DEPTH {
        return Err(EncodingError::TooDeep);
    }
    match part {
        KeyPart::Str(s) => {
            out.push('s');
            out.push(':');
            out.push_str(&s.len().to_string());
            out.push(':');
            out.push_str(s);
        }
        KeyPart::Int(v) => {
            out.push('i');
            out.push(':');
            out.push_str(&v.to_string());
        }
        KeyPart::Bool(b) => {
            out.push('b');
            out.push(':');
            out.push(if *b { '1' } else { '0' });
        }
        KeyPart::Null => out.push_str("n:"),
        KeyPart::Seq(items) => {
            out.push('a');
            encode_seq(items, out, depth + 1)?;
        }
        KeyPart::Map(entries) => {
            let mut sorted: Vec<&(String, KeyPart)> = entries.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            out.push('m');
            out.push('{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&k.len().to_string());
                out.push(':');
                out.push_str(k);
                out.push('=');
                encode_part(v, out, depth + 1)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Patterns for matching query keys against a predicate, used by
/// `QueryCache::find_all` and `QueryClient::invalidate_queries`.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryKeyPattern {
    Exact(QueryKey),
    Prefix(QueryKey),
}

impl QueryKeyPattern {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            QueryKeyPattern::Exact(k) => k == key,
            QueryKeyPattern::Prefix(prefix) => prefix.matches_prefix(key),
        }
    }
}
