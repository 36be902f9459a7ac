//! Tokens: the immutable units of data that flow through ports.
//!
//! A token carries either an inline JSON value, a reference to data held at a
//! location, or a list of either. Tokens are never mutated after release; new
//! data is always a new token with a new id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::deployment::LocationRef;
use crate::error::ParseError;

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

/// Hierarchical invocation index.
///
/// The root tag is empty and renders as `0`. Scattering item `i` of a token
/// tagged `t` produces tag `t.i`, so the item at index 2 of a root-level
/// scatter renders as `0.2`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<u32>);

impl Tag {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_indices(indices: Vec<u32>) -> Self {
        Self(indices)
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The tag of item `index` scattered from a token with this tag.
    pub fn child(&self, index: u32) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    /// True when `self` equals `other` or is an ancestor of it.
    pub fn is_prefix_of(&self, other: &Tag) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Concatenate two tags (used by the cartesian combinator).
    pub fn concat(&self, other: &Tag) -> Self {
        let mut indices = self.0.clone();
        indices.extend_from_slice(&other.0);
        Self(indices)
    }

    /// Longest common prefix of a set of tags. Empty input yields the root.
    pub fn common_prefix<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Self {
        let mut iter = tags.into_iter();
        let Some(first) = iter.next() else {
            return Self::root();
        };
        let mut len = first.0.len();
        for tag in iter {
            len = len.min(
                first.0[..len]
                    .iter()
                    .zip(tag.0.iter())
                    .take_while(|(a, b)| a == b)
                    .count(),
            );
        }
        Self(first.0[..len].to_vec())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0")?;
        for index in &self.0 {
            write!(f, ".{index}")?;
        }
        Ok(())
    }
}

impl FromStr for Tag {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        if parts.next() != Some("0") {
            return Err(ParseError::InvalidTag(s.to_string()));
        }
        parts
            .map(|p| p.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
            .map_err(|_| ParseError::InvalidTag(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Reference to a file or directory held at a specific location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRef {
    pub location: LocationRef,
    pub path: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Contents of a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum Payload {
    Value(Value),
    Data(DataRef),
    List(Vec<Payload>),
}

impl Payload {
    /// All data references in depth-first order.
    pub fn data_refs(&self) -> Vec<&DataRef> {
        let mut out = Vec::new();
        self.collect_data_refs(&mut out);
        out
    }

    fn collect_data_refs<'a>(&'a self, out: &mut Vec<&'a DataRef>) {
        match self {
            Payload::Value(_) => {}
            Payload::Data(data) => out.push(data),
            Payload::List(items) => items.iter().for_each(|i| i.collect_data_refs(out)),
        }
    }

    pub fn has_data(&self) -> bool {
        !self.data_refs().is_empty()
    }

    /// Rebuild this payload with its data references replaced, in the order
    /// returned by [`Payload::data_refs`]. Missing replacements keep the
    /// original reference.
    pub fn with_data_refs(&self, replacements: &[DataRef]) -> Payload {
        let mut next = 0usize;
        self.replace_data(replacements, &mut next)
    }

    fn replace_data(&self, replacements: &[DataRef], next: &mut usize) -> Payload {
        match self {
            Payload::Value(v) => Payload::Value(v.clone()),
            Payload::Data(data) => {
                let replaced = replacements.get(*next).cloned().unwrap_or_else(|| data.clone());
                *next += 1;
                Payload::Data(replaced)
            }
            Payload::List(items) => Payload::List(
                items.iter().map(|i| i.replace_data(replacements, next)).collect(),
            ),
        }
    }

    /// Items produced when this payload is scattered. Lists and JSON arrays
    /// expand element-wise; anything else scatters as a single item.
    pub fn scatter_items(&self) -> Vec<Payload> {
        match self {
            Payload::List(items) => items.clone(),
            Payload::Value(Value::Array(values)) => {
                values.iter().cloned().map(Payload::Value).collect()
            }
            other => vec![other.clone()],
        }
    }

    /// Plain JSON view handed to job commands. Data references become paths.
    pub fn to_json(&self) -> Value {
        match self {
            Payload::Value(v) => v.clone(),
            Payload::Data(data) => Value::String(data.path.clone()),
            Payload::List(items) => Value::Array(items.iter().map(Payload::to_json).collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// One step of a token's history: the invocation that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub step: String,
    pub tag: Tag,
}

/// An immutable unit of data on a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub port: String,
    pub tag: Tag,
    /// Position in the port's stream, assigned when the token is released.
    #[serde(default)]
    pub seq: u64,
    pub payload: Payload,
    #[serde(default)]
    pub provenance: Vec<Provenance>,
}

impl Token {
    pub fn new(port: impl Into<String>, tag: Tag, payload: Payload) -> Self {
        Self {
            id: Uuid::now_v7(),
            port: port.into(),
            tag,
            seq: 0,
            payload,
            provenance: Vec::new(),
        }
    }

    /// Total bytes of referenced data carried by this token.
    pub fn data_bytes(&self) -> u64 {
        self.payload.data_refs().iter().map(|d| d.size_bytes).sum()
    }
}

/// Why a port's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::Completed => "completed",
            TerminationReason::Skipped => "skipped",
            TerminationReason::Failed => "failed",
            TerminationReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
