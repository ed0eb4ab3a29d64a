//! Axes and chunks: the scalar index space jobs fan out over.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named dimension of parallel instantiation (e.g. `byline`, `bychar`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Axis(pub String);

impl Axis {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Axis {
    fn from(s: &str) -> Self {
        Axis::new(s)
    }
}

/// A single value of an axis. Chunk sets are ordered collections of these,
/// materialised as the output of a split job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Chunk {
    Int(i64),
    Str(String),
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Int(i) => write!(f, "{}", i),
            Chunk::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Chunk {
    fn from(v: i64) -> Self {
        Chunk::Int(v)
    }
}

impl From<&str> for Chunk {
    fn from(v: &str) -> Self {
        Chunk::Str(v.to_string())
    }
}

impl From<String> for Chunk {
    fn from(v: String) -> Self {
        Chunk::Str(v)
    }
}

/// An ordered, deduplication-free set of chunks materialised by a split job.
pub type ChunkSet = Vec<Chunk>;
