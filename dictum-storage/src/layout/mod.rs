//! Storage layouts.
//!
//! Every layout implements the same contract: `lookup(key) → attributes or
//! absent`. Bulk layouts (flat, hashed, range, trie, polygon) build a
//! complete snapshot off to the side and publish it with one atomic swap;
//! the cache layout keeps a bounded resident set and loads misses on demand.
//!
//! # State machine
//!
//! ```text
//! Empty ─► Loading ─► Ready ─► Refreshing ─► Ready
//!             │                    │
//!             └──────► Failed ◄────┘
//! ```
//!
//! A failed layout keeps serving its last published snapshot, if any.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use dictum_core::{
    Attributes, ConfigError, DictResult, DictionaryError, Key, KeyModel, LookupError,
    RegistryKind, Timestamp, Value,
};
use serde::{Deserialize, Serialize};

use crate::source::DictionarySource;

pub mod cache;
pub mod flat;
pub mod hashed;
pub mod polygon;
pub mod range_hashed;
pub mod registry;
pub mod snapshot;
pub mod trie;

pub use cache::{CacheLayout, CacheStats};
pub use flat::FlatData;
pub use hashed::HashedData;
pub use polygon::PolygonData;
pub use range_hashed::RangeData;
pub use registry::{LayoutArgs, LayoutConstructor, LayoutRegistry};
pub use snapshot::{BulkLayout, Generation, SnapshotBuilder, SnapshotCell, SnapshotData};
pub use trie::TrieData;

/// The built-in layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    Flat,
    Hashed,
    ComplexKeyHashed,
    Cache,
    ComplexKeyCache,
    RangeHashed,
    ComplexKeyRangeHashed,
    Trie,
    Polygon,
}

impl LayoutKind {
    pub const ALL: [LayoutKind; 9] = [
        Self::Flat,
        Self::Hashed,
        Self::ComplexKeyHashed,
        Self::Cache,
        Self::ComplexKeyCache,
        Self::RangeHashed,
        Self::ComplexKeyRangeHashed,
        Self::Trie,
        Self::Polygon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Hashed => "hashed",
            Self::ComplexKeyHashed => "complex_key_hashed",
            Self::Cache => "cache",
            Self::ComplexKeyCache => "complex_key_cache",
            Self::RangeHashed => "range_hashed",
            Self::ComplexKeyRangeHashed => "complex_key_range_hashed",
            Self::Trie => "trie",
            Self::Polygon => "polygon",
        }
    }

    /// Whether the layout holds the whole dataset after a load.
    pub fn requires_bulk_load(&self) -> bool {
        !matches!(self, Self::Cache | Self::ComplexKeyCache)
    }

    pub fn is_range(&self) -> bool {
        matches!(self, Self::RangeHashed | Self::ComplexKeyRangeHashed)
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayoutKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownKind {
                registry: RegistryKind::Layout,
                name: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutState {
    Empty,
    Loading,
    Ready,
    Refreshing,
    Failed,
}

impl fmt::Display for LayoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Empty => "empty",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Refreshing => "refreshing",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// How a refresh reads the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Rebuild from `load_all`.
    Full,
    /// Merge `load_updated_after(previous load start)` into a copy of the
    /// current snapshot. Falls back to a full load when nothing is published.
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Published { generation: u64, elements: usize },
    /// Source reported no modification, or the layout has nothing to rebuild.
    Unchanged,
}

/// Point-in-time view of a layout for introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutStatus {
    pub state: LayoutState,
    /// Number of publications so far; 0 until the first successful load.
    pub generation: u64,
    pub element_count: usize,
    /// Start time of the load that produced the current snapshot.
    pub loaded_at: Option<Timestamp>,
    pub failed_attempts: u32,
    pub last_error: Option<DictionaryError>,
}

/// One lookup request.
#[derive(Debug, Clone, Copy)]
pub struct Probe<'a> {
    pub key: &'a Key,
    /// Range point for range layouts.
    pub at: Option<&'a Value>,
}

impl<'a> Probe<'a> {
    pub fn key(key: &'a Key) -> Self {
        Self { key, at: None }
    }

    pub fn at(key: &'a Key, point: &'a Value) -> Self {
        Self {
            key,
            at: Some(point),
        }
    }
}

#[async_trait]
pub trait DictionaryLayout: Send + Sync {
    fn kind(&self) -> LayoutKind;

    fn status(&self) -> LayoutStatus;

    /// Whether lookups can be answered (a snapshot is published, or the
    /// layout loads on demand).
    fn is_loaded(&self) -> bool;

    /// Validate a caller-supplied key. Layouts with special lookup keys
    /// (IP addresses, points) override this.
    fn check_key(&self, model: &KeyModel, key: &Key) -> Result<(), LookupError> {
        model.check(key)
    }

    async fn refresh(
        &self,
        source: &dyn DictionarySource,
        mode: RefreshMode,
    ) -> DictResult<RefreshOutcome>;

    async fn lookup(
        &self,
        probe: Probe<'_>,
        source: &dyn DictionarySource,
    ) -> DictResult<Option<Attributes>>;

    /// Look up many keys, preserving input order.
    async fn lookup_many(
        &self,
        keys: &[Key],
        source: &dyn DictionarySource,
    ) -> DictResult<Vec<Option<Attributes>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.lookup(Probe::key(key), source).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in LayoutKind::ALL {
            assert_eq!(kind.as_str().parse::<LayoutKind>().unwrap(), kind);
        }
        assert!("btree".parse::<LayoutKind>().is_err());
        assert!(!LayoutKind::Cache.requires_bulk_load());
        assert!(LayoutKind::ComplexKeyRangeHashed.is_range());
    }
}
