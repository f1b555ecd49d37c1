//! DICTUM Test Utilities
//!
//! Shared test infrastructure for the dictum workspace:
//! - Mock sources that count calls, stall or fail on demand
//! - Proptest generators for values and row sets
//! - Fixtures for common dictionary declarations
//! - Custom assertions for dictum error variants

// Re-export core types for convenience
pub use dictum_core::{
    AttributeConfig, AttributeType, Attributes, ConfigError, DictResult, DictionaryConfig,
    DictionaryError, Interval, Key, KeyField, KeyModel, LayoutConfig, LookupError, Point, Polygon,
    Row, SourceConfig, SourceError, StructureConfig, Value,
};
pub use dictum_storage::{DictionarySource, MemorySource, RowStream};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dictum_core::Timestamp;
use parking_lot::Mutex;

/// Install a `tracing` subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK SOURCES
// ============================================================================

/// Per-method call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCalls {
    pub load_all: u64,
    pub load_ids: u64,
    pub load_updated_after: u64,
    pub is_modified: u64,
}

#[derive(Debug, Default)]
struct Counters {
    load_all: AtomicU64,
    load_ids: AtomicU64,
    load_updated_after: AtomicU64,
    is_modified: AtomicU64,
}

/// In-memory source that counts calls and can stall or fail on demand.
///
/// Data, selective and incremental behavior come from the wrapped
/// [`MemorySource`].
#[derive(Debug, Default)]
pub struct CountingSource {
    inner: MemorySource,
    counters: Counters,
    delay: Mutex<Option<Duration>>,
    failure: Mutex<Option<SourceError>>,
}

impl CountingSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            inner: MemorySource::new(rows),
            ..Self::default()
        }
    }

    /// Sleep this long (tokio time) before answering any load.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Fail every load with `error` until cleared with `None`.
    pub fn set_failure(&self, error: Option<SourceError>) {
        *self.failure.lock() = error;
    }

    pub fn data(&self) -> &MemorySource {
        &self.inner
    }

    pub fn calls(&self) -> SourceCalls {
        SourceCalls {
            load_all: self.counters.load_all.load(Ordering::SeqCst),
            load_ids: self.counters.load_ids.load(Ordering::SeqCst),
            load_updated_after: self.counters.load_updated_after.load(Ordering::SeqCst),
            is_modified: self.counters.is_modified.load(Ordering::SeqCst),
        }
    }

    /// Calls that read rows (excludes `is_modified`).
    pub fn loads(&self) -> u64 {
        let calls = self.calls();
        calls.load_all + calls.load_ids + calls.load_updated_after
    }

    async fn prepare(&self, counter: &AtomicU64) -> Result<(), SourceError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failure.lock().clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DictionarySource for CountingSource {
    fn kind(&self) -> &str {
        "counting"
    }

    async fn load_all(&self) -> Result<RowStream, SourceError> {
        self.prepare(&self.counters.load_all).await?;
        self.inner.load_all().await
    }

    async fn load_ids(&self, keys: &[Key]) -> Result<RowStream, SourceError> {
        self.prepare(&self.counters.load_ids).await?;
        self.inner.load_ids(keys).await
    }

    async fn load_updated_after(&self, since: Timestamp) -> Result<RowStream, SourceError> {
        self.prepare(&self.counters.load_updated_after).await?;
        self.inner.load_updated_after(since).await
    }

    fn supports_selective_load(&self) -> bool {
        true
    }

    fn supports_incremental_load(&self) -> bool {
        true
    }

    async fn is_modified(&self) -> Result<bool, SourceError> {
        self.counters.is_modified.fetch_add(1, Ordering::SeqCst);
        self.inner.is_modified().await
    }
}

/// Source whose first `failures` loads fail with `error`, then succeeds.
#[derive(Debug)]
pub struct FlakySource {
    inner: MemorySource,
    remaining_failures: AtomicU64,
    error: SourceError,
}

impl FlakySource {
    pub fn new(rows: Vec<Row>, failures: u64, error: SourceError) -> Self {
        Self {
            inner: MemorySource::new(rows),
            remaining_failures: AtomicU64::new(failures),
            error,
        }
    }

    pub fn remaining_failures(&self) -> u64 {
        self.remaining_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DictionarySource for FlakySource {
    fn kind(&self) -> &str {
        "flaky"
    }

    async fn load_all(&self) -> Result<RowStream, SourceError> {
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(self.error.clone());
        }
        self.inner.load_all().await
    }
}

/// Shared handle helper: most tests keep an `Arc` to poke the source.
pub fn shared<S: DictionarySource + 'static>(source: S) -> (Arc<S>, Arc<dyn DictionarySource>) {
    let source = Arc::new(source);
    let dynamic: Arc<dyn DictionarySource> = source.clone();
    (source, dynamic)
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for dictum values and row sets.

    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Generate a short printable string.
    pub fn arb_label() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9 ]{0,11}"
    }

    /// Generate a non-null value of `ty`. Polygons are not generated.
    pub fn arb_value(ty: AttributeType) -> BoxedStrategy<Value> {
        match ty {
            AttributeType::UInt64 => any::<u64>().prop_map(Value::UInt64).boxed(),
            AttributeType::Int64 => any::<i64>().prop_map(Value::Int64).boxed(),
            AttributeType::Float64 => (-1.0e9f64..1.0e9).prop_map(Value::Float64).boxed(),
            AttributeType::Bool => any::<bool>().prop_map(Value::Bool).boxed(),
            _ => arb_label().prop_map(Value::String).boxed(),
        }
    }

    /// Generate `(id, label)` rows with unique ids below `max_id`.
    pub fn arb_simple_rows(max_id: u64, max_rows: usize) -> impl Strategy<Value = Vec<Row>> {
        prop::collection::btree_map(0..max_id, arb_label(), 1..max_rows).prop_map(|rows| {
            rows.into_iter()
                .map(|(id, label)| Row::new(id, vec![Value::String(label)]))
                .collect()
        })
    }

    /// Generate `((code, n), label)` rows with unique composite keys.
    pub fn arb_complex_rows(max_rows: usize) -> impl Strategy<Value = Vec<Row>> {
        prop::collection::btree_map(("[A-Z]{2}", 0u64..1000), arb_label(), 1..max_rows).prop_map(
            |rows: BTreeMap<(String, u64), String>| {
                rows.into_iter()
                    .map(|((code, n), label)| {
                        Row::new(
                            Key::complex([Value::String(code), Value::UInt64(n)]),
                            vec![Value::String(label)],
                        )
                    })
                    .collect()
            },
        )
    }

    /// Generate disjoint `[start, end]` intervals per key, each with a label.
    pub fn arb_range_rows(max_keys: u64) -> impl Strategy<Value = Vec<Row>> {
        prop::collection::vec((0..max_keys, 1u64..5, 0i64..20, arb_label()), 1..24).prop_map(
            |specs| {
                let mut next_start: BTreeMap<u64, i64> = BTreeMap::new();
                specs
                    .into_iter()
                    .map(|(key, slots, gap, label)| {
                        let start = next_start.get(&key).copied().unwrap_or(0) + gap;
                        let end = start + slots as i64;
                        next_start.insert(key, end + 1);
                        Row::new(key, vec![Value::String(label)])
                            .with_range(Interval::new(Value::Int64(start), Value::Int64(end)))
                    })
                    .collect()
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built declarations and datasets.

    use super::*;

    /// `regions(id) -> name, parent` with a hierarchical `parent` (root 0).
    pub fn regions_config(layout: LayoutConfig) -> DictionaryConfig {
        let structure = StructureConfig::new(
            KeyModel::simple("id"),
            vec![
                AttributeConfig::new("name", AttributeType::String).with_null_value("unknown"),
                AttributeConfig::new("parent", AttributeType::UInt64)
                    .with_null_value(0)
                    .hierarchical(),
            ],
        );
        DictionaryConfig::new("regions", structure, SourceConfig::new("memory"), layout)
    }

    pub fn region(id: u64, name: &str, parent: u64) -> Row {
        Row::new(id, vec![Value::from(name), Value::UInt64(parent)])
    }

    /// world > europe > france > paris, plus asia under world.
    pub fn world_regions() -> Vec<Row> {
        vec![
            region(1, "world", 0),
            region(2, "europe", 1),
            region(3, "france", 2),
            region(4, "paris", 3),
            region(5, "asia", 1),
        ]
    }

    /// Single `label` String attribute over `key`.
    pub fn labels_config(name: &str, key: KeyModel, layout: LayoutConfig) -> DictionaryConfig {
        let structure = StructureConfig::new(
            key,
            vec![AttributeConfig::new("label", AttributeType::String)],
        );
        DictionaryConfig::new(name, structure, SourceConfig::new("memory"), layout)
    }

    /// `(code String, n UInt64)` composite key.
    pub fn code_number_key() -> KeyModel {
        KeyModel::Complex(vec![
            KeyField::new("code", AttributeType::String),
            KeyField::new("n", AttributeType::UInt64),
        ])
    }

    pub fn label(text: &str) -> Attributes {
        Attributes::new(vec![Value::from(text)])
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for dictum error variants.

    use super::*;

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &DictResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_loaded<T: std::fmt::Debug>(result: &DictResult<T>) {
        match result {
            Err(e) if e.is_not_loaded() => {}
            other => panic!("Expected NotLoaded, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &DictResult<T>) {
        match result {
            Err(DictionaryError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_source_data_error<T: std::fmt::Debug>(result: &DictResult<T>) {
        match result {
            Err(DictionaryError::Source(SourceError::Data { .. })) => {}
            other => panic!("Expected source data error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_attributes(actual: &Attributes, expected: &[Value]) {
        assert_eq!(actual.values(), expected, "attribute mismatch");
    }
}
