//! Property-Based Tests for Layout Round-Trips
//!
//! **Property: Round-trip**
//!
//! For any generated row set, building a dictionary over each layout kind
//! and querying every inserted key SHALL return the inserted attributes.

use std::sync::Arc;
use std::time::Duration;

use dictum_storage::{Dictionary, DictionarySource, LayoutArgs, LayoutRegistry};
use dictum_test_utils::fixtures::*;
use dictum_test_utils::generators::*;
use dictum_test_utils::*;
use futures_util::future::join_all;
use proptest::prelude::*;
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn build(config: DictionaryConfig, source: Arc<dyn DictionarySource>) -> Dictionary {
    let structure = config.structure.resolve().unwrap();
    let layout = LayoutRegistry::global()
        .create(LayoutArgs {
            name: &config.name,
            structure: &structure,
            config: &config.layout,
            lifetime: config.lifetime(),
        })
        .unwrap();
    Dictionary::from_parts(config, structure, source, layout).unwrap()
}

/// One expected lookup: key, optional range point, attributes.
type Probe = (Key, Option<Value>, Attributes);

async fn check_roundtrip(
    config: DictionaryConfig,
    rows: Vec<Row>,
    probes: Vec<Probe>,
) -> Result<(), TestCaseError> {
    let dict = build(config, Arc::new(MemorySource::new(rows)));
    dict.load()
        .await
        .map_err(|e| TestCaseError::fail(format!("load failed: {}", e)))?;

    for (key, point, expected) in probes {
        let got = match &point {
            Some(point) => dict.get_in_range(&key, point).await,
            None => dict.get(&key).await,
        }
        .map_err(|e| TestCaseError::fail(format!("lookup {} failed: {}", key, e)))?;
        prop_assert_eq!(got, expected);
    }
    Ok(())
}

/// Every row is probed by its own key.
fn probe_keys(rows: &[Row]) -> Vec<Probe> {
    rows.iter()
        .map(|row| (row.key.clone(), None, Attributes::new(row.values.clone())))
        .collect()
}

// ============================================================================
// PROPERTY TEST STRATEGIES
// ============================================================================

/// Distinct `/24` networks, each labeled.
fn network_strategy() -> impl Strategy<Value = Vec<((u8, u8, u8), String)>> {
    prop::collection::btree_map((any::<u8>(), any::<u8>(), any::<u8>()), arb_label(), 1..40)
        .prop_map(|m| m.into_iter().collect())
}

/// Distinct cells of a 20x20 grid, each labeled.
fn grid_strategy() -> impl Strategy<Value = Vec<((u8, u8), String)>> {
    prop::collection::btree_map((0u8..20, 0u8..20), arb_label(), 1..30)
        .prop_map(|m| m.into_iter().collect())
}

fn square(x: u8, y: u8) -> Polygon {
    let (x0, y0) = (f64::from(x) * 10.0 + 1.0, f64::from(y) * 10.0 + 1.0);
    let (x1, y1) = (x0 + 8.0, y0 + 8.0);
    Polygon::new(vec![
        Point::new(x0, y0),
        Point::new(x1, y0),
        Point::new(x1, y1),
        Point::new(x0, y1),
    ])
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_hashed_roundtrip(rows in arb_simple_rows(10_000, 64)) {
        let config = labels_config("hashed", KeyModel::simple("id"), LayoutConfig::new("hashed"));
        let probes = probe_keys(&rows);
        test_runtime()?.block_on(check_roundtrip(config, rows, probes))?;
    }

    #[test]
    fn prop_flat_roundtrip(rows in arb_simple_rows(500, 64)) {
        let config = labels_config("flat", KeyModel::simple("id"), LayoutConfig::new("flat"));
        let probes = probe_keys(&rows);
        test_runtime()?.block_on(check_roundtrip(config, rows, probes))?;
    }

    #[test]
    fn prop_complex_key_hashed_roundtrip(rows in arb_complex_rows(64)) {
        let config = labels_config(
            "zips",
            code_number_key(),
            LayoutConfig::new("complex_key_hashed"),
        );
        let probes = probe_keys(&rows);
        test_runtime()?.block_on(check_roundtrip(config, rows, probes))?;
    }

    #[test]
    fn prop_cache_roundtrip(rows in arb_simple_rows(10_000, 64)) {
        let config = labels_config(
            "cached",
            KeyModel::simple("id"),
            LayoutConfig::new("cache").with_param("size_in_cells", 1024),
        );
        let probes = probe_keys(&rows);
        test_runtime()?.block_on(check_roundtrip(config, rows, probes))?;
    }

    #[test]
    fn prop_range_hashed_roundtrip(rows in arb_range_rows(8)) {
        let mut config = labels_config("rates", KeyModel::simple("id"), LayoutConfig::new("range_hashed"));
        config.structure = config.structure.clone().with_range("start", "end", AttributeType::Int64);
        let probes = rows
            .iter()
            .flat_map(|row| {
                let range = row.range.clone().unwrap();
                let attrs = Attributes::new(row.values.clone());
                [
                    (row.key.clone(), Some(range.start), attrs.clone()),
                    (row.key.clone(), Some(range.end), attrs),
                ]
            })
            .collect();
        test_runtime()?.block_on(check_roundtrip(config, rows, probes))?;
    }

    #[test]
    fn prop_trie_roundtrip(networks in network_strategy()) {
        let config = labels_config(
            "networks",
            KeyModel::Complex(vec![KeyField::new("prefix", AttributeType::String)]),
            LayoutConfig::new("trie"),
        );
        let mut rows = Vec::new();
        let mut probes = Vec::new();
        for ((a, b, c), name) in networks {
            rows.push(Row::new(
                Key::complex([Value::from(format!("{a}.{b}.{c}.0/24"))]),
                vec![Value::from(name.as_str())],
            ));
            probes.push((
                Key::complex([Value::from(format!("{a}.{b}.{c}.77"))]),
                None,
                label(&name),
            ));
        }
        test_runtime()?.block_on(check_roundtrip(config, rows, probes))?;
    }

    #[test]
    fn prop_polygon_roundtrip(cells in grid_strategy()) {
        let config = labels_config(
            "areas",
            KeyModel::Complex(vec![KeyField::new("area", AttributeType::Polygon)]),
            LayoutConfig::new("polygon"),
        );
        let mut rows = Vec::new();
        let mut probes = Vec::new();
        for ((x, y), name) in cells {
            rows.push(Row::new(
                Key::complex([Value::from(square(x, y))]),
                vec![Value::from(name.as_str())],
            ));
            let (cx, cy) = (f64::from(x) * 10.0 + 5.0, f64::from(y) * 10.0 + 5.0);
            probes.push((
                Key::complex([Value::Float64(cx), Value::Float64(cy)]),
                None,
                label(&name),
            ));
        }
        test_runtime()?.block_on(check_roundtrip(config, rows, probes))?;
    }
}

// ============================================================================
// LAYOUT-SPECIFIC PROPERTIES
// ============================================================================

#[tokio::test]
async fn trie_prefers_the_longest_prefix() {
    let config = labels_config(
        "networks",
        KeyModel::Complex(vec![KeyField::new("prefix", AttributeType::String)]),
        LayoutConfig::new("trie"),
    );
    let rows = vec![
        Row::new(Key::complex([Value::from("10.0.0.0/8")]), vec![Value::from("corp")]),
        Row::new(Key::complex([Value::from("10.1.0.0/16")]), vec![Value::from("lab")]),
    ];
    let dict = build(config, Arc::new(MemorySource::new(rows)));
    dict.load().await.unwrap();

    let lookup = |ip: &str| Key::complex([Value::from(ip)]);
    assert_eq!(dict.get(&lookup("10.1.2.3")).await.unwrap(), label("lab"));
    assert_eq!(dict.get(&lookup("10.2.0.1")).await.unwrap(), label("corp"));
    assert!(!dict.has(&lookup("192.168.0.1")).await.unwrap());
}

#[tokio::test]
async fn overlapping_ranges_fail_the_load() {
    let mut config = labels_config("rates", KeyModel::simple("id"), LayoutConfig::new("range_hashed"));
    config.structure = config.structure.clone().with_range("start", "end", AttributeType::Int64);
    let rows = vec![
        Row::new(1u64, vec![Value::from("a")]).with_range(Interval::new(0i64, 10i64)),
        Row::new(1u64, vec![Value::from("b")]).with_range(Interval::new(5i64, 20i64)),
    ];
    let dict = build(config, Arc::new(MemorySource::new(rows)));
    let result = dict.load().await;
    dictum_test_utils::assertions::assert_source_data_error(&result);
    assert!(!dict.is_loaded());
}

#[tokio::test]
async fn flat_rejects_keys_beyond_max_array_size() {
    let config = labels_config(
        "small",
        KeyModel::simple("id"),
        LayoutConfig::new("flat").with_param("max_array_size", 10),
    );
    let rows = vec![
        Row::new(3u64, vec![Value::from("ok")]),
        Row::new(10u64, vec![Value::from("too far")]),
    ];
    let dict = build(config, Arc::new(MemorySource::new(rows)));
    dictum_test_utils::assertions::assert_source_data_error(&dict.load().await);
}

#[tokio::test]
async fn cache_reloads_an_evicted_key_once() {
    let rows: Vec<Row> = (1..=4u64)
        .map(|id| Row::new(id, vec![Value::from(format!("v{id}"))]))
        .collect();
    let (source, dynamic) = shared(CountingSource::new(rows));
    let config = labels_config(
        "cached",
        KeyModel::simple("id"),
        LayoutConfig::new("cache").with_param("size_in_cells", 3),
    );
    let dict = build(config, dynamic);
    dict.load().await.unwrap();

    for id in 1..=4u64 {
        dict.get(&Key::Simple(id)).await.unwrap();
    }
    assert_eq!(source.calls().load_ids, 4);

    // Key 1 was least recently used and is gone; 4 is still resident.
    dict.get(&Key::Simple(4)).await.unwrap();
    assert_eq!(source.calls().load_ids, 4);
    assert_eq!(dict.get(&Key::Simple(1)).await.unwrap(), label("v1"));
    assert_eq!(source.calls().load_ids, 5);
    assert_eq!(source.calls().load_all, 0);
}

#[tokio::test(start_paused = true)]
async fn cache_single_flight_under_concurrency() {
    let (source, dynamic) = shared(
        CountingSource::new(vec![Row::new(7u64, vec![Value::from("seven")])])
            .with_delay(Duration::from_millis(50)),
    );
    let config = labels_config(
        "cached",
        KeyModel::simple("id"),
        LayoutConfig::new("cache").with_param("size_in_cells", 16),
    );
    let dict = build(config, dynamic);

    let key = Key::Simple(7);
    let results = join_all((0..8).map(|_| dict.get(&key))).await;
    assert_eq!(source.calls().load_ids, 1);
    for result in results {
        assert_eq!(result.unwrap(), label("seven"));
    }
}
