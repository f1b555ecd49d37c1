//! End-to-end catalog tests: TOML declarations, file sources and
//! background refresh.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dictum_storage::{
    DictionaryCatalog, DictionarySource, LayoutKind, LayoutRegistry, LayoutState, RefreshOutcome,
    SchedulerConfig, SourceArgs, SourceRegistry,
};
use dictum_test_utils::assertions::*;
use dictum_test_utils::*;

fn write_file(path: &Path, contents: &str, age: Duration) {
    fs::write(path, contents).unwrap();
    // Push the mtime apart so coarse filesystem clocks still see a change.
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + age).unwrap();
}

fn regions_toml(path: &Path) -> String {
    format!(
        r#"
name = "regions"

[structure]
key = {{ simple = "id" }}

[[structure.attributes]]
name = "name"
type = "String"
null_value = "unknown"

[[structure.attributes]]
name = "parent"
type = "UInt64"
null_value = 0
hierarchical = true

[source]
kind = "file"
path = "{}"
format = "TabSeparated"

[layout]
kind = "hashed"
"#,
        path.display()
    )
}

#[tokio::test]
async fn file_dictionary_declared_in_toml() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("regions.tsv");
    write_file(&path, "1\tworld\t0\n2\teurope\t1\n3\tfrance\t2\n", Duration::ZERO);

    let catalog = DictionaryCatalog::new();
    catalog.create_from_toml(&regions_toml(&path)).await.unwrap();

    let key = Key::Simple(3);
    assert_eq!(
        catalog.dict_get("regions", "name", &key).await.unwrap(),
        Value::from("france")
    );
    assert_eq!(
        catalog
            .dict_get_or_default("regions", "name", &Key::Simple(42), None)
            .await
            .unwrap(),
        Value::from("unknown")
    );
    assert_eq!(
        catalog.dict_get_hierarchy("regions", 3).await.unwrap(),
        vec![3, 2, 1]
    );
    assert!(catalog.dict_is_in("regions", 3, 1).await.unwrap());

    let info = &catalog.list()[0];
    assert_eq!(info.layout, LayoutKind::Hashed);
    assert_eq!(info.state, LayoutState::Ready);
    assert_eq!(info.element_count, 3);
    assert!(info.loaded_at.is_some());
    assert!(info.source.starts_with("file"));

    // Unchanged file: nothing to do.
    assert_eq!(
        catalog.reload("regions").await.unwrap(),
        RefreshOutcome::Unchanged
    );

    write_file(
        &path,
        "1\tworld\t0\n2\teurope\t1\n3\tfrance\t2\n4\tparis\t3\n",
        Duration::from_secs(10),
    );
    assert!(matches!(
        catalog.reload("regions").await.unwrap(),
        RefreshOutcome::Published { generation: 2, elements: 4 }
    ));
    assert!(catalog.dict_has("regions", &Key::Simple(4)).await.unwrap());
}

#[tokio::test]
async fn malformed_file_keeps_serving_previous_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("regions.tsv");
    write_file(&path, "1\tworld\t0\n", Duration::ZERO);

    let catalog = DictionaryCatalog::new();
    catalog.create_from_toml(&regions_toml(&path)).await.unwrap();

    write_file(&path, "1\tworld\t0\n2\teurope\n", Duration::from_secs(10));
    assert_source_data_error(&catalog.reload("regions").await);
    assert_eq!(
        catalog.dict_get("regions", "name", &Key::Simple(1)).await.unwrap(),
        Value::from("world")
    );
    assert!(!catalog.dict_has("regions", &Key::Simple(2)).await.unwrap());
}

#[tokio::test]
async fn json_range_dictionary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rates.jsonl");
    write_file(
        &path,
        concat!(
            r#"{"id": 1, "start": 0, "end": 9, "rate": "low"}"#,
            "\n",
            r#"{"id": 1, "start": 10, "end": 99, "rate": "high"}"#,
            "\n",
        ),
        Duration::ZERO,
    );
    let text = format!(
        r#"
name = "rates"

[structure]
key = {{ simple = "id" }}
range = {{ min = "start", max = "end", type = "Int64" }}

[[structure.attributes]]
name = "rate"
type = "String"

[source]
kind = "file"
path = "{}"
format = "JSONEachRow"

[layout]
kind = "range_hashed"
"#,
        path.display()
    );

    let catalog = DictionaryCatalog::new();
    catalog.create_from_toml(&text).await.unwrap();

    let key = Key::Simple(1);
    let at = |point: i64| Value::Int64(point);
    assert_eq!(
        catalog.dict_get_in_range("rates", "rate", &key, &at(9)).await.unwrap(),
        Value::from("low")
    );
    assert_eq!(
        catalog.dict_get_in_range("rates", "rate", &key, &at(10)).await.unwrap(),
        Value::from("high")
    );
    assert_not_found(&catalog.dict_get_in_range("rates", "rate", &key, &at(100)).await);
}

/// Catalog whose `shared` source kind always hands out `source`.
fn catalog_over(source: Arc<CountingSource>, scheduler: SchedulerConfig) -> DictionaryCatalog {
    let sources = SourceRegistry::with_builtins();
    sources
        .register(
            "shared",
            Arc::new(move |_args: SourceArgs<'_>| {
                Ok(source.clone() as Arc<dyn DictionarySource>)
            }),
        )
        .unwrap();
    DictionaryCatalog::with_registries(Arc::new(sources), Arc::new(LayoutRegistry::with_builtins()))
        .with_scheduler(scheduler)
}

fn shared_config(lifetime_secs: u64) -> DictionaryConfig {
    let mut config = fixtures::regions_config(LayoutConfig::new("hashed"))
        .with_lifetime(lifetime_secs, lifetime_secs);
    config.source = SourceConfig::new("shared");
    config
}

#[tokio::test(start_paused = true)]
async fn scheduler_picks_up_source_changes() {
    let source = Arc::new(CountingSource::new(fixtures::world_regions()));
    let mut catalog = catalog_over(source.clone(), SchedulerConfig::default());
    catalog.create(shared_config(5)).await.unwrap();

    source.data().upsert(fixtures::region(6, "oceania", 1));
    tokio::time::sleep(Duration::from_secs(12)).await;

    assert!(catalog.dict_has("regions", &Key::Simple(6)).await.unwrap());
    let metrics = catalog.scheduler().unwrap().metrics();
    assert!(metrics.refreshes_succeeded >= 1);
    catalog.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scheduler_retries_failed_initial_load() {
    let source = Arc::new(CountingSource::new(fixtures::world_regions()));
    source.set_failure(Some(SourceError::unavailable("shared", "connection refused")));
    let mut catalog = catalog_over(source.clone(), SchedulerConfig::default());

    let dict = catalog.create(shared_config(300)).await.unwrap();
    assert!(!dict.is_loaded());
    assert_not_loaded(&catalog.dict_get("regions", "name", &Key::Simple(1)).await);

    source.set_failure(None);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(dict.is_loaded());
    assert_eq!(
        catalog.dict_get("regions", "name", &Key::Simple(1)).await.unwrap(),
        Value::from("world")
    );
    let snapshot = catalog.scheduler().unwrap().metrics();
    assert_eq!(snapshot.refreshes_failed, 0);
    assert_eq!(snapshot.refreshes_succeeded, 1);
    catalog.shutdown().await;
}

#[tokio::test]
async fn removed_dictionary_is_unknown() {
    let catalog = DictionaryCatalog::new();
    let text = r#"
name = "colors"
[structure]
key = { simple = "id" }
[[structure.attributes]]
name = "name"
type = "String"
[source]
kind = "memory"
rows = [[1, "red"], [2, "green"]]
[layout]
kind = "flat"
"#;
    catalog.create_from_toml(text).await.unwrap();
    assert_eq!(
        catalog.dict_get("colors", "name", &Key::Simple(2)).await.unwrap(),
        Value::from("green")
    );
    let keys = [Key::Simple(2), Key::Simple(9), Key::Simple(1)];
    assert_eq!(
        catalog.dict_get_many("colors", "name", &keys).await.unwrap(),
        vec![Some(Value::from("green")), None, Some(Value::from("red"))]
    );

    catalog.remove("colors").await.unwrap();
    let result = catalog.dict_get("colors", "name", &Key::Simple(2)).await;
    assert!(dictum_storage::is_unknown_dictionary(&result));
    assert!(catalog.list().is_empty());
}
