//! In-process source.
//!
//! Rows live in memory, either declared in configuration (`rows`, one JSON
//! array per row in column order) or pushed programmatically. Every
//! mutation bumps a version; `is_modified` reports whether the version moved
//! since the last load observed it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dictum_core::{ConfigError, DictionaryStructure, Key, Row, SourceError, Timestamp, Value};
use parking_lot::RwLock;
use serde::Deserialize;

use super::{rows_stream, DictionarySource, RowStream, SourceArgs};

#[derive(Debug, Clone)]
struct StoredRow {
    row: Row,
    updated_at: Timestamp,
}

#[derive(Debug, Default)]
pub struct MemorySource {
    rows: RwLock<Vec<StoredRow>>,
    version: AtomicU64,
    observed_version: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct MemoryParams {
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

impl MemorySource {
    pub fn new(rows: Vec<Row>) -> Self {
        let source = Self::default();
        source.replace(rows);
        source
    }

    pub fn from_args(args: SourceArgs<'_>) -> Result<Arc<dyn DictionarySource>, ConfigError> {
        let params: MemoryParams = args.config.params_as()?;
        let rows = decode_config_rows(args.structure, &params.rows)?;
        Ok(Arc::new(Self::new(rows)))
    }

    /// Replace the whole dataset.
    pub fn replace(&self, rows: Vec<Row>) {
        let now = Utc::now();
        *self.rows.write() = rows
            .into_iter()
            .map(|row| StoredRow { row, updated_at: now })
            .collect();
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Insert or overwrite the rows of one key (and range, if any).
    pub fn upsert(&self, row: Row) {
        let now = Utc::now();
        let mut rows = self.rows.write();
        rows.retain(|stored| !(stored.row.key == row.key && stored.row.range == row.range));
        rows.push(StoredRow { row, updated_at: now });
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Append a row without replacing earlier rows of the same key.
    pub fn push(&self, row: Row) {
        self.rows.write().push(StoredRow {
            row,
            updated_at: Utc::now(),
        });
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn observe(&self) {
        self.observed_version
            .store(self.version.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn snapshot(&self, filter: impl Fn(&StoredRow) -> bool) -> RowStream {
        let rows: Vec<_> = self
            .rows
            .read()
            .iter()
            .filter(|stored| filter(stored))
            .map(|stored| Ok(stored.row.clone()))
            .collect();
        rows_stream(rows)
    }
}

fn decode_config_rows(
    structure: &DictionaryStructure,
    rows: &[Vec<serde_json::Value>],
) -> Result<Vec<Row>, ConfigError> {
    let types = structure.column_types();
    rows.iter()
        .map(|cells| {
            let invalid = |reason: String| {
                ConfigError::invalid("source.memory.rows", serde_json::Value::Array(cells.clone()), &reason)
            };
            if cells.len() != types.len() {
                return Err(invalid(format!("expected {} cells", types.len())));
            }
            let raw = cells
                .iter()
                .zip(&types)
                .map(|(cell, ty)| Value::from_json(*ty, cell))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| invalid(e.to_string()))?;
            structure.decode_row(raw).map_err(|e| invalid(e.to_string()))
        })
        .collect()
}

#[async_trait]
impl DictionarySource for MemorySource {
    fn kind(&self) -> &str {
        "memory"
    }

    fn describe(&self) -> String {
        format!("memory ({} rows)", self.len())
    }

    async fn load_all(&self) -> Result<RowStream, SourceError> {
        self.observe();
        Ok(self.snapshot(|_| true))
    }

    async fn load_ids(&self, keys: &[Key]) -> Result<RowStream, SourceError> {
        let wanted: HashSet<&Key> = keys.iter().collect();
        Ok(self.snapshot(|stored| wanted.contains(&stored.row.key)))
    }

    async fn load_updated_after(&self, since: Timestamp) -> Result<RowStream, SourceError> {
        self.observe();
        Ok(self.snapshot(|stored| stored.updated_at >= since))
    }

    fn supports_selective_load(&self) -> bool {
        true
    }

    fn supports_incremental_load(&self) -> bool {
        true
    }

    async fn is_modified(&self) -> Result<bool, SourceError> {
        Ok(self.version.load(Ordering::SeqCst) != self.observed_version.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{collect_rows, SourceContext};
    use dictum_core::{AttributeSpec, AttributeType, KeyModel, SourceConfig};

    fn structure() -> DictionaryStructure {
        DictionaryStructure::new(
            KeyModel::simple("id"),
            vec![AttributeSpec::new("name", AttributeType::String)],
        )
    }

    #[tokio::test]
    async fn test_version_drives_is_modified() {
        let source = MemorySource::new(vec![Row::new(1u64, vec![Value::from("a")])]);
        assert!(source.is_modified().await.unwrap());
        let rows = collect_rows(source.load_all().await.unwrap()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!source.is_modified().await.unwrap());

        source.upsert(Row::new(1u64, vec![Value::from("b")]));
        assert!(source.is_modified().await.unwrap());
        assert_eq!(source.len(), 1);
    }

    #[tokio::test]
    async fn test_load_ids_filters() {
        let source = MemorySource::new(vec![
            Row::new(1u64, vec![Value::from("a")]),
            Row::new(2u64, vec![Value::from("b")]),
        ]);
        let rows = collect_rows(source.load_ids(&[Key::Simple(2), Key::Simple(9)]).await.unwrap())
            .await
            .unwrap();
        assert_eq!(rows, vec![Row::new(2u64, vec![Value::from("b")])]);
    }

    #[tokio::test]
    async fn test_updated_after_returns_recent_rows_only() {
        let source = MemorySource::new(vec![Row::new(1u64, vec![Value::from("a")])]);
        let cutoff = Utc::now() + chrono::Duration::milliseconds(1);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        source.upsert(Row::new(2u64, vec![Value::from("b")]));
        let rows = collect_rows(source.load_updated_after(cutoff).await.unwrap())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, Key::Simple(2));
    }

    #[test]
    fn test_rows_from_config() {
        let structure = structure();
        let config = SourceConfig::new("memory").with_param(
            "rows",
            serde_json::json!([[1, "one"], [2, null]]),
        );
        let context = SourceContext::new();
        let args = SourceArgs {
            config: &config,
            structure: &structure,
            update_field: None,
            context: &context,
        };
        assert!(MemorySource::from_args(args).is_ok());

        let bad = SourceConfig::new("memory").with_param("rows", serde_json::json!([[1]]));
        let args = SourceArgs {
            config: &bad,
            structure: &structure,
            update_field: None,
            context: &context,
        };
        assert!(MemorySource::from_args(args).is_err());
    }
}
