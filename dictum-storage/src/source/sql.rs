//! SQL-backed sources (`mysql`, `clickhouse`, `odbc`, `jdbc`).
//!
//! The engine builds the queries; connection I/O belongs to a
//! [`SqlConnector`] collaborator registered in the
//! [`SourceContext`](super::SourceContext) under the source kind.

use std::sync::Arc;

use async_trait::async_trait;
use dictum_core::{
    ConfigError, DictionaryStructure, Key, KeyModel, SourceError, Timestamp, Value,
};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{decode_stream, DictionarySource, RowStream, SourceArgs};

/// Executes one query and returns raw rows in select-list order.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<Vec<Value>>, SourceError>;
}

/// How identifiers are quoted in generated SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStyle {
    /// `` `name` `` (MySQL, ClickHouse)
    Backticks,
    /// `"name"` (ANSI: ODBC, JDBC)
    DoubleQuotes,
}

impl QuoteStyle {
    pub fn for_kind(kind: &str) -> Self {
        match kind {
            "mysql" | "clickhouse" => Self::Backticks,
            _ => Self::DoubleQuotes,
        }
    }

    pub fn quote(&self, identifier: &str) -> String {
        match self {
            Self::Backticks => format!("`{}`", identifier.replace('`', "``")),
            Self::DoubleQuotes => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    /// Render a value as an SQL literal. MySQL and ClickHouse take
    /// backslash escapes in strings; ANSI dialects only double the quote.
    pub fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::UInt64(_) | Value::Int64(_) | Value::Float64(_) | Value::Bool(_) => {
                value.to_string()
            }
            other => {
                let text = other.to_string();
                match self {
                    Self::Backticks => {
                        format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
                    }
                    Self::DoubleQuotes => format!("'{}'", text.replace('\'', "''")),
                }
            }
        }
    }
}

/// Builds the `SELECT`s issued against an external table.
#[derive(Debug, Clone)]
pub struct ExternalQueryBuilder {
    style: QuoteStyle,
    db: Option<String>,
    schema: Option<String>,
    table: String,
    where_clause: Option<String>,
    update_field: Option<String>,
    columns: Vec<String>,
    key: KeyModel,
}

impl ExternalQueryBuilder {
    pub fn new(style: QuoteStyle, table: impl Into<String>, structure: &DictionaryStructure) -> Self {
        Self {
            style,
            db: None,
            schema: None,
            table: table.into(),
            where_clause: None,
            update_field: None,
            columns: structure.column_names().into_iter().map(str::to_string).collect(),
            key: structure.key.clone(),
        }
    }

    pub fn with_db(mut self, db: impl Into<String>) -> Self {
        self.db = Some(db.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_where(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    pub fn with_update_field(mut self, field: impl Into<String>) -> Self {
        self.update_field = Some(field.into());
        self
    }

    fn select_from(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| self.style.quote(c)).collect();
        let mut table = String::new();
        for part in [&self.db, &self.schema].into_iter().flatten() {
            table.push_str(&self.style.quote(part));
            table.push('.');
        }
        table.push_str(&self.style.quote(&self.table));
        format!("SELECT {} FROM {}", columns.join(", "), table)
    }

    fn with_conditions(&self, extra: Option<String>) -> String {
        let mut sql = self.select_from();
        let conditions: Vec<String> = self
            .where_clause
            .iter()
            .map(|w| format!("({w})"))
            .chain(extra)
            .collect();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push(';');
        sql
    }

    pub fn load_all_query(&self) -> String {
        self.with_conditions(None)
    }

    pub fn load_update_query(&self, since: Timestamp) -> String {
        match &self.update_field {
            Some(field) => self.with_conditions(Some(format!(
                "{} >= {}",
                self.style.quote(field),
                self.style.literal(&Value::DateTime(since))
            ))),
            None => self.load_all_query(),
        }
    }

    /// `WHERE key IN (...)`, or a tuple `IN` for composite keys.
    pub fn load_ids_query(&self, keys: &[Key]) -> String {
        let names = self.key.field_names();
        let condition = if self.key.is_complex() {
            let columns: Vec<String> = names.iter().map(|n| self.style.quote(n)).collect();
            let tuples: Vec<String> = keys
                .iter()
                .map(|key| {
                    let values: Vec<String> = key
                        .to_values()
                        .iter()
                        .map(|v| self.style.literal(v))
                        .collect();
                    format!("({})", values.join(", "))
                })
                .collect();
            format!("({}) IN ({})", columns.join(", "), tuples.join(", "))
        } else {
            let ids: Vec<String> = keys
                .iter()
                .filter_map(Key::as_simple)
                .map(|id| id.to_string())
                .collect();
            format!("{} IN ({})", self.style.quote(names[0]), ids.join(", "))
        };
        self.with_conditions(Some(condition))
    }
}


#[derive(Debug, Deserialize)]
struct SqlParams {
    #[serde(default)]
    db: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    /// Replaces the generated full-load query.
    #[serde(default)]
    query: Option<String>,
    #[serde(default, rename = "where")]
    where_clause: Option<String>,
    #[serde(default)]
    invalidate_query: Option<String>,
}

pub struct SqlSource {
    kind: String,
    connector: Arc<dyn SqlConnector>,
    builder: ExternalQueryBuilder,
    custom_query: Option<String>,
    invalidate_query: Option<String>,
    last_invalidate_digest: Mutex<Option<[u8; 32]>>,
    structure: Arc<DictionaryStructure>,
}

impl SqlSource {
    pub fn new(
        kind: impl Into<String>,
        connector: Arc<dyn SqlConnector>,
        builder: ExternalQueryBuilder,
        structure: DictionaryStructure,
    ) -> Self {
        Self {
            kind: kind.into(),
            connector,
            builder,
            custom_query: None,
            invalidate_query: None,
            last_invalidate_digest: Mutex::new(None),
            structure: Arc::new(structure),
        }
    }

    pub fn with_invalidate_query(mut self, query: impl Into<String>) -> Self {
        self.invalidate_query = Some(query.into());
        self
    }

    pub fn from_args(args: SourceArgs<'_>) -> Result<Arc<dyn DictionarySource>, ConfigError> {
        let kind = args.config.kind.as_str();
        let connector = args
            .context
            .sql_connector(kind)
            .ok_or_else(|| ConfigError::MissingRequired {
                field: format!("source.{kind}.connector"),
            })?;
        let params: SqlParams = args.config.params_as()?;
        let table = match (&params.table, &params.query) {
            (Some(table), _) => table.clone(),
            (None, Some(_)) => String::new(),
            (None, None) => {
                return Err(ConfigError::MissingRequired {
                    field: format!("source.{kind}.table"),
                })
            }
        };

        let mut builder = ExternalQueryBuilder::new(QuoteStyle::for_kind(kind), table, args.structure);
        if let Some(db) = params.db {
            builder = builder.with_db(db);
        }
        if let Some(schema) = params.schema {
            builder = builder.with_schema(schema);
        }
        if let Some(clause) = params.where_clause {
            builder = builder.with_where(clause);
        }
        if let Some(field) = args.update_field {
            builder = builder.with_update_field(field);
        }

        let mut source = Self::new(kind, connector, builder, args.structure.clone());
        source.custom_query = params.query;
        source.invalidate_query = params.invalidate_query;
        Ok(Arc::new(source))
    }

    async fn run(&self, sql: &str) -> Result<RowStream, SourceError> {
        tracing::debug!(source = %self.kind, query = sql, "Running dictionary query");
        let raw = self.connector.query(sql).await?;
        Ok(decode_stream(Arc::clone(&self.structure), raw))
    }
}

fn digest_rows(rows: &[Vec<Value>]) -> [u8; 32] {
    let mut buf = Vec::new();
    for row in rows {
        buf.extend_from_slice(&(row.len() as u64).to_be_bytes());
        for value in row {
            value.write_canonical(&mut buf);
        }
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(&buf));
    out
}

#[async_trait]
impl DictionarySource for SqlSource {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn describe(&self) -> String {
        match &self.custom_query {
            Some(query) => format!("{} query {query:?}", self.kind),
            None => format!("{} {}", self.kind, self.builder.load_all_query()),
        }
    }

    async fn load_all(&self) -> Result<RowStream, SourceError> {
        match &self.custom_query {
            Some(query) => self.run(query).await,
            None => self.run(&self.builder.load_all_query()).await,
        }
    }

    async fn load_ids(&self, keys: &[Key]) -> Result<RowStream, SourceError> {
        if self.custom_query.is_some() {
            return Err(SourceError::unsupported(&self.kind, "load_ids with a custom query"));
        }
        if keys.is_empty() {
            return Ok(decode_stream(Arc::clone(&self.structure), Vec::new()));
        }
        self.run(&self.builder.load_ids_query(keys)).await
    }

    async fn load_updated_after(&self, since: Timestamp) -> Result<RowStream, SourceError> {
        if !self.supports_incremental_load() {
            return Err(SourceError::unsupported(&self.kind, "load_updated_after"));
        }
        self.run(&self.builder.load_update_query(since)).await
    }

    fn supports_selective_load(&self) -> bool {
        self.custom_query.is_none()
    }

    fn supports_incremental_load(&self) -> bool {
        self.custom_query.is_none() && self.builder.update_field.is_some()
    }

    /// Runs `invalidate_query` and compares a digest of its result with the
    /// previous probe. Without an invalidate query the source always reports
    /// modified.
    async fn is_modified(&self) -> Result<bool, SourceError> {
        let Some(query) = &self.invalidate_query else {
            return Ok(true);
        };
        let rows = self.connector.query(query).await?;
        let digest = digest_rows(&rows);
        let mut last = self.last_invalidate_digest.lock();
        let modified = last.as_ref() != Some(&digest);
        *last = Some(digest);
        Ok(modified)
    }
}

impl std::fmt::Debug for SqlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSource")
            .field("kind", &self.kind)
            .field("builder", &self.builder)
            .field("custom_query", &self.custom_query)
            .field("invalidate_query", &self.invalidate_query)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{collect_rows, SourceContext};
    use chrono::TimeZone;
    use dictum_core::{AttributeSpec, AttributeType, KeyField, SourceConfig};

    fn simple() -> DictionaryStructure {
        DictionaryStructure::new(
            KeyModel::simple("id"),
            vec![AttributeSpec::new("name", AttributeType::String)],
        )
    }

    fn composite() -> DictionaryStructure {
        DictionaryStructure::new(
            KeyModel::Complex(vec![
                KeyField::new("country", AttributeType::String),
                KeyField::new("zip", AttributeType::UInt64),
            ]),
            vec![AttributeSpec::new("city", AttributeType::String)],
        )
    }

    /// Answers every query with a fixed result and records what it saw.
    struct Recorder {
        rows: Mutex<Vec<Vec<Value>>>,
        queries: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(rows: Vec<Vec<Value>>) -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(rows),
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SqlConnector for Recorder {
        async fn query(&self, sql: &str) -> Result<Vec<Vec<Value>>, SourceError> {
            self.queries.lock().push(sql.to_string());
            Ok(self.rows.lock().clone())
        }
    }

    #[test]
    fn test_simple_key_queries_with_backticks() {
        let builder = ExternalQueryBuilder::new(QuoteStyle::for_kind("mysql"), "regions", &simple())
            .with_db("geo")
            .with_where("active = 1");
        assert_eq!(
            builder.load_all_query(),
            "SELECT `id`, `name` FROM `geo`.`regions` WHERE (active = 1);"
        );
        assert_eq!(
            builder.load_ids_query(&[Key::Simple(1), Key::Simple(2)]),
            "SELECT `id`, `name` FROM `geo`.`regions` WHERE (active = 1) AND `id` IN (1, 2);"
        );
    }

    #[test]
    fn test_composite_key_uses_tuple_in_with_double_quotes() {
        let builder = ExternalQueryBuilder::new(QuoteStyle::for_kind("odbc"), "zips", &composite())
            .with_schema("public");
        let keys = [
            Key::complex([Value::from("DE"), Value::UInt64(10115)]),
            Key::complex([Value::from("O'Hare"), Value::UInt64(1)]),
        ];
        assert_eq!(
            builder.load_ids_query(&keys),
            "SELECT \"country\", \"zip\", \"city\" FROM \"public\".\"zips\" \
             WHERE (\"country\", \"zip\") IN (('DE', 10115), ('O''Hare', 1));"
        );
    }

    #[test]
    fn test_update_query_filters_by_update_field() {
        let builder = ExternalQueryBuilder::new(QuoteStyle::Backticks, "regions", &simple())
            .with_update_field("updated_at");
        let since = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            builder.load_update_query(since),
            "SELECT `id`, `name` FROM `regions` WHERE `updated_at` >= '2024-03-01 12:00:00';"
        );
    }

    #[test]
    fn test_string_literals_follow_dialect() {
        let value = Value::from("O'Hare \\ gate");
        assert_eq!(QuoteStyle::Backticks.literal(&value), "'O\\'Hare \\\\ gate'");
        assert_eq!(QuoteStyle::DoubleQuotes.literal(&value), "'O''Hare \\ gate'");
        assert_eq!(QuoteStyle::DoubleQuotes.literal(&Value::Null), "NULL");
        assert_eq!(QuoteStyle::Backticks.literal(&Value::UInt64(7)), "7");
    }

    #[test]
    fn test_identifier_quotes_are_escaped() {
        assert_eq!(QuoteStyle::Backticks.quote("we`ird"), "`we``ird`");
        assert_eq!(QuoteStyle::DoubleQuotes.quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_invalidate_query_digest() {
        let recorder = Recorder::new(vec![vec![Value::UInt64(1)]]);
        let builder = ExternalQueryBuilder::new(QuoteStyle::Backticks, "regions", &simple());
        let source = SqlSource::new("mysql", recorder.clone(), builder, simple())
            .with_invalidate_query("SELECT max(updated_at) FROM regions");

        assert!(source.is_modified().await.unwrap());
        assert!(!source.is_modified().await.unwrap());
        *recorder.rows.lock() = vec![vec![Value::UInt64(2)]];
        assert!(source.is_modified().await.unwrap());
    }

    #[tokio::test]
    async fn test_rows_decode_through_structure() {
        let recorder = Recorder::new(vec![vec![Value::Int64(4), Value::from("four")]]);
        let builder = ExternalQueryBuilder::new(QuoteStyle::Backticks, "regions", &simple());
        let source = SqlSource::new("clickhouse", recorder.clone(), builder, simple());
        let rows = collect_rows(source.load_ids(&[Key::Simple(4)]).await.unwrap())
            .await
            .unwrap();
        assert_eq!(rows[0].key, Key::Simple(4));
        assert_eq!(recorder.queries.lock().len(), 1);
    }

    #[test]
    fn test_missing_connector_is_config_error() {
        let structure = simple();
        let config = SourceConfig::new("mysql").with_param("table", "regions");
        let context = SourceContext::new();
        let result = SqlSource::from_args(SourceArgs {
            config: &config,
            structure: &structure,
            update_field: None,
            context: &context,
        });
        assert!(matches!(result, Err(ConfigError::MissingRequired { .. })));
    }
}
