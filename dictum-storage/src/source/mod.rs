//! Dictionary sources.
//!
//! A source is a bulk-loadable, optionally point-queryable and optionally
//! incrementally-updatable external dataset. Every load returns a fresh,
//! one-shot row stream; each call opens its own connection (or process, or
//! file handle) and nothing is pooled across loads.
//!
//! Connection I/O for protocols the engine does not speak itself is
//! delegated to collaborators supplied through [`SourceContext`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dictum_core::{DictionaryStructure, Key, Row, SourceConfig, SourceError, Timestamp};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};

pub mod executable;
pub mod file;
pub mod format;
pub mod http;
pub mod kv;
pub mod library;
pub mod memory;
pub mod registry;
pub mod sql;

pub use executable::ExecutableSource;
pub use file::FileSource;
pub use format::RowFormat;
pub use http::HttpSource;
pub use kv::{Document, KeyValueConnector, KeyValueSource};
pub use library::{LibraryHandle, LibraryLoader, LibrarySource};
pub use memory::MemorySource;
pub use registry::{SourceConstructor, SourceRegistry};
pub use sql::{ExternalQueryBuilder, QuoteStyle, SqlConnector, SqlSource};

/// Lazy, finite, one-shot sequence of rows.
pub type RowStream = BoxStream<'static, Result<Row, SourceError>>;

/// Uniform contract over every external dataset.
#[async_trait]
pub trait DictionarySource: Send + Sync {
    /// Registered kind name, e.g. `"file"` or `"mysql"`.
    fn kind(&self) -> &str;

    /// Human-readable description for introspection.
    fn describe(&self) -> String {
        self.kind().to_string()
    }

    /// Stream every row of the dataset.
    async fn load_all(&self) -> Result<RowStream, SourceError>;

    /// Stream the rows of the requested keys only.
    async fn load_ids(&self, _keys: &[Key]) -> Result<RowStream, SourceError> {
        Err(SourceError::unsupported(self.kind(), "load_ids"))
    }

    /// Stream rows updated at or after `since`.
    async fn load_updated_after(&self, _since: Timestamp) -> Result<RowStream, SourceError> {
        Err(SourceError::unsupported(self.kind(), "load_updated_after"))
    }

    fn supports_selective_load(&self) -> bool {
        false
    }

    fn supports_incremental_load(&self) -> bool {
        false
    }

    /// Cheap staleness probe. Sources that cannot tell always report `true`.
    async fn is_modified(&self) -> Result<bool, SourceError> {
        Ok(true)
    }
}

/// Wrap already-materialized rows as a [`RowStream`].
pub fn rows_stream(rows: Vec<Result<Row, SourceError>>) -> RowStream {
    stream::iter(rows).boxed()
}

/// Drain a stream, failing on the first bad row.
pub async fn collect_rows(stream: RowStream) -> Result<Vec<Row>, SourceError> {
    stream.try_collect().await
}

/// Decode connector-produced raw rows lazily against `structure`.
pub(crate) fn decode_stream(structure: Arc<DictionaryStructure>, raw: Vec<Vec<dictum_core::Value>>) -> RowStream {
    stream::iter(raw.into_iter().map(move |cells| structure.decode_row(cells))).boxed()
}

/// Everything a source constructor receives.
pub struct SourceArgs<'a> {
    pub config: &'a SourceConfig,
    pub structure: &'a DictionaryStructure,
    /// Column driving incremental refresh, when configured.
    pub update_field: Option<&'a str>,
    pub context: &'a SourceContext,
}

/// Externally supplied collaborators, looked up by connector kind.
#[derive(Clone, Default)]
pub struct SourceContext {
    sql: HashMap<String, Arc<dyn SqlConnector>>,
    key_value: HashMap<String, Arc<dyn KeyValueConnector>>,
    library: Option<Arc<dyn LibraryLoader>>,
    http_client: Option<reqwest::Client>,
}

impl SourceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector for one SQL kind (`mysql`, `clickhouse`, `odbc`, `jdbc`).
    pub fn with_sql_connector(mut self, kind: &str, connector: Arc<dyn SqlConnector>) -> Self {
        self.sql.insert(kind.to_string(), connector);
        self
    }

    /// Connector for one key-value kind (`mongodb`, `redis`).
    pub fn with_key_value_connector(
        mut self,
        kind: &str,
        connector: Arc<dyn KeyValueConnector>,
    ) -> Self {
        self.key_value.insert(kind.to_string(), connector);
        self
    }

    pub fn with_library_loader(mut self, loader: Arc<dyn LibraryLoader>) -> Self {
        self.library = Some(loader);
        self
    }

    /// Shared HTTP client; a default client is built per source otherwise.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn sql_connector(&self, kind: &str) -> Option<Arc<dyn SqlConnector>> {
        self.sql.get(kind).cloned()
    }

    pub fn key_value_connector(&self, kind: &str) -> Option<Arc<dyn KeyValueConnector>> {
        self.key_value.get(kind).cloned()
    }

    pub fn library_loader(&self) -> Option<Arc<dyn LibraryLoader>> {
        self.library.clone()
    }

    pub fn http_client(&self) -> Option<reqwest::Client> {
        self.http_client.clone()
    }
}

impl std::fmt::Debug for SourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sql: Vec<_> = self.sql.keys().collect();
        sql.sort();
        let mut key_value: Vec<_> = self.key_value.keys().collect();
        key_value.sort();
        f.debug_struct("SourceContext")
            .field("sql", &sql)
            .field("key_value", &key_value)
            .field("library", &self.library.is_some())
            .field("http_client", &self.http_client.is_some())
            .finish()
    }
}
