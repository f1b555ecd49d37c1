//! Key-value and document store sources (`mongodb`, `redis`).
//!
//! The collaborator returns documents keyed by column name; the source
//! decodes them against the dictionary structure exactly like a
//! `JSONEachRow` line.

use std::sync::Arc;

use async_trait::async_trait;
use dictum_core::{ConfigError, DictionaryStructure, Key, SourceError};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;

use super::format::decode_json_object;
use super::{DictionarySource, RowStream, SourceArgs};

pub type Document = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait KeyValueConnector: Send + Sync {
    /// Every document of a collection (or every hash under a key prefix).
    async fn scan(&self, collection: &str) -> Result<Vec<Document>, SourceError>;

    /// Documents of the requested keys; absent keys are simply omitted.
    async fn multi_get(&self, collection: &str, keys: &[Key]) -> Result<Vec<Document>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct KeyValueParams {
    #[serde(alias = "key_prefix")]
    collection: String,
}

pub struct KeyValueSource {
    kind: String,
    collection: String,
    connector: Arc<dyn KeyValueConnector>,
    structure: Arc<DictionaryStructure>,
}

impl KeyValueSource {
    pub fn new(
        kind: impl Into<String>,
        collection: impl Into<String>,
        connector: Arc<dyn KeyValueConnector>,
        structure: DictionaryStructure,
    ) -> Self {
        Self {
            kind: kind.into(),
            collection: collection.into(),
            connector,
            structure: Arc::new(structure),
        }
    }

    pub fn from_args(args: SourceArgs<'_>) -> Result<Arc<dyn DictionarySource>, ConfigError> {
        let kind = args.config.kind.as_str();
        let connector = args
            .context
            .key_value_connector(kind)
            .ok_or_else(|| ConfigError::MissingRequired {
                field: format!("source.{kind}.connector"),
            })?;
        let params: KeyValueParams = args.config.params_as()?;
        Ok(Arc::new(Self::new(
            kind,
            params.collection,
            connector,
            args.structure.clone(),
        )))
    }

    fn decode(&self, documents: Vec<Document>) -> RowStream {
        let structure = Arc::clone(&self.structure);
        stream::iter(documents.into_iter().map(move |doc| {
            let raw = decode_json_object(&structure, &doc)?;
            structure.decode_row(raw)
        }))
        .boxed()
    }
}

#[async_trait]
impl DictionarySource for KeyValueSource {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn describe(&self) -> String {
        format!("{} {}", self.kind, self.collection)
    }

    async fn load_all(&self) -> Result<RowStream, SourceError> {
        let documents = self.connector.scan(&self.collection).await?;
        Ok(self.decode(documents))
    }

    async fn load_ids(&self, keys: &[Key]) -> Result<RowStream, SourceError> {
        let documents = self.connector.multi_get(&self.collection, keys).await?;
        Ok(self.decode(documents))
    }

    fn supports_selective_load(&self) -> bool {
        true
    }
}
