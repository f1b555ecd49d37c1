//! Dynamic library source.
//!
//! Loading the shared object is the collaborator's job; this source opens a
//! fresh handle through the [`LibraryLoader`] for every load cycle and drops
//! it when the cycle ends.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dictum_core::{ConfigError, DictionaryStructure, Key, SourceError, Value};
use serde::Deserialize;

use super::{decode_stream, DictionarySource, RowStream, SourceArgs};

/// One opened library instance.
#[async_trait]
pub trait LibraryHandle: Send + Sync {
    /// Every row, cells in the requested column order.
    async fn load_all(&self, columns: &[String]) -> Result<Vec<Vec<Value>>, SourceError>;

    async fn load_ids(&self, columns: &[String], keys: &[Key]) -> Result<Vec<Vec<Value>>, SourceError>;

    async fn is_modified(&self) -> Result<bool, SourceError> {
        Ok(true)
    }

    fn supports_selective_load(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait LibraryLoader: Send + Sync {
    async fn open(
        &self,
        path: &std::path::Path,
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Arc<dyn LibraryHandle>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct LibraryParams {
    path: PathBuf,
    #[serde(default)]
    settings: serde_json::Map<String, serde_json::Value>,
    /// Declared rather than probed so that creating the source never opens
    /// the library.
    #[serde(default = "default_selective")]
    selective: bool,
}

fn default_selective() -> bool {
    true
}

pub struct LibrarySource {
    path: PathBuf,
    settings: serde_json::Map<String, serde_json::Value>,
    selective: bool,
    loader: Arc<dyn LibraryLoader>,
    columns: Vec<String>,
    structure: Arc<DictionaryStructure>,
}

impl LibrarySource {
    pub fn new(path: impl Into<PathBuf>, loader: Arc<dyn LibraryLoader>, structure: DictionaryStructure) -> Self {
        Self {
            path: path.into(),
            settings: serde_json::Map::new(),
            selective: true,
            loader,
            columns: structure.column_names().into_iter().map(str::to_string).collect(),
            structure: Arc::new(structure),
        }
    }

    pub fn from_args(args: SourceArgs<'_>) -> Result<Arc<dyn DictionarySource>, ConfigError> {
        let loader = args
            .context
            .library_loader()
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "source.library.loader".to_string(),
            })?;
        let params: LibraryParams = args.config.params_as()?;
        let mut source = Self::new(params.path, loader, args.structure.clone());
        source.settings = params.settings;
        source.selective = params.selective;
        Ok(Arc::new(source))
    }

    async fn open(&self) -> Result<Arc<dyn LibraryHandle>, SourceError> {
        self.loader.open(&self.path, &self.settings).await
    }
}

#[async_trait]
impl DictionarySource for LibrarySource {
    fn kind(&self) -> &str {
        "library"
    }

    fn describe(&self) -> String {
        format!("library {}", self.path.display())
    }

    async fn load_all(&self) -> Result<RowStream, SourceError> {
        let handle = self.open().await?;
        let raw = handle.load_all(&self.columns).await?;
        Ok(decode_stream(Arc::clone(&self.structure), raw))
    }

    async fn load_ids(&self, keys: &[Key]) -> Result<RowStream, SourceError> {
        if !self.selective {
            return Err(SourceError::unsupported("library", "load_ids"));
        }
        let handle = self.open().await?;
        if !handle.supports_selective_load() {
            return Err(SourceError::unsupported("library", "load_ids"));
        }
        let raw = handle.load_ids(&self.columns, keys).await?;
        Ok(decode_stream(Arc::clone(&self.structure), raw))
    }

    fn supports_selective_load(&self) -> bool {
        self.selective
    }

    async fn is_modified(&self) -> Result<bool, SourceError> {
        self.open().await?.is_modified().await
    }
}
