//! Local file source.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dictum_core::{ConfigError, DictionaryStructure, SourceError};
use parking_lot::Mutex;
use serde::Deserialize;

use super::{DictionarySource, RowFormat, RowStream, SourceArgs};

#[derive(Debug, Deserialize)]
struct FileParams {
    path: PathBuf,
    #[serde(default)]
    format: RowFormat,
}

/// Reads a whole file per load. Staleness is the file's mtime as observed
/// when the previous load started.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    format: RowFormat,
    structure: Arc<DictionaryStructure>,
    loaded_mtime: Mutex<Option<SystemTime>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, format: RowFormat, structure: DictionaryStructure) -> Self {
        Self {
            path: path.into(),
            format,
            structure: Arc::new(structure),
            loaded_mtime: Mutex::new(None),
        }
    }

    pub fn from_args(args: SourceArgs<'_>) -> Result<Arc<dyn DictionarySource>, ConfigError> {
        let params: FileParams = args.config.params_as()?;
        if params.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "source.file.path".to_string(),
            });
        }
        Ok(Arc::new(Self::new(params.path, params.format, args.structure.clone())))
    }

    async fn mtime(&self) -> Result<SystemTime, SourceError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| SourceError::unavailable("file", format!("{}: {e}", self.path.display())))?;
        metadata
            .modified()
            .map_err(|e| SourceError::unavailable("file", format!("{}: {e}", self.path.display())))
    }
}

#[async_trait]
impl DictionarySource for FileSource {
    fn kind(&self) -> &str {
        "file"
    }

    fn describe(&self) -> String {
        format!("file {} ({:?})", self.path.display(), self.format)
    }

    async fn load_all(&self) -> Result<RowStream, SourceError> {
        let mtime = self.mtime().await?;
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::unavailable("file", format!("{}: {e}", self.path.display())))?;
        *self.loaded_mtime.lock() = Some(mtime);
        Ok(self.format.decode_stream(Arc::clone(&self.structure), text))
    }

    async fn is_modified(&self) -> Result<bool, SourceError> {
        let current = self.mtime().await?;
        Ok(*self.loaded_mtime.lock() != Some(current))
    }
}
