//! Executable source: runs a shell command and parses its stdout.
//!
//! - full load: the command runs with empty stdin
//! - selective load: requested keys are written to stdin in the row format
//! - incremental load: the last update time is appended as one argument

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dictum_core::{ConfigError, DictionaryStructure, Key, SourceError, Timestamp};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{DictionarySource, RowFormat, RowStream, SourceArgs};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
struct ExecutableParams {
    command: String,
    #[serde(default)]
    format: RowFormat,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

#[derive(Debug)]
pub struct ExecutableSource {
    command: String,
    format: RowFormat,
    timeout: Duration,
    update_field: Option<String>,
    structure: Arc<DictionaryStructure>,
}

impl ExecutableSource {
    pub fn new(command: impl Into<String>, format: RowFormat, structure: DictionaryStructure) -> Self {
        Self {
            command: command.into(),
            format,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            update_field: None,
            structure: Arc::new(structure),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_update_field(mut self, field: impl Into<String>) -> Self {
        self.update_field = Some(field.into());
        self
    }

    pub fn from_args(args: SourceArgs<'_>) -> Result<Arc<dyn DictionarySource>, ConfigError> {
        let params: ExecutableParams = args.config.params_as()?;
        if params.command.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "source.executable.command".to_string(),
            });
        }
        if params.timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "source.executable.timeout_secs",
                0,
                "timeout must be positive",
            ));
        }
        let mut source = Self::new(params.command, params.format, args.structure.clone())
            .with_timeout(Duration::from_secs(params.timeout_secs));
        if let Some(field) = args.update_field {
            source = source.with_update_field(field);
        }
        Ok(Arc::new(source))
    }

    async fn run(&self, command_line: &str, stdin: Option<String>) -> Result<String, SourceError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::unavailable("executable", format!("spawn {command_line:?}: {e}")))?;

        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
                let result = pipe.write_all(input.as_bytes()).await;
                drop(pipe);
                result
            })),
            _ => None,
        };

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                SourceError::unavailable(
                    "executable",
                    format!("{command_line:?} timed out after {:?}", self.timeout),
                )
            })?
            .map_err(|e| SourceError::unavailable("executable", e))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, command = command_line, "Executable closed stdin early");
                }
                Err(e) => return Err(SourceError::unavailable("executable", e)),
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::unavailable(
                "executable",
                format!("{command_line:?} exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| SourceError::data(format!("executable output is not UTF-8: {e}")))
    }
}

/// Quote one shell word.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "'\\''"))
}

#[async_trait]
impl DictionarySource for ExecutableSource {
    fn kind(&self) -> &str {
        "executable"
    }

    fn describe(&self) -> String {
        format!("executable {:?} ({:?})", self.command, self.format)
    }

    async fn load_all(&self) -> Result<RowStream, SourceError> {
        let text = self.run(&self.command, None).await?;
        Ok(self.format.decode_stream(Arc::clone(&self.structure), text))
    }

    async fn load_ids(&self, keys: &[Key]) -> Result<RowStream, SourceError> {
        let input = self.format.encode_keys(&self.structure.key, keys);
        let text = self.run(&self.command, Some(input)).await?;
        Ok(self.format.decode_stream(Arc::clone(&self.structure), text))
    }

    async fn load_updated_after(&self, since: Timestamp) -> Result<RowStream, SourceError> {
        if self.update_field.is_none() {
            return Err(SourceError::unsupported("executable", "load_updated_after"));
        }
        let stamp = since.format("%Y-%m-%d %H:%M:%S").to_string();
        let command_line = format!("{} {}", self.command, shell_quote(&stamp));
        let text = self.run(&command_line, None).await?;
        Ok(self.format.decode_stream(Arc::clone(&self.structure), text))
    }

    fn supports_selective_load(&self) -> bool {
        true
    }

    fn supports_incremental_load(&self) -> bool {
        self.update_field.is_some()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::source::collect_rows;
    use dictum_core::{AttributeSpec, AttributeType, KeyModel, Value};

    fn structure() -> DictionaryStructure {
        DictionaryStructure::new(
            KeyModel::simple("id"),
            vec![AttributeSpec::new("name", AttributeType::String)],
        )
    }

    #[tokio::test]
    async fn test_full_load_parses_stdout() {
        let source = ExecutableSource::new("printf '1\\tone\\n2\\ttwo\\n'", RowFormat::TabSeparated, structure());
        let rows = collect_rows(source.load_all().await.unwrap()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values[0], Value::from("one"));
    }

    #[tokio::test]
    async fn test_selective_load_echoes_keys_from_stdin() {
        // Reply with "<id>\tname-<id>" for every id read from stdin.
        let command = "while read id; do printf '%s\\tname-%s\\n' \"$id\" \"$id\"; done";
        let source = ExecutableSource::new(command, RowFormat::TabSeparated, structure());
        let rows = collect_rows(source.load_ids(&[Key::Simple(3), Key::Simple(5)]).await.unwrap())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].key, Key::Simple(5));
        assert_eq!(rows[1].values[0], Value::from("name-5"));
    }

    #[tokio::test]
    async fn test_failing_command_is_unavailable() {
        let source = ExecutableSource::new("exit 3", RowFormat::TabSeparated, structure());
        let err = source.load_all().await.err().unwrap();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_incremental_requires_update_field() {
        let source = ExecutableSource::new("true", RowFormat::TabSeparated, structure());
        assert!(!source.supports_incremental_load());
        let err = source.load_updated_after(chrono::Utc::now()).await.err().unwrap();
        assert!(matches!(err, SourceError::Unsupported { .. }));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
