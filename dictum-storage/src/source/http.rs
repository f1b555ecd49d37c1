//! HTTP source.
//!
//! GET for full loads, POST of the requested keys for selective loads and
//! `<update_field>=<timestamp>` as a query parameter for incremental loads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dictum_core::{ConfigError, DictionaryStructure, Key, SourceError, Timestamp};
use serde::Deserialize;

use super::{DictionarySource, RowFormat, RowStream, SourceArgs};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
struct HttpParams {
    url: String,
    #[serde(default)]
    format: RowFormat,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

#[derive(Debug)]
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
    format: RowFormat,
    headers: BTreeMap<String, String>,
    update_field: Option<String>,
    structure: Arc<DictionaryStructure>,
}

impl HttpSource {
    pub fn from_args(args: SourceArgs<'_>) -> Result<Arc<dyn DictionarySource>, ConfigError> {
        let params: HttpParams = args.config.params_as()?;
        let url = reqwest::Url::parse(&params.url)
            .map_err(|e| ConfigError::invalid("source.http.url", &params.url, &e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "source.http.url",
                &params.url,
                "scheme must be http or https",
            ));
        }
        let client = match args.context.http_client() {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(Duration::from_secs(params.timeout_secs))
                .build()
                .map_err(|e| ConfigError::invalid("source.http", &params.url, &e.to_string()))?,
        };
        Ok(Arc::new(Self {
            client,
            url: params.url,
            format: params.format,
            headers: params.headers,
            update_field: args.update_field.map(str::to_string),
            structure: Arc::new(args.structure.clone()),
        }))
    }

    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<RowStream, SourceError> {
        let mut request = request;
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SourceError::unavailable("http", e))?
            .error_for_status()
            .map_err(|e| SourceError::unavailable("http", e))?;
        let text = response
            .text()
            .await
            .map_err(|e| SourceError::unavailable("http", e))?;
        Ok(self.format.decode_stream(Arc::clone(&self.structure), text))
    }
}

#[async_trait]
impl DictionarySource for HttpSource {
    fn kind(&self) -> &str {
        "http"
    }

    fn describe(&self) -> String {
        format!("http {} ({:?})", self.url, self.format)
    }

    async fn load_all(&self) -> Result<RowStream, SourceError> {
        self.fetch(self.client.get(&self.url)).await
    }

    async fn load_ids(&self, keys: &[Key]) -> Result<RowStream, SourceError> {
        let body = self.format.encode_keys(&self.structure.key, keys);
        self.fetch(self.client.post(&self.url).body(body)).await
    }

    async fn load_updated_after(&self, since: Timestamp) -> Result<RowStream, SourceError> {
        let Some(field) = &self.update_field else {
            return Err(SourceError::unsupported("http", "load_updated_after"));
        };
        let stamp = since.format("%Y-%m-%d %H:%M:%S").to_string();
        let request = self.client.get(&self.url).query(&[(field.as_str(), stamp.as_str())]);
        self.fetch(request).await
    }

    fn supports_selective_load(&self) -> bool {
        true
    }

    fn supports_incremental_load(&self) -> bool {
        self.update_field.is_some()
    }
}
