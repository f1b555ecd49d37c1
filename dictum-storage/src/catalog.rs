//! Dictionary catalog and call surface.
//!
//! The catalog owns every declared dictionary by name, performs initial
//! loads, hands dictionaries to the refresh scheduler and exposes the
//! function-style lookups (`dict_get`, `dict_has`, ...) a query engine
//! binds to.

use std::collections::HashMap;
use std::sync::Arc;

use dictum_core::{DictResult, DictionaryConfig, DictionaryError, Key, LookupError, Value};
use futures_util::future::join_all;
use parking_lot::RwLock;

use crate::dictionary::{Dictionary, DictionaryInfo};
use crate::layout::{LayoutRegistry, RefreshOutcome};
use crate::scheduler::{SchedulerConfig, SchedulerHandle};
use crate::source::{SourceContext, SourceRegistry};

pub struct DictionaryCatalog {
    dictionaries: RwLock<HashMap<String, Dictionary>>,
    sources: Arc<SourceRegistry>,
    layouts: Arc<LayoutRegistry>,
    context: SourceContext,
    scheduler: Option<SchedulerHandle>,
}

impl std::fmt::Debug for DictionaryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionaryCatalog")
            .field("dictionaries", &self.names())
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}

impl Default for DictionaryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl DictionaryCatalog {
    /// Catalog over the built-in registries, without background refresh.
    pub fn new() -> Self {
        Self::with_registries(
            Arc::new(SourceRegistry::with_builtins()),
            Arc::new(LayoutRegistry::with_builtins()),
        )
    }

    pub fn with_registries(sources: Arc<SourceRegistry>, layouts: Arc<LayoutRegistry>) -> Self {
        Self {
            dictionaries: RwLock::new(HashMap::new()),
            sources,
            layouts,
            context: SourceContext::new(),
            scheduler: None,
        }
    }

    /// Collaborators (connectors, loaders, HTTP client) handed to sources.
    pub fn with_context(mut self, context: SourceContext) -> Self {
        self.context = context;
        self
    }

    /// Spawn a refresh scheduler on the current runtime.
    pub fn with_scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = Some(SchedulerHandle::spawn(config));
        self
    }

    pub fn scheduler(&self) -> Option<&SchedulerHandle> {
        self.scheduler.as_ref()
    }

    /// Declare, construct and load a dictionary.
    ///
    /// Construction errors (invalid config, unknown kinds, incompatible
    /// options) fail before any source call and leave the catalog as it
    /// was. A failed initial load is only logged: the dictionary is kept,
    /// answers `NotLoaded` and is retried by the scheduler.
    pub async fn create(&self, config: DictionaryConfig) -> DictResult<Dictionary> {
        let name = config.name.clone();
        let dictionary = Dictionary::create(config, &self.sources, &self.layouts, &self.context)?;

        if let Err(e) = dictionary.load().await {
            tracing::warn!(
                dictionary = %name,
                error = %e,
                "Initial dictionary load failed, will retry in background"
            );
        }

        let replaced = self
            .dictionaries
            .write()
            .insert(name.clone(), dictionary.clone());
        if replaced.is_some() {
            tracing::info!(dictionary = %name, "Dictionary redeclared");
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.register(dictionary.clone()).await;
        }
        Ok(dictionary)
    }

    /// Parse one TOML declaration and [`create`](Self::create) it.
    pub async fn create_from_toml(&self, text: &str) -> DictResult<Dictionary> {
        let config = DictionaryConfig::from_toml_str(text)?;
        self.create(config).await
    }

    pub fn get(&self, name: &str) -> DictResult<Dictionary> {
        self.dictionaries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                LookupError::UnknownDictionary {
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dictionaries.read().contains_key(name)
    }

    /// Drop a dictionary; in-flight lookups on clones finish normally.
    pub async fn remove(&self, name: &str) -> DictResult<()> {
        if self.dictionaries.write().remove(name).is_none() {
            return Err(LookupError::UnknownDictionary {
                name: name.to_string(),
            }
            .into());
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.deregister(name).await;
        }
        tracing::info!(dictionary = %name, "Dictionary removed");
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dictionaries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Introspection rows, sorted by name.
    pub fn list(&self) -> Vec<DictionaryInfo> {
        let mut rows: Vec<DictionaryInfo> = self
            .dictionaries
            .read()
            .values()
            .map(Dictionary::info)
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub async fn reload(&self, name: &str) -> DictResult<RefreshOutcome> {
        self.get(name)?.reload().await
    }

    /// Reload every dictionary concurrently; results are sorted by name.
    pub async fn reload_all(&self) -> Vec<(String, DictResult<RefreshOutcome>)> {
        let dictionaries: Vec<Dictionary> = self.dictionaries.read().values().cloned().collect();
        let mut results = join_all(dictionaries.into_iter().map(|d| async move {
            let outcome = d.reload().await;
            (d.name().to_string(), outcome)
        }))
        .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Stop background refresh, if running.
    pub async fn shutdown(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }
    }

    // ------------------------------------------------------------------
    // Call surface
    // ------------------------------------------------------------------

    pub async fn dict_get(&self, name: &str, attribute: &str, key: &Key) -> DictResult<Value> {
        self.get(name)?.get_attribute(key, attribute).await
    }

    /// `default` when the key is absent; `None` falls back to the
    /// attribute's declared `null_value`.
    pub async fn dict_get_or_default(
        &self,
        name: &str,
        attribute: &str,
        key: &Key,
        default: Option<Value>,
    ) -> DictResult<Value> {
        let dictionary = self.get(name)?;
        match default {
            Some(default) => dictionary.get_attribute_or(key, attribute, default).await,
            None => dictionary.get_attribute_or_default(key, attribute).await,
        }
    }

    /// One attribute for many keys, in input order; `None` where absent.
    pub async fn dict_get_many(
        &self,
        name: &str,
        attribute: &str,
        keys: &[Key],
    ) -> DictResult<Vec<Option<Value>>> {
        let dictionary = self.get(name)?;
        let index = dictionary.structure().attribute_index(attribute).ok_or_else(|| {
            LookupError::UnknownAttribute {
                dictionary: name.to_string(),
                attribute: attribute.to_string(),
            }
        })?;
        let found = dictionary.bulk_get(keys).await?;
        Ok(found
            .into_iter()
            .map(|(_, attrs)| attrs.and_then(|a| a.get(index).cloned()))
            .collect())
    }

    pub async fn dict_has(&self, name: &str, key: &Key) -> DictResult<bool> {
        self.get(name)?.has(key).await
    }

    pub async fn dict_get_in_range(
        &self,
        name: &str,
        attribute: &str,
        key: &Key,
        point: &Value,
    ) -> DictResult<Value> {
        self.get(name)?
            .get_attribute_in_range(key, point, attribute)
            .await
    }

    pub async fn dict_get_hierarchy(&self, name: &str, id: u64) -> DictResult<Vec<u64>> {
        self.get(name)?.get_hierarchy(id).await
    }

    pub async fn dict_is_in(&self, name: &str, child: u64, ancestor: u64) -> DictResult<bool> {
        self.get(name)?.is_in(child, ancestor).await
    }
}

/// True when `result` failed because the named dictionary is not declared.
pub fn is_unknown_dictionary<T>(result: &DictResult<T>) -> bool {
    matches!(
        result,
        Err(DictionaryError::Lookup(LookupError::UnknownDictionary { .. }))
    )
}
