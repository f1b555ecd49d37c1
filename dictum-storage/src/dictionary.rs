//! Dictionary facade: one source wired into one layout.
//!
//! A [`Dictionary`] is a cheap handle (`Arc` inside) shared by the catalog,
//! the refresh scheduler and callers. Lookups go straight to the layout;
//! loads are coalesced so concurrent `reload()` calls share one source load.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dictum_core::{
    Attributes, ConfigError, DictResult, DictionaryConfig, DictionaryError, DictionaryStructure,
    Key, KeyModel, Lifetime, LookupError, Timestamp, Value,
};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;

use crate::layout::{
    DictionaryLayout, LayoutArgs, LayoutKind, LayoutRegistry, LayoutState, Probe, RefreshMode,
    RefreshOutcome,
};
use crate::source::{DictionarySource, SourceArgs, SourceContext, SourceRegistry};

/// Upper bound on parent hops when walking a hierarchy.
pub const MAX_HIERARCHY_DEPTH: usize = 1000;

type SharedLoad = Shared<BoxFuture<'static, DictResult<RefreshOutcome>>>;

struct PendingLoad {
    id: u64,
    mode: RefreshMode,
    load: SharedLoad,
}

/// Introspection row for one dictionary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DictionaryInfo {
    pub name: String,
    pub layout: LayoutKind,
    pub source: String,
    pub state: LayoutState,
    /// Start time of the load that produced the published snapshot.
    pub loaded_at: Option<Timestamp>,
    pub element_count: usize,
    pub generation: u64,
    pub failed_attempts: u32,
    pub last_error: Option<String>,
    pub lifetime_min_secs: u64,
    pub lifetime_max_secs: u64,
}

struct DictionaryInner {
    config: DictionaryConfig,
    structure: Arc<DictionaryStructure>,
    source: Arc<dyn DictionarySource>,
    layout: Arc<dyn DictionaryLayout>,
    lifetime: Lifetime,
    pending_load: Mutex<Option<PendingLoad>>,
    next_load_id: AtomicU64,
}

#[derive(Clone)]
pub struct Dictionary {
    inner: Arc<DictionaryInner>,
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dictionary")
            .field("name", &self.name())
            .field("layout", &self.inner.layout.kind())
            .field("source", &self.inner.source.describe())
            .finish()
    }
}

impl Dictionary {
    /// Build a dictionary from its declaration. Nothing is loaded yet.
    ///
    /// Fails on invalid config, unknown source/layout kinds, key models the
    /// layout cannot serve, or a cache layout over a source without
    /// selective loading.
    pub fn create(
        config: DictionaryConfig,
        sources: &SourceRegistry,
        layouts: &LayoutRegistry,
        context: &SourceContext,
    ) -> DictResult<Self> {
        config.validate()?;
        let structure = config.structure.resolve()?;
        let lifetime = config.lifetime();

        let layout = layouts.create(LayoutArgs {
            name: &config.name,
            structure: &structure,
            config: &config.layout,
            lifetime,
        })?;
        let source = sources.create(SourceArgs {
            config: &config.source,
            structure: &structure,
            update_field: config.update_field.as_deref(),
            context,
        })?;
        Self::from_parts(config, structure, source, layout)
    }

    /// Wire an already constructed source and layout together.
    pub fn from_parts(
        config: DictionaryConfig,
        structure: DictionaryStructure,
        source: Arc<dyn DictionarySource>,
        layout: Arc<dyn DictionaryLayout>,
    ) -> DictResult<Self> {
        if !layout.kind().requires_bulk_load() && !source.supports_selective_load() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("layout {}", layout.kind()),
                option_b: format!("source {} without selective loading", source.kind()),
            }
            .into());
        }
        let lifetime = config.lifetime();
        Ok(Self {
            inner: Arc::new(DictionaryInner {
                config,
                structure: Arc::new(structure),
                source,
                layout,
                lifetime,
                pending_load: Mutex::new(None),
                next_load_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &DictionaryConfig {
        &self.inner.config
    }

    pub fn structure(&self) -> &DictionaryStructure {
        &self.inner.structure
    }

    pub fn lifetime(&self) -> Lifetime {
        self.inner.lifetime
    }

    pub fn layout_kind(&self) -> LayoutKind {
        self.inner.layout.kind()
    }

    /// Whether lookups can be answered.
    pub fn is_loaded(&self) -> bool {
        self.inner.layout.is_loaded()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Initial load. Same path as [`Dictionary::reload`].
    pub async fn load(&self) -> DictResult<RefreshOutcome> {
        self.reload().await
    }

    /// Full reload, returning once the new snapshot is published or the
    /// load has failed. Joins a full load already in flight.
    pub async fn reload(&self) -> DictResult<RefreshOutcome> {
        self.coalesced(RefreshMode::Full).await
    }

    /// Scheduled refresh: incremental when `update_field` is configured and
    /// the source supports it, otherwise full.
    pub async fn refresh(&self) -> DictResult<RefreshOutcome> {
        let incremental = self.inner.config.update_field.is_some()
            && self.inner.source.supports_incremental_load();
        let mode = if incremental {
            RefreshMode::Incremental
        } else {
            RefreshMode::Full
        };
        self.coalesced(mode).await
    }

    /// Join the load in flight or start one. Loads run on their own task,
    /// so a caller that stops waiting does not stop the load. A full
    /// reload that finds an incremental refresh running waits for it and
    /// then loads in full.
    async fn coalesced(&self, mode: RefreshMode) -> DictResult<RefreshOutcome> {
        let mut force = false;
        loop {
            let (id, joined, load) = {
                let mut pending = self.inner.pending_load.lock();
                match pending.as_ref() {
                    Some(running) => (running.id, running.mode, running.load.clone()),
                    None => {
                        let running = self.inner.start_load(mode, force);
                        let joined = (running.id, running.mode, running.load.clone());
                        *pending = Some(running);
                        joined
                    }
                }
            };
            let result = load.await;
            self.inner.clear_pending(id);
            if mode == RefreshMode::Full && joined == RefreshMode::Incremental {
                // The delta marked the source as seen but cannot carry deletions.
                force = true;
                continue;
            }
            return result;
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    fn check_key(&self, key: &Key) -> DictResult<()> {
        self.inner
            .layout
            .check_key(&self.inner.structure.key, key)
            .map_err(DictionaryError::from)
    }

    fn not_found(&self) -> DictionaryError {
        LookupError::NotFound {
            dictionary: self.name().to_string(),
        }
        .into()
    }

    fn attribute_index(&self, attribute: &str) -> DictResult<usize> {
        self.inner
            .structure
            .attribute_index(attribute)
            .ok_or_else(|| {
                LookupError::UnknownAttribute {
                    dictionary: self.name().to_string(),
                    attribute: attribute.to_string(),
                }
                .into()
            })
    }

    async fn lookup(&self, probe: Probe<'_>) -> DictResult<Option<Attributes>> {
        self.check_key(probe.key)?;
        self.inner
            .layout
            .lookup(probe, self.inner.source.as_ref())
            .await
    }

    /// Attributes of `key`; `NotFound` when absent.
    pub async fn get(&self, key: &Key) -> DictResult<Attributes> {
        self.lookup(Probe::key(key))
            .await?
            .ok_or_else(|| self.not_found())
    }

    /// Attributes of `key` at `point`, for range layouts. The point is
    /// coerced to the declared range type.
    pub async fn get_in_range(&self, key: &Key, point: &Value) -> DictResult<Attributes> {
        let point = match &self.inner.structure.range {
            Some(range) => point.clone().coerce(range.ty).map_err(|e| LookupError::KeyMismatch {
                expected: format!("range point {}", range.ty),
                got: e.to_string(),
            })?,
            None => point.clone(),
        };
        self.lookup(Probe::at(key, &point))
            .await?
            .ok_or_else(|| self.not_found())
    }

    /// Attributes of `key`, or `default` when the key is absent or nothing
    /// has been loaded yet.
    pub async fn get_or_default(&self, key: &Key, default: Attributes) -> DictResult<Attributes> {
        match self.get(key).await {
            Ok(attrs) => Ok(attrs),
            Err(e) if e.is_not_found() || e.is_not_loaded() => Ok(default),
            Err(e) => Err(e),
        }
    }

    pub async fn has(&self, key: &Key) -> DictResult<bool> {
        Ok(self.lookup(Probe::key(key)).await?.is_some())
    }

    /// Look up many keys at once, preserving input order. Cache layouts
    /// batch their misses into one source call.
    pub async fn bulk_get(&self, keys: &[Key]) -> DictResult<Vec<(Key, Option<Attributes>)>> {
        for key in keys {
            self.check_key(key)?;
        }
        let found = self
            .inner
            .layout
            .lookup_many(keys, self.inner.source.as_ref())
            .await?;
        Ok(keys.iter().cloned().zip(found).collect())
    }

    /// One attribute of `key`.
    pub async fn get_attribute(&self, key: &Key, attribute: &str) -> DictResult<Value> {
        let index = self.attribute_index(attribute)?;
        let attrs = self.get(key).await?;
        Ok(attrs.get(index).cloned().unwrap_or(Value::Null))
    }

    /// One attribute of `key`, or `default` when the key is absent.
    pub async fn get_attribute_or(
        &self,
        key: &Key,
        attribute: &str,
        default: Value,
    ) -> DictResult<Value> {
        match self.get_attribute(key, attribute).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_not_found() || e.is_not_loaded() => Ok(default),
            Err(e) => Err(e),
        }
    }

    /// One attribute of `key`, falling back to the attribute's `null_value`.
    pub async fn get_attribute_or_default(&self, key: &Key, attribute: &str) -> DictResult<Value> {
        let index = self.attribute_index(attribute)?;
        let default = self.inner.structure.attributes[index].null_value.clone();
        self.get_attribute_or(key, attribute, default).await
    }

    /// One attribute of `key` at `point`, for range layouts.
    pub async fn get_attribute_in_range(
        &self,
        key: &Key,
        point: &Value,
        attribute: &str,
    ) -> DictResult<Value> {
        let index = self.attribute_index(attribute)?;
        let attrs = self.get_in_range(key, point).await?;
        Ok(attrs.get(index).cloned().unwrap_or(Value::Null))
    }

    fn hierarchy_index(&self) -> DictResult<usize> {
        if !matches!(self.inner.structure.key, KeyModel::Simple(_)) {
            return Err(LookupError::KeyMismatch {
                expected: "simple key for hierarchy lookups".to_string(),
                got: self.inner.structure.key.describe(),
            }
            .into());
        }
        self.inner.structure.hierarchical_index().ok_or_else(|| {
            LookupError::UnknownAttribute {
                dictionary: self.name().to_string(),
                attribute: "<hierarchical>".to_string(),
            }
            .into()
        })
    }

    /// Parent of `id`, or `None` at the root (NULL or the attribute's
    /// `null_value`) or when `id` is absent.
    async fn parent_of(&self, id: u64, index: usize) -> DictResult<Option<u64>> {
        let Some(attrs) = self.lookup(Probe::key(&Key::Simple(id))).await? else {
            return Ok(None);
        };
        let root = &self.inner.structure.attributes[index].null_value;
        Ok(match attrs.get(index) {
            Some(parent) if !parent.is_null() && parent != root => parent.as_u64(),
            _ => None,
        })
    }

    /// `id` followed by its ancestors, nearest first. Empty when `id` is
    /// absent. Stops at a cycle or after [`MAX_HIERARCHY_DEPTH`] hops.
    pub async fn get_hierarchy(&self, id: u64) -> DictResult<Vec<u64>> {
        let index = self.hierarchy_index()?;
        if !self.has(&Key::Simple(id)).await? {
            return Ok(Vec::new());
        }
        let mut chain = vec![id];
        let mut seen = HashSet::from([id]);
        let mut current = id;
        while chain.len() <= MAX_HIERARCHY_DEPTH {
            match self.parent_of(current, index).await? {
                Some(parent) if seen.insert(parent) => {
                    chain.push(parent);
                    current = parent;
                }
                _ => break,
            }
        }
        Ok(chain)
    }

    /// Whether `ancestor` is `child` or one of its ancestors.
    pub async fn is_in(&self, child: u64, ancestor: u64) -> DictResult<bool> {
        if child == ancestor {
            self.hierarchy_index()?;
            return Ok(true);
        }
        Ok(self.get_hierarchy(child).await?.contains(&ancestor))
    }

    pub fn info(&self) -> DictionaryInfo {
        let status = self.inner.layout.status();
        DictionaryInfo {
            name: self.name().to_string(),
            layout: self.inner.layout.kind(),
            source: self.inner.source.describe(),
            state: status.state,
            loaded_at: status.loaded_at,
            element_count: status.element_count,
            generation: status.generation,
            failed_attempts: status.failed_attempts,
            last_error: status.last_error.map(|e| e.to_string()),
            lifetime_min_secs: self.inner.lifetime.min.as_secs(),
            lifetime_max_secs: self.inner.lifetime.max.as_secs(),
        }
    }
}

impl DictionaryInner {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Spawn one load cycle. The task clears its own pending slot when it
    /// finishes, whether or not anyone is still waiting on it.
    fn start_load(self: &Arc<Self>, mode: RefreshMode, force: bool) -> PendingLoad {
        let id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = Arc::clone(&inner).load_cycle(mode, force).await;
            inner.clear_pending(id);
            result
        });
        let dictionary = self.name().to_string();
        let load = async move {
            task.await.unwrap_or_else(|e| {
                Err(DictionaryError::LoadAborted {
                    dictionary,
                    reason: e.to_string(),
                })
            })
        }
        .boxed()
        .shared();
        PendingLoad { id, mode, load }
    }

    fn clear_pending(&self, id: u64) {
        let mut pending = self.pending_load.lock();
        if pending.as_ref().is_some_and(|running| running.id == id) {
            *pending = None;
        }
    }

    /// One load attempt. Unless `force` is set, a Ready bulk layout whose
    /// source reports no modification is left untouched; a failed probe
    /// counts as modified.
    async fn load_cycle(
        self: Arc<Self>,
        mode: RefreshMode,
        force: bool,
    ) -> DictResult<RefreshOutcome> {
        let started = Instant::now();
        let layout = &self.layout;
        let ready = layout.kind().requires_bulk_load() && layout.status().state == LayoutState::Ready;
        if ready && !force {
            match self.source.is_modified().await {
                Ok(false) => {
                    tracing::debug!(dictionary = %self.name(), "source unchanged, skipping load");
                    return Ok(RefreshOutcome::Unchanged);
                }
                Ok(true) => {}
                Err(e) => {
                    tracing::debug!(
                        dictionary = %self.name(),
                        error = %e,
                        "modification probe failed, loading anyway"
                    );
                }
            }
        }

        match layout.refresh(self.source.as_ref(), mode).await {
            Ok(RefreshOutcome::Published {
                generation,
                elements,
            }) => {
                tracing::info!(
                    dictionary = %self.name(),
                    generation,
                    elements,
                    incremental = mode == RefreshMode::Incremental,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Dictionary loaded"
                );
                Ok(RefreshOutcome::Published {
                    generation,
                    elements,
                })
            }
            Ok(RefreshOutcome::Unchanged) => {
                tracing::debug!(dictionary = %self.name(), "refresh left dictionary unchanged");
                Ok(RefreshOutcome::Unchanged)
            }
            Err(e) => {
                tracing::warn!(
                    dictionary = %self.name(),
                    error = %e,
                    attempts = layout.status().failed_attempts,
                    "Dictionary load failed"
                );
                Err(e)
            }
        }
    }
}
