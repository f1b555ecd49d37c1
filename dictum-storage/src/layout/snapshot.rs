//! Atomic snapshot publication shared by every bulk layout.
//!
//! A load builds a complete [`SnapshotData`] off to the side; readers keep
//! using the previous [`Generation`] until it is swapped in with one
//! `ArcSwapOption::store`. Old generations are freed when their last reader
//! drops its `Arc`.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::Utc;
use dictum_core::{
    Attributes, DictResult, DictionaryError, Key, KeyModel, LookupError, Row, SourceError,
    Timestamp,
};
use futures_util::TryStreamExt;
use parking_lot::Mutex;

use super::{
    DictionaryLayout, LayoutKind, LayoutState, LayoutStatus, Probe, RefreshMode, RefreshOutcome,
};
use crate::source::DictionarySource;

/// Immutable, queryable contents of one bulk layout.
pub trait SnapshotData: Send + Sync + Sized + 'static {
    type Builder: SnapshotBuilder<Output = Self>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builder seeded with this snapshot's contents, for incremental merges.
    fn to_builder(&self) -> Self::Builder;

    fn get(&self, probe: Probe<'_>) -> Option<Attributes>;

    fn check_key(model: &KeyModel, key: &Key) -> Result<(), LookupError> {
        model.check(key)
    }
}

/// Scratch structure a load writes into.
pub trait SnapshotBuilder: Send + 'static {
    type Output;

    /// Add one row; invariant violations abort the load.
    fn insert(&mut self, row: Row) -> Result<(), SourceError>;

    fn finish(self) -> Result<Self::Output, SourceError>;
}

/// One published build.
#[derive(Debug)]
pub struct Generation<T> {
    pub number: u64,
    /// Start time of the load that produced this build.
    pub loaded_at: Timestamp,
    pub data: T,
}

#[derive(Debug)]
struct CellStatus {
    state: LayoutState,
    published: u64,
    failed_attempts: u32,
    last_error: Option<DictionaryError>,
}

/// Current generation plus load bookkeeping.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    current: ArcSwapOption<Generation<T>>,
    status: Mutex<CellStatus>,
}

impl<T> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            status: Mutex::new(CellStatus {
                state: LayoutState::Empty,
                published: 0,
                failed_attempts: 0,
                last_error: None,
            }),
        }
    }
}

impl<T> SnapshotCell<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Option<Arc<Generation<T>>> {
        self.current.load_full()
    }

    pub fn is_published(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn state(&self) -> LayoutState {
        self.status.lock().state
    }

    /// Enter `Loading` (nothing published yet) or `Refreshing`.
    pub fn begin(&self) {
        let mut status = self.status.lock();
        status.state = if self.is_published() {
            LayoutState::Refreshing
        } else {
            LayoutState::Loading
        };
    }

    /// Swap in a new generation and return its number.
    pub fn publish(&self, data: T, loaded_at: Timestamp) -> u64 {
        let mut status = self.status.lock();
        status.published += 1;
        let number = status.published;
        self.current.store(Some(Arc::new(Generation {
            number,
            loaded_at,
            data,
        })));
        status.state = LayoutState::Ready;
        status.failed_attempts = 0;
        status.last_error = None;
        number
    }

    /// Record a failed load; the published generation, if any, stays.
    pub fn fail(&self, error: DictionaryError) {
        let mut status = self.status.lock();
        status.state = LayoutState::Failed;
        status.failed_attempts += 1;
        status.last_error = Some(error);
    }
}

impl<T: SnapshotData> SnapshotCell<T> {
    pub fn status(&self) -> LayoutStatus {
        let current = self.load();
        let status = self.status.lock();
        LayoutStatus {
            state: status.state,
            generation: current.as_ref().map_or(0, |g| g.number),
            element_count: current.as_ref().map_or(0, |g| g.data.len()),
            loaded_at: current.as_ref().map(|g| g.loaded_at),
            failed_attempts: status.failed_attempts,
            last_error: status.last_error.clone(),
        }
    }
}

type BuilderFactory<T> = Box<dyn Fn() -> <T as SnapshotData>::Builder + Send + Sync>;

/// A layout that holds its whole dataset in one published snapshot.
pub struct BulkLayout<T: SnapshotData> {
    name: String,
    kind: LayoutKind,
    cell: SnapshotCell<T>,
    new_builder: BuilderFactory<T>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl<T: SnapshotData> BulkLayout<T> {
    pub fn new(
        name: impl Into<String>,
        kind: LayoutKind,
        new_builder: impl Fn() -> T::Builder + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            cell: SnapshotCell::new(),
            new_builder: Box::new(new_builder),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The currently published generation.
    pub fn snapshot(&self) -> Option<Arc<Generation<T>>> {
        self.cell.load()
    }

    fn published(&self) -> DictResult<Arc<Generation<T>>> {
        self.cell.load().ok_or_else(|| {
            LookupError::NotLoaded {
                dictionary: self.name.clone(),
            }
            .into()
        })
    }

    fn check_probe(&self, probe: &Probe<'_>) -> DictResult<()> {
        if self.kind.is_range() && probe.at.is_none() {
            return Err(LookupError::RangeRequired {
                dictionary: self.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn build(
        &self,
        source: &dyn DictionarySource,
        mode: RefreshMode,
        current: Option<Arc<Generation<T>>>,
    ) -> Result<T, SourceError> {
        let (mut builder, mut rows) = match (mode, current) {
            (RefreshMode::Incremental, Some(current)) => (
                current.data.to_builder(),
                source.load_updated_after(current.loaded_at).await?,
            ),
            _ => ((self.new_builder)(), source.load_all().await?),
        };
        while let Some(row) = rows.try_next().await? {
            builder.insert(row)?;
        }
        builder.finish()
    }
}

#[async_trait]
impl<T: SnapshotData> DictionaryLayout for BulkLayout<T> {
    fn kind(&self) -> LayoutKind {
        self.kind
    }

    fn status(&self) -> LayoutStatus {
        self.cell.status()
    }

    fn is_loaded(&self) -> bool {
        self.cell.is_published()
    }

    fn check_key(&self, model: &KeyModel, key: &Key) -> Result<(), LookupError> {
        T::check_key(model, key)
    }

    async fn refresh(
        &self,
        source: &dyn DictionarySource,
        mode: RefreshMode,
    ) -> DictResult<RefreshOutcome> {
        let _serial = self.refresh_lock.lock().await;
        let started = Utc::now();
        let current = self.cell.load();
        self.cell.begin();
        match self.build(source, mode, current).await {
            Ok(data) => {
                let elements = data.len();
                let generation = self.cell.publish(data, started);
                Ok(RefreshOutcome::Published {
                    generation,
                    elements,
                })
            }
            Err(e) => {
                let error = DictionaryError::from(e);
                self.cell.fail(error.clone());
                Err(error)
            }
        }
    }

    async fn lookup(
        &self,
        probe: Probe<'_>,
        _source: &dyn DictionarySource,
    ) -> DictResult<Option<Attributes>> {
        let generation = self.published()?;
        self.check_probe(&probe)?;
        Ok(generation.data.get(probe))
    }

    async fn lookup_many(
        &self,
        keys: &[Key],
        _source: &dyn DictionarySource,
    ) -> DictResult<Vec<Option<Attributes>>> {
        let generation = self.published()?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let probe = Probe::key(key);
            self.check_probe(&probe)?;
            out.push(generation.data.get(probe));
        }
        Ok(out)
    }
}
