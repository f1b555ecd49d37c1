//! Cache layout: a bounded LRU resident set filled on demand.
//!
//! A miss asks the source for just the missing keys (`load_ids`). Both hits
//! and confirmed-absent keys are cached, each with its own expiry drawn from
//! the dictionary lifetime.
//!
//! # Single-flight
//!
//! Concurrent misses on one key share a single source call. The first caller
//! claims the key in the in-flight map and becomes its leader; later callers
//! subscribe to the leader's `watch` channel. A leader inserts the result
//! into the LRU *before* releasing its claim, so a caller that finds no
//! claim re-checks the LRU and never issues a duplicate load. A leader that
//! is dropped mid-load releases its claims without a result and followers
//! retry.
//!
//! Lock order is in-flight map, then shard. A shard lock is never held
//! across an await.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dictum_core::{
    Attributes, ConfigError, DictResult, DictionaryError, Key, Lifetime, SourceError,
};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::{
    DictionaryLayout, LayoutKind, LayoutState, LayoutStatus, Probe, RefreshMode, RefreshOutcome,
};
use crate::source::{collect_rows, DictionarySource};

/// Resident sets at or above this size are split into
/// [`DEFAULT_SHARDS_LARGE`] shards unless `shards` is configured.
pub const SHARDING_THRESHOLD: usize = 4096;
pub const DEFAULT_SHARDS_LARGE: usize = 16;

/// Parameters of the `cache` and `complex_key_cache` layouts.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CacheParams {
    #[serde(alias = "capacity")]
    pub size_in_cells: usize,
    #[serde(default)]
    pub shards: Option<usize>,
    /// Serve an expired entry when re-fetching it fails.
    #[serde(default)]
    pub allow_read_expired_keys: bool,
}

impl CacheParams {
    pub fn new(size_in_cells: usize) -> Self {
        Self {
            size_in_cells,
            shards: None,
            allow_read_expired_keys: false,
        }
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn with_read_expired_keys(mut self, allow: bool) -> Self {
        self.allow_read_expired_keys = allow;
        self
    }

    pub fn shard_count(&self) -> usize {
        match self.shards {
            Some(n) => n,
            None if self.size_in_cells < SHARDING_THRESHOLD => 1,
            None => DEFAULT_SHARDS_LARGE,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_in_cells == 0 {
            return Err(ConfigError::invalid(
                "size_in_cells",
                self.size_in_cells,
                "cache capacity must be positive",
            ));
        }
        let shards = self.shard_count();
        if shards == 0 || shards > self.size_in_cells {
            return Err(ConfigError::invalid(
                "shards",
                shards,
                "must be between 1 and size_in_cells",
            ));
        }
        Ok(())
    }
}

/// Counters exposed for introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries pushed out by capacity.
    pub evictions: u64,
    /// `load_ids` calls issued to the source.
    pub source_calls: u64,
    pub entry_count: u64,
}

impl CacheStats {
    /// Hit rate in `[0.0, 1.0]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` marks a key the source confirmed absent.
    value: Option<Attributes>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type FetchResult = DictResult<Option<Attributes>>;
type FetchSender = Arc<watch::Sender<Option<FetchResult>>>;

enum Resident {
    Fresh(Option<Attributes>),
    /// Expired but kept for `allow_read_expired_keys`.
    Stale(Option<Attributes>),
    Missing,
}

enum Claim {
    Resident(Option<Attributes>),
    Leader(FetchSender),
    Follower(watch::Receiver<Option<FetchResult>>),
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    source_calls: AtomicU64,
}

#[derive(Debug, Default)]
struct FailureState {
    failed_attempts: u32,
    last_error: Option<DictionaryError>,
}

pub struct CacheLayout {
    name: String,
    kind: LayoutKind,
    lifetime: Lifetime,
    allow_read_expired_keys: bool,
    shards: Vec<Mutex<LruCache<Key, CacheEntry>>>,
    hasher: RandomState,
    in_flight: Mutex<HashMap<Key, FetchSender>>,
    counters: Counters,
    failures: Mutex<FailureState>,
}

impl CacheLayout {
    pub fn new(
        name: impl Into<String>,
        kind: LayoutKind,
        params: CacheParams,
        lifetime: Lifetime,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        let shard_count = params.shard_count();
        let per_shard = params.size_in_cells.div_ceil(shard_count);
        let per_shard = NonZeroUsize::new(per_shard).ok_or_else(|| {
            ConfigError::invalid("size_in_cells", params.size_in_cells, "cache capacity must be positive")
        })?;
        Ok(Self {
            name: name.into(),
            kind,
            lifetime,
            allow_read_expired_keys: params.allow_read_expired_keys,
            shards: (0..shard_count)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            hasher: RandomState::new(),
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            failures: Mutex::new(FailureState::default()),
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            source_calls: self.counters.source_calls.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &Key) -> &Mutex<LruCache<Key, CacheEntry>> {
        let index = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[index]
    }

    fn resident(&self, key: &Key) -> Resident {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();
        let Some(entry) = shard.get(key) else {
            return Resident::Missing;
        };
        if !entry.is_expired(now) {
            return Resident::Fresh(entry.value.clone());
        }
        if self.allow_read_expired_keys {
            return Resident::Stale(entry.value.clone());
        }
        shard.pop(key);
        Resident::Missing
    }

    fn store(&self, key: Key, value: Option<Attributes>) {
        let entry = CacheEntry {
            value,
            expires_at: self.lifetime.next_delay().map(|d| Instant::now() + d),
        };
        let evicted = self.shard(&key).lock().push(key.clone(), entry);
        if let Some((old_key, _)) = evicted {
            if old_key != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn claim(&self, key: &Key) -> Claim {
        let mut in_flight = self.in_flight.lock();
        if let Some(sender) = in_flight.get(key) {
            return Claim::Follower(sender.subscribe());
        }
        // A leader may have finished since our first probe.
        if let Resident::Fresh(value) = self.resident(key) {
            return Claim::Resident(value);
        }
        let (tx, _rx) = watch::channel(None);
        let sender = Arc::new(tx);
        in_flight.insert(key.clone(), Arc::clone(&sender));
        Claim::Leader(sender)
    }

    /// Publish a leader's result: LRU first, then release the claim, then wake followers.
    fn complete(&self, key: &Key, sender: &FetchSender, result: FetchResult, cache: bool) {
        if cache {
            if let Ok(value) = &result {
                self.store(key.clone(), value.clone());
            }
        }
        release(&mut self.in_flight.lock(), key, sender);
        sender.send_replace(Some(result));
    }

    async fn fetch(
        &self,
        keys: &[Key],
        source: &dyn DictionarySource,
    ) -> Result<HashMap<Key, Attributes>, SourceError> {
        self.counters.source_calls.fetch_add(1, Ordering::Relaxed);
        debug!(dictionary = %self.name, keys = keys.len(), "cache miss, loading from source");
        let rows = collect_rows(source.load_ids(keys).await?).await?;
        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = row.key.clone();
            found.insert(key, row.into_attributes());
        }
        Ok(found)
    }

    fn record_fetch(&self, outcome: Result<(), &SourceError>) {
        let mut failures = self.failures.lock();
        match outcome {
            Ok(()) => *failures = FailureState::default(),
            Err(e) => {
                failures.failed_attempts += 1;
                failures.last_error = Some(DictionaryError::from(e.clone()));
            }
        }
    }

    /// Lead the load of `keys`, answering every claim whatever happens.
    async fn lead(
        &self,
        leaders: Vec<(Key, FetchSender, Option<Option<Attributes>>)>,
        source: &dyn DictionarySource,
    ) -> DictResult<Vec<(Key, Option<Attributes>)>> {
        let mut guard = ClaimGuard {
            layout: self,
            claims: leaders
                .iter()
                .map(|(k, s, _)| (k.clone(), Arc::clone(s)))
                .collect(),
        };
        let keys: Vec<Key> = leaders.iter().map(|(k, _, _)| k.clone()).collect();
        let fetched = self.fetch(&keys, source).await;
        self.record_fetch(fetched.as_ref().map(|_| ()));

        let mut out = Vec::with_capacity(leaders.len());
        let mut first_error = None;
        match fetched {
            Ok(mut found) => {
                for (key, sender, _) in leaders {
                    let value = found.remove(&key);
                    self.complete(&key, &sender, Ok(value.clone()), true);
                    out.push((key, value));
                }
            }
            Err(e) => {
                let error = DictionaryError::from(e);
                for (key, sender, stale) in leaders {
                    match stale {
                        Some(value) if self.allow_read_expired_keys => {
                            debug!(dictionary = %self.name, key = %key, "serving expired entry after failed re-fetch");
                            self.complete(&key, &sender, Ok(value.clone()), false);
                            out.push((key, value));
                        }
                        _ => {
                            self.complete(&key, &sender, Err(error.clone()), false);
                            first_error.get_or_insert_with(|| error.clone());
                        }
                    }
                }
            }
        }
        guard.claims.clear();
        match first_error {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Drop expired entries, unless they are kept for stale reads.
    fn purge_expired(&self) -> usize {
        if self.allow_read_expired_keys {
            return 0;
        }
        let now = Instant::now();
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let expired: Vec<Key> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                shard.pop(&key);
                purged += 1;
            }
        }
        purged
    }
}

fn release(in_flight: &mut HashMap<Key, FetchSender>, key: &Key, sender: &FetchSender) {
    if in_flight
        .get(key)
        .is_some_and(|current| Arc::ptr_eq(current, sender))
    {
        in_flight.remove(key);
    }
}

/// Releases claims of a leader that never completed (cancelled or panicked).
struct ClaimGuard<'a> {
    layout: &'a CacheLayout,
    claims: Vec<(Key, FetchSender)>,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.claims.is_empty() {
            return;
        }
        let mut in_flight = self.layout.in_flight.lock();
        for (key, sender) in &self.claims {
            release(&mut in_flight, key, sender);
        }
    }
}

#[async_trait]
impl DictionaryLayout for CacheLayout {
    fn kind(&self) -> LayoutKind {
        self.kind
    }

    fn status(&self) -> LayoutStatus {
        let failures = self.failures.lock();
        LayoutStatus {
            state: LayoutState::Ready,
            generation: 0,
            element_count: self.len(),
            loaded_at: None,
            failed_attempts: failures.failed_attempts,
            last_error: failures.last_error.clone(),
        }
    }

    fn is_loaded(&self) -> bool {
        true
    }

    async fn refresh(
        &self,
        _source: &dyn DictionarySource,
        _mode: RefreshMode,
    ) -> DictResult<RefreshOutcome> {
        let purged = self.purge_expired();
        if purged > 0 {
            debug!(dictionary = %self.name, purged, "purged expired cache entries");
        }
        Ok(RefreshOutcome::Unchanged)
    }

    async fn lookup(
        &self,
        probe: Probe<'_>,
        source: &dyn DictionarySource,
    ) -> DictResult<Option<Attributes>> {
        let mut out = self.lookup_many(std::slice::from_ref(probe.key), source).await?;
        Ok(out.pop().flatten())
    }

    async fn lookup_many(
        &self,
        keys: &[Key],
        source: &dyn DictionarySource,
    ) -> DictResult<Vec<Option<Attributes>>> {
        let mut results: Vec<Option<Option<Attributes>>> = vec![None; keys.len()];
        let mut pending: HashMap<Key, (Vec<usize>, Option<Option<Attributes>>)> = HashMap::new();

        for (i, key) in keys.iter().enumerate() {
            if let Some((slots, _)) = pending.get_mut(key) {
                slots.push(i);
                continue;
            }
            match self.resident(key) {
                Resident::Fresh(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    results[i] = Some(value);
                }
                Resident::Stale(value) => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    pending.insert(key.clone(), (vec![i], Some(value)));
                }
                Resident::Missing => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    pending.insert(key.clone(), (vec![i], None));
                }
            }
        }

        while !pending.is_empty() {
            let mut resolved: Vec<(Key, Option<Attributes>)> = Vec::new();
            let mut leaders = Vec::new();
            let mut followers = Vec::new();
            for (key, (_, stale)) in &pending {
                match self.claim(key) {
                    Claim::Resident(value) => resolved.push((key.clone(), value)),
                    Claim::Leader(sender) => leaders.push((key.clone(), sender, stale.clone())),
                    Claim::Follower(rx) => followers.push((key.clone(), rx)),
                }
            }

            if !leaders.is_empty() {
                resolved.extend(self.lead(leaders, source).await?);
            }
            for (key, mut rx) in followers {
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(result) => (*result).clone(),
                    // Leader gave up without a result; claim again next round.
                    Err(_) => None,
                };
                match outcome {
                    Some(Ok(value)) => resolved.push((key, value)),
                    Some(Err(e)) => return Err(e),
                    None => {}
                }
            }

            for (key, value) in resolved {
                if let Some((slots, _)) = pending.remove(&key) {
                    for i in slots {
                        results[i] = Some(value.clone());
                    }
                }
            }
        }

        Ok(results.into_iter().map(Option::flatten).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, RowStream};
    use dictum_core::{Row, Timestamp, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts `load_ids` calls and can be told to fail or stall.
    struct Counting {
        inner: MemorySource,
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
        delay: Duration,
    }

    impl Counting {
        fn new(rows: Vec<Row>) -> Self {
            Self {
                inner: MemorySource::new(rows),
                calls: AtomicUsize::new(0),
                fail: Default::default(),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DictionarySource for Counting {
        fn kind(&self) -> &str {
            "counting"
        }

        async fn load_all(&self) -> Result<RowStream, SourceError> {
            self.inner.load_all().await
        }

        async fn load_ids(&self, keys: &[Key]) -> Result<RowStream, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::unavailable("counting", "down"));
            }
            self.inner.load_ids(keys).await
        }

        async fn load_updated_after(&self, since: Timestamp) -> Result<RowStream, SourceError> {
            self.inner.load_updated_after(since).await
        }

        fn supports_selective_load(&self) -> bool {
            true
        }
    }

    fn rows(n: u64) -> Vec<Row> {
        (1..=n)
            .map(|id| Row::new(id, vec![Value::String(format!("v{id}"))]))
            .collect()
    }

    fn cache(params: CacheParams, lifetime: Lifetime) -> CacheLayout {
        CacheLayout::new("users", LayoutKind::Cache, params, lifetime).unwrap()
    }

    async fn get(layout: &CacheLayout, source: &Counting, id: u64) -> Option<Attributes> {
        let key = Key::Simple(id);
        layout.lookup(Probe::key(&key), source).await.unwrap()
    }

    #[test]
    fn test_shard_defaults() {
        assert_eq!(CacheParams::new(100).shard_count(), 1);
        assert_eq!(CacheParams::new(4095).shard_count(), 1);
        assert_eq!(CacheParams::new(4096).shard_count(), 16);
        assert_eq!(CacheParams::new(4096).with_shards(4).shard_count(), 4);
        assert!(CacheParams::new(0).validate().is_err());
        assert!(CacheParams::new(2).with_shards(3).validate().is_err());
    }

    #[test]
    fn test_params_accept_capacity_alias() {
        let params: CacheParams =
            serde_json::from_value(serde_json::json!({ "capacity": 8, "allow_read_expired_keys": true }))
                .unwrap();
        assert_eq!(params.size_in_cells, 8);
        assert!(params.allow_read_expired_keys);
    }

    #[tokio::test]
    async fn test_lru_eviction_then_single_reload() {
        let source = Counting::new(rows(10));
        let layout = cache(CacheParams::new(3), Lifetime::NEVER);

        for id in 1..=3 {
            assert!(get(&layout, &source, id).await.is_some());
        }
        assert_eq!(source.calls(), 3);

        // Fourth distinct key evicts key 1, the least recently used.
        get(&layout, &source, 4).await;
        assert_eq!(layout.stats().evictions, 1);
        assert_eq!(layout.len(), 3);

        get(&layout, &source, 1).await;
        assert_eq!(source.calls(), 5);
        // Key 1 is resident again.
        get(&layout, &source, 1).await;
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test]
    async fn test_negative_results_are_cached() {
        let source = Counting::new(rows(2));
        let layout = cache(CacheParams::new(10), Lifetime::NEVER);
        assert!(get(&layout, &source, 99).await.is_none());
        assert!(get(&layout, &source, 99).await.is_none());
        assert_eq!(source.calls(), 1);
        let stats = layout.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_marker_expires() {
        let source = Counting::new(rows(2));
        let layout = cache(CacheParams::new(10), Lifetime::fixed(Duration::from_secs(60)));
        assert!(get(&layout, &source, 7).await.is_none());
        assert_eq!(source.calls(), 1);

        source.inner.upsert(Row::new(7u64, vec![Value::from("late")]));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(get(&layout, &source, 7).await.is_none());
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let found = get(&layout, &source, 7).await.unwrap();
        assert_eq!(found.values(), &[Value::from("late")]);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_load() {
        let mut source = Counting::new(rows(5));
        source.delay = Duration::from_millis(50);
        let layout = cache(CacheParams::new(10), Lifetime::NEVER);
        let key = Key::Simple(3);

        let lookups = (0..8).map(|_| layout.lookup(Probe::key(&key), &source));
        let results = futures_util::future::join_all(lookups).await;

        assert_eq!(source.calls(), 1);
        let first = results[0].clone().unwrap().unwrap();
        for result in results {
            assert_eq!(result.unwrap().unwrap().values(), first.values());
        }
    }

    #[tokio::test]
    async fn test_bulk_lookup_batches_misses() {
        let source = Counting::new(rows(10));
        let layout = cache(CacheParams::new(100), Lifetime::NEVER);
        get(&layout, &source, 2).await;
        assert_eq!(source.calls(), 1);

        let keys: Vec<Key> = [1, 2, 3, 42, 3].into_iter().map(Key::Simple).collect();
        let out = layout.lookup_many(&keys, &source).await.unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].as_ref().unwrap().values(), &[Value::from("v1")]);
        assert!(out[1].is_some());
        assert!(out[3].is_none());
        assert_eq!(out[2], out[4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_reload() {
        let source = Counting::new(rows(3));
        let layout = cache(CacheParams::new(10), Lifetime::fixed(Duration::from_secs(60)));
        get(&layout, &source, 1).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        get(&layout, &source, 1).await;
        assert_eq!(source.calls(), 1);
        tokio::time::advance(Duration::from_secs(31)).await;
        get(&layout, &source, 1).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_read_on_failed_refetch() {
        let source = Counting::new(rows(3));
        let layout = cache(
            CacheParams::new(10).with_read_expired_keys(true),
            Lifetime::fixed(Duration::from_secs(10)),
        );
        assert!(get(&layout, &source, 1).await.is_some());
        tokio::time::advance(Duration::from_secs(11)).await;
        source.fail.store(true, Ordering::SeqCst);

        let key = Key::Simple(1);
        let stale = layout.lookup(Probe::key(&key), &source).await.unwrap();
        assert_eq!(stale.unwrap().values(), &[Value::from("v1")]);
        assert_eq!(layout.status().failed_attempts, 1);

        // Without a resident copy the failure surfaces.
        let missing = Key::Simple(2);
        let err = layout.lookup(Probe::key(&missing), &source).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_without_stale_reads() {
        let source = Counting::new(rows(3));
        let layout = cache(CacheParams::new(10), Lifetime::fixed(Duration::from_secs(10)));
        get(&layout, &source, 1).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        source.fail.store(true, Ordering::SeqCst);
        let key = Key::Simple(1);
        assert!(layout.lookup(Probe::key(&key), &source).await.is_err());
        assert!(layout.in_flight.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_purges_expired() {
        let source = Counting::new(rows(3));
        let layout = cache(CacheParams::new(10), Lifetime::fixed(Duration::from_secs(5)));
        get(&layout, &source, 1).await;
        get(&layout, &source, 2).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        let outcome = layout.refresh(&source, RefreshMode::Full).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Unchanged);
        assert!(layout.is_empty());
        assert!(layout.is_loaded());
    }

    #[tokio::test]
    async fn test_sharded_cache_serves_all_keys() {
        let source = Counting::new(rows(50));
        let layout = cache(CacheParams::new(400).with_shards(4), Lifetime::NEVER);
        assert_eq!(layout.shard_count(), 4);
        for id in 1..=50 {
            assert!(get(&layout, &source, id).await.is_some());
        }
        assert_eq!(layout.len(), 50);
    }
}
