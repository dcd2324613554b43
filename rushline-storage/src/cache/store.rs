//! Cache-aside engine over the shared key-value store.
//!
//! This module routes reads through one of three [`CachePolicy`]s. Every
//! lock taken here is released on every exit path: loaders run in their own
//! task so that a panicking loader surfaces as `CacheError::Loader` instead
//! of skipping the release, and critical sections run detached from the
//! caller so an abandoned read does not abandon a held lock.

use super::bloom::BloomFilter;
use super::entry::{is_negative, LogicalEntry, NULL_SENTINEL};
use super::loader::{CacheId, CacheableValue, Loader};
use super::policy::{CachePolicy, CacheRead, CacheSource, RebuildStatus};
use crate::kv::KvStore;
use crate::lock::DistributedLock;
use rushline_core::keys::{cache_key, cache_lock_key};
use rushline_core::{
    Acquired, CacheError, CacheSettings, Clock, Lock, LockError, RushlineResult, SystemClock,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// STATISTICS
// ============================================================================

/// Counters for cache behaviour.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    bloom_rejections: AtomicU64,
    lock_waits: AtomicU64,
    stale_served: AtomicU64,
    rebuilds_started: AtomicU64,
    rebuilds_failed: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            bloom_rejections: self.bloom_rejections.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            rebuilds_started: self.rebuilds_started.load(Ordering::Relaxed),
            rebuilds_failed: self.rebuilds_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub negative_hits: u64,
    pub misses: u64,
    /// Loader invocations, rebuilds included.
    pub loads: u64,
    pub bloom_rejections: u64,
    pub lock_waits: u64,
    pub stale_served: u64,
    pub rebuilds_started: u64,
    pub rebuilds_failed: u64,
}

impl CacheStatsSnapshot {
    /// Calculate the hit rate (0.0 to 1.0). Negative hits count as hits.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.negative_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// CACHE STORE
// ============================================================================

enum Lookup<T> {
    Hit(T),
    Negative,
    Miss,
}

/// Read-through cache with per-read consistency policy.
#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn KvStore>,
    locks: DistributedLock,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    bloom: Option<Arc<BloomFilter>>,
    stats: Arc<CacheStats>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KvStore>, settings: CacheSettings) -> Self {
        Self {
            locks: DistributedLock::new(Arc::clone(&store)),
            store,
            clock: Arc::new(SystemClock),
            settings,
            bloom: None,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Use `clock` for logical expiry timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.locks = self.locks.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Answer ids the filter has never seen as absent without a lookup.
    pub fn with_bloom_filter(mut self, bloom: Arc<BloomFilter>) -> Self {
        self.bloom = Some(bloom);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Look up `prefix + id`, resolving misses with `loader` under `policy`.
    ///
    /// `ttl` is the physical TTL for pass-through and mutex writes, and the
    /// logical lifetime for logical-expiration rebuilds.
    pub async fn query_cached<K, T, L>(
        &self,
        prefix: &str,
        id: &K,
        ttl: Duration,
        policy: CachePolicy,
        loader: &Arc<L>,
    ) -> RushlineResult<Option<T>>
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        Ok(self.read(prefix, id, ttl, policy, loader).await?.into_value())
    }

    /// [`query_cached`](Self::query_cached) with the configured `normal_ttl`.
    pub async fn query<K, T, L>(
        &self,
        prefix: &str,
        id: &K,
        policy: CachePolicy,
        loader: &Arc<L>,
    ) -> RushlineResult<Option<T>>
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        self.query_cached(prefix, id, self.settings.normal_ttl, policy, loader)
            .await
    }

    /// Like [`query_cached`](Self::query_cached), returning provenance and
    /// rebuild metadata with the value.
    pub async fn read<K, T, L>(
        &self,
        prefix: &str,
        id: &K,
        ttl: Duration,
        policy: CachePolicy,
        loader: &Arc<L>,
    ) -> RushlineResult<CacheRead<T>>
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        let key = cache_key(prefix, &id.to_string());

        if let Some(bloom) = &self.bloom {
            if !bloom.might_contain(&key) {
                bump(&self.stats.bloom_rejections);
                tracing::debug!(key = %key, "Bloom filter rejected id");
                return Ok(CacheRead::absent(CacheSource::BloomFilter));
            }
        }

        match policy {
            CachePolicy::PassThrough => self.read_pass_through(&key, id, ttl, loader).await,
            CachePolicy::Mutex => self.read_mutex(prefix, &key, id, ttl, loader).await,
            CachePolicy::LogicalExpiration => {
                self.read_logical(prefix, &key, id, ttl, loader).await
            }
        }
    }

    /// Write a value with a physical TTL.
    pub async fn set<K: CacheId, T: CacheableValue>(
        &self,
        prefix: &str,
        id: &K,
        value: &T,
        ttl: Duration,
    ) -> RushlineResult<()> {
        let key = cache_key(prefix, &id.to_string());
        let json = encode(&key, value)?;
        self.store.set(&key, &json, Some(ttl)).await?;
        self.remember(&key);
        Ok(())
    }

    /// Write a logical-expiration entry that goes stale `ttl` from now.
    /// Keys read under [`CachePolicy::LogicalExpiration`] must be warmed first.
    pub async fn warm_logical<K: CacheId, T: CacheableValue>(
        &self,
        prefix: &str,
        id: &K,
        value: &T,
        ttl: Duration,
    ) -> RushlineResult<()> {
        let key = cache_key(prefix, &id.to_string());
        self.write_logical(&key, value, ttl).await?;
        self.remember(&key);
        Ok(())
    }

    /// Drop the cached entry. Callers update durable storage first.
    pub async fn invalidate<K: CacheId>(&self, prefix: &str, id: &K) -> RushlineResult<bool> {
        let key = cache_key(prefix, &id.to_string());
        let removed = self.store.delete(&key).await?;
        tracing::debug!(key = %key, removed, "Cache entry invalidated");
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Policies
    // ------------------------------------------------------------------------

    async fn read_pass_through<K, T, L>(
        &self,
        key: &str,
        id: &K,
        ttl: Duration,
        loader: &Arc<L>,
    ) -> RushlineResult<CacheRead<T>>
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        match self.lookup(key).await? {
            Lookup::Hit(value) => Ok(CacheRead::hit(value)),
            Lookup::Negative => Ok(CacheRead::absent(CacheSource::NegativeCache)),
            Lookup::Miss => {
                let loaded = self.load_and_fill(key, id, ttl, Arc::clone(loader)).await?;
                Ok(CacheRead::loaded(loaded))
            }
        }
    }

    async fn read_mutex<K, T, L>(
        &self,
        prefix: &str,
        key: &str,
        id: &K,
        ttl: Duration,
        loader: &Arc<L>,
    ) -> RushlineResult<CacheRead<T>>
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        let lock_key = cache_lock_key(prefix, &id.to_string());
        let attempts = self.settings.max_lock_retries.max(1);

        for attempt in 1..=attempts {
            match self.lookup(key).await? {
                Lookup::Hit(value) => return Ok(CacheRead::hit(value)),
                Lookup::Negative => return Ok(CacheRead::absent(CacheSource::NegativeCache)),
                Lookup::Miss => {}
            }

            let Some(lock) = self
                .locks
                .try_acquire(&lock_key, self.settings.rebuild_lock_lease)
                .await?
            else {
                bump(&self.stats.lock_waits);
                if attempt < attempts {
                    tokio::time::sleep(self.settings.retry_interval).await;
                }
                continue;
            };

            // Detached so the lock is released even if this caller goes away.
            let this = self.clone();
            let key_owned = key.to_string();
            let id_owned = id.clone();
            let loader = Arc::clone(loader);
            let section = tokio::spawn(async move {
                let result = this.fill_under_lock(&key_owned, &id_owned, ttl, loader).await;
                this.release_quietly(lock).await;
                result
            });
            return section.await.map_err(|e| CacheError::Loader {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        }

        tracing::warn!(key = %key, attempts, "Cache mutex retries exhausted");
        Err(LockError::Timeout {
            key: lock_key,
            attempts,
        }
        .into())
    }

    async fn read_logical<K, T, L>(
        &self,
        prefix: &str,
        key: &str,
        id: &K,
        ttl: Duration,
        loader: &Arc<L>,
    ) -> RushlineResult<CacheRead<T>>
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        let Some(entry) = self.lookup_logical::<T>(key).await? else {
            bump(&self.stats.misses);
            return Ok(CacheRead::absent(CacheSource::Absent));
        };
        if !entry.is_expired(self.now_ms()) {
            bump(&self.stats.hits);
            return Ok(CacheRead::hit(entry.data));
        }

        bump(&self.stats.stale_served);
        let lock_key = cache_lock_key(prefix, &id.to_string());
        let Some(lock) = self
            .locks
            .try_acquire(&lock_key, self.settings.rebuild_lock_lease)
            .await?
        else {
            return Ok(CacheRead::stale(entry.data, RebuildStatus::InProgress));
        };

        // Another rebuild may have finished between our read and the lock.
        match self.lookup_logical::<T>(key).await {
            Ok(Some(current)) if !current.is_expired(self.now_ms()) => {
                self.release_quietly(lock).await;
                return Ok(CacheRead::hit(current.data));
            }
            Ok(_) => {}
            Err(e) => {
                self.release_quietly(lock).await;
                return Err(e);
            }
        }

        bump(&self.stats.rebuilds_started);
        tracing::debug!(key = %key, "Logical rebuild started");
        let this = self.clone();
        let key_owned = key.to_string();
        let id_owned = id.clone();
        let loader = Arc::clone(loader);
        tokio::spawn(async move {
            this.rebuild_logical(&key_owned, &id_owned, ttl, loader).await;
            this.release_quietly(lock).await;
        });

        Ok(CacheRead::stale(entry.data, RebuildStatus::Started))
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn lookup<T: CacheableValue>(&self, key: &str) -> RushlineResult<Lookup<T>> {
        match self.store.get(key).await? {
            Some(raw) if is_negative(&raw) => {
                bump(&self.stats.negative_hits);
                Ok(Lookup::Negative)
            }
            Some(raw) => {
                bump(&self.stats.hits);
                Ok(Lookup::Hit(decode(key, &raw)?))
            }
            None => Ok(Lookup::Miss),
        }
    }

    async fn lookup_logical<T: CacheableValue>(
        &self,
        key: &str,
    ) -> RushlineResult<Option<LogicalEntry<T>>> {
        match self.store.get(key).await? {
            Some(raw) if !is_negative(&raw) => Ok(Some(decode(key, &raw)?)),
            _ => Ok(None),
        }
    }

    /// Double-check, then load and fill. Runs while holding the mutex lock.
    async fn fill_under_lock<K, T, L>(
        &self,
        key: &str,
        id: &K,
        ttl: Duration,
        loader: Arc<L>,
    ) -> RushlineResult<CacheRead<T>>
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        match self.lookup(key).await? {
            Lookup::Hit(value) => Ok(CacheRead::hit(value)),
            Lookup::Negative => Ok(CacheRead::absent(CacheSource::NegativeCache)),
            Lookup::Miss => Ok(CacheRead::loaded(
                self.load_and_fill(key, id, ttl, loader).await?,
            )),
        }
    }

    /// Load, then write either the value with `ttl` or the negative sentinel.
    async fn load_and_fill<K, T, L>(
        &self,
        key: &str,
        id: &K,
        ttl: Duration,
        loader: Arc<L>,
    ) -> RushlineResult<Option<T>>
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        bump(&self.stats.misses);
        let loaded = self.guarded_load(key, id, loader).await?;
        match &loaded {
            Some(value) => {
                let json = encode(key, value)?;
                self.store.set(key, &json, Some(ttl)).await?;
            }
            None => {
                tracing::debug!(key = %key, "Caching negative sentinel");
                self.store
                    .set(key, NULL_SENTINEL, Some(self.settings.null_ttl))
                    .await?;
            }
        }
        Ok(loaded)
    }

    async fn rebuild_logical<K, T, L>(&self, key: &str, id: &K, ttl: Duration, loader: Arc<L>)
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        let outcome = match self.guarded_load(key, id, loader).await {
            Ok(Some(value)) => self.write_logical(key, &value, ttl).await,
            Ok(None) => self.store.delete(key).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => tracing::debug!(key = %key, "Logical rebuild finished"),
            Err(e) => {
                bump(&self.stats.rebuilds_failed);
                tracing::warn!(key = %key, error = %e, "Logical rebuild failed; serving stale data");
            }
        }
    }

    /// Run the loader in its own task so a panic becomes an error.
    async fn guarded_load<K, T, L>(
        &self,
        key: &str,
        id: &K,
        loader: Arc<L>,
    ) -> RushlineResult<Option<T>>
    where
        K: CacheId,
        T: CacheableValue,
        L: Loader<K, T>,
    {
        bump(&self.stats.loads);
        let id = id.clone();
        tokio::spawn(async move { loader.load(&id).await })
            .await
            .map_err(|e| {
                tracing::error!(key = %key, error = %e, "Cache loader aborted");
                CacheError::Loader {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            })?
    }

    async fn write_logical<T: CacheableValue>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> RushlineResult<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let entry = LogicalEntry::new(value, self.now_ms().saturating_add(ttl_ms));
        let json = encode(key, &entry)?;
        self.store.set(key, &json, None).await
    }

    async fn release_quietly(&self, lock: Lock<Acquired>) {
        let key = lock.key().to_string();
        if let Err(e) = self.locks.release(lock).await {
            tracing::warn!(key = %key, error = %e, "Failed to release cache lock");
        }
    }

    fn remember(&self, key: &str) {
        if let Some(bloom) = &self.bloom {
            bloom.insert(key);
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

fn encode<T: serde::Serialize>(key: &str, value: &T) -> RushlineResult<String> {
    serde_json::to_string(value).map_err(|e| {
        CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> RushlineResult<T> {
    serde_json::from_str(raw).map_err(|e| {
        CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}
