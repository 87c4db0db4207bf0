//! # Query Cache
//!
//! Two-tier cache in front of the connection manager.
//!
//! Lookup order is L1 → L2 → origin. An L2 hit is copied into L1 for the
//! time the shared entry has left; an origin result is written to both tiers
//! with the same TTL. Concurrent callers for one key share a single origin
//! fetch and all observe its result or its error.
//!
//! Tier failures never reach the caller: they are logged, counted and
//! treated as misses.
//!
//! An invalidation that lands while a matching origin fetch is in flight
//! detaches that fetch: its waiters still get the result, but it is not
//! written to either tier, and later callers start a fresh fetch.

use crate::cache::errors::CacheError;
use crate::cache::fingerprint::family_fingerprint;
use crate::cache::glob::glob_match;
use crate::cache::l1::L1Cache;
use crate::cache::provider::SharedTier;
use crate::config::{CircuitBreakerConfig, QueryCacheConfig};
use crate::database::{ConnectionManager, LogicalDb, ManagerMode, QueryResult, SqlParam};
use crate::error::{GatewayError, Result};
use crate::resilience::CircuitState;
use crate::telemetry::{CacheEvent, CacheOutcome, CacheTier, TelemetrySink};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

/// Origin fetch registered for a key
#[derive(Clone)]
struct InFlight {
    fetch: SharedFetch,
    /// Set when the key is invalidated before the fetch completes
    stale: Arc<AtomicBool>,
}

/// Envelope written to the shared tier so a reader can recover the
/// remaining lifetime without a second round trip
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    expires_at_ms: i64,
}

impl StoredEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            value,
            expires_at_ms: chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms),
        }
    }

    fn remaining(&self) -> Duration {
        let left = self.expires_at_ms - chrono::Utc::now().timestamp_millis();
        Duration::from_millis(u64::try_from(left).unwrap_or(0))
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
    origin_fetches: AtomicU64,
    origin_errors: AtomicU64,
    coalesced_waits: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_errors: u64,
    pub origin_fetches: u64,
    pub origin_errors: u64,
    /// Callers that joined a fetch already in flight instead of starting one
    pub coalesced_waits: u64,
    pub invalidations: u64,
    pub l1_entries: usize,
    pub in_flight: usize,
    pub l2_backend: &'static str,
    pub l2_circuit: Option<CircuitState>,
}

/// Entries removed by an invalidation, per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub l1_removed: usize,
    pub l2_removed: u64,
}

struct CacheInner {
    config: QueryCacheConfig,
    l1: L1Cache,
    l2: SharedTier,
    inflight: DashMap<String, InFlight>,
    counters: CacheCounters,
    telemetry: Arc<dyn TelemetrySink>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CacheInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("enabled", &self.config.enabled)
            .field("l1_entries", &self.l1.len())
            .field("l2", &self.l2)
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl CacheInner {
    fn emit(&self, tier: CacheTier, outcome: CacheOutcome, key: &str) {
        self.telemetry.on_cache(&CacheEvent::new(tier, outcome, key));
    }

    async fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.l1.get(key) {
            CacheCounters::bump(&self.counters.l1_hits);
            self.emit(CacheTier::L1, CacheOutcome::Hit, key);
            return Some(value);
        }
        CacheCounters::bump(&self.counters.l1_misses);
        self.emit(CacheTier::L1, CacheOutcome::Miss, key);

        if !self.l2.is_enabled() {
            return None;
        }

        match self.l2.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<StoredEntry>(&raw) {
                Ok(entry) => {
                    let remaining = entry.remaining();
                    if remaining.is_zero() {
                        CacheCounters::bump(&self.counters.l2_misses);
                        self.emit(CacheTier::L2, CacheOutcome::Miss, key);
                        return None;
                    }
                    CacheCounters::bump(&self.counters.l2_hits);
                    self.emit(CacheTier::L2, CacheOutcome::Hit, key);
                    self.l1.insert(key, entry.value.clone(), remaining);
                    Some(entry.value)
                }
                Err(e) => {
                    self.tier_error(key, &CacheError::from(e));
                    None
                }
            },
            Ok(None) => {
                CacheCounters::bump(&self.counters.l2_misses);
                self.emit(CacheTier::L2, CacheOutcome::Miss, key);
                None
            }
            Err(e) => {
                self.tier_error(key, &e);
                None
            }
        }
    }

    fn tier_error(&self, key: &str, error: &CacheError) {
        CacheCounters::bump(&self.counters.l2_errors);
        self.emit(CacheTier::L2, CacheOutcome::Error, key);
        match error {
            CacheError::CircuitOpen => debug!(key, "Shared cache tier skipped, circuit open"),
            _ => warn!(key, error = %error, "Shared cache tier error, continuing without it"),
        }
    }

    async fn store(&self, key: &str, value: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        self.l1.insert(key, value.clone(), ttl);
        self.emit(CacheTier::L1, CacheOutcome::Write, key);

        if !self.l2.is_enabled() {
            return;
        }

        let raw = match serde_json::to_string(&StoredEntry::new(value, ttl)) {
            Ok(raw) => raw,
            Err(e) => {
                self.tier_error(key, &CacheError::from(e));
                return;
            }
        };
        match self.l2.set(key, &raw, ttl).await {
            Ok(()) => self.emit(CacheTier::L2, CacheOutcome::Write, key),
            Err(e) => self.tier_error(key, &e),
        }
    }

    /// Drop the in-flight entry for `key` if it is still the one tagged `stale`
    fn finish_flight(&self, key: &str, stale: &Arc<AtomicBool>) {
        self.inflight
            .remove_if(key, |_, flight| Arc::ptr_eq(&flight.stale, stale));
    }

    /// Mark in-flight fetches for matching keys stale and detach them
    fn detach_flights(&self, matches: impl Fn(&str) -> bool) -> usize {
        let mut detached = 0;
        self.inflight.retain(|key, flight| {
            if matches(key.as_str()) {
                flight.stale.store(true, Ordering::Release);
                detached += 1;
                false
            } else {
                true
            }
        });
        detached
    }

    /// Origin fetch shared by every caller waiting on `key`.
    ///
    /// Whoever drives the future to completion populates the tiers, unless
    /// the key was invalidated meanwhile, and clears the in-flight entry.
    async fn origin_fetch<T, Fut>(
        inner: Weak<CacheInner>,
        key: String,
        ttl: Duration,
        stale: Arc<AtomicBool>,
        fetch: Fut,
    ) -> Result<Value>
    where
        T: Serialize,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cache) = inner.upgrade() {
            if let Some(value) = cache.l1.get(&key) {
                cache.finish_flight(&key, &stale);
                return Ok(value);
            }
            CacheCounters::bump(&cache.counters.origin_fetches);
        }

        let result = fetch
            .await
            .and_then(|value| serde_json::to_value(value).map_err(GatewayError::from));

        if let Some(cache) = inner.upgrade() {
            match &result {
                Ok(value) => {
                    cache.emit(CacheTier::Origin, CacheOutcome::Hit, &key);
                    if stale.load(Ordering::Acquire) {
                        debug!(key = %key, "Key invalidated during origin fetch, result not cached");
                    } else {
                        cache.store(&key, value.clone(), ttl).await;
                        if stale.load(Ordering::Acquire) {
                            cache.l1.remove(&key);
                            if cache.l2.is_enabled() {
                                if let Err(e) = cache.l2.delete(&key).await {
                                    cache.tier_error(&key, &e);
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    CacheCounters::bump(&cache.counters.origin_errors);
                    cache.emit(CacheTier::Origin, CacheOutcome::Error, &key);
                    debug!(key = %key, error = %e, "Origin fetch failed, nothing cached");
                }
            }
            cache.finish_flight(&key, &stale);
        }
        result
    }
}

/// Two-tier cache with single-flight origin fetches
#[derive(Debug, Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new(config: QueryCacheConfig, l2: SharedTier, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                l1: L1Cache::new(config.l1.max_entries),
                l2,
                inflight: DashMap::new(),
                counters: CacheCounters::default(),
                telemetry,
                sweeper: parking_lot::Mutex::new(None),
                config,
            }),
        }
    }

    /// Build both tiers from configuration and start the L1 sweep task
    pub async fn from_config(
        config: &QueryCacheConfig,
        breakers: &CircuitBreakerConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        config.log_configuration();
        let l2 = SharedTier::from_config_graceful(config, breakers, Arc::clone(&telemetry)).await;
        let cache = Self::new(config.clone(), l2, telemetry);
        cache.start_sweeper();
        info!(
            enabled = config.enabled,
            l2_backend = cache.inner.l2.provider_name(),
            default_ttl_seconds = config.default_ttl_seconds,
            "Query cache ready"
        );
        cache
    }

    /// Build from the current environment's preset plus
    /// `ERP_GATEWAY_QUERY_CACHE_*` / `ERP_GATEWAY_REDIS_URL` overrides
    pub async fn from_environment(
        breakers: &CircuitBreakerConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self::from_config(&QueryCacheConfig::from_environment(), breakers, telemetry).await
    }

    /// Spawn the periodic L1 expiry sweep. Must run inside a Tokio runtime;
    /// calling it again is a no-op.
    pub fn start_sweeper(&self) {
        if !self.inner.config.enabled {
            return;
        }
        let mut slot = self.inner.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.l1.sweep_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = inner.l1.sweep_expired();
                if removed > 0 {
                    debug!(removed, remaining = inner.l1.len(), "L1 sweep removed expired entries");
                }
            }
        }));
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.config.default_ttl()
    }

    /// Cached value for `key`, consulting L1 then L2
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.is_enabled() {
            return None;
        }
        let value = self.inner.lookup(key).await?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(key, error = %e, "Cached payload does not match requested type");
                None
            }
        }
    }

    /// Write `value` to both tiers with `ttl` or the configured default.
    ///
    /// Fails only when `value` cannot be serialized.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let value = serde_json::to_value(value)?;
        self.inner
            .store(key, value, ttl.unwrap_or_else(|| self.default_ttl()))
            .await;
        Ok(())
    }

    /// Cached value for `key`, or the result of `fetch` (run at most once
    /// across concurrent callers) written to both tiers.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.is_enabled() {
            return fetch().await;
        }

        if let Some(value) = self.inner.lookup(key).await {
            match serde_json::from_value(value) {
                Ok(decoded) => return Ok(decoded),
                Err(e) => {
                    warn!(key, error = %e, "Cached payload does not match requested type, refetching");
                    self.inner.l1.remove(key);
                }
            }
        }

        let ttl = ttl.unwrap_or_else(|| self.default_ttl());
        let (shared, leader) = match self.inner.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().fetch.clone(), false),
            Entry::Vacant(entry) => {
                let stale = Arc::new(AtomicBool::new(false));
                let fetch = CacheInner::origin_fetch(
                    Arc::downgrade(&self.inner),
                    key.to_string(),
                    ttl,
                    Arc::clone(&stale),
                    fetch(),
                );
                let shared = fetch.boxed().shared();
                entry.insert(InFlight {
                    fetch: shared.clone(),
                    stale,
                });
                (shared, true)
            }
        };

        if !leader {
            CacheCounters::bump(&self.inner.counters.coalesced_waits);
            self.inner.emit(CacheTier::Origin, CacheOutcome::Coalesced, key);
            debug!(key, "Joined in-flight origin fetch");
        }

        let value = shared.await?;
        serde_json::from_value(value).map_err(GatewayError::from)
    }

    /// Cache-fronted `ConnectionManager::execute`.
    ///
    /// The key is `family:<fingerprint>`, so `invalidate_pattern("family:*")`
    /// drops every cached statement of that family. Results served while the
    /// manager is degraded are never cached.
    pub async fn cached_execute(
        &self,
        manager: &Arc<ConnectionManager>,
        family: &str,
        db: LogicalDb,
        sql: &str,
        params: &[SqlParam],
        ttl: Option<Duration>,
    ) -> Result<QueryResult> {
        if manager.initialize().await? == ManagerMode::Degraded {
            return manager.execute(db, sql, params).await;
        }

        let key = family_fingerprint(family, sql, params);
        let manager = Arc::clone(manager);
        let sql = sql.to_string();
        let params = params.to_vec();
        self.get_or_fetch(&key, ttl, move || async move {
            manager.execute(db, &sql, &params).await
        })
        .await
    }

    /// Remove `key` from both tiers. A fetch for `key` still in flight
    /// will not be cached.
    pub async fn invalidate(&self, key: &str) -> InvalidationReport {
        CacheCounters::bump(&self.inner.counters.invalidations);
        self.inner.detach_flights(|candidate| candidate == key);
        let l1_removed = usize::from(self.inner.l1.remove(key));
        self.inner.emit(CacheTier::L1, CacheOutcome::Invalidate, key);

        let mut report = InvalidationReport {
            l1_removed,
            l2_removed: 0,
        };
        if self.inner.l2.is_enabled() {
            match self.inner.l2.delete(key).await {
                Ok(()) => {
                    report.l2_removed = 1;
                    self.inner.emit(CacheTier::L2, CacheOutcome::Invalidate, key);
                }
                Err(e) => self.inner.tier_error(key, &e),
            }
        }
        report
    }

    /// Remove every key matching the glob `pattern` (e.g. `item:*`) from both
    /// tiers. Keys are enumerated; no secondary index is kept.
    pub async fn invalidate_pattern(&self, pattern: &str) -> InvalidationReport {
        CacheCounters::bump(&self.inner.counters.invalidations);
        let detached = self.inner.detach_flights(|key| glob_match(pattern, key));
        if detached > 0 {
            debug!(pattern, detached, "Detached in-flight fetches");
        }
        let l1_removed = self.inner.l1.remove_matching(pattern);
        self.inner.emit(CacheTier::L1, CacheOutcome::Invalidate, pattern);

        let mut report = InvalidationReport {
            l1_removed,
            l2_removed: 0,
        };
        if self.inner.l2.is_enabled() {
            match self.inner.l2.delete_pattern(pattern).await {
                Ok(removed) => {
                    report.l2_removed = removed;
                    self.inner.emit(CacheTier::L2, CacheOutcome::Invalidate, pattern);
                }
                Err(e) => self.inner.tier_error(pattern, &e),
            }
        }
        debug!(pattern, l1_removed = report.l1_removed, l2_removed = report.l2_removed, "Pattern invalidation");
        report
    }

    /// Drop all L1 entries (the shared tier is left alone)
    pub fn clear_local(&self) {
        self.inner.l1.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            l1_hits: c.l1_hits.load(Ordering::Relaxed),
            l1_misses: c.l1_misses.load(Ordering::Relaxed),
            l2_hits: c.l2_hits.load(Ordering::Relaxed),
            l2_misses: c.l2_misses.load(Ordering::Relaxed),
            l2_errors: c.l2_errors.load(Ordering::Relaxed),
            origin_fetches: c.origin_fetches.load(Ordering::Relaxed),
            origin_errors: c.origin_errors.load(Ordering::Relaxed),
            coalesced_waits: c.coalesced_waits.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            l1_entries: self.inner.l1.len(),
            in_flight: self.inner.inflight.len(),
            l2_backend: self.inner.l2.provider_name(),
            l2_circuit: self.inner.l2.circuit_state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::providers::MemoryStore;
    use crate::test_utils::RecordingSink;
    use std::sync::atomic::AtomicU32;

    fn memory_cache(store: &MemoryStore) -> QueryCache {
        let config = QueryCacheConfig::for_test();
        let l2 = SharedTier::memory(store.clone(), &config);
        QueryCache::new(config, l2, Arc::new(RecordingSink::default()))
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cache = memory_cache(&MemoryStore::new());
        cache
            .set("item:1", &vec!["bolt".to_string()], Some(Duration::from_secs(30)))
            .await
            .unwrap();
        let value: Option<Vec<String>> = cache.get("item:1").await;
        assert_eq!(value, Some(vec!["bolt".to_string()]));
    }

    #[tokio::test]
    async fn test_l2_hit_is_written_back_to_l1() {
        let store = MemoryStore::new();
        let writer = memory_cache(&store);
        let reader = memory_cache(&store);

        writer.set("item:2", &42u32, None).await.unwrap();
        assert_eq!(reader.get::<u32>("item:2").await, Some(42));
        assert_eq!(reader.stats().l2_hits, 1);

        assert_eq!(reader.get::<u32>("item:2").await, Some(42));
        assert_eq!(reader.stats().l1_hits, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let cache = memory_cache(&MemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let first: Result<u32> = cache
            .get_or_fetch("item:3", None, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Timeout("origin".into()))
            })
            .await;
        assert!(first.is_err());

        let counter = Arc::clone(&calls);
        let second: Result<u32> = cache
            .get_or_fetch("item:3", None, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert_eq!(second.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_unreachable_l2_degrades_to_origin() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let cache = memory_cache(&store);

        let value: u32 = cache
            .get_or_fetch("item:4", None, || async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert!(cache.stats().l2_errors >= 1);
        assert_eq!(cache.get::<u32>("item:4").await, Some(5));
    }

    #[tokio::test]
    async fn test_disabled_cache_always_fetches() {
        let mut config = QueryCacheConfig::for_test();
        config.enabled = false;
        let cache = QueryCache::new(config, SharedTier::noop(), Arc::new(RecordingSink::default()));

        cache.set("k", &1u32, None).await.unwrap();
        assert_eq!(cache.get::<u32>("k").await, None);
        let value: u32 = cache.get_or_fetch("k", None, || async { Ok(2) }).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_l1_entries() {
        let cache = memory_cache(&MemoryStore::new());
        cache.start_sweeper();
        cache.set("short", &1u32, Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(cache.stats().l1_entries, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.stats().l1_entries, 0);
        cache.stop_sweeper();
    }
}
