//! Multi-strategy TTL and size bounded cache
//!
//! Entries are partitioned by *type* (e.g. `"track_metadata"`), each with its
//! own [`CacheTypeConfig`]. Expiry is lazy: an entry past its TTL is treated
//! as absent by [`Cache::get`] but stays stored so fallback strategies can
//! still serve it as stale data, until cleanup or eviction removes it.
//!
//! Size is estimated from the value's JSON encoding. On insert, the least
//! recently accessed entries are evicted until both `max_entries` and
//! `max_bytes` hold again; the entry just written is never the victim.
//!
//! ```
//! use std::time::Duration;
//!
//! use relaygate_core::{Cache, CacheTypeConfig};
//!
//! let cache: Cache<String> = Cache::new();
//! cache
//!     .configure_type("profiles", CacheTypeConfig::builder().ttl(Duration::from_secs(60)).build()?)?;
//! cache.set("profiles", "user-1", "Ada".to_string(), None)?;
//! assert_eq!(cache.get("profiles", "user-1"), Some("Ada".to_string()));
//! # Ok::<(), relaygate_common::EngineError>(())
//! ```

mod config;
mod stats;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use relaygate_common::{Clock, EngineError, EngineResult, SystemClock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::{CacheStrategy, CacheTypeConfig, CacheTypeConfigBuilder};
pub use stats::CacheStats;
use stats::CacheCounters;

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// Removed to satisfy `max_entries` / `max_bytes`
    Capacity,
    /// Removed by expiry cleanup
    Expired,
    /// Removed by delete, pattern invalidation or clearing
    Invalidated,
}

/// Observer called after entries are removed: `(cache_type, key, reason)`
pub type EvictHook = Arc<dyn Fn(&str, &str, EvictionReason) + Send + Sync>;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    access_tick: u64,
    ttl: Duration,
    size: usize,
}

impl<V> CacheEntry<V> {
    /// A TTL reaching past the representable range never expires
    fn is_fresh(&self, now: Instant) -> bool {
        match self.inserted_at.checked_add(self.ttl) {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

#[derive(Debug)]
struct TypePartition<V> {
    config: CacheTypeConfig,
    entries: HashMap<String, CacheEntry<V>>,
    total_bytes: usize,
    tick: u64,
    counters: Arc<CacheCounters>,
}

impl<V> TypePartition<V> {
    fn new(config: CacheTypeConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            total_bytes: 0,
            tick: 0,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    /// Evict least recently accessed entries, sparing `keep`, until within bounds
    fn enforce_bounds(&mut self, keep: Option<&str>) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.config.max_entries || self.total_bytes > self.config.max_bytes {
            let victim = self
                .entries
                .iter()
                .filter(|(key, _)| Some(key.as_str()) != keep)
                .min_by_key(|(_, entry)| entry.access_tick)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                break;
            };
            self.remove(&victim);
            CacheCounters::bump(&self.counters.evictions);
            evicted.push(victim);
        }
        evicted
    }

    fn stats(&self, cache_type: &str) -> CacheStats {
        let mut stats = CacheStats {
            cache_type: cache_type.to_string(),
            entries: self.entries.len(),
            bytes: self.total_bytes,
            max_entries: self.config.max_entries,
            max_bytes: self.config.max_bytes,
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }
}

struct Inner<V, C> {
    clock: C,
    types: Mutex<HashMap<String, TypePartition<V>>>,
    refreshing: Mutex<HashSet<(String, String)>>,
    on_evict: Mutex<Option<EvictHook>>,
    cleanup: Mutex<Option<CancellationToken>>,
}

/// Typed in-memory cache shared by clones
pub struct Cache<V, C: Clock = SystemClock> {
    inner: Arc<Inner<V, C>>,
}

impl<V, C: Clock> Clone for Cache<V, C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<V> Default for Cache<V, SystemClock>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Cache<V, SystemClock>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Empty cache on the system clock; configure types before use
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<V, C> Cache<V, C>
where
    V: Clone + Serialize + Send + Sync + 'static,
    C: Clock,
{
    /// Empty cache reading time from `clock`
    pub fn with_clock(clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                types: Mutex::new(HashMap::new()),
                refreshing: Mutex::new(HashSet::new()),
                on_evict: Mutex::new(None),
                cleanup: Mutex::new(None),
            }),
        }
    }

    /// Create or reconfigure a cache type; existing entries are trimmed to the
    /// new bounds.
    pub fn configure_type(&self, cache_type: &str, config: CacheTypeConfig) -> EngineResult<()> {
        config.validate()?;
        let evicted = {
            let mut types = self.inner.types.lock();
            match types.get_mut(cache_type) {
                Some(partition) => {
                    partition.config = config;
                    partition.enforce_bounds(None)
                }
                None => {
                    types.insert(cache_type.to_string(), TypePartition::new(config));
                    Vec::new()
                }
            }
        };
        self.notify_evicted(cache_type, evicted, EvictionReason::Capacity);
        debug!(cache_type, "Cache type configured");
        Ok(())
    }

    /// Install the eviction observer; panics inside it are caught and logged
    pub fn set_on_evict<F>(&self, hook: F)
    where
        F: Fn(&str, &str, EvictionReason) + Send + Sync + 'static,
    {
        *self.inner.on_evict.lock() = Some(Arc::new(hook));
    }

    /// Fresh value for `key`, or `None` if missing or expired
    pub fn get(&self, cache_type: &str, key: &str) -> Option<V> {
        self.lookup(cache_type, key, false).map(|(value, _)| value)
    }

    /// Cached value and whether it is still fresh. With `allow_stale`, expired
    /// entries are returned too.
    fn lookup(&self, cache_type: &str, key: &str, allow_stale: bool) -> Option<(V, bool)> {
        let now = self.inner.clock.now();
        let mut types = self.inner.types.lock();
        let partition = types.get_mut(cache_type)?;
        let tick = partition.next_tick();

        let found = match partition.entries.get_mut(key) {
            Some(entry) => {
                let fresh = entry.is_fresh(now);
                if fresh || allow_stale {
                    entry.access_tick = tick;
                    Some((entry.value.clone(), fresh))
                } else {
                    None
                }
            }
            None => None,
        };

        match &found {
            Some((_, true)) => CacheCounters::bump(&partition.counters.hits),
            _ => CacheCounters::bump(&partition.counters.misses),
        }
        found
    }

    /// Insert or replace `key`, evicting LRU entries as needed.
    ///
    /// `ttl` overrides the type's TTL for this entry.
    pub fn set(&self, cache_type: &str, key: &str, value: V, ttl: Option<Duration>) -> EngineResult<()> {
        let size = estimate_size(key, &value);
        let now = self.inner.clock.now();
        let evicted = {
            let mut types = self.inner.types.lock();
            let partition = types.get_mut(cache_type).ok_or_else(|| unknown_type(cache_type))?;
            let tick = partition.next_tick();
            let entry = CacheEntry {
                value,
                inserted_at: now,
                access_tick: tick,
                ttl: ttl.unwrap_or(partition.config.ttl),
                size,
            };

            partition.remove(key);
            partition.entries.insert(key.to_string(), entry);
            partition.total_bytes += size;
            CacheCounters::bump(&partition.counters.sets);

            if size > partition.config.max_bytes {
                debug!(cache_type, key, size, "Entry larger than cache type bound");
            }
            partition.enforce_bounds(Some(key))
        };

        if !evicted.is_empty() {
            debug!(cache_type, evicted = evicted.len(), "Evicted least recently used entries");
        }
        self.notify_evicted(cache_type, evicted, EvictionReason::Capacity);
        Ok(())
    }

    /// Remove one entry; returns whether it existed
    pub fn delete(&self, cache_type: &str, key: &str) -> bool {
        let removed = {
            let mut types = self.inner.types.lock();
            let Some(partition) = types.get_mut(cache_type) else {
                return false;
            };
            let removed = partition.remove(key).is_some();
            if removed {
                CacheCounters::bump(&partition.counters.deletes);
            }
            removed
        };
        if removed {
            self.notify_evicted(cache_type, vec![key.to_string()], EvictionReason::Invalidated);
        }
        removed
    }

    /// Remove exactly the entries of `cache_type` whose key matches `pattern`
    pub fn invalidate_by_pattern(&self, cache_type: &str, pattern: &Regex) -> usize {
        let removed = {
            let mut types = self.inner.types.lock();
            let Some(partition) = types.get_mut(cache_type) else {
                return 0;
            };
            let matching: Vec<String> =
                partition.entries.keys().filter(|key| pattern.is_match(key)).cloned().collect();
            for key in &matching {
                partition.remove(key);
            }
            CacheCounters::add(&partition.counters.invalidations, matching.len() as u64);
            matching
        };
        let count = removed.len();
        info!(cache_type, pattern = pattern.as_str(), count, "Invalidated cache entries");
        self.notify_evicted(cache_type, removed, EvictionReason::Invalidated);
        count
    }

    /// Drop every entry of one type, keeping its configuration
    pub fn clear_type(&self, cache_type: &str) -> usize {
        let removed: Vec<String> = {
            let mut types = self.inner.types.lock();
            let Some(partition) = types.get_mut(cache_type) else {
                return 0;
            };
            let keys: Vec<String> = partition.entries.drain().map(|(key, _)| key).collect();
            partition.total_bytes = 0;
            CacheCounters::add(&partition.counters.invalidations, keys.len() as u64);
            keys
        };
        let count = removed.len();
        self.notify_evicted(cache_type, removed, EvictionReason::Invalidated);
        count
    }

    /// Remove every entry of every type, returning how many went
    pub fn clear_all(&self) -> usize {
        self.types().iter().map(|cache_type| self.clear_type(cache_type)).sum()
    }

    /// Physically remove expired entries from every type
    pub fn cleanup_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let removed: Vec<(String, Vec<String>)> = {
            let mut types = self.inner.types.lock();
            types
                .iter_mut()
                .map(|(cache_type, partition)| {
                    let expired: Vec<String> = partition
                        .entries
                        .iter()
                        .filter(|(_, entry)| !entry.is_fresh(now))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in &expired {
                        partition.remove(key);
                    }
                    CacheCounters::add(&partition.counters.expirations, expired.len() as u64);
                    (cache_type.clone(), expired)
                })
                .collect()
        };

        let mut total = 0;
        for (cache_type, keys) in removed {
            total += keys.len();
            self.notify_evicted(&cache_type, keys, EvictionReason::Expired);
        }
        if total > 0 {
            debug!(removed = total, "Cleaned up expired cache entries");
        }
        total
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `interval` on the
    /// current tokio runtime until [`stop_cleanup`](Self::stop_cleanup).
    pub fn start_cleanup(&self, interval: Duration) -> EngineResult<()> {
        if interval.is_zero() {
            return Err(EngineError::config_field("cleanup_interval_ms", "must be greater than zero"));
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::config("cache cleanup requires a tokio runtime"))?;

        let token = CancellationToken::new();
        if let Some(previous) = self.inner.cleanup.lock().replace(token.clone()) {
            previous.cancel();
        }

        let weak: Weak<Inner<V, C>> = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            loop {
                let sleep = match weak.upgrade() {
                    Some(inner) => inner.clock.sleep(interval),
                    None => break,
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep => {}
                }
                match weak.upgrade() {
                    Some(inner) => {
                        Cache { inner }.cleanup_expired();
                    }
                    None => break,
                }
            }
            debug!("Cache cleanup task stopped");
        });
        info!(interval_ms = interval.as_millis() as u64, "Cache cleanup started");
        Ok(())
    }

    /// Stop the periodic sweep, if running
    pub fn stop_cleanup(&self) {
        if let Some(token) = self.inner.cleanup.lock().take() {
            token.cancel();
        }
    }

    /// Configured type names, sorted
    pub fn types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.types.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Entries physically stored for `cache_type`
    pub fn len(&self, cache_type: &str) -> usize {
        self.inner.types.lock().get(cache_type).map_or(0, |partition| partition.entries.len())
    }

    /// Whether `cache_type` holds no entries
    pub fn is_empty(&self, cache_type: &str) -> bool {
        self.len(cache_type) == 0
    }

    /// Counters for one type; `None` when unconfigured
    pub fn stats(&self, cache_type: &str) -> Option<CacheStats> {
        self.inner.types.lock().get(cache_type).map(|partition| partition.stats(cache_type))
    }

    /// Counters for every type, sorted by name
    pub fn all_stats(&self) -> Vec<CacheStats> {
        let types = self.inner.types.lock();
        let mut stats: Vec<CacheStats> =
            types.iter().map(|(cache_type, partition)| partition.stats(cache_type)).collect();
        stats.sort_by(|a, b| a.cache_type.cmp(&b.cache_type));
        stats
    }

    /// Zero every counter; entries are untouched
    pub fn reset_stats(&self) {
        for partition in self.inner.types.lock().values() {
            partition.counters.reset();
        }
    }

    /// Fetch through the type's configured strategy
    pub async fn fetch<F, Fut>(&self, cache_type: &str, key: &str, fetch: F) -> EngineResult<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<V>> + Send + 'static,
    {
        let strategy = self
            .inner
            .types
            .lock()
            .get(cache_type)
            .map(|partition| partition.config.strategy)
            .ok_or_else(|| unknown_type(cache_type))?;
        self.fetch_with_strategy(cache_type, key, strategy, fetch).await
    }

    /// Combine the cache and `fetch` according to `strategy`.
    ///
    /// Returns `Ok(None)` only for a `CacheOnly` miss.
    pub async fn fetch_with_strategy<F, Fut>(
        &self,
        cache_type: &str,
        key: &str,
        strategy: CacheStrategy,
        fetch: F,
    ) -> EngineResult<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<V>> + Send + 'static,
    {
        if strategy != CacheStrategy::NetworkOnly && !self.inner.types.lock().contains_key(cache_type) {
            return Err(unknown_type(cache_type));
        }

        match strategy {
            CacheStrategy::NetworkOnly => fetch().await.map(Some),
            CacheStrategy::CacheOnly => Ok(self.get(cache_type, key)),
            CacheStrategy::CacheFirst => {
                if let Some((value, true)) = self.lookup(cache_type, key, true) {
                    return Ok(Some(value));
                }
                self.fetch_and_store(cache_type, key, fetch).await
            }
            CacheStrategy::NetworkFirst => self.fetch_and_store(cache_type, key, fetch).await,
            CacheStrategy::StaleWhileRevalidate => match self.lookup(cache_type, key, true) {
                Some((value, fresh)) => {
                    if !fresh {
                        self.count(cache_type, |counters| CacheCounters::bump(&counters.stale_served));
                    }
                    self.spawn_refresh(cache_type, key, fetch);
                    Ok(Some(value))
                }
                None => self.fetch_and_store(cache_type, key, fetch).await,
            },
        }
    }

    /// Fetch and store; on failure serve any cached value, even expired
    async fn fetch_and_store<F, Fut>(&self, cache_type: &str, key: &str, fetch: F) -> EngineResult<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<V>>,
    {
        match fetch().await {
            Ok(value) => {
                self.set(cache_type, key, value.clone(), None)?;
                Ok(Some(value))
            }
            Err(err) => match self.peek_any(cache_type, key) {
                Some(stale) => {
                    warn!(cache_type, key, error = %err, "Fetch failed; serving cached value");
                    self.count(cache_type, |counters| CacheCounters::bump(&counters.stale_served));
                    Ok(Some(stale))
                }
                None => Err(err),
            },
        }
    }

    /// Any stored value, fresh or not, without touching hit/miss counters
    fn peek_any(&self, cache_type: &str, key: &str) -> Option<V> {
        let types = self.inner.types.lock();
        types.get(cache_type)?.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Refresh `key` in the background; at most one refresh per key runs at a time
    fn spawn_refresh<F, Fut>(&self, cache_type: &str, key: &str, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<V>> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(cache_type, key, "No runtime available for background refresh");
            return;
        };

        let flight = (cache_type.to_string(), key.to_string());
        if !self.inner.refreshing.lock().insert(flight.clone()) {
            debug!(cache_type, key, "Background refresh already in flight");
            return;
        }
        self.count(cache_type, |counters| CacheCounters::bump(&counters.background_refreshes));

        let cache = self.clone();
        handle.spawn(async move {
            let _flight = RefreshGuard { cache: cache.clone(), flight: flight.clone() };
            let (cache_type, key) = &flight;
            match fetch().await {
                Ok(value) => {
                    if let Err(err) = cache.set(cache_type, key, value, None) {
                        warn!(cache_type = cache_type.as_str(), error = %err, "Background refresh could not store value");
                    }
                }
                Err(err) => {
                    warn!(cache_type = cache_type.as_str(), key = key.as_str(), error = %err, "Background refresh failed");
                }
            }
        });
    }

    fn count(&self, cache_type: &str, apply: impl FnOnce(&CacheCounters)) {
        if let Some(partition) = self.inner.types.lock().get(cache_type) {
            apply(&partition.counters);
        }
    }

    fn notify_evicted(&self, cache_type: &str, keys: Vec<String>, reason: EvictionReason) {
        if keys.is_empty() {
            return;
        }
        let Some(hook) = self.inner.on_evict.lock().clone() else {
            return;
        };
        for key in keys {
            if catch_unwind(AssertUnwindSafe(|| hook(cache_type, &key, reason))).is_err() {
                warn!(cache_type, key = key.as_str(), "on_evict hook panicked");
            }
        }
    }
}

/// Clears the single-flight marker when a background refresh ends
struct RefreshGuard<V, C>
where
    V: Clone + Serialize + Send + Sync + 'static,
    C: Clock,
{
    cache: Cache<V, C>,
    flight: (String, String),
}

impl<V, C> Drop for RefreshGuard<V, C>
where
    V: Clone + Serialize + Send + Sync + 'static,
    C: Clock,
{
    fn drop(&mut self) {
        self.cache.inner.refreshing.lock().remove(&self.flight);
    }
}

fn unknown_type(cache_type: &str) -> EngineError {
    EngineError::config_field("cache_type", format!("cache type '{}' is not configured", cache_type))
}

/// Approximate footprint: key length plus JSON-encoded value length
fn estimate_size<V: Serialize>(key: &str, value: &V) -> usize {
    let value_size = serde_json::to_vec(value).map_or(std::mem::size_of::<V>(), |bytes| bytes.len());
    key.len() + value_size
}
