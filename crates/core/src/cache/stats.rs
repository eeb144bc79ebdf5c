//! Cache statistics and metrics tracking

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Statistics for one cache type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Cache type these counters belong to
    pub cache_type: String,
    /// Entries physically stored, including expired ones
    pub entries: usize,
    /// Estimated bytes currently stored
    pub bytes: usize,
    /// Configured entry bound
    pub max_entries: usize,
    /// Configured byte bound
    pub max_bytes: usize,

    /// Reads served from a fresh entry
    pub hits: u64,
    /// Reads that found nothing fresh
    pub misses: u64,
    /// Inserts and replacements
    pub sets: u64,
    /// Explicit deletes and pattern invalidations
    pub deletes: u64,
    /// Entries removed to satisfy size bounds
    pub evictions: u64,
    /// Expired entries removed by cleanup
    pub expirations: u64,
    /// Entries removed by pattern invalidation or clearing
    pub invalidations: u64,
    /// Expired values returned by a fallback strategy
    pub stale_served: u64,
    /// Stale-while-revalidate refreshes started
    pub background_refreshes: u64,
}

impl CacheStats {
    /// Calculate hit rate (hits / total accesses)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Atomic counters behind [`CacheStats`]
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) sets: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) expirations: AtomicU64,
    pub(crate) invalidations: AtomicU64,
    pub(crate) stale_served: AtomicU64,
    pub(crate) background_refreshes: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Fill the counter fields of `stats`
    pub(crate) fn fill(&self, stats: &mut CacheStats) {
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
        stats.sets = self.sets.load(Ordering::Relaxed);
        stats.deletes = self.deletes.load(Ordering::Relaxed);
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.expirations = self.expirations.load(Ordering::Relaxed);
        stats.invalidations = self.invalidations.load(Ordering::Relaxed);
        stats.stale_served = self.stale_served.load(Ordering::Relaxed);
        stats.background_refreshes = self.background_refreshes.load(Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.evictions,
            &self.expirations,
            &self.invalidations,
            &self.stale_served,
            &self.background_refreshes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
