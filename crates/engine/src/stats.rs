//! Data access statistics
//!
//! Process-level counters shared by every session created from one
//! `CacheStore`. All counters use Relaxed ordering: they are observational
//! only and do not synchronize other memory.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters
#[derive(Debug, Default)]
pub struct DataAccessStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    store_gets: AtomicU64,
    store_puts: AtomicU64,
    store_deletes: AtomicU64,
    queries: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Entities served from the cache
    pub cache_hits: u64,
    /// Cache lookups that fell through to the store
    pub cache_misses: u64,
    /// Entities requested from the store
    pub store_gets: u64,
    /// Entities written to the store
    pub store_puts: u64,
    /// Keys deleted from the store
    pub store_deletes: u64,
    /// Queries run
    pub queries: u64,
    /// Transactions committed
    pub commits: u64,
    /// Commits rejected with a conflict
    pub conflicts: u64,
}

impl StatsSnapshot {
    /// Fraction of entity lookups served from cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl DataAccessStats {
    pub(crate) fn record_cache_hits(&self, n: usize) {
        self.cache_hits.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_misses(&self, n: usize) {
        self.cache_misses.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_store_gets(&self, n: usize) {
        self.store_gets.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_store_puts(&self, n: usize) {
        self.store_puts.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_store_deletes(&self, n: usize) {
        self.store_deletes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            store_gets: self.store_gets.load(Ordering::Relaxed),
            store_puts: self.store_puts.load(Ordering::Relaxed),
            store_deletes: self.store_deletes.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero
    pub fn reset(&self) {
        for counter in [
            &self.cache_hits,
            &self.cache_misses,
            &self.store_gets,
            &self.store_puts,
            &self.store_deletes,
            &self.queries,
            &self.commits,
            &self.conflicts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = DataAccessStats::default();
        stats.record_cache_hits(3);
        stats.record_cache_misses(1);
        stats.record_commit();

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 3);
        assert_eq!(snap.commits, 1);
        assert!((snap.hit_rate() - 0.75).abs() < f64::EPSILON);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_hit_rate_without_lookups() {
        assert_eq!(StatsSnapshot::default().hit_rate(), 0.0);
    }
}
