//! Expiry index for cache entries
//!
//! Maps expiry instant -> set of cache keys so that expired entries can be
//! purged without scanning the whole cache. The index may hold stale
//! entries (a key rewritten with a later expiry); callers re-check the live
//! entry before removing it.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

/// Expiry index: expiry instant -> cache keys
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    index: BTreeMap<Instant, HashSet<String>>,
}

impl ExpiryIndex {
    /// Create a new empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` expires at `at`
    pub fn insert(&mut self, at: Instant, key: String) {
        self.index.entry(at).or_default().insert(key);
    }

    /// Forget `key` at `at`, dropping the instant when it becomes empty
    pub fn remove(&mut self, at: Instant, key: &str) {
        if let Some(keys) = self.index.get_mut(&at) {
            keys.remove(key);
            if keys.is_empty() {
                self.index.remove(&at);
            }
        }
    }

    /// Remove and return every key recorded at or before `now`
    pub fn drain_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<Instant> = self.index.range(..=now).map(|(at, _)| *at).collect();
        let mut keys = Vec::new();
        for at in expired {
            if let Some(set) = self.index.remove(&at) {
                keys.extend(set);
            }
        }
        keys
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Total number of recorded keys
    pub fn len(&self) -> usize {
        self.index.values().map(HashSet::len).sum()
    }
}
