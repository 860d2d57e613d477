//! Process-local instance cache
//!
//! A second, expiring cache tier that lives inside one `CacheStore` and is
//! shared by all of its sessions. Nothing here is written through to the
//! distributed cache or the store; callers decide what to keep locally
//! and for how long. Expired entries read as absent and are dropped on
//! access or by `purge_expired`.

use cachestore_core::CacheValue;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone)]
struct InstanceEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl InstanceEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Expiring in-process map of cache values
#[derive(Debug, Default)]
pub struct InstanceCache {
    entries: DashMap<String, InstanceEntry>,
}

impl InstanceCache {
    /// Create an empty instance cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous entry
    pub fn put(&self, key: impl Into<String>, value: CacheValue, ttl: Option<Duration>) {
        let key = key.into();
        trace!(target: "cachestore::instance", key = %key, "put");
        self.entries.insert(
            key,
            InstanceEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    /// Store several values sharing one expiry
    pub fn put_many(&self, entries: Vec<(String, CacheValue)>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        for (key, value) in entries {
            self.entries.insert(key, InstanceEntry { value, expires_at });
        }
    }

    /// Live value under `key`
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => return None,
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        trace!(target: "cachestore::instance", key, hit = value.is_some(), "get");
        value
    }

    /// Drop `key`; returns whether a live entry was removed
    pub fn remove(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now))
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are held
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_put_get_remove() {
        let cache = InstanceCache::new();
        cache.put("a", CacheValue::Int(1), None);
        assert_eq!(cache.get("a").and_then(|v| v.as_int()), Some(1));
        assert!(cache.get("b").is_none());

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entry_reads_as_absent() {
        let cache = InstanceCache::new();
        cache.put("short", CacheValue::Bool(true), Some(Duration::from_millis(5)));
        cache.put("long", CacheValue::Bool(true), Some(Duration::from_secs(60)));
        thread::sleep(Duration::from_millis(20));

        assert!(cache.get("short").is_none());
        assert_eq!(cache.len(), 1);
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn test_purge_expired() {
        let cache = InstanceCache::new();
        cache.put_many(
            vec![
                ("x".to_string(), CacheValue::Int(1)),
                ("y".to_string(), CacheValue::Int(2)),
            ],
            Some(Duration::from_millis(5)),
        );
        cache.put("z", CacheValue::Int(3), None);
        thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
