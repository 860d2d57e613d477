//! In-memory distributed cache
//!
//! Values are stored bincode-encoded, so every read returns a fresh
//! snapshot and transient entity attributes never reach the cache.
//! Expired entries are treated as absent on access and can be purged in
//! bulk with `purge_expired`.

use crate::ttl::ExpiryIndex;
use cachestore_core::{CacheValue, DistributedCache, Error, Identifiable, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug)]
struct CacheEntry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
    stamp: u64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory `DistributedCache`
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    expiries: Mutex<ExpiryIndex>,
    stamps: AtomicU64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            expiries: Mutex::new(ExpiryIndex::new()),
            stamps: AtomicU64::new(1),
        }
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry (simulates a cache flush)
    pub fn clear(&self) {
        self.entries.clear();
        *self.expiries.lock() = ExpiryIndex::new();
    }

    /// Remove entries whose expiry has passed; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let candidates = self.expiries.lock().drain_expired(now);
        candidates
            .into_iter()
            .filter(|key| {
                self.entries
                    .remove_if(key, |_, entry| !entry.is_live(now))
                    .is_some()
            })
            .count()
    }

    fn new_entry(&self, value: &CacheValue, expiry: Option<Duration>) -> Result<CacheEntry> {
        Ok(CacheEntry {
            bytes: bincode::serialize(value)?,
            expires_at: expiry.map(|d| Instant::now() + d),
            stamp: self.stamps.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn track_expiry(&self, key: &str, expires_at: Option<Instant>) {
        if let Some(at) = expires_at {
            self.expiries.lock().insert(at, key.to_string());
        }
    }

    /// Decode the live entry under `key`, dropping it if expired
    fn read_live(&self, key: &str) -> Result<Option<(CacheValue, u64)>> {
        let now = Instant::now();
        let decoded = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                Some((bincode::deserialize(&entry.bytes)?, entry.stamp))
            }
            Some(_) => None,
            None => return Ok(None),
        };
        if decoded.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(decoded)
    }
}

impl DistributedCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let value = self.read_live(key)?.map(|(value, _)| value);
        trace!(target: "cachestore::cache", key, hit = value.is_some(), "get");
        Ok(value)
    }

    fn get_many(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some((value, _)) = self.read_live(key)? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    fn put(&self, key: &str, value: CacheValue, expiry: Option<Duration>) -> Result<()> {
        let entry = self.new_entry(&value, expiry)?;
        let expires_at = entry.expires_at;
        self.entries.insert(key.to_string(), entry);
        self.track_expiry(key, expires_at);
        Ok(())
    }

    fn put_many(&self, entries: Vec<(String, CacheValue)>, expiry: Option<Duration>) -> Result<()> {
        for (key, value) in entries {
            self.put(&key, value, expiry)?;
        }
        Ok(())
    }

    fn put_if_absent(&self, key: &str, value: CacheValue, expiry: Option<Duration>) -> Result<bool> {
        let now = Instant::now();
        let fresh = self.new_entry(&value, expiry)?;
        let expires_at = fresh.expires_at;
        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) if existing.get().is_live(now) => false,
            Entry::Occupied(mut expired) => {
                expired.insert(fresh);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };
        if written {
            self.track_expiry(key, expires_at);
        }
        Ok(written)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now)))
    }

    fn delete_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    fn get_identifiable(&self, key: &str) -> Result<Option<Identifiable>> {
        Ok(self
            .read_live(key)?
            .map(|(value, stamp)| Identifiable { value, stamp }))
    }

    fn put_if_untouched(
        &self,
        key: &str,
        previous: &Identifiable,
        value: CacheValue,
        expiry: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let fresh = self.new_entry(&value, expiry)?;
        let expires_at = fresh.expires_at;
        let written = match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.stamp == previous.stamp => {
                *entry = fresh;
                true
            }
            _ => false,
        };
        if written {
            self.track_expiry(key, expires_at);
        }
        Ok(written)
    }

    fn increment(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        if !entry.is_live(now) {
            return Ok(None);
        }
        let current = match bincode::deserialize::<CacheValue>(&entry.bytes)? {
            CacheValue::Int(i) => i,
            other => {
                return Err(Error::Cache(format!(
                    "cannot increment non-integer entry {key} ({other:?})"
                )))
            }
        };
        let next = current.wrapping_add(delta);
        entry.bytes = bincode::serialize(&CacheValue::Int(next))?;
        entry.stamp = self.stamps.fetch_add(1, Ordering::Relaxed);
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachestore_core::{Entity, Key};
    use std::thread;

    #[test]
    fn test_put_get_delete() {
        let cache = MemoryCache::new();
        cache.put("a", CacheValue::Int(1), None).unwrap();
        assert_eq!(cache.get("a").unwrap(), Some(CacheValue::Int(1)));
        assert!(cache.delete("a").unwrap());
        assert!(!cache.delete("a").unwrap());
        assert_eq!(cache.get("a").unwrap(), None);
    }

    #[test]
    fn test_entity_snapshot_drops_attributes() {
        let cache = MemoryCache::new();
        let mut e = Entity::new(Key::with_id("User", 1));
        e.set_property("n", 1i64);
        e.attributes_mut().insert("trace", 1u8);
        cache.put("u", CacheValue::Entity(e.clone()), None).unwrap();

        let back = cache.get("u").unwrap().unwrap().into_entity().unwrap();
        assert_eq!(back, e);
        assert!(back.attributes().is_empty());
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let cache = MemoryCache::new();
        cache
            .put("t", CacheValue::Bool(true), Some(Duration::from_millis(10)))
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("t").unwrap(), None);
        assert_eq!(cache.increment("t", 1).unwrap(), None);
        assert!(cache
            .put_if_absent("t", CacheValue::Bool(true), None)
            .unwrap());
    }

    #[test]
    fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache
            .put("short", CacheValue::Int(1), Some(Duration::from_millis(5)))
            .unwrap();
        cache
            .put("long", CacheValue::Int(1), Some(Duration::from_secs(60)))
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_if_absent() {
        let cache = MemoryCache::new();
        assert!(cache.put_if_absent("k", CacheValue::Int(1), None).unwrap());
        assert!(!cache.put_if_absent("k", CacheValue::Int(2), None).unwrap());
        assert_eq!(cache.get("k").unwrap(), Some(CacheValue::Int(1)));
    }

    #[test]
    fn test_compare_and_swap() {
        let cache = MemoryCache::new();
        cache.put("k", CacheValue::Int(1), None).unwrap();
        let first = cache.get_identifiable("k").unwrap().unwrap();
        let second = cache.get_identifiable("k").unwrap().unwrap();

        assert!(cache
            .put_if_untouched("k", &first, CacheValue::Int(2), None)
            .unwrap());
        assert!(!cache
            .put_if_untouched("k", &second, CacheValue::Int(3), None)
            .unwrap());
        assert_eq!(cache.get("k").unwrap(), Some(CacheValue::Int(2)));
    }

    #[test]
    fn test_increment() {
        let cache = MemoryCache::new();
        assert_eq!(cache.increment("c", 1).unwrap(), None);
        cache.put("c", CacheValue::Int(10), None).unwrap();
        assert_eq!(cache.increment("c", -3).unwrap(), Some(7));
        cache.put("f", CacheValue::Bool(true), None).unwrap();
        assert!(cache.increment("f", 1).is_err());
    }

    #[test]
    fn test_concurrent_put_if_absent_has_single_winner() {
        use std::sync::{Arc, Barrier};

        let cache = Arc::new(MemoryCache::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.put_if_absent("lock", CacheValue::Bool(true), None).unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
