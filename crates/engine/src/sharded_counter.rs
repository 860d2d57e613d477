//! Sharded counters
//!
//! A logical counter on `(owner, field)` is spread over several shard
//! records so that concurrent increments rarely touch the same record.
//! Each increment picks one shard at random and updates it in its own
//! transaction; a read sums every shard straight from the store.
//!
//! Shard records live under the reserved kind `_ShardCounter`, named
//! `<len>:<owner><len>:<field>.<n>` with `n` in `1..=shard_count`. Both
//! parts carry their byte length, so no two `(owner, field)` pairs share a
//! name. The shard count may differ between calls; reads always see every
//! shard ever written.

use crate::dal::CachingDataAccessLayer;
use crate::handle::CacheStore;
use cachestore_concurrency::RetryPolicy;
use cachestore_core::{Entity, Error, FetchOptions, Key, Query, Result, Value};
use rand::Rng;
use tracing::{debug, trace};

/// Reserved kind of shard records
pub const SHARD_KIND: &str = "_ShardCounter";

const OWNER_PROPERTY: &str = "owner";
const FIELD_PROPERTY: &str = "field";
const VALUE_PROPERTY: &str = "value";
const READ_PAGE_SIZE: usize = 500;

/// Key of shard `index` of the counter on `(owner, field)`
pub fn shard_key(owner: &Key, field: &str, index: u32) -> Key {
    let owner = owner.to_string();
    Key::with_name(
        SHARD_KIND,
        format!("{}:{owner}{}:{field}.{index}", owner.len(), field.len()),
    )
}

fn shard_query(owner: &Key, field: &str) -> Query {
    Query::new(SHARD_KIND)
        .filter_eq(OWNER_PROPERTY, owner.clone())
        .filter_eq(FIELD_PROPERTY, field)
}

/// High-contention counters stored as sums of shard records
#[derive(Debug, Clone)]
pub struct ShardedCounterService {
    handle: CacheStore,
    policy: RetryPolicy,
    default_shards: u32,
}

impl ShardedCounterService {
    /// Service using the handle's retry policy and default shard count
    pub fn new(handle: CacheStore) -> Self {
        let policy = handle.config().retry;
        let default_shards = handle.config().counters.default_shard_count;
        Self {
            handle,
            policy,
            default_shards,
        }
    }

    /// Override the retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shard count used by `increment`
    pub fn default_shard_count(&self) -> u32 {
        self.default_shards
    }

    /// Add `delta` to the counter using the default shard count
    pub fn increment(&self, owner: &Key, field: &str, delta: i64) -> Result<()> {
        self.increment_with_shards(owner, field, delta, self.default_shards)
    }

    /// Add `delta` to the counter, spreading writes over `shard_count` shards
    ///
    /// # Errors
    /// - `Error::InvalidArgument` for a zero shard count or incomplete owner
    /// - `Error::RetryLimitExceeded` when every attempt conflicted
    pub fn increment_with_shards(
        &self,
        owner: &Key,
        field: &str,
        delta: i64,
        shard_count: u32,
    ) -> Result<()> {
        if shard_count == 0 {
            return Err(Error::invalid_argument("shard count must be positive"));
        }
        if !owner.is_complete() {
            return Err(Error::invalid_argument(format!(
                "counter owner {owner} is incomplete"
            )));
        }

        let mut dal = self.handle.session();
        let mut state = self.policy.start();
        let mut rng = rand::thread_rng();
        loop {
            let index = rng.gen_range(1..=shard_count);
            let key = shard_key(owner, field, index);
            match Self::apply_to_shard(&mut dal, owner, field, &key, delta) {
                Ok(total) => {
                    trace!(
                        target: "cachestore::counter",
                        shard = %key,
                        total,
                        attempts = state.attempts() + 1,
                        "Shard incremented"
                    );
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    dal.rollback_if_active()?;
                    state.record_failure(e)?;
                }
                Err(e) => {
                    dal.rollback_if_active()?;
                    return Err(e);
                }
            }
        }
    }

    /// One transactional read-modify-write of a shard; returns its new value
    fn apply_to_shard(
        dal: &mut CachingDataAccessLayer,
        owner: &Key,
        field: &str,
        key: &Key,
        delta: i64,
    ) -> Result<i64> {
        dal.begin_transaction(true)?;
        let mut shard = match dal.get_if_exists(key)? {
            Some(shard) => shard,
            None => {
                let mut shard = Entity::new(key.clone());
                shard.set_property(OWNER_PROPERTY, owner.clone());
                shard.set_property(FIELD_PROPERTY, field);
                shard
            }
        };
        let value = shard
            .property(VALUE_PROPERTY)
            .and_then(Value::as_int)
            .unwrap_or(0)
            + delta;
        shard.set_unindexed_property(VALUE_PROPERTY, value);
        dal.put(&mut shard)?;
        dal.commit()?;
        Ok(value)
    }

    /// Current value: the sum over every shard, read from the store
    pub fn read(&self, owner: &Key, field: &str) -> Result<i64> {
        let store = self.handle.store();
        let query = shard_query(owner, field);
        let mut options = FetchOptions::with_limit(READ_PAGE_SIZE);
        let mut total = 0i64;
        let mut shards = 0usize;
        loop {
            let page = store.query(&query, &options)?;
            shards += page.entities.len();
            total += page
                .entities
                .iter()
                .filter_map(|e| e.property(VALUE_PROPERTY).and_then(Value::as_int))
                .sum::<i64>();
            if !page.more_results {
                break;
            }
            options = FetchOptions::with_limit(READ_PAGE_SIZE).start_at(page.end_cursor);
        }
        trace!(target: "cachestore::counter", owner = %owner, field, shards, total, "Counter read");
        Ok(total)
    }

    /// Delete every shard; returns how many were removed
    pub fn reset(&self, owner: &Key, field: &str) -> Result<usize> {
        let mut dal = self.handle.session();
        let keys = dal.query_keys(&shard_query(owner, field), None, None)?;
        dal.delete_many(&keys)?;
        debug!(target: "cachestore::counter", owner = %owner, field, shards = keys.len(), "Counter reset");
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachestore_core::BackingStore;
    use cachestore_storage::{MemoryCache, MemoryStore};
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryStore>, ShardedCounterService) {
        let store = Arc::new(MemoryStore::new());
        let handle = CacheStore::new(store.clone(), Arc::new(MemoryCache::new()));
        (store, ShardedCounterService::new(handle))
    }

    #[test]
    fn test_shard_key_layout() {
        let owner = Key::with_id("Player", 4);
        let key = shard_key(&owner, "kills", 2);
        assert_eq!(key.kind(), SHARD_KIND);
        assert_eq!(key.name(), Some("9:Player(4)5:kills.2"));
    }

    #[test]
    fn test_shard_keys_of_nested_owners_stay_apart() {
        let parent = Key::with_id("Guild", 1);
        let child = Key::with_id("Player", 2).child_of(parent.clone());

        // Rendered back to back, both pairs spell "Guild(1)/Player(2)xp".
        let a = shard_key(&parent, "/Player(2)xp", 1);
        let b = shard_key(&child, "xp", 1);
        assert_ne!(a, b);

        let c = shard_key(&Key::with_id("Player", 1), "1.2", 3);
        let d = shard_key(&Key::with_id("Player", 1), "1", 23);
        assert_ne!(c, d);
    }

    #[test]
    fn test_increment_and_read() {
        let (store, counters) = setup();
        let owner = Key::with_id("Player", 1);
        for _ in 0..20 {
            counters.increment(&owner, "kills", 1).unwrap();
        }
        counters.increment(&owner, "kills", -5).unwrap();

        assert_eq!(counters.read(&owner, "kills").unwrap(), 15);
        assert_eq!(counters.read(&owner, "deaths").unwrap(), 0);
        assert!(store.len() <= counters.default_shard_count() as usize);
    }

    #[test]
    fn test_shard_count_may_vary() {
        let (_, counters) = setup();
        let owner = Key::with_id("Player", 1);
        counters.increment_with_shards(&owner, "xp", 10, 1).unwrap();
        counters.increment_with_shards(&owner, "xp", 10, 20).unwrap();
        assert_eq!(counters.read(&owner, "xp").unwrap(), 20);
    }

    #[test]
    fn test_invalid_arguments() {
        let (_, counters) = setup();
        let err = counters
            .increment_with_shards(&Key::with_id("Player", 1), "xp", 1, 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(counters.increment(&Key::incomplete("Player"), "xp", 1).is_err());
    }

    #[test]
    fn test_conflicts_are_retried() {
        let (store, counters) = setup();
        store.inject_commit_conflicts(3);
        let owner = Key::with_id("Player", 1);
        counters.increment(&owner, "xp", 7).unwrap();
        assert_eq!(counters.read(&owner, "xp").unwrap(), 7);
        assert_eq!(store.open_transactions(), 0);
    }

    #[test]
    fn test_bounded_policy_surfaces_limit() {
        let (store, counters) = setup();
        let counters = counters.with_policy(RetryPolicy::default().with_max_attempts(2));
        store.inject_commit_conflicts(usize::MAX);
        let err = counters
            .increment(&Key::with_id("Player", 1), "xp", 1)
            .unwrap_err();
        assert!(matches!(err, Error::RetryLimitExceeded { attempts: 2, .. }));
    }

    #[test]
    fn test_reset_removes_all_shards() {
        let (store, counters) = setup();
        let owner = Key::with_id("Player", 1);
        let other = Key::with_id("Player", 2);
        counters.increment_with_shards(&owner, "xp", 1, 1).unwrap();
        counters.increment_with_shards(&owner, "xp", 1, 50).unwrap();
        counters.increment_with_shards(&other, "xp", 1, 1).unwrap();

        let removed = counters.reset(&owner, "xp").unwrap();
        assert!(removed >= 1);
        assert_eq!(counters.read(&owner, "xp").unwrap(), 0);
        assert_eq!(counters.read(&other, "xp").unwrap(), 1);
        assert!(store.get(None, &shard_key(&other, "xp", 1)).unwrap().is_some());
    }
}
