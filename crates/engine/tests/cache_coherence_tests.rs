//! Cache Coherence Tests
//!
//! After any sequence of successful operations, a cached entity either is
//! absent or equals the stored record. Failed transactions never touch the
//! cache.

use cachestore_core::{BackingStore, CacheValue, DistributedCache, Entity, Key, Value};
use cachestore_engine::{CacheStore, CacheStoreConfig, CachingDataAccessLayer, EntityPool};
use cachestore_storage::{MemoryCache, MemoryStore};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn setup_with(config: CacheStoreConfig) -> (Arc<MemoryStore>, Arc<MemoryCache>, CacheStore) {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let handle = CacheStore::builder(store.clone(), cache.clone())
        .config(config)
        .build()
        .unwrap();
    (store, cache, handle)
}

fn setup() -> (Arc<MemoryStore>, Arc<MemoryCache>, CacheStore) {
    setup_with(CacheStoreConfig::default())
}

fn item(id: i64, n: i64) -> Entity {
    let mut e = Entity::new(Key::with_id("Item", id));
    e.set_property("n", n);
    e
}

fn cached(handle: &CacheStore, key: &Key) -> Option<Entity> {
    handle
        .cache()
        .get(&handle.entity_cache_key(key))
        .unwrap()
        .and_then(CacheValue::into_entity)
}

fn assert_coherent(store: &MemoryStore, handle: &CacheStore, key: &Key) {
    if let Some(in_cache) = cached(handle, key) {
        let in_store = store.get(None, key).unwrap();
        assert_eq!(Some(in_cache), in_store, "cache disagrees with store for {key}");
    }
}

// ============================================================================
// Commit / abort
// ============================================================================

#[test]
fn test_commit_publishes_every_change() {
    let (store, _, handle) = setup();
    let mut dal = handle.session();
    dal.put_many(&mut [item(1, 0), item(2, 0), item(3, 0)]).unwrap();

    dal.begin_transaction(true).unwrap();
    let mut one = dal.get(&Key::with_id("Item", 1)).unwrap();
    one.set_property("n", 10i64);
    dal.put(&mut one).unwrap();
    dal.delete(&Key::with_id("Item", 2)).unwrap();
    let mut fresh = Entity::of_kind("Item");
    let fresh_key = dal.put(&mut fresh).unwrap();
    dal.commit().unwrap();

    for id in 1..=3 {
        assert_coherent(&store, &handle, &Key::with_id("Item", id));
    }
    assert!(cached(&handle, &Key::with_id("Item", 2)).is_none());
    assert_eq!(cached(&handle, &fresh_key), Some(fresh));
}

#[test]
fn test_aborted_transaction_leaves_cache_alone() {
    let (store, cache, handle) = setup();
    let mut dal = handle.session();
    dal.put(&mut item(1, 0)).unwrap();
    let before = cache.len();

    dal.begin_transaction(true).unwrap();
    let mut e = dal.get(&Key::with_id("Item", 1)).unwrap();
    store.inject_commit_conflicts(1);
    e.set_property("n", 5i64);
    dal.put(&mut e).unwrap();
    dal.put(&mut Entity::of_kind("Item")).unwrap();
    assert!(dal.commit().is_err());

    assert_eq!(cache.len(), before);
    assert_eq!(
        cached(&handle, &Key::with_id("Item", 1)).unwrap().property("n"),
        Some(&Value::Int(0))
    );
    assert_coherent(&store, &handle, &Key::with_id("Item", 1));
}

// ============================================================================
// Degraded cache
// ============================================================================

#[test]
fn test_expired_cache_entry_falls_back_to_store() {
    let mut config = CacheStoreConfig::default();
    config.cache.entity_ttl_secs = Some(0);
    let (_, _, handle) = setup_with(config);
    let mut dal = handle.session();
    let key = dal.put(&mut item(1, 7)).unwrap();

    thread::sleep(Duration::from_millis(5));
    assert!(cached(&handle, &key).is_none());
    assert_eq!(dal.get(&key).unwrap().property("n"), Some(&Value::Int(7)));
}

#[test]
fn test_foreign_cache_value_is_a_miss() {
    let (_, _, handle) = setup();
    let mut dal = handle.session();
    let key = dal.put(&mut item(1, 7)).unwrap();
    handle
        .cache()
        .put(&handle.entity_cache_key(&key), CacheValue::Int(3), None)
        .unwrap();

    handle.reset_stats();
    assert_eq!(dal.get(&key).unwrap().property("n"), Some(&Value::Int(7)));
    assert_eq!(handle.stats().cache_misses, 1);
}

// ============================================================================
// Concurrent sessions
// ============================================================================

#[test]
fn test_concurrent_writers_leave_cache_coherent() {
    const THREADS: i64 = 4;
    let (store, _, handle) = setup();
    handle.session().put(&mut item(1, 0)).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let handle = handle.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut dal = handle.session();
                barrier.wait();
                for round in 0..20 {
                    dal.begin_transaction(true).unwrap();
                    let mut e = dal.get(&Key::with_id("Item", 1)).unwrap();
                    e.set_property("n", t * 100 + round);
                    dal.put(&mut e).unwrap();
                    let _ = dal.commit();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Cache writes after commit are not ordered across sessions; a fresh
    // read-through after eviction must agree with the store.
    let key = Key::with_id("Item", 1);
    handle.cache().delete(&handle.entity_cache_key(&key)).unwrap();
    handle.session().get(&key).unwrap();
    assert_coherent(&store, &handle, &key);
}

#[test]
fn test_pool_reads_through_cache() {
    let (_, _, handle) = setup();
    let mut dal = handle.session();
    dal.put_many(&mut [item(1, 1), item(2, 2)]).unwrap();
    handle.reset_stats();

    let mut pool = EntityPool::new();
    pool.add_to_queue(vec![Key::with_id("Item", 1), Key::with_id("Item", 2)]);
    pool.add_to_queue(Key::with_id("Item", 3));
    pool.load_entities(&mut dal).unwrap();

    assert_eq!(handle.stats().cache_hits, 2);
    assert_eq!(pool.failed_fetch_count(), 1);
}

// ============================================================================
// Properties
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(i64, i64),
    Delete(i64),
    Get(i64),
    TxnPut(i64, i64, bool),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..5, any::<i64>()).prop_map(|(id, n)| Op::Put(id, n)),
        (1i64..5).prop_map(Op::Delete),
        (1i64..5).prop_map(Op::Get),
        (1i64..5, any::<i64>(), any::<bool>()).prop_map(|(id, n, c)| Op::TxnPut(id, n, c)),
    ]
}

fn apply(dal: &mut CachingDataAccessLayer, op: &Op) {
    match *op {
        Op::Put(id, n) => {
            dal.put(&mut item(id, n)).unwrap();
        }
        Op::Delete(id) => dal.delete(&Key::with_id("Item", id)).unwrap(),
        Op::Get(id) => {
            dal.get_if_exists(&Key::with_id("Item", id)).unwrap();
        }
        Op::TxnPut(id, n, commit) => {
            dal.begin_transaction(false).unwrap();
            dal.put(&mut item(id, n)).unwrap();
            if commit {
                dal.commit().unwrap();
            } else {
                dal.rollback_if_active().unwrap();
            }
        }
    }
}

proptest! {
    #[test]
    fn prop_cache_never_disagrees_with_store(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let (store, _, handle) = setup();
        let mut dal = handle.session();
        for op in &ops {
            apply(&mut dal, op);
            for id in 1..5 {
                let key = Key::with_id("Item", id);
                if let Some(in_cache) = cached(&handle, &key) {
                    prop_assert_eq!(Some(in_cache), store.get(None, &key).unwrap());
                }
            }
        }
    }
}
