//! Multi-Threaded Transaction Tests
//!
//! Validates optimistic concurrency through the data access layer:
//! first-committer-wins, atomic commit, and retry termination.

use cachestore_concurrency::RetryPolicy;
use cachestore_core::{BackingStore, Entity, Error, Key, Value};
use cachestore_engine::{CacheStore, CachingDataAccessLayer, TransactionRunner};
use cachestore_storage::{MemoryCache, MemoryStore};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;

fn setup() -> (Arc<MemoryStore>, CacheStore) {
    let store = Arc::new(MemoryStore::new());
    let handle = CacheStore::new(store.clone(), Arc::new(MemoryCache::new()));
    (store, handle)
}

fn account(id: i64, balance: i64) -> Entity {
    let mut e = Entity::new(Key::with_id("Account", id));
    e.set_property("balance", balance);
    e
}

fn balance(dal: &mut CachingDataAccessLayer, id: i64) -> i64 {
    dal.get(&Key::with_id("Account", id))
        .unwrap()
        .property("balance")
        .and_then(Value::as_int)
        .unwrap()
}

// ============================================================================
// Read-Write Conflict Tests
// ============================================================================

/// Test: T1 and T2 read the same record, both write -> exactly one commits
#[test]
fn test_read_write_conflict_first_committer_wins() {
    let (_, handle) = setup();
    handle.session().put(&mut account(1, 100)).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let handle = handle.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut dal = handle.session();
                dal.begin_transaction(true).unwrap();
                let mut e = dal.get(&Key::with_id("Account", 1)).unwrap();
                barrier.wait();
                e.set_property("balance", 100 + i64::from(i) + 1);
                dal.put(&mut e).unwrap();
                dal.commit()
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let committed = results.iter().filter(|r| r.is_ok()).count();
    let conflicted = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_conflict()))
        .count();

    assert_eq!(committed, 1, "exactly one writer should commit");
    assert_eq!(conflicted, 1, "the other writer should see a conflict");
    assert_eq!(handle.stats().conflicts, 1);
}

/// Test: blind writes (no read) never conflict
#[test]
fn test_blind_writes_no_conflict() {
    let (_, handle) = setup();
    handle.session().put(&mut account(1, 0)).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let handle = handle.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut dal = handle.session();
                dal.begin_transaction(false).unwrap();
                barrier.wait();
                dal.put(&mut account(1, i)).unwrap();
                dal.commit()
            })
        })
        .collect();

    for h in handles {
        assert!(h.join().unwrap().is_ok());
    }
}

/// Test: a conflicting transaction applies none of its writes
#[test]
fn test_conflicting_commit_is_atomic() {
    let (store, handle) = setup();
    let mut dal = handle.session();
    dal.put_many(&mut [account(1, 100), account(2, 100)]).unwrap();

    dal.begin_transaction(true).unwrap();
    let mut from = dal.get(&Key::with_id("Account", 1)).unwrap();
    let mut to = dal.get(&Key::with_id("Account", 2)).unwrap();
    from.set_property("balance", 50i64);
    to.set_property("balance", 150i64);
    dal.put(&mut from).unwrap();
    dal.put(&mut to).unwrap();

    // Concurrent writer touches one of the records we read
    handle.session().put(&mut account(2, 999)).unwrap();
    assert!(dal.commit().unwrap_err().is_conflict());

    assert_eq!(balance(&mut dal, 1), 100);
    assert_eq!(balance(&mut dal, 2), 999);
    let stored = store.get(None, &Key::with_id("Account", 1)).unwrap().unwrap();
    assert_eq!(stored.property("balance"), Some(&Value::Int(100)));
}

// ============================================================================
// Runner Tests
// ============================================================================

/// Test: N threads increment one record through the runner -> N
#[test]
fn test_runner_serializes_concurrent_increments() {
    const THREADS: usize = 8;
    const PER_THREAD: i64 = 10;
    let (_, handle) = setup();
    handle.session().put(&mut account(1, 0)).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let handle = handle.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut dal = handle.session();
                let runner = TransactionRunner::new();
                barrier.wait();
                for _ in 0..PER_THREAD {
                    runner
                        .run(&mut dal, |dal| {
                            let mut e = dal.get(&Key::with_id("Account", 1))?;
                            let b = e.property("balance").and_then(Value::as_int).unwrap_or(0);
                            e.set_property("balance", b + 1);
                            dal.put(&mut e).map(|_| ())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut dal = handle.session();
    assert_eq!(balance(&mut dal, 1), THREADS as i64 * PER_THREAD);
}

/// Test: an always-conflicting store stops a bounded runner after exactly
/// max_attempts commits
#[test]
fn test_retry_terminates_after_max_attempts() {
    let (store, handle) = setup();
    store.inject_commit_conflicts(usize::MAX);
    let mut dal = handle.session();
    let runner = TransactionRunner::with_policy(RetryPolicy::default().with_max_attempts(3));

    let mut calls = 0;
    let err = runner
        .run(&mut dal, |dal| {
            calls += 1;
            dal.put(&mut Entity::of_kind("Note")).map(|_| ())
        })
        .unwrap_err();

    assert!(matches!(err, Error::RetryLimitExceeded { attempts: 3, .. }));
    assert_eq!(calls, 3);
    assert_eq!(store.stats().commits, 3);
    assert_eq!(store.open_transactions(), 0);
    assert!(store.is_empty());
}

/// Test: a panic inside the closure leaves no open transaction behind
#[test]
fn test_panic_in_closure_rolls_back() {
    let (store, handle) = setup();
    let outcome = thread::spawn(move || {
        let mut dal = handle.session();
        TransactionRunner::new().run(&mut dal, |dal| -> cachestore_core::Result<()> {
            dal.put(&mut Entity::of_kind("Note"))?;
            panic!("boom");
        })
    })
    .join();

    assert!(outcome.is_err());
    assert_eq!(store.open_transactions(), 0);
    assert!(store.is_empty());
}

// ============================================================================
// Fetch-Before-Write
// ============================================================================

proptest! {
    /// Writing a persisted record in an enforce-fetch transaction succeeds
    /// exactly when that record was read earlier in the transaction
    #[test]
    fn prop_fetch_before_write(fetched in proptest::collection::vec(any::<bool>(), 1..8)) {
        let (_, handle) = setup();
        let mut dal = handle.session();
        let mut records: Vec<Entity> = (1..=fetched.len() as i64).map(|i| account(i, i)).collect();
        dal.put_many(&mut records).unwrap();

        dal.begin_transaction(true).unwrap();
        for (record, &read_first) in records.iter_mut().zip(&fetched) {
            if read_first {
                dal.get(record.key()).unwrap();
            }
            record.set_property("balance", 0i64);
            let result = dal.put(record);
            if read_first {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(matches!(result, Err(Error::NotFetchedInTransaction(_))));
            }
        }
        dal.commit().unwrap();
    }
}
