//! Client-side transaction context
//!
//! A `TransactionContext` exists for exactly one open store transaction. It
//! tracks which keys were fetched inside the transaction, which entities
//! were changed and which keys were deleted, so that the data access layer
//! can enforce fetch-before-write and update the cache after commit.
//!
//! Rules:
//! - A changed entity supersedes an earlier delete of the same key
//! - A delete supersedes an earlier change of the same key
//! - Under enforce-fetch, a complete key must be fetched before it is
//!   marked changed
//!
//! State transitions:
//! - `Active` -> `Committed` (store accepted the commit)
//! - `Active` -> `Aborted` (conflict, rollback, or error)

use cachestore_core::{Entity, Error, Key, Result, TxnHandle};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, Instant};

/// Status of a transaction context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Transaction is open
    Active,
    /// Store accepted the commit
    Committed,
    /// Transaction was rolled back or rejected
    Aborted {
        /// Human-readable reason for abort
        reason: String,
    },
}

/// Cache work to do after a successful commit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitSet {
    /// Entities to write to the cache
    pub changed: Vec<Entity>,
    /// Keys to evict from the cache
    pub deleted: Vec<Key>,
}

/// Tracking state for one open store transaction
#[derive(Debug)]
pub struct TransactionContext {
    handle: TxnHandle,
    enforce_fetch: bool,
    fetched: HashSet<Key>,
    changed: BTreeMap<Key, Entity>,
    deleted: BTreeSet<Key>,
    status: TransactionStatus,
    start_time: Instant,
}

impl TransactionContext {
    /// Create a context for an open store transaction
    pub fn new(handle: TxnHandle, enforce_fetch: bool) -> Self {
        Self {
            handle,
            enforce_fetch,
            fetched: HashSet::new(),
            changed: BTreeMap::new(),
            deleted: BTreeSet::new(),
            status: TransactionStatus::Active,
            start_time: Instant::now(),
        }
    }

    /// Store transaction handle
    pub fn handle(&self) -> TxnHandle {
        self.handle
    }

    /// Whether fetch-before-write is enforced
    pub fn enforces_fetch(&self) -> bool {
        self.enforce_fetch
    }

    /// Current status
    pub fn status(&self) -> &TransactionStatus {
        &self.status
    }

    /// Check if transaction is open
    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// Time since the transaction was opened
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check if transaction can accept operations
    ///
    /// # Errors
    /// Returns `Error::InvalidState` if the transaction already finished.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "transaction {} is not active: {:?}",
                self.handle.0, self.status
            )))
        }
    }

    /// Record that `key` was read inside this transaction
    pub fn record_fetched(&mut self, key: Key) {
        self.fetched.insert(key);
    }

    /// Whether `key` was read inside this transaction
    pub fn was_fetched(&self, key: &Key) -> bool {
        self.fetched.contains(key)
    }

    /// Record a changed entity
    ///
    /// # Errors
    /// Returns `Error::NotFetchedInTransaction` when fetch is enforced and a
    /// complete key was never fetched in this transaction.
    pub fn mark_changed(&mut self, entity: &Entity) -> Result<()> {
        self.ensure_active()?;
        let key = entity.key();
        if self.enforce_fetch && key.is_complete() && !self.fetched.contains(key) {
            return Err(Error::NotFetchedInTransaction(key.clone()));
        }
        self.deleted.remove(key);
        self.changed.insert(key.clone(), entity.clone());
        Ok(())
    }

    /// Record a deleted key
    pub fn mark_deleted(&mut self, key: Key) -> Result<()> {
        self.ensure_active()?;
        self.changed.remove(&key);
        self.deleted.insert(key);
        Ok(())
    }

    /// Number of fetched keys
    pub fn fetched_count(&self) -> usize {
        self.fetched.len()
    }

    /// Number of changed entities
    pub fn changed_count(&self) -> usize {
        self.changed.len()
    }

    /// Number of deleted keys
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    /// Mark committed and hand over the post-commit cache work
    pub fn mark_committed(&mut self) -> Result<CommitSet> {
        self.ensure_active()?;
        self.status = TransactionStatus::Committed;
        self.fetched.clear();
        Ok(CommitSet {
            changed: std::mem::take(&mut self.changed).into_values().collect(),
            deleted: std::mem::take(&mut self.deleted).into_iter().collect(),
        })
    }

    /// Mark aborted, discarding all tracking
    pub fn mark_aborted(&mut self, reason: impl Into<String>) {
        self.status = TransactionStatus::Aborted {
            reason: reason.into(),
        };
        self.fetched.clear();
        self.changed.clear();
        self.deleted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: i64) -> Entity {
        let mut e = Entity::new(Key::with_id("User", id));
        e.set_property("n", id);
        e
    }

    // ========================================================================
    // Fetch-before-write
    // ========================================================================

    #[test]
    fn test_enforced_change_requires_fetch() {
        let mut ctx = TransactionContext::new(TxnHandle(1), true);
        let e = entity(1);
        let err = ctx.mark_changed(&e).unwrap_err();
        assert!(matches!(err, Error::NotFetchedInTransaction(_)));

        ctx.record_fetched(e.key().clone());
        ctx.mark_changed(&e).unwrap();
        assert_eq!(ctx.changed_count(), 1);
    }

    #[test]
    fn test_unenforced_change_needs_no_fetch() {
        let mut ctx = TransactionContext::new(TxnHandle(1), false);
        ctx.mark_changed(&entity(1)).unwrap();
        assert_eq!(ctx.changed_count(), 1);
    }

    #[test]
    fn test_incomplete_key_is_exempt_from_enforcement() {
        let mut ctx = TransactionContext::new(TxnHandle(1), true);
        ctx.mark_changed(&Entity::of_kind("User")).unwrap();
    }

    // ========================================================================
    // Changed / deleted interplay
    // ========================================================================

    #[test]
    fn test_delete_supersedes_change_and_back() {
        let mut ctx = TransactionContext::new(TxnHandle(1), false);
        let e = entity(1);
        ctx.mark_changed(&e).unwrap();
        ctx.mark_deleted(e.key().clone()).unwrap();
        assert_eq!(ctx.changed_count(), 0);
        assert_eq!(ctx.deleted_count(), 1);

        ctx.mark_changed(&e).unwrap();
        assert_eq!(ctx.changed_count(), 1);
        assert_eq!(ctx.deleted_count(), 0);
    }

    #[test]
    fn test_changed_holds_snapshot() {
        let mut ctx = TransactionContext::new(TxnHandle(1), false);
        let mut e = entity(1);
        ctx.mark_changed(&e).unwrap();
        e.set_property("n", 99i64);

        let set = ctx.mark_committed().unwrap();
        assert_eq!(set.changed[0].property("n").and_then(|v| v.as_int()), Some(1));
    }

    // ========================================================================
    // Status transitions
    // ========================================================================

    #[test]
    fn test_commit_hands_over_work_and_closes() {
        let mut ctx = TransactionContext::new(TxnHandle(7), false);
        ctx.mark_changed(&entity(1)).unwrap();
        ctx.mark_deleted(Key::with_id("User", 2)).unwrap();

        let set = ctx.mark_committed().unwrap();
        assert_eq!(set.changed.len(), 1);
        assert_eq!(set.deleted, vec![Key::with_id("User", 2)]);
        assert_eq!(ctx.status(), &TransactionStatus::Committed);
        assert!(ctx.mark_changed(&entity(3)).is_err());
        assert!(ctx.mark_committed().is_err());
    }

    #[test]
    fn test_abort_clears_tracking() {
        let mut ctx = TransactionContext::new(TxnHandle(1), true);
        ctx.record_fetched(Key::with_id("User", 1));
        ctx.mark_changed(&entity(1)).unwrap();
        ctx.mark_aborted("conflict");

        assert!(!ctx.is_active());
        assert_eq!(ctx.fetched_count(), 0);
        assert_eq!(ctx.changed_count(), 0);
        assert!(matches!(ctx.status(), TransactionStatus::Aborted { .. }));
    }

    // ========================================================================
    // Properties
    // ========================================================================

    proptest::proptest! {
        #[test]
        fn prop_changed_and_deleted_stay_disjoint(
            ops in proptest::collection::vec((proptest::bool::ANY, 1i64..6), 0..50)
        ) {
            let mut ctx = TransactionContext::new(TxnHandle(1), false);
            for (is_delete, id) in ops {
                if is_delete {
                    ctx.mark_deleted(Key::with_id("User", id)).unwrap();
                } else {
                    ctx.mark_changed(&entity(id)).unwrap();
                }
            }
            let set = ctx.mark_committed().unwrap();
            for e in &set.changed {
                proptest::prop_assert!(!set.deleted.contains(e.key()));
            }
        }
    }
}
