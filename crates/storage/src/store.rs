//! In-memory backing store with optimistic transactions
//!
//! # Design
//!
//! - DashMap of key -> versioned record; deletes leave a versioned tombstone
//!   so that "absent, then created, then deleted" is still seen as a change
//! - Global version counter (AtomicU64); every applied write takes the next
//!   version
//! - Transactions record the version of each key on its first read and
//!   buffer their writes
//! - Commit validates the read set under a single commit lock and applies
//!   the buffered writes (first committer wins). Blind writes never conflict.
//!
//! Validation is per key, finer than entity groups.

use cachestore_core::{
    BackingStore, Cursor, Entity, Error, FetchOptions, Key, KeyRange, Query, QueryResults,
    Result, TxnHandle,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredRecord {
    entity: Option<Entity>,
    version: u64,
}

#[derive(Debug, Default)]
struct PendingTransaction {
    /// Version observed on first read (0 = never existed)
    read_versions: HashMap<Key, u64>,
    /// Buffered writes; `None` is a delete
    writes: BTreeMap<Key, Option<Entity>>,
}

/// Counters describing store activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Single-key and multi-key reads
    pub reads: u64,
    /// Records written (including deletes)
    pub writes: u64,
    /// Commit attempts
    pub commits: u64,
    /// Commits rejected with a conflict
    pub conflicts: u64,
    /// Queries run
    pub queries: u64,
}

/// In-memory `BackingStore`
pub struct MemoryStore {
    records: DashMap<Key, StoredRecord>,
    transactions: DashMap<TxnHandle, PendingTransaction>,
    next_ids: DashMap<String, i64>,
    version: AtomicU64,
    next_txn: AtomicU64,
    commit_lock: Mutex<()>,
    forced_conflicts: AtomicUsize,
    reads: AtomicU64,
    writes: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
    queries: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            transactions: DashMap::new(),
            next_ids: DashMap::new(),
            version: AtomicU64::new(0),
            next_txn: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
            forced_conflicts: AtomicUsize::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    /// Make the next `count` commits fail with a conflict
    ///
    /// Used to exercise retry paths.
    pub fn inject_commit_conflicts(&self, count: usize) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    /// Snapshot of activity counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
        }
    }

    /// Number of live (non-deleted) records
    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.entity.is_some()).count()
    }

    /// True when the store holds no live records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of open transactions
    pub fn open_transactions(&self) -> usize {
        self.transactions.len()
    }

    fn current_version(&self, key: &Key) -> u64 {
        self.records.get(key).map_or(0, |r| r.version)
    }

    /// Read a record and its version without holding the map guard afterwards
    fn read_record(&self, key: &Key) -> (Option<Entity>, u64) {
        match self.records.get(key) {
            Some(record) => (record.entity.clone(), record.version),
            None => (None, 0),
        }
    }

    fn record_read(&self, txn: TxnHandle, key: &Key, version: u64) -> Result<()> {
        let mut pending = self
            .transactions
            .get_mut(&txn)
            .ok_or_else(|| unknown_transaction(txn))?;
        pending.read_versions.entry(key.clone()).or_insert(version);
        Ok(())
    }

    fn buffer_write(&self, txn: TxnHandle, key: Key, entity: Option<Entity>) -> Result<()> {
        let mut pending = self
            .transactions
            .get_mut(&txn)
            .ok_or_else(|| unknown_transaction(txn))?;
        pending.writes.insert(key, entity);
        Ok(())
    }

    /// Apply a write; caller must hold the commit lock
    fn apply(&self, key: Key, entity: Option<Entity>) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.records.insert(key, StoredRecord { entity, version });
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Complete an incomplete key and clear the entity's local flags
    fn prepare(&self, entity: &Entity) -> Result<Entity> {
        let mut stored = entity.clone();
        if !stored.key().is_complete() {
            let key = stored.key().clone();
            if let Some(parent) = key.parent() {
                if !parent.is_complete() {
                    return Err(Error::invalid_argument(format!(
                        "cannot store {key}: parent key is incomplete"
                    )));
                }
            }
            let range = self.allocate_ids(key.kind(), key.parent(), 1)?;
            stored.set_key(key.completed_with(range.start));
        }
        stored.mark_persisted();
        Ok(stored)
    }

    fn write(&self, txn: Option<TxnHandle>, entity: &Entity) -> Result<Key> {
        let stored = self.prepare(entity)?;
        let key = stored.key().clone();
        match txn {
            Some(txn) => self.buffer_write(txn, key.clone(), Some(stored))?,
            None => {
                let _guard = self.commit_lock.lock();
                self.apply(key.clone(), Some(stored));
            }
        }
        Ok(key)
    }
}

fn unknown_transaction(txn: TxnHandle) -> Error {
    Error::invalid_state(format!("transaction {} is not open", txn.0))
}

fn require_complete(key: &Key) -> Result<()> {
    if key.is_complete() {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!("key {key} is incomplete")))
    }
}

impl BackingStore for MemoryStore {
    fn begin_transaction(&self) -> Result<TxnHandle> {
        let txn = TxnHandle(self.next_txn.fetch_add(1, Ordering::SeqCst));
        self.transactions.insert(txn, PendingTransaction::default());
        debug!(target: "cachestore::store", txn = txn.0, "Transaction started");
        Ok(txn)
    }

    fn commit(&self, txn: TxnHandle) -> Result<()> {
        let (_, pending) = self
            .transactions
            .remove(&txn)
            .ok_or_else(|| unknown_transaction(txn))?;
        self.commits.fetch_add(1, Ordering::Relaxed);

        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(target: "cachestore::store", txn = txn.0, "Injected commit conflict");
            return Err(Error::conflict(format!("transaction {} collided", txn.0)));
        }

        let _guard = self.commit_lock.lock();
        for (key, read_version) in &pending.read_versions {
            let current = self.current_version(key);
            if current != *read_version {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "cachestore::store",
                    txn = txn.0,
                    key = %key,
                    read_version,
                    current,
                    "Commit rejected"
                );
                return Err(Error::conflict(format!(
                    "{key} changed from version {read_version} to {current}"
                )));
            }
        }

        let write_count = pending.writes.len();
        for (key, entity) in pending.writes {
            self.apply(key, entity);
        }
        debug!(target: "cachestore::store", txn = txn.0, writes = write_count, "Transaction committed");
        Ok(())
    }

    fn rollback(&self, txn: TxnHandle) -> Result<()> {
        if self.transactions.remove(&txn).is_some() {
            debug!(target: "cachestore::store", txn = txn.0, "Transaction rolled back");
        }
        Ok(())
    }

    fn get(&self, txn: Option<TxnHandle>, key: &Key) -> Result<Option<Entity>> {
        require_complete(key)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let (entity, version) = self.read_record(key);
        if let Some(txn) = txn {
            self.record_read(txn, key, version)?;
        }
        Ok(entity)
    }

    fn get_many(&self, txn: Option<TxnHandle>, keys: &[Key]) -> Result<HashMap<Key, Entity>> {
        keys.iter().try_for_each(require_complete)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let (entity, version) = self.read_record(key);
            if let Some(txn) = txn {
                self.record_read(txn, key, version)?;
            }
            if let Some(entity) = entity {
                found.insert(key.clone(), entity);
            }
        }
        Ok(found)
    }

    fn put(&self, txn: Option<TxnHandle>, entity: &Entity) -> Result<Key> {
        self.write(txn, entity)
    }

    fn put_many(&self, txn: Option<TxnHandle>, entities: &[Entity]) -> Result<Vec<Key>> {
        let prepared: Vec<Entity> = entities
            .iter()
            .map(|e| self.prepare(e))
            .collect::<Result<_>>()?;
        let keys: Vec<Key> = prepared.iter().map(|e| e.key().clone()).collect();
        match txn {
            Some(txn) => {
                for entity in prepared {
                    self.buffer_write(txn, entity.key().clone(), Some(entity))?;
                }
            }
            None => {
                let _guard = self.commit_lock.lock();
                for entity in prepared {
                    self.apply(entity.key().clone(), Some(entity));
                }
            }
        }
        Ok(keys)
    }

    fn delete_many(&self, txn: Option<TxnHandle>, keys: &[Key]) -> Result<()> {
        keys.iter().try_for_each(require_complete)?;
        match txn {
            Some(txn) => {
                for key in keys {
                    self.buffer_write(txn, key.clone(), None)?;
                }
            }
            None => {
                let _guard = self.commit_lock.lock();
                for key in keys {
                    if self.records.contains_key(key) {
                        self.apply(key.clone(), None);
                    }
                }
            }
        }
        Ok(())
    }

    fn query(&self, query: &Query, options: &FetchOptions) -> Result<QueryResults> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let mut matched: Vec<Entity> = self
            .records
            .iter()
            .filter_map(|r| r.entity.clone())
            .filter(|e| query.matches(e))
            .collect();
        matched.sort_by(|a, b| query.compare(a, b));

        let start = match &options.start_cursor {
            Some(cursor) => cursor.position()? as usize,
            None => options.offset,
        };
        let total = matched.len();
        let page: Vec<Entity> = matched
            .into_iter()
            .skip(start)
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|e| if query.keys_only { e.key_only() } else { e })
            .collect();
        let end = start + page.len();

        debug!(
            target: "cachestore::store",
            kind = %query.kind,
            returned = page.len(),
            "Query executed"
        );
        Ok(QueryResults {
            entities: page,
            end_cursor: Some(Cursor::at(end as u64)),
            more_results: end < total,
        })
    }

    fn count(&self, query: &Query, limit: Option<usize>) -> Result<usize> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let matched = self
            .records
            .iter()
            .filter(|r| r.entity.as_ref().map_or(false, |e| query.matches(e)))
            .count();
        Ok(limit.map_or(matched, |l| matched.min(l)))
    }

    fn allocate_ids(&self, kind: &str, parent: Option<&Key>, count: usize) -> Result<KeyRange> {
        if count == 0 {
            return Err(Error::invalid_argument("cannot allocate zero ids"));
        }
        let start = {
            let mut next = self.next_ids.entry(kind.to_string()).or_insert(1);
            let start = *next;
            *next += count as i64;
            start
        };
        Ok(KeyRange {
            kind: kind.to_string(),
            parent: parent.cloned(),
            start,
            end: start + count as i64 - 1,
        })
    }
}
