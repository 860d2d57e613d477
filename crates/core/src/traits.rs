//! Collaborator traits
//!
//! The data access layer talks to three external systems through these
//! traits: the transactional backing store, the look-aside distributed
//! cache, and an optional schema provider. All implementations must be
//! safe to call from many threads at once (`Send + Sync`).

use crate::entity::Entity;
use crate::error::Result;
use crate::query::{FetchOptions, Query, QueryResults};
use crate::types::{Key, KeyRange};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

// ============================================================================
// Backing store
// ============================================================================

/// Handle of an open store transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnHandle(pub u64);

/// Transactional, hierarchical-key entity store
///
/// Every data operation takes an optional transaction handle. Reads inside
/// a transaction are recorded for commit-time validation; writes inside a
/// transaction are buffered until commit.
pub trait BackingStore: Send + Sync {
    /// Open a transaction that may span several entity groups
    fn begin_transaction(&self) -> Result<TxnHandle>;

    /// Commit a transaction
    ///
    /// # Errors
    ///
    /// Returns `Error::ConcurrentConflict` when a record read by the
    /// transaction changed since it was read. The transaction is finished
    /// either way.
    fn commit(&self, txn: TxnHandle) -> Result<()>;

    /// Discard a transaction's buffered writes
    fn rollback(&self, txn: TxnHandle) -> Result<()>;

    /// Read one record
    fn get(&self, txn: Option<TxnHandle>, key: &Key) -> Result<Option<Entity>>;

    /// Read several records; absent keys are omitted from the map
    fn get_many(&self, txn: Option<TxnHandle>, keys: &[Key]) -> Result<HashMap<Key, Entity>>;

    /// Write one record, allocating an id first if its key is incomplete
    ///
    /// Returns the complete key the record was written under.
    fn put(&self, txn: Option<TxnHandle>, entity: &Entity) -> Result<Key>;

    /// Write several records; returns their complete keys in input order
    fn put_many(&self, txn: Option<TxnHandle>, entities: &[Entity]) -> Result<Vec<Key>>;

    /// Delete several records (absent keys are ignored)
    fn delete_many(&self, txn: Option<TxnHandle>, keys: &[Key]) -> Result<()>;

    /// Run a query outside any transaction
    fn query(&self, query: &Query, options: &FetchOptions) -> Result<QueryResults>;

    /// Count matching records, stopping at `limit`
    fn count(&self, query: &Query, limit: Option<usize>) -> Result<usize>;

    /// Reserve `count` ids for `kind` under `parent`
    fn allocate_ids(&self, kind: &str, parent: Option<&Key>, count: usize) -> Result<KeyRange>;
}

// ============================================================================
// Distributed cache
// ============================================================================

/// Value stored in the distributed cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    /// Entity snapshot
    Entity(Entity),
    /// Integer (counters, rate limiters)
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Flag (locks)
    Bool(bool),
    /// Set of strings
    Set(BTreeSet<String>),
}

impl CacheValue {
    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CacheValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if this is a Float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            CacheValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Consume into an entity if this is an Entity value
    pub fn into_entity(self) -> Option<Entity> {
        match self {
            CacheValue::Entity(e) => Some(e),
            _ => None,
        }
    }
}

/// Cache value together with the stamp used for compare-and-swap
#[derive(Debug, Clone, PartialEq)]
pub struct Identifiable {
    /// Value read
    pub value: CacheValue,
    /// Opaque stamp; changes on every write to the entry
    pub stamp: u64,
}

/// Look-aside, string-keyed cache with per-entry expiry
///
/// Expired entries behave exactly like absent ones.
pub trait DistributedCache: Send + Sync {
    /// Read one entry
    fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    /// Read several entries; misses are omitted from the map
    fn get_many(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>>;

    /// Write one entry, replacing any existing one
    fn put(&self, key: &str, value: CacheValue, expiry: Option<Duration>) -> Result<()>;

    /// Write several entries
    fn put_many(&self, entries: Vec<(String, CacheValue)>, expiry: Option<Duration>)
        -> Result<()>;

    /// Write only if no live entry exists; returns whether it was written
    fn put_if_absent(&self, key: &str, value: CacheValue, expiry: Option<Duration>)
        -> Result<bool>;

    /// Delete one entry; returns whether a live entry was removed
    fn delete(&self, key: &str) -> Result<bool>;

    /// Delete several entries
    fn delete_many(&self, keys: &[String]) -> Result<()>;

    /// Read an entry together with its compare-and-swap stamp
    fn get_identifiable(&self, key: &str) -> Result<Option<Identifiable>>;

    /// Write only if the entry is unchanged since `previous` was read
    fn put_if_untouched(
        &self,
        key: &str,
        previous: &Identifiable,
        value: CacheValue,
        expiry: Option<Duration>,
    ) -> Result<bool>;

    /// Atomically add `delta` to an integer entry
    ///
    /// Returns the new value, or `None` when no live entry exists.
    fn increment(&self, key: &str, delta: i64) -> Result<Option<i64>>;
}

// ============================================================================
// Schema provider
// ============================================================================

/// Declared storage type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Boolean
    Bool,
    /// Integer
    Int,
    /// Floating point
    Float,
    /// Short string
    String,
    /// Long text, stored unindexed
    Text,
    /// Raw bytes
    Bytes,
    /// Entity reference
    Key,
    /// List of values
    List,
}

/// Per-kind field metadata consulted on every write
pub trait SchemaProvider: Send + Sync {
    /// Whether `field` of `kind` must be stored unindexed
    fn is_unindexed(&self, kind: &str, field: &str) -> bool;

    /// Declared storage type of `field`, if the schema knows it
    fn field_type(&self, kind: &str, field: &str) -> Option<FieldType>;

    /// Kinds described by the schema
    fn kinds(&self) -> Vec<String>;
}
