//! Caching data access engine
//!
//! This crate ties the lower layers together:
//! - CacheStore: shared handle to the backing store, cache and configuration
//! - InstanceCache: expiring process-local cache tier on the handle
//! - CachingDataAccessLayer: per-unit-of-work session with cache-aware
//!   reads and writes, transactions, bulk writes, counters and locks
//! - TransactionRunner: conflict-retrying transaction loop
//! - EntityPool: batched preloading of a working set
//! - ShardedCounterService: contention-free counters over shard records
//!
//! The engine is the only component that knows about:
//! - Cache consistency rules (when to populate, update and evict)
//! - Cross-layer coordination (store transaction + client context + cache)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dal;
pub mod handle;
pub mod instance_cache;
pub mod pool;
pub mod runner;
pub mod sharded_counter;
pub mod stats;

pub use config::{
    CacheSettings, CacheStoreConfig, CounterSettings, LockSettings, QuerySettings,
    TrackingSettings, CONFIG_FILE_NAME, DEFAULT_ENTITY_PREFIX,
};
pub use dal::{
    BulkWriteOutcome, CachingDataAccessLayer, QueryIter, FIRST_PUT_TRACE_ATTRIBUTE,
    MAX_VALUE_BACKUPS,
};
pub use handle::{CacheStore, CacheStoreBuilder, PutHook};
pub use instance_cache::InstanceCache;
pub use pool::{EntityPool, PoolItem};
pub use runner::TransactionRunner;
pub use sharded_counter::{shard_key, ShardedCounterService, SHARD_KIND};
pub use stats::{DataAccessStats, StatsSnapshot};
