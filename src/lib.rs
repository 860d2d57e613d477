//! cachestore - caching and consistency layer for transactional entity stores
//!
//! cachestore sits between application code and a transactional,
//! hierarchical-key entity store, keeping a look-aside distributed cache
//! coherent with the store.
//!
//! # Quick Start
//!
//! ```ignore
//! use cachestore::{CacheStore, Entity, TransactionRunner};
//!
//! let handle = CacheStore::in_memory();
//! let mut dal = handle.session();
//!
//! let mut user = Entity::of_kind("User");
//! user.set_property("name", "Alice");
//! let key = dal.put(&mut user)?;
//!
//! TransactionRunner::new().run(&mut dal, |dal| {
//!     let mut user = dal.get(&key)?;
//!     user.set_property("visits", 1i64);
//!     dal.put(&mut user).map(|_| ())
//! })?;
//! ```
//!
//! # Architecture
//!
//! All data access goes through a [`CachingDataAccessLayer`] session opened
//! from a shared [`CacheStore`] handle. The store and cache are pluggable
//! through the [`BackingStore`] and [`DistributedCache`] traits; in-memory
//! reference implementations are provided.

pub use cachestore_concurrency::{Backoff, RetryPolicy};
pub use cachestore_core::*;
pub use cachestore_engine::*;
pub use cachestore_storage::{MemoryCache, MemoryStore, StoreStats};
