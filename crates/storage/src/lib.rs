//! Reference collaborators for cachestore
//!
//! This crate implements in-memory versions of the two external systems the
//! data access layer depends on:
//! - MemoryStore: versioned, DashMap-backed entity store with optimistic
//!   transactions (first-committer-wins read-set validation)
//! - MemoryCache: look-aside cache holding bincode-encoded snapshots with
//!   per-entry expiry, compare-and-swap stamps and atomic increments
//! - ExpiryIndex: expiry instant -> cache keys, for purging expired entries

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod store;
pub mod ttl;

pub use cache::MemoryCache;
pub use store::{MemoryStore, StoreStats};
pub use ttl::ExpiryIndex;
