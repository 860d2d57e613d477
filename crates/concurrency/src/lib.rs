//! Concurrency layer for cachestore
//!
//! This crate implements the client side of optimistic concurrency control:
//! - TransactionContext: fetched / changed / deleted tracking for one open
//!   store transaction, with the enforce-fetch-before-write rule
//! - RetryPolicy: bounds for conflict-retry loops (unbounded by default)
//! - Backoff: bounded exponential backoff with jitter, shared by retry
//!   loops and the cache lock spin

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod retry;
pub mod transaction;

pub use retry::{Backoff, RetryPolicy, RetryState};
pub use transaction::{CommitSet, TransactionContext, TransactionStatus};
