//! Retrying transaction runner
//!
//! `TransactionRunner::run` wraps a closure in begin / run / commit and
//! re-runs it from the top when the commit conflicts. A guard rolls back any
//! transaction still open when the closure returns an error or panics.
//!
//! # Example
//!
//! ```ignore
//! let runner = TransactionRunner::new();
//! let total = runner.run(&mut dal, |dal| {
//!     let mut account = dal.get(&key)?;
//!     let balance = account.property("balance").and_then(Value::as_int).unwrap_or(0);
//!     account.set_property("balance", balance + 10);
//!     dal.put(&mut account)?;
//!     Ok(balance + 10)
//! })?;
//! ```

use crate::config::CacheStoreConfig;
use crate::dal::CachingDataAccessLayer;
use cachestore_concurrency::RetryPolicy;
use cachestore_core::Result;
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

/// Rolls back an open transaction when dropped
struct RollbackGuard<'a> {
    dal: &'a mut CachingDataAccessLayer,
}

impl Deref for RollbackGuard<'_> {
    type Target = CachingDataAccessLayer;

    fn deref(&self) -> &Self::Target {
        self.dal
    }
}

impl DerefMut for RollbackGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.dal
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.dal.rollback_if_active() {
            warn!(target: "cachestore::txn", error = %e, "Rollback after failed attempt failed");
        }
    }
}

/// Runs closures transactionally with conflict retry
#[derive(Debug, Clone)]
pub struct TransactionRunner {
    policy: RetryPolicy,
    enforce_fetch: bool,
}

impl Default for TransactionRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRunner {
    /// Unbounded retry with fetch-before-write enforced
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
            enforce_fetch: true,
        }
    }

    /// Use `policy` to bound retries
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            policy,
            enforce_fetch: true,
        }
    }

    /// Use the retry policy from `config`
    pub fn from_config(config: &CacheStoreConfig) -> Self {
        Self::with_policy(config.retry)
    }

    /// Toggle fetch-before-write enforcement
    pub fn enforce_fetch(mut self, enforce: bool) -> Self {
        self.enforce_fetch = enforce;
        self
    }

    /// Retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` in a transaction, retrying on commit conflicts
    ///
    /// `f` may run several times and must not have side effects outside
    /// the session.
    ///
    /// # Errors
    /// - Any error returned by `f`, after rollback, without retry
    /// - `Error::RetryLimitExceeded` once the policy is exhausted
    pub fn run<T, F>(&self, dal: &mut CachingDataAccessLayer, mut f: F) -> Result<T>
    where
        F: FnMut(&mut CachingDataAccessLayer) -> Result<T>,
    {
        let mut state = self.policy.start();
        loop {
            dal.begin_transaction(self.enforce_fetch)?;
            let mut guard = RollbackGuard { dal: &mut *dal };
            let value = f(&mut *guard)?;
            match guard.commit() {
                Ok(()) => {
                    if state.attempts() > 0 {
                        debug!(
                            target: "cachestore::txn",
                            retries = state.attempts(),
                            "Transaction committed after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_conflict() => {
                    drop(guard);
                    state.record_failure(e)?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
