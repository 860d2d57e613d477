//! Transaction lifecycle on a session
//!
//! At most one transaction is open per session. Cache updates for the
//! transaction's writes happen only after the store accepts the commit;
//! a rejected or rolled-back transaction leaves the cache and the
//! session's fetch tracking untouched.

use super::CachingDataAccessLayer;
use cachestore_concurrency::TransactionContext;
use cachestore_core::{Error, Result};
use tracing::{debug, info, warn};

impl CachingDataAccessLayer {
    /// Open a transaction
    ///
    /// With `enforce_fetch`, every persisted entity written in the
    /// transaction must first have been read in it.
    ///
    /// # Errors
    /// Returns `Error::InvalidState` if a transaction is already open or
    /// bulk-write mode is on.
    pub fn begin_transaction(&mut self, enforce_fetch: bool) -> Result<()> {
        if self.bulk.is_some() {
            return Err(Error::invalid_state(
                "cannot begin a transaction during a bulk write",
            ));
        }
        if let Some(ctx) = &self.txn {
            return Err(Error::invalid_state(format!(
                "transaction {} already active",
                ctx.handle().0
            )));
        }
        let handle = self.shared().store.begin_transaction()?;
        debug!(target: "cachestore::txn", txn = handle.0, enforce_fetch, "Transaction started");
        self.txn = Some(TransactionContext::new(handle, enforce_fetch));
        Ok(())
    }

    /// Whether a transaction is open
    pub fn is_transaction_active(&self) -> bool {
        self.txn.is_some()
    }

    /// Commit the open transaction
    ///
    /// The transaction is finished whether or not the commit succeeds.
    ///
    /// # Errors
    /// - `Error::InvalidState` if no transaction is open
    /// - `Error::ConcurrentConflict` if the store rejected the commit
    pub fn commit(&mut self) -> Result<()> {
        let mut ctx = self
            .txn
            .take()
            .ok_or_else(|| Error::invalid_state("no transaction to commit"))?;
        let handle = ctx.handle();

        match self.shared().store.commit(handle) {
            Ok(()) => {
                let set = ctx.mark_committed()?;
                self.cache_store(&set.changed);
                self.cache_evict(&set.deleted);
                self.remember_written(&set.changed);
                self.tracking.forget(&set.deleted);
                self.shared().stats.record_commit();
                info!(
                    target: "cachestore::txn",
                    txn = handle.0,
                    changed = set.changed.len(),
                    deleted = set.deleted.len(),
                    elapsed_us = ctx.elapsed().as_micros() as u64,
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                ctx.mark_aborted(e.to_string());
                if e.is_conflict() {
                    self.shared().stats.record_conflict();
                    warn!(target: "cachestore::txn", txn = handle.0, error = %e, "Commit rejected");
                }
                Err(e)
            }
        }
    }

    /// Roll back the open transaction, if any
    ///
    /// Returns whether a transaction was open.
    pub fn rollback_if_active(&mut self) -> Result<bool> {
        let Some(mut ctx) = self.txn.take() else {
            return Ok(false);
        };
        ctx.mark_aborted("rolled back");
        self.shared().store.rollback(ctx.handle())?;
        debug!(target: "cachestore::txn", txn = ctx.handle().0, "Transaction rolled back");
        Ok(true)
    }
}
