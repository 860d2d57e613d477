//! Cache lock
//!
//! A lock is a flag entry written with add-if-absent. Whoever writes it
//! holds the lock until `release_lock` or until the entry expires.

use super::CachingDataAccessLayer;
use cachestore_core::{CacheValue, Result};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

impl CachingDataAccessLayer {
    /// Acquire the named lock, holding it for at most `timeout`
    ///
    /// Spins with the configured backoff until the lock is free. Returns
    /// `false` if the configured acquire timeout passes first.
    pub fn get_lock(&self, name: &str, timeout: Duration) -> Result<bool> {
        let cache = &self.shared().cache;
        let settings = &self.shared().config.lock;
        let deadline = settings
            .acquire_timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut failures = 0;
        loop {
            if cache.get(name)?.is_none()
                && cache.put_if_absent(name, CacheValue::Bool(true), Some(timeout))?
            {
                debug!(target: "cachestore::lock", name, failures, "Lock acquired");
                return Ok(true);
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                warn!(target: "cachestore::lock", name, failures, "Gave up acquiring lock");
                return Ok(false);
            }
            failures += 1;
            settings.backoff.wait(failures);
        }
    }

    /// Release the named lock; returns whether it was held
    pub fn release_lock(&self, name: &str) -> Result<bool> {
        let released = self.shared().cache.delete(name)?;
        debug!(target: "cachestore::lock", name, released, "Lock released");
        Ok(released)
    }
}
