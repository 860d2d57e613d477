//! Cache-backed counters, action rate limiting, string sets, backed-up
//! values and named statistics
//!
//! None of these touch the backing store. Counters keep a second cache
//! entry (`counterBackup-<name>`) so that an evicted counter is re-seeded
//! from the backup instead of restarting from the initial value. Integer
//! and float counters share the namespace; reading one as the other is an
//! error.

use super::CachingDataAccessLayer;
use cachestore_core::{CacheValue, Error, Identifiable, Result};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Most backup copies a backed-up value may keep
pub const MAX_VALUE_BACKUPS: usize = 4;

/// Cache key of the set naming every stat written through `set_stat` or
/// `increment_stat`
const STAT_REGISTRY_KEY: &str = "statNames";

fn counter_key(name: &str) -> String {
    format!("counter-{name}")
}

fn backup_key(name: &str) -> String {
    format!("counterBackup-{name}")
}

fn limiter_key(action: &str) -> String {
    format!("actionLimiter-{action}")
}

fn value_backup_key(key: &str, index: usize) -> String {
    format!("{key}-backup#{index}")
}

fn stat_key(name: &str) -> String {
    format!("stat-{name}")
}

fn check_backups(backups: usize) -> Result<()> {
    if backups > MAX_VALUE_BACKUPS {
        return Err(Error::invalid_argument(format!(
            "backup count must be at most {MAX_VALUE_BACKUPS}, got {backups}"
        )));
    }
    Ok(())
}

fn expect_int(key: &str, value: CacheValue) -> Result<i64> {
    value
        .as_int()
        .ok_or_else(|| Error::Cache(format!("entry {key} is not an integer")))
}

fn expect_float(key: &str, value: &CacheValue) -> Result<f64> {
    value
        .as_float()
        .ok_or_else(|| Error::Cache(format!("entry {key} is not a float")))
}

impl CachingDataAccessLayer {
    // ========================================================================
    // Counters
    // ========================================================================

    /// Add `delta` to the named counter and return the new value
    ///
    /// A missing counter starts from its backup entry, or from `initial`
    /// when the backup is gone too.
    pub fn change_counter(
        &self,
        name: &str,
        delta: i64,
        initial: i64,
        expiry: Option<Duration>,
    ) -> Result<i64> {
        let cache = &self.shared().cache;
        let key = counter_key(name);
        let backup = backup_key(name);
        loop {
            if let Some(value) = cache.increment(&key, delta)? {
                cache.put(&backup, CacheValue::Int(value), expiry)?;
                trace!(target: "cachestore::counter", name, value, "Counter changed");
                return Ok(value);
            }
            let base = match cache.get(&backup)? {
                Some(v) => expect_int(&backup, v)?,
                None => initial,
            };
            let value = base + delta;
            if cache.put_if_absent(&key, CacheValue::Int(value), expiry)? {
                cache.put(&backup, CacheValue::Int(value), expiry)?;
                debug!(target: "cachestore::counter", name, value, "Counter re-seeded");
                return Ok(value);
            }
        }
    }

    /// Current value of the named counter
    ///
    /// Falls back to the backup entry, then to `initial` (which is stored).
    /// Returns `None` only when all three are missing.
    pub fn get_counter(&self, name: &str, initial: Option<i64>) -> Result<Option<i64>> {
        let cache = &self.shared().cache;
        let key = counter_key(name);
        if let Some(value) = cache.get(&key)? {
            return expect_int(&key, value).map(Some);
        }
        let backup = backup_key(name);
        let value = match cache.get(&backup)? {
            Some(v) => expect_int(&backup, v)?,
            None => match initial {
                Some(initial) => {
                    cache.put(&backup, CacheValue::Int(initial), None)?;
                    initial
                }
                None => return Ok(None),
            },
        };
        cache.put_if_absent(&key, CacheValue::Int(value), None)?;
        Ok(Some(value))
    }

    /// Float variant of `change_counter`
    ///
    /// The cache has no atomic float add, so the update is a
    /// compare-and-swap loop on the counter entry.
    pub fn change_counter_f64(
        &self,
        name: &str,
        delta: f64,
        initial: f64,
        expiry: Option<Duration>,
    ) -> Result<f64> {
        let cache = &self.shared().cache;
        let backoff = &self.shared().config.lock.backoff;
        let key = counter_key(name);
        let backup = backup_key(name);
        let mut failures = 0;
        loop {
            let written = match cache.get_identifiable(&key)? {
                Some(current) => {
                    let value = expect_float(&key, &current.value)? + delta;
                    cache
                        .put_if_untouched(&key, &current, CacheValue::Float(value), expiry)?
                        .then_some(value)
                }
                None => {
                    let base = match cache.get(&backup)? {
                        Some(v) => expect_float(&backup, &v)?,
                        None => initial,
                    };
                    let value = base + delta;
                    cache
                        .put_if_absent(&key, CacheValue::Float(value), expiry)?
                        .then_some(value)
                }
            };
            if let Some(value) = written {
                cache.put(&backup, CacheValue::Float(value), expiry)?;
                trace!(target: "cachestore::counter", name, value, "Float counter changed");
                return Ok(value);
            }
            failures += 1;
            backoff.wait(failures);
        }
    }

    /// Float variant of `get_counter`
    pub fn get_counter_f64(&self, name: &str, initial: Option<f64>) -> Result<Option<f64>> {
        let cache = &self.shared().cache;
        let key = counter_key(name);
        if let Some(value) = cache.get(&key)? {
            return expect_float(&key, &value).map(Some);
        }
        let backup = backup_key(name);
        let value = match cache.get(&backup)? {
            Some(v) => expect_float(&backup, &v)?,
            None => match initial {
                Some(initial) => {
                    cache.put(&backup, CacheValue::Float(initial), None)?;
                    initial
                }
                None => return Ok(None),
            },
        };
        cache.put_if_absent(&key, CacheValue::Float(value), None)?;
        Ok(Some(value))
    }

    // ========================================================================
    // Backed-up values
    // ========================================================================

    /// Write `value` under `key` and under `backups` extra keys
    /// (`<key>-backup#<i>`), so that a single eviction does not lose it
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` when `backups` exceeds
    /// `MAX_VALUE_BACKUPS`.
    pub fn set_safer_value(&self, key: &str, value: CacheValue, backups: usize) -> Result<()> {
        check_backups(backups)?;
        let mut entries = Vec::with_capacity(backups + 1);
        entries.extend((0..backups).map(|i| (value_backup_key(key, i), value.clone())));
        entries.push((key.to_string(), value));
        self.shared().cache.put_many(entries, None)
    }

    /// Read a value written by `set_safer_value`
    ///
    /// Falls back to the backup copies in order. A value found only in a
    /// backup is written back to the primary key if that is still empty.
    pub fn get_safer_value(&self, key: &str, backups: usize) -> Result<Option<CacheValue>> {
        check_backups(backups)?;
        let cache = &self.shared().cache;
        if let Some(value) = cache.get(key)? {
            return Ok(Some(value));
        }
        for index in 0..backups {
            if let Some(value) = cache.get(&value_backup_key(key, index))? {
                debug!(target: "cachestore::counter", key, index, "Value restored from backup");
                cache.put_if_absent(key, value.clone(), None)?;
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Named statistics
    // ========================================================================

    /// Add `amount` to the named stat, starting from 0
    pub fn increment_stat(&self, name: &str, amount: i64) -> Result<i64> {
        let cache = &self.shared().cache;
        let key = stat_key(name);
        loop {
            if let Some(value) = cache.increment(&key, amount)? {
                return Ok(value);
            }
            if cache.put_if_absent(&key, CacheValue::Int(amount), None)? {
                self.add_to_cached_set(STAT_REGISTRY_KEY, name)?;
                return Ok(amount);
            }
        }
    }

    /// Overwrite the named stat
    pub fn set_stat(&self, name: &str, value: i64, expiry: Option<Duration>) -> Result<()> {
        self.shared()
            .cache
            .put(&stat_key(name), CacheValue::Int(value), expiry)?;
        self.add_to_cached_set(STAT_REGISTRY_KEY, name)?;
        Ok(())
    }

    /// Current value of the named stat
    pub fn get_stat(&self, name: &str) -> Result<Option<i64>> {
        let key = stat_key(name);
        match self.shared().cache.get(&key)? {
            Some(value) => expect_int(&key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Reset every registered stat to 0; returns how many were reset
    pub fn clear_stats(&self) -> Result<usize> {
        let names = self.cached_set(STAT_REGISTRY_KEY)?;
        let entries: Vec<(String, CacheValue)> = names
            .iter()
            .map(|name| (stat_key(name), CacheValue::Int(0)))
            .collect();
        self.shared().cache.put_many(entries, None)?;
        info!(target: "cachestore::counter", count = names.len(), "Stats cleared");
        Ok(names.len())
    }

    // ========================================================================
    // Action limiter
    // ========================================================================

    /// Count one occurrence of `action` and report whether it must now be
    /// limited
    ///
    /// The first occurrence opens a window of `period` allowing `max`
    /// occurrences. Every call past the allowance returns `true` until the
    /// window expires. With a `penalty`, hitting the limit restarts the
    /// window with the penalty duration.
    pub fn flag_action_limiter(
        &self,
        action: &str,
        period: Duration,
        max: i64,
        penalty: Option<Duration>,
    ) -> Result<bool> {
        let cache = &self.shared().cache;
        let key = limiter_key(action);
        let remaining = match cache.increment(&key, -1)? {
            Some(remaining) => remaining,
            None => {
                if cache.put_if_absent(&key, CacheValue::Int(max), Some(period))? {
                    max
                } else {
                    cache.increment(&key, -1)?.unwrap_or(max)
                }
            }
        };
        if remaining > 0 {
            return Ok(false);
        }
        if let Some(penalty) = penalty {
            cache.put(&key, CacheValue::Int(0), Some(penalty))?;
        }
        debug!(target: "cachestore::counter", action, "Action limited");
        Ok(true)
    }

    /// Whether `action` is currently limited
    pub fn is_action_limited(&self, action: &str) -> Result<bool> {
        let key = limiter_key(action);
        Ok(match self.shared().cache.get(&key)? {
            Some(value) => expect_int(&key, value)? <= 0,
            None => false,
        })
    }

    // ========================================================================
    // String sets
    // ========================================================================

    /// Add `member` to the set stored at cache key `key`
    ///
    /// Returns `false` when the member was already present.
    pub fn add_to_cached_set(&self, key: &str, member: &str) -> Result<bool> {
        self.update_cached_set(key, |set| set.insert(member.to_string()), true)
    }

    /// Remove `member` from the set stored at cache key `key`
    ///
    /// Returns `false` when the member was not present.
    pub fn remove_from_cached_set(&self, key: &str, member: &str) -> Result<bool> {
        self.update_cached_set(key, |set| set.remove(member), false)
    }

    /// Members of the set stored at cache key `key` (empty when absent)
    pub fn cached_set(&self, key: &str) -> Result<BTreeSet<String>> {
        match self.shared().cache.get(key)? {
            Some(CacheValue::Set(set)) => Ok(set),
            Some(_) => Err(Error::Cache(format!("entry {key} is not a set"))),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Compare-and-swap loop; `apply` returns whether it changed the set
    fn update_cached_set(
        &self,
        key: &str,
        mut apply: impl FnMut(&mut BTreeSet<String>) -> bool,
        create_if_absent: bool,
    ) -> Result<bool> {
        let cache = &self.shared().cache;
        let backoff = &self.shared().config.lock.backoff;
        let mut failures = 0;
        loop {
            let current: Option<Identifiable> = cache.get_identifiable(key)?;
            let mut set = match &current {
                Some(Identifiable {
                    value: CacheValue::Set(set),
                    ..
                }) => set.clone(),
                Some(_) => return Err(Error::Cache(format!("entry {key} is not a set"))),
                None if create_if_absent => BTreeSet::new(),
                None => return Ok(false),
            };
            if !apply(&mut set) {
                return Ok(false);
            }
            let written = match &current {
                Some(previous) => cache.put_if_untouched(key, previous, CacheValue::Set(set), None)?,
                None => cache.put_if_absent(key, CacheValue::Set(set), None)?,
            };
            if written {
                return Ok(true);
            }
            failures += 1;
            trace!(target: "cachestore::counter", key, failures, "Cached set update raced, retrying");
            backoff.wait(failures);
        }
    }
}
