//! Per-unit-of-work dedup tracking
//!
//! Both maps are scoped to one session and cleared by
//! `reset_request_tracking`. Reads inside a transaction bypass the fetched
//! map, which is refreshed from the committed write set. A repeat put is
//! rejected inside a transaction too, but only puts outside one are
//! recorded.

use crate::config::TrackingSettings;
use cachestore_core::{Entity, Error, Key, Result};
use std::backtrace::Backtrace;
use std::collections::HashMap;

/// Attribute holding the call stack of an entity's first put in a session
pub const FIRST_PUT_TRACE_ATTRIBUTE: &str = "first_put_trace";

#[derive(Debug, Default)]
pub(crate) struct RequestTracking {
    fetched: HashMap<Key, Entity>,
    /// Key -> stack captured at its first put
    puts: HashMap<Key, String>,
}

impl RequestTracking {
    pub(crate) fn fetched(&self, key: &Key) -> Option<&Entity> {
        self.fetched.get(key)
    }

    pub(crate) fn remember(&mut self, settings: &TrackingSettings, entity: &Entity) {
        if settings.track_fetches {
            self.fetched.insert(entity.key().clone(), entity.clone());
        }
    }

    /// Reject a repeat put of `key` under single-put tracking
    pub(crate) fn check_put(&self, settings: &TrackingSettings, key: &Key) -> Result<()> {
        if !settings.single_put || !key.is_complete() {
            return Ok(());
        }
        match self.puts.get(key) {
            Some(first_put) => Err(Error::AlreadyPut {
                key: key.clone(),
                first_put: first_put.clone(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn record_put(&mut self, settings: &TrackingSettings, entity: &mut Entity) {
        if settings.single_put {
            let trace = Backtrace::force_capture().to_string();
            entity
                .attributes_mut()
                .insert(FIRST_PUT_TRACE_ATTRIBUTE, trace.clone());
            self.puts.entry(entity.key().clone()).or_insert(trace);
        }
        if settings.track_fetches {
            self.fetched.insert(entity.key().clone(), entity.clone());
        }
    }

    pub(crate) fn forget(&mut self, keys: &[Key]) {
        for key in keys {
            self.fetched.remove(key);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.fetched.clear();
        self.puts.clear();
    }
}
