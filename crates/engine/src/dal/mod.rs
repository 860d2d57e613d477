//! Caching data access layer
//!
//! `CachingDataAccessLayer` is a per-unit-of-work session in front of the
//! backing store and the look-aside cache. Cache rules:
//!
//! - Outside a transaction, reads go cache first, then store, and populate
//!   the cache on a miss. Writes go to the store, then to the cache.
//! - Inside a transaction, reads bypass the cache and are recorded in the
//!   fetched set. Cache updates are deferred until the commit succeeds.
//! - Deletes evict from the cache (immediately, or at commit).
//!
//! The session is used by one thread at a time. Dropping a session with an
//! open transaction rolls the transaction back.

mod bulk;
mod counters;
mod ids;
mod lock;
mod query;
mod tracking;
mod transaction;

pub use bulk::BulkWriteOutcome;
pub use counters::MAX_VALUE_BACKUPS;
pub use query::QueryIter;
pub use tracking::FIRST_PUT_TRACE_ATTRIBUTE;

use crate::handle::{CacheStore, Shared};
use bulk::BulkWriteBuffer;
use cachestore_concurrency::TransactionContext;
use cachestore_core::{
    CacheValue, Cursor, Entity, Error, FieldType, Key, Result, TxnHandle, Value,
};
use std::collections::{HashMap, HashSet};
use tracking::RequestTracking;
use tracing::{debug, error, warn};

/// Per-unit-of-work session over the store and cache
pub struct CachingDataAccessLayer {
    handle: CacheStore,
    txn: Option<TransactionContext>,
    bulk: Option<BulkWriteBuffer>,
    tracking: RequestTracking,
    last_cursor: Option<Cursor>,
}

impl std::fmt::Debug for CachingDataAccessLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingDataAccessLayer")
            .field("transaction", &self.txn.as_ref().map(|t| t.handle()))
            .field("bulk_write", &self.bulk.is_some())
            .finish()
    }
}

fn require_complete(key: &Key) -> Result<()> {
    if key.is_complete() {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "key {key} is incomplete"
        )))
    }
}

impl CachingDataAccessLayer {
    pub(crate) fn new(handle: CacheStore) -> Self {
        Self {
            handle,
            txn: None,
            bulk: None,
            tracking: RequestTracking::default(),
            last_cursor: None,
        }
    }

    /// Handle this session was opened from
    pub fn handle(&self) -> &CacheStore {
        &self.handle
    }

    fn shared(&self) -> &Shared {
        self.handle.shared()
    }

    fn txn_handle(&self) -> Option<TxnHandle> {
        self.txn.as_ref().map(TransactionContext::handle)
    }

    // ========================================================================
    // Cache plumbing
    // ========================================================================

    fn cache_enabled(&self) -> bool {
        self.shared().config.cache.enabled
    }

    fn cache_key(&self, key: &Key) -> String {
        self.handle.entity_cache_key(key)
    }

    /// Cache read; failures degrade to a miss
    fn cache_lookup(&self, keys: &[Key]) -> HashMap<Key, Entity> {
        let by_cache_key: HashMap<String, &Key> =
            keys.iter().map(|k| (self.cache_key(k), k)).collect();
        let cache_keys: Vec<String> = by_cache_key.keys().cloned().collect();
        match self.shared().cache.get_many(&cache_keys) {
            Ok(found) => found
                .into_iter()
                .filter_map(|(cache_key, value)| {
                    let key = by_cache_key.get(&cache_key)?;
                    value.into_entity().map(|e| ((*key).clone(), e))
                })
                .collect(),
            Err(e) => {
                warn!(target: "cachestore::cache", error = %e, "Cache read failed, treating as miss");
                HashMap::new()
            }
        }
    }

    /// Write entity snapshots to the cache; on failure evict instead
    fn cache_store(&self, entities: &[Entity]) {
        if !self.cache_enabled() || entities.is_empty() {
            return;
        }
        let entries: Vec<(String, CacheValue)> = entities
            .iter()
            .map(|e| (self.cache_key(e.key()), CacheValue::Entity(e.clone())))
            .collect();
        let ttl = self.shared().config.cache.entity_ttl();
        if let Err(e) = self.shared().cache.put_many(entries, ttl) {
            warn!(target: "cachestore::cache", error = %e, "Cache write failed, evicting");
            let keys: Vec<Key> = entities.iter().map(|e| e.key().clone()).collect();
            self.cache_evict(&keys);
        }
    }

    fn cache_evict(&self, keys: &[Key]) {
        if !self.cache_enabled() || keys.is_empty() {
            return;
        }
        let cache_keys: Vec<String> = keys.iter().map(|k| self.cache_key(k)).collect();
        if let Err(e) = self.shared().cache.delete_many(&cache_keys) {
            error!(
                target: "cachestore::cache",
                error = %e,
                count = keys.len(),
                "Cache eviction failed; cached entries may be stale"
            );
        }
    }

    /// Refresh the session's fetch tracking with entities that reached the store
    fn remember_written(&mut self, entities: &[Entity]) {
        let settings = &self.handle.shared().config.tracking;
        if !settings.track_fetches {
            return;
        }
        for entity in entities {
            let mut entity = entity.clone();
            entity.mark_persisted();
            self.tracking.remember(settings, &entity);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Strict lookup
    ///
    /// # Errors
    /// Returns `Error::NotFound` when the key has no record.
    pub fn get(&mut self, key: &Key) -> Result<Entity> {
        self.get_if_exists(key)?
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    /// Lenient lookup
    pub fn get_if_exists(&mut self, key: &Key) -> Result<Option<Entity>> {
        require_complete(key)?;
        let stats = &self.handle.shared().stats;

        if let Some(ctx) = self.txn.as_mut() {
            let entity = self.handle.shared().store.get(Some(ctx.handle()), key)?;
            stats.record_store_gets(1);
            ctx.record_fetched(key.clone());
            return Ok(entity);
        }

        if let Some(entity) = self.tracking.fetched(key) {
            return Ok(Some(entity.clone()));
        }

        if self.cache_enabled() {
            if let Some(entity) = self.cache_lookup(std::slice::from_ref(key)).remove(key) {
                stats.record_cache_hits(1);
                self.tracking.remember(&self.handle.shared().config.tracking, &entity);
                return Ok(Some(entity));
            }
            stats.record_cache_misses(1);
        }

        let entity = self.shared().store.get(None, key)?;
        stats.record_store_gets(1);
        if let Some(entity) = &entity {
            self.cache_store(std::slice::from_ref(entity));
            self.tracking.remember(&self.handle.shared().config.tracking, entity);
        }
        Ok(entity)
    }

    /// Batch lookup preserving input order
    ///
    /// `None` inputs and keys without a record yield `None`.
    ///
    /// # Errors
    /// Returns `Error::InternalConsistency` if a key resolves from both the
    /// cache and the store in the same call.
    pub fn get_many(&mut self, keys: &[Option<Key>]) -> Result<Vec<Option<Entity>>> {
        let mut seen = HashSet::new();
        let wanted: Vec<Key> = keys
            .iter()
            .flatten()
            .filter(|k| seen.insert(*k))
            .cloned()
            .collect();
        wanted.iter().try_for_each(require_complete)?;

        let in_txn = self.txn.is_some();
        let mut resolved: HashMap<Key, Entity> = HashMap::with_capacity(wanted.len());
        let mut from_cache: HashSet<Key> = HashSet::new();

        if !in_txn {
            for key in &wanted {
                if let Some(entity) = self.tracking.fetched(key) {
                    resolved.insert(key.clone(), entity.clone());
                }
            }
            if self.cache_enabled() {
                let lookup: Vec<Key> = wanted
                    .iter()
                    .filter(|k| !resolved.contains_key(*k))
                    .cloned()
                    .collect();
                let hits = self.cache_lookup(&lookup);
                self.shared().stats.record_cache_hits(hits.len());
                self.shared()
                    .stats
                    .record_cache_misses(lookup.len() - hits.len());
                for (key, entity) in hits {
                    from_cache.insert(key.clone());
                    resolved.insert(key, entity);
                }
            }
        }

        let remaining: Vec<Key> = wanted
            .iter()
            .filter(|k| !resolved.contains_key(*k))
            .cloned()
            .collect();
        if !remaining.is_empty() {
            let found = self
                .shared()
                .store
                .get_many(self.txn_handle(), &remaining)?;
            self.shared().stats.record_store_gets(remaining.len());
            if let Some(ctx) = self.txn.as_mut() {
                for key in &remaining {
                    ctx.record_fetched(key.clone());
                }
            }
            if let Some(key) = found.keys().find(|k| from_cache.contains(*k)) {
                return Err(Error::InternalConsistency(format!(
                    "{key} resolved from both cache and store"
                )));
            }
            if !in_txn {
                let loaded: Vec<Entity> = found.values().cloned().collect();
                self.cache_store(&loaded);
            }
            resolved.extend(found);
        }

        if !in_txn {
            let settings = self.shared().config.tracking.clone();
            for entity in resolved.values() {
                self.tracking.remember(&settings, entity);
            }
        }

        Ok(keys
            .iter()
            .map(|k| k.as_ref().and_then(|k| resolved.get(k).cloned()))
            .collect())
    }

    /// Batch lookup of complete keys, preserving input order
    pub fn get_all(&mut self, keys: &[Key]) -> Result<Vec<Option<Entity>>> {
        let keys: Vec<Option<Key>> = keys.iter().cloned().map(Some).collect();
        self.get_many(&keys)
    }

    /// Batch lookup returning a map that includes absent keys
    pub fn get_as_map(&mut self, keys: &[Key]) -> Result<HashMap<Key, Option<Entity>>> {
        let entities = self.get_all(keys)?;
        Ok(keys.iter().cloned().zip(entities).collect())
    }

    /// Reload entities in place from the store
    ///
    /// Inside a transaction the keys are recorded as fetched.
    ///
    /// # Errors
    /// Returns `Error::NotFound` if a record no longer exists.
    pub fn refetch(&mut self, entities: &mut [Entity]) -> Result<()> {
        let keys: Vec<Key> = entities.iter().map(|e| e.key().clone()).collect();
        keys.iter().try_for_each(require_complete)?;
        let found = self.shared().store.get_many(self.txn_handle(), &keys)?;
        self.shared().stats.record_store_gets(keys.len());
        if let Some(ctx) = self.txn.as_mut() {
            for key in &keys {
                ctx.record_fetched(key.clone());
            }
        }
        for entity in entities.iter_mut() {
            let fresh = found
                .get(entity.key())
                .ok_or_else(|| Error::NotFound(entity.key().clone()))?;
            entity.copy_properties_from(fresh);
            entity.mark_persisted();
        }
        if self.txn.is_none() {
            let loaded: Vec<Entity> = found.into_values().collect();
            self.cache_store(&loaded);
        }
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Apply schema rules (unindexed fields, text conversion) before a write
    fn apply_schema(&self, entity: &mut Entity) {
        let Some(schema) = self.shared().schema.as_ref() else {
            return;
        };
        let kind = entity.kind().to_string();
        let updates: Vec<(String, Option<Value>)> = entity
            .properties()
            .filter_map(|(name, property)| {
                let is_text = schema.field_type(&kind, name) == Some(FieldType::Text);
                match &property.value {
                    Value::String(s) if is_text => {
                        Some((name.to_string(), Some(Value::Text(s.clone()))))
                    }
                    _ if property.indexed && (is_text || schema.is_unindexed(&kind, name)) => {
                        Some((name.to_string(), None))
                    }
                    _ => None,
                }
            })
            .collect();
        for (name, converted) in updates {
            match converted {
                Some(value) => entity.set_unindexed_property(name, value),
                None => {
                    entity.set_indexed(&name, false);
                }
            }
        }
    }

    /// Schema and hook processing; returns false when the hook vetoes
    fn prepare_put(&self, entity: &mut Entity) -> bool {
        self.apply_schema(entity);
        if let Some(hook) = self.shared().put_hook.as_ref() {
            if !hook.before_put(entity) {
                debug!(target: "cachestore::cache", key = %entity.key(), "Put vetoed by hook");
                return false;
            }
        }
        true
    }

    /// Write one entity
    ///
    /// On return the entity carries its complete key and is no longer new
    /// or dirty. In bulk-write mode the entity is staged instead. A put
    /// vetoed by the put hook is a successful no-op.
    ///
    /// # Errors
    /// - `Error::NotFetchedInTransaction` for an unfetched persisted entity
    ///   in an enforce-fetch transaction
    /// - `Error::AlreadyPut` for a repeat put under single-put tracking
    pub fn put(&mut self, entity: &mut Entity) -> Result<Key> {
        if !self.prepare_put(entity) {
            return Ok(entity.key().clone());
        }
        if let Some(bulk) = self.bulk.as_mut() {
            bulk.stage_put(entity.clone());
            return Ok(entity.key().clone());
        }

        let shared = self.handle.shared();
        let key = match self.txn.as_mut() {
            Some(ctx) => {
                self.tracking.check_put(&shared.config.tracking, entity.key())?;
                if !entity.key().is_complete() || entity.is_new() {
                    let key = shared.store.put(Some(ctx.handle()), entity)?;
                    entity.set_key(key.clone());
                    ctx.record_fetched(key.clone());
                    ctx.mark_changed(entity)?;
                    key
                } else {
                    ctx.mark_changed(entity)?;
                    shared.store.put(Some(ctx.handle()), entity)?
                }
            }
            None => {
                self.tracking.check_put(&shared.config.tracking, entity.key())?;
                let key = shared.store.put(None, entity)?;
                entity.set_key(key.clone());
                entity.mark_persisted();
                self.cache_store(std::slice::from_ref(entity));
                self.tracking.record_put(&shared.config.tracking, entity);
                key
            }
        };
        shared.stats.record_store_puts(1);
        entity.mark_persisted();
        Ok(key)
    }

    /// Write several entities; returns their keys in input order
    pub fn put_many(&mut self, entities: &mut [Entity]) -> Result<Vec<Key>> {
        if self.bulk.is_some() || self.txn.is_some() {
            return entities.iter_mut().map(|e| self.put(e)).collect();
        }

        let tracking = self.shared().config.tracking.clone();
        let mut writable = Vec::with_capacity(entities.len());
        for (index, entity) in entities.iter_mut().enumerate() {
            if self.prepare_put(entity) {
                self.tracking.check_put(&tracking, entity.key())?;
                writable.push(index);
            }
        }
        let snapshots: Vec<Entity> = writable.iter().map(|&i| entities[i].clone()).collect();
        let keys = self.shared().store.put_many(None, &snapshots)?;
        self.shared().stats.record_store_puts(keys.len());

        for (&index, key) in writable.iter().zip(keys) {
            let entity = &mut entities[index];
            entity.set_key(key);
            entity.mark_persisted();
            self.tracking.record_put(&tracking, entity);
        }
        let written: Vec<Entity> = writable.iter().map(|&i| entities[i].clone()).collect();
        self.cache_store(&written);

        Ok(entities.iter().map(|e| e.key().clone()).collect())
    }

    /// Write only the entities with unsaved changes; returns how many
    pub fn put_if_changed(&mut self, entities: &mut [Entity]) -> Result<usize> {
        let mut written = 0;
        for entity in entities.iter_mut().filter(|e| e.is_dirty()) {
            self.put(entity)?;
            written += 1;
        }
        Ok(written)
    }

    /// Delete one record
    pub fn delete(&mut self, key: &Key) -> Result<()> {
        self.delete_many(std::slice::from_ref(key))
    }

    /// Delete several records
    pub fn delete_many(&mut self, keys: &[Key]) -> Result<()> {
        keys.iter().try_for_each(require_complete)?;
        if let Some(bulk) = self.bulk.as_mut() {
            for key in keys {
                bulk.stage_delete(key.clone());
            }
            return Ok(());
        }

        let shared = self.handle.shared();
        match self.txn.as_mut() {
            Some(ctx) => {
                shared.store.delete_many(Some(ctx.handle()), keys)?;
                for key in keys {
                    ctx.mark_deleted(key.clone())?;
                }
            }
            None => {
                shared.store.delete_many(None, keys)?;
                self.cache_evict(keys);
                self.tracking.forget(keys);
            }
        }
        shared.stats.record_store_deletes(keys.len());
        Ok(())
    }

    // ========================================================================
    // Per-request tracking
    // ========================================================================

    /// Start a new unit of work: forget dedup-tracked fetches and puts
    pub fn reset_request_tracking(&mut self) {
        self.tracking.clear();
    }
}

impl Drop for CachingDataAccessLayer {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.txn.take() {
            ctx.mark_aborted("session dropped");
            if let Err(e) = self.handle.shared().store.rollback(ctx.handle()) {
                warn!(target: "cachestore::txn", error = %e, "Rollback on drop failed");
            }
        }
    }
}
