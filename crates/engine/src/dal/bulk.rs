//! Bulk-write mode
//!
//! While bulk-write mode is on, puts and deletes are staged in memory. On
//! commit, every staged incomplete key gets an id in one allocation per
//! kind, references to the provisional keys (parent chains and key-valued
//! properties) are rewritten to the allocated keys, and everything is
//! written in one batch. A later put or delete of a key replaces an
//! earlier staged operation on the same key.

use super::CachingDataAccessLayer;
use cachestore_core::{Entity, Error, Key, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub(crate) struct BulkWriteBuffer {
    puts: BTreeMap<Key, Entity>,
    deletes: BTreeSet<Key>,
}

impl BulkWriteBuffer {
    pub(crate) fn stage_put(&mut self, entity: Entity) {
        self.deletes.remove(entity.key());
        self.puts.insert(entity.key().clone(), entity);
    }

    pub(crate) fn stage_delete(&mut self, key: Key) {
        self.puts.remove(&key);
        self.deletes.insert(key);
    }
}

/// Result of committing a bulk write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteOutcome {
    /// Staged key -> key it was written under, for every key that changed
    pub key_map: HashMap<Key, Key>,
    /// Entities written
    pub written: usize,
    /// Keys deleted
    pub deleted: usize,
}

impl BulkWriteOutcome {
    /// Final key for a staged key (the key itself when it did not change)
    pub fn resolve<'a>(&'a self, staged: &'a Key) -> &'a Key {
        self.key_map.get(staged).unwrap_or(staged)
    }
}

/// Rebuild `key` with allocated ids substituted along its whole chain
fn resolve_key(key: &Key, allocated: &HashMap<Key, i64>) -> Key {
    let parent = key.parent().map(|p| resolve_key(p, allocated));
    let completed = match allocated.get(key) {
        Some(&id) => key.completed_with(id),
        None => key.clone(),
    };
    completed.with_parent(parent)
}

impl CachingDataAccessLayer {
    /// Enter bulk-write mode
    ///
    /// # Errors
    /// Returns `Error::InvalidState` inside a transaction or when bulk-write
    /// mode is already on.
    pub fn begin_bulk_write(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::invalid_state(
                "cannot begin a bulk write inside a transaction",
            ));
        }
        if self.bulk.is_some() {
            return Err(Error::invalid_state("bulk write already in progress"));
        }
        self.bulk = Some(BulkWriteBuffer::default());
        Ok(())
    }

    /// Whether bulk-write mode is on
    pub fn is_bulk_write_active(&self) -> bool {
        self.bulk.is_some()
    }

    /// Number of staged puts
    pub fn bulk_put_count(&self) -> usize {
        self.bulk.as_ref().map_or(0, |b| b.puts.len())
    }

    /// Leave bulk-write mode, discarding everything staged
    pub fn cancel_bulk_write(&mut self) -> bool {
        self.bulk.take().is_some()
    }

    /// Leave bulk-write mode and write everything staged
    pub fn commit_bulk_write(&mut self) -> Result<BulkWriteOutcome> {
        let buffer = self
            .bulk
            .take()
            .ok_or_else(|| Error::invalid_state("no bulk write in progress"))?;
        let mut entities: Vec<Entity> = buffer.puts.into_values().collect();
        let deletes: Vec<Key> = buffer.deletes.into_iter().collect();

        let mut by_kind: BTreeMap<String, Vec<Key>> = BTreeMap::new();
        for entity in entities.iter().filter(|e| !e.key().is_complete()) {
            by_kind
                .entry(entity.kind().to_string())
                .or_default()
                .push(entity.key().clone());
        }
        let mut allocated: HashMap<Key, i64> = HashMap::new();
        for (kind, keys) in by_kind {
            let range = self.shared().store.allocate_ids(&kind, None, keys.len())?;
            allocated.extend(keys.into_iter().zip(range.ids()));
        }

        let mut key_map = HashMap::new();
        for entity in &mut entities {
            let staged = entity.key().clone();
            let resolved = resolve_key(&staged, &allocated);
            let rewritten = entity.rewrite_property_keys(&mut |k| {
                let r = resolve_key(k, &allocated);
                (r != *k).then_some(r)
            });
            for property in rewritten {
                debug!(
                    target: "cachestore::bulk",
                    key = %resolved,
                    property = %property,
                    "Rewrote provisional key reference"
                );
            }
            if resolved != staged {
                entity.set_key(resolved.clone());
                key_map.insert(staged, resolved);
            }
        }

        if !deletes.is_empty() {
            self.shared().store.delete_many(None, &deletes)?;
            self.shared().stats.record_store_deletes(deletes.len());
            self.cache_evict(&deletes);
            self.tracking.forget(&deletes);
        }
        if !entities.is_empty() {
            self.shared().store.put_many(None, &entities)?;
            self.shared().stats.record_store_puts(entities.len());
            for entity in &mut entities {
                entity.mark_persisted();
            }
            self.cache_store(&entities);
            self.remember_written(&entities);
        }

        info!(
            target: "cachestore::bulk",
            written = entities.len(),
            deleted = deletes.len(),
            allocated = key_map.len(),
            "Bulk write committed"
        );
        Ok(BulkWriteOutcome {
            key_map,
            written: entities.len(),
            deleted: deletes.len(),
        })
    }
}
