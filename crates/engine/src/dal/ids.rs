//! Id allocation and preallocation
//!
//! Preallocated ids live on the shared handle, so every session draws from
//! the same per-kind buffer. An empty buffer is refilled with one store
//! allocation of the kind's auto-preallocation batch size (default 1).

use super::CachingDataAccessLayer;
use cachestore_core::{Entity, Error, Key, KeyRange, Result};
use tracing::debug;

impl CachingDataAccessLayer {
    /// Reserve `count` ids for `kind` directly from the store
    pub fn allocate_ids(&self, kind: &str, parent: Option<&Key>, count: usize) -> Result<KeyRange> {
        self.shared().store.allocate_ids(kind, parent, count)
    }

    /// Reserve `count` ids for `kind` and add them to the shared buffer
    pub fn preallocate_ids_for(&self, kind: &str, count: usize) -> Result<()> {
        let range = self.allocate_ids(kind, None, count)?;
        debug!(target: "cachestore::cache", kind, start = range.start, end = range.end, "Preallocated ids");
        self.shared()
            .preallocated
            .lock()
            .entry(kind.to_string())
            .or_default()
            .extend(range.ids());
        Ok(())
    }

    /// Number of buffered ids for `kind`
    pub fn preallocated_count(&self, kind: &str) -> usize {
        self.shared()
            .preallocated
            .lock()
            .get(kind)
            .map_or(0, |ids| ids.len())
    }

    /// Set the refill batch size for `kind`
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` for a zero batch size.
    pub fn set_auto_preallocation(&self, kind: &str, batch: usize) -> Result<()> {
        if batch == 0 {
            return Err(Error::invalid_argument(format!(
                "auto preallocation batch for {kind} must be positive"
            )));
        }
        self.shared()
            .auto_preallocation
            .lock()
            .insert(kind.to_string(), batch);
        Ok(())
    }

    /// Take the next buffered id for `kind`, refilling the buffer if empty
    pub fn preallocated_id_for(&self, kind: &str) -> Result<i64> {
        let mut buffers = self.shared().preallocated.lock();
        let ids = buffers.entry(kind.to_string()).or_default();
        if ids.is_empty() {
            let batch = self
                .shared()
                .auto_preallocation
                .lock()
                .get(kind)
                .copied()
                .unwrap_or(1);
            let range = self.shared().store.allocate_ids(kind, None, batch)?;
            ids.extend(range.ids());
        }
        ids.pop_front()
            .ok_or_else(|| Error::InternalConsistency(format!("id buffer for {kind} is empty")))
    }

    /// New entity of `kind` keyed with a preallocated id
    pub fn new_entity(&self, kind: &str) -> Result<Entity> {
        let id = self.preallocated_id_for(kind)?;
        Ok(Entity::new(Key::with_id(kind, id)))
    }
}
