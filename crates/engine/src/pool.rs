//! Preloaded working set
//!
//! An `EntityPool` collects the keys a unit of work will need, resolves them
//! with one batched get, and then serves lookups from memory. Once a key is
//! resolved (to an entity or to "absent") it never changes for the life of
//! the pool.

use crate::dal::CachingDataAccessLayer;
use cachestore_core::{Entity, Error, Key, Result};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Something that can be queued into a pool
#[derive(Debug, Clone)]
pub enum PoolItem {
    /// Key to resolve on the next load
    Key(Key),
    /// Entity added as already resolved
    Entity(Entity),
    /// Nested sequence
    Many(Vec<PoolItem>),
}

impl From<Key> for PoolItem {
    fn from(key: Key) -> Self {
        PoolItem::Key(key)
    }
}

impl From<&Key> for PoolItem {
    fn from(key: &Key) -> Self {
        PoolItem::Key(key.clone())
    }
}

impl From<Entity> for PoolItem {
    fn from(entity: Entity) -> Self {
        PoolItem::Entity(entity)
    }
}

impl<T: Into<PoolItem>> From<Option<T>> for PoolItem {
    fn from(item: Option<T>) -> Self {
        match item {
            Some(item) => item.into(),
            None => PoolItem::Many(Vec::new()),
        }
    }
}

impl<T: Into<PoolItem>> From<Vec<T>> for PoolItem {
    fn from(items: Vec<T>) -> Self {
        PoolItem::Many(items.into_iter().map(Into::into).collect())
    }
}

/// Map of preloaded entities for one unit of work
#[derive(Debug, Default)]
pub struct EntityPool {
    resolved: HashMap<Key, Option<Entity>>,
    queue: BTreeSet<Key>,
}

impl EntityPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue keys and add entities
    ///
    /// Entities are added directly; keys already resolved are skipped.
    /// Incomplete keys cannot be looked up and are ignored.
    pub fn add_to_queue(&mut self, item: impl Into<PoolItem>) {
        match item.into() {
            PoolItem::Key(key) => {
                if key.is_complete() && !self.resolved.contains_key(&key) {
                    self.queue.insert(key);
                }
            }
            PoolItem::Entity(entity) => self.add_entity_directly(entity),
            PoolItem::Many(items) => {
                for item in items {
                    self.add_to_queue(item);
                }
            }
        }
    }

    /// Number of keys waiting for the next load
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Resolve every queued key with one batched get
    ///
    /// Returns what this load resolved, absent keys included.
    pub fn load_entities(
        &mut self,
        dal: &mut CachingDataAccessLayer,
    ) -> Result<HashMap<Key, Option<Entity>>> {
        if self.queue.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<Key> = self.queue.iter().cloned().collect();
        let loaded = dal.get_as_map(&keys)?;
        self.queue.clear();
        for (key, entity) in &loaded {
            self.resolved
                .entry(key.clone())
                .or_insert_with(|| entity.clone());
        }
        debug!(
            target: "cachestore::cache",
            requested = keys.len(),
            missing = loaded.values().filter(|e| e.is_none()).count(),
            "Entity pool loaded"
        );
        Ok(loaded)
    }

    /// Preloaded entity for `key`
    ///
    /// # Errors
    /// Returns `Error::NotPreloaded` if `key` was never resolved.
    pub fn get(&self, key: &Key) -> Result<Option<&Entity>> {
        self.resolved
            .get(key)
            .map(Option::as_ref)
            .ok_or_else(|| Error::NotPreloaded(key.clone()))
    }

    /// Preloaded entities for `keys`, in order
    pub fn get_many(&self, keys: &[Key]) -> Result<Vec<Option<&Entity>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Whether `key` has been resolved
    pub fn contains(&self, key: &Key) -> bool {
        self.resolved.contains_key(key)
    }

    /// Add an entity as resolved unless its key already is
    pub fn add_entity_directly(&mut self, entity: Entity) {
        let key = entity.key().clone();
        if !key.is_complete() {
            return;
        }
        self.queue.remove(&key);
        self.resolved.entry(key).or_insert(Some(entity));
    }

    /// Record `key` as absent unless it is already resolved
    pub fn add_absent_directly(&mut self, key: Key) {
        self.queue.remove(&key);
        self.resolved.entry(key).or_insert(None);
    }

    /// Number of resolved keys that had no entity
    pub fn failed_fetch_count(&self) -> usize {
        self.resolved.values().filter(|e| e.is_none()).count()
    }

    /// Resolved keys that had no entity
    pub fn failed_fetch_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .resolved
            .iter()
            .filter(|(_, e)| e.is_none())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of resolved keys
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    /// True when nothing is resolved
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::CacheStore;

    fn user(id: i64) -> Entity {
        let mut e = Entity::new(Key::with_id("User", id));
        e.set_property("n", id);
        e
    }

    #[test]
    fn test_unloaded_key_is_not_preloaded() {
        let mut pool = EntityPool::new();
        pool.add_to_queue(Key::with_id("User", 1));
        assert_eq!(pool.queued(), 1);
        let err = pool.get(&Key::with_id("User", 1)).unwrap_err();
        assert!(matches!(err, Error::NotPreloaded(_)));
    }

    #[test]
    fn test_nested_items_and_options() {
        let mut pool = EntityPool::new();
        pool.add_to_queue(vec![
            PoolItem::from(Key::with_id("User", 1)),
            PoolItem::from(None::<Key>),
            PoolItem::from(vec![Key::with_id("User", 2), Key::with_id("User", 1)]),
            PoolItem::from(user(3)),
            PoolItem::from(Key::incomplete("User")),
        ]);
        assert_eq!(pool.queued(), 2);
        assert!(pool.contains(&Key::with_id("User", 3)));
    }

    #[test]
    fn test_direct_adds_never_overwrite() {
        let mut pool = EntityPool::new();
        pool.add_absent_directly(Key::with_id("User", 1));
        pool.add_entity_directly(user(1));
        assert_eq!(pool.get(&Key::with_id("User", 1)).unwrap(), None);

        pool.add_entity_directly(user(2));
        pool.add_absent_directly(Key::with_id("User", 2));
        assert!(pool.get(&Key::with_id("User", 2)).unwrap().is_some());
        assert_eq!(pool.failed_fetch_keys(), vec![Key::with_id("User", 1)]);
    }

    #[test]
    fn test_load_resolves_queue_in_one_batch() {
        let handle = CacheStore::in_memory();
        let mut dal = handle.session();
        dal.put(&mut user(1)).unwrap();
        dal.put(&mut user(2)).unwrap();
        handle.reset_stats();

        let mut pool = EntityPool::new();
        pool.add_to_queue(vec![
            Key::with_id("User", 1),
            Key::with_id("User", 2),
            Key::with_id("User", 9),
        ]);
        let loaded = pool.load_entities(&mut dal).unwrap();

        assert_eq!(loaded.len(), 3);
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.failed_fetch_count(), 1);
        assert!(pool.get(&Key::with_id("User", 9)).unwrap().is_none());
        let one = pool.get(&Key::with_id("User", 1)).unwrap().unwrap();
        assert_eq!(one.property("n").and_then(|v| v.as_int()), Some(1));

        let stats = handle.stats();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.store_gets, 1);
        assert!(pool.load_entities(&mut dal).unwrap().is_empty());
    }

    #[test]
    fn test_resolved_entries_are_stable() {
        let handle = CacheStore::in_memory();
        let mut dal = handle.session();
        let mut pool = EntityPool::new();
        pool.add_absent_directly(Key::with_id("User", 1));
        dal.put(&mut user(1)).unwrap();

        pool.add_to_queue(Key::with_id("User", 1));
        assert_eq!(pool.queued(), 0);
        pool.load_entities(&mut dal).unwrap();
        assert!(pool.get(&Key::with_id("User", 1)).unwrap().is_none());
    }
}
