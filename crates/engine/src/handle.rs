//! Shared handle to the store, cache and configuration
//!
//! A `CacheStore` is constructed once per process (or per test) and cloned
//! into every consumer. Each unit of work opens its own
//! `CachingDataAccessLayer` session from it; sessions share the collaborators,
//! statistics and id-preallocation buffers but never transaction state.

use crate::config::CacheStoreConfig;
use crate::dal::CachingDataAccessLayer;
use crate::instance_cache::InstanceCache;
use crate::stats::{DataAccessStats, StatsSnapshot};
use cachestore_core::{
    BackingStore, CacheValue, DistributedCache, Entity, Key, Result, SchemaProvider,
};
use cachestore_storage::{MemoryCache, MemoryStore};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hook run immediately before an entity is written
pub trait PutHook: Send + Sync {
    /// Inspect or rewrite `entity`; return `false` to skip the write
    fn before_put(&self, entity: &mut Entity) -> bool;
}

pub(crate) struct Shared {
    pub(crate) store: Arc<dyn BackingStore>,
    pub(crate) cache: Arc<dyn DistributedCache>,
    pub(crate) schema: Option<Arc<dyn SchemaProvider>>,
    pub(crate) put_hook: Option<Arc<dyn PutHook>>,
    pub(crate) config: CacheStoreConfig,
    pub(crate) stats: DataAccessStats,
    pub(crate) instance: InstanceCache,
    /// Preallocated ids per kind, handed out front first
    pub(crate) preallocated: Mutex<HashMap<String, VecDeque<i64>>>,
    /// Replenish batch size per kind, seeded from config
    pub(crate) auto_preallocation: Mutex<HashMap<String, usize>>,
}

/// Cheaply cloneable handle shared by all sessions
#[derive(Clone)]
pub struct CacheStore {
    shared: Arc<Shared>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.shared.config)
            .field("schema", &self.shared.schema.is_some())
            .field("put_hook", &self.shared.put_hook.is_some())
            .finish()
    }
}

impl CacheStore {
    /// Build a handle over the given collaborators with default settings
    pub fn new(store: Arc<dyn BackingStore>, cache: Arc<dyn DistributedCache>) -> Self {
        Self::builder(store, cache).build_unchecked()
    }

    /// Start a builder
    pub fn builder(
        store: Arc<dyn BackingStore>,
        cache: Arc<dyn DistributedCache>,
    ) -> CacheStoreBuilder {
        CacheStoreBuilder {
            store,
            cache,
            schema: None,
            put_hook: None,
            config: CacheStoreConfig::default(),
        }
    }

    /// Handle over a fresh `MemoryStore` and `MemoryCache`
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()))
    }

    /// Open a new unit-of-work session
    pub fn session(&self) -> CachingDataAccessLayer {
        CachingDataAccessLayer::new(self.clone())
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.shared.store
    }

    /// Distributed cache
    pub fn cache(&self) -> &Arc<dyn DistributedCache> {
        &self.shared.cache
    }

    /// Active configuration
    pub fn config(&self) -> &CacheStoreConfig {
        &self.shared.config
    }

    /// Current statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Reset statistics to zero
    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Cache key of an entity: the configured prefix plus the key rendering
    pub fn entity_cache_key(&self, key: &Key) -> String {
        format!("{}{}", self.shared.config.cache.entity_prefix, key)
    }

    /// Process-local cache shared by every session of this handle
    pub fn instance_cache(&self) -> &InstanceCache {
        &self.shared.instance
    }

    /// Keep local copies of `entities` under their entity cache keys
    pub fn put_entities_to_instance_cache(&self, entities: &[Entity], ttl: Option<Duration>) {
        let entries = entities
            .iter()
            .map(|e| (self.entity_cache_key(e.key()), CacheValue::Entity(e.clone())))
            .collect();
        self.shared.instance.put_many(entries, ttl);
    }

    /// Live local copy of the entity under `key`
    pub fn get_entity_from_instance_cache(&self, key: &Key) -> Option<Entity> {
        self.shared
            .instance
            .get(&self.entity_cache_key(key))
            .and_then(CacheValue::into_entity)
    }
}

/// Builder for `CacheStore`
pub struct CacheStoreBuilder {
    store: Arc<dyn BackingStore>,
    cache: Arc<dyn DistributedCache>,
    schema: Option<Arc<dyn SchemaProvider>>,
    put_hook: Option<Arc<dyn PutHook>>,
    config: CacheStoreConfig,
}

impl CacheStoreBuilder {
    /// Use `config` instead of the defaults
    pub fn config(mut self, config: CacheStoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Consult `schema` on every write
    pub fn schema(mut self, schema: Arc<dyn SchemaProvider>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Run `hook` before every write
    pub fn put_hook(mut self, hook: Arc<dyn PutHook>) -> Self {
        self.put_hook = Some(hook);
        self
    }

    /// Validate the configuration and build the handle
    pub fn build(self) -> Result<CacheStore> {
        self.config.validate()?;
        Ok(self.build_unchecked())
    }

    fn build_unchecked(self) -> CacheStore {
        let auto_preallocation = self.config.preallocation.clone();
        CacheStore {
            shared: Arc::new(Shared {
                store: self.store,
                cache: self.cache,
                schema: self.schema,
                put_hook: self.put_hook,
                config: self.config,
                stats: DataAccessStats::default(),
                instance: InstanceCache::new(),
                preallocated: Mutex::new(HashMap::new()),
                auto_preallocation: Mutex::new(auto_preallocation),
            }),
        }
    }
}
