//! Query helpers
//!
//! Queries always run against the store outside any transaction. Entity
//! queries run keys-only and then resolve the keys through the normal
//! cache-aware batch get, so hot entities come from the cache.

use super::CachingDataAccessLayer;
use crate::handle::CacheStore;
use cachestore_core::{CacheValue, Cursor, Entity, FetchOptions, Key, Query, Result};
use std::collections::VecDeque;
use tracing::{trace, warn};

impl CachingDataAccessLayer {
    /// Keys matching `query`, starting at `cursor`
    ///
    /// The end cursor is kept and available from `last_query_cursor`.
    pub fn query_keys(
        &mut self,
        query: &Query,
        limit: Option<usize>,
        cursor: Option<Cursor>,
    ) -> Result<Vec<Key>> {
        self.run_keys_query(query, limit, 0, cursor)
    }

    fn run_keys_query(
        &mut self,
        query: &Query,
        limit: Option<usize>,
        offset: usize,
        cursor: Option<Cursor>,
    ) -> Result<Vec<Key>> {
        let mut keys_query = query.clone();
        keys_query.keys_only = true;
        let options = FetchOptions {
            limit,
            offset,
            start_cursor: cursor,
        };
        let results = self.shared().store.query(&keys_query, &options)?;
        self.shared().stats.record_query();
        trace!(
            target: "cachestore::cache",
            kind = %query.kind,
            returned = results.entities.len(),
            more = results.more_results,
            "Keys query"
        );
        self.last_cursor = results.end_cursor.clone();
        Ok(results.keys())
    }

    /// Entities matching `query`, starting at `cursor`
    ///
    /// Entities deleted between the keys query and the fetch are skipped.
    pub fn query(
        &mut self,
        query: &Query,
        limit: Option<usize>,
        cursor: Option<Cursor>,
    ) -> Result<Vec<Entity>> {
        let keys = self.run_keys_query(query, limit, 0, cursor)?;
        Ok(self.get_all(&keys)?.into_iter().flatten().collect())
    }

    /// Entities matching `query`, skipping the first `offset` matches
    pub fn query_offset(
        &mut self,
        query: &Query,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Entity>> {
        let keys = self.run_keys_query(query, limit, offset, None)?;
        Ok(self.get_all(&keys)?.into_iter().flatten().collect())
    }

    /// First entity matching `query`
    pub fn query_single(&mut self, query: &Query) -> Result<Option<Entity>> {
        Ok(self.query(query, Some(1), None)?.into_iter().next())
    }

    /// Number of entities matching `query`, stopping at `limit`
    pub fn count(&self, query: &Query, limit: Option<usize>) -> Result<usize> {
        self.shared().stats.record_query();
        self.shared().store.count(query, limit)
    }

    /// Entities of `kind` under `parent`
    pub fn fetch_children(
        &mut self,
        kind: &str,
        parent: &Key,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>> {
        let query = Query::new(kind).ancestor(parent.clone());
        self.query(&query, limit, None)
    }

    /// End cursor of the most recent keys query
    pub fn last_query_cursor(&self) -> Option<&Cursor> {
        self.last_cursor.as_ref()
    }

    /// Lazily page through every entity matching `query`
    ///
    /// Pages are fetched from the store in chunks of the configured size.
    /// With `cache_results`, each fetched entity is written to the cache.
    pub fn query_iter(&self, query: Query, cache_results: bool) -> QueryIter {
        QueryIter {
            handle: self.handle.clone(),
            chunk_size: self.shared().config.query.chunk_size,
            query,
            cache_results,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

/// Chunked iterator over query results
///
/// Yields `Err` once if a page fails to load, then ends.
pub struct QueryIter {
    handle: CacheStore,
    query: Query,
    chunk_size: usize,
    cache_results: bool,
    cursor: Option<Cursor>,
    buffer: VecDeque<Entity>,
    exhausted: bool,
}

impl QueryIter {
    fn load_page(&mut self) -> Result<()> {
        let options = FetchOptions::with_limit(self.chunk_size).start_at(self.cursor.take());
        let shared = self.handle.shared();
        let results = shared.store.query(&self.query, &options)?;
        shared.stats.record_query();

        if self.cache_results && shared.config.cache.enabled && !results.entities.is_empty() {
            let entries: Vec<(String, CacheValue)> = results
                .entities
                .iter()
                .map(|e| {
                    (
                        self.handle.entity_cache_key(e.key()),
                        CacheValue::Entity(e.clone()),
                    )
                })
                .collect();
            if let Err(e) = shared.cache.put_many(entries, shared.config.cache.entity_ttl()) {
                warn!(target: "cachestore::cache", error = %e, "Caching query page failed");
            }
        }

        self.exhausted = !results.more_results;
        self.cursor = results.end_cursor;
        self.buffer.extend(results.entities);
        Ok(())
    }
}

impl Iterator for QueryIter {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.load_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl std::fmt::Debug for QueryIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryIter")
            .field("kind", &self.query.kind)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
