//! Configuration via `cachestore.toml`
//!
//! Every field has a default, so an empty file (or no file) yields a working
//! configuration. `CacheStoreConfig::default_toml()` returns a commented
//! template with the defaults spelled out.

use cachestore_concurrency::{Backoff, RetryPolicy};
use cachestore_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Conventional config file name
pub const CONFIG_FILE_NAME: &str = "cachestore.toml";

/// Default prefix of entity cache keys
pub const DEFAULT_ENTITY_PREFIX: &str = "MCENTITY";

/// Look-aside cache behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Serve reads from / write through to the cache
    pub enabled: bool,
    /// Prefix prepended to the key rendering to build entity cache keys
    pub entity_prefix: String,
    /// Expiry of cached entities in seconds (None = no expiry)
    pub entity_ttl_secs: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            entity_prefix: DEFAULT_ENTITY_PREFIX.to_string(),
            entity_ttl_secs: None,
        }
    }
}

impl CacheSettings {
    /// Entity expiry as a duration
    pub fn entity_ttl(&self) -> Option<Duration> {
        self.entity_ttl_secs.map(Duration::from_secs)
    }
}

/// Per-unit-of-work dedup tracking
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// Serve repeat gets of a key from the session's own map
    pub track_fetches: bool,
    /// Reject a put of a key this session already put outside a transaction
    pub single_put: bool,
}

/// Cache lock acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Backoff between acquisition attempts
    pub backoff: Backoff,
    /// Give up acquiring after this many milliseconds (None = wait forever)
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            backoff: Backoff::exponential(1, 50),
            acquire_timeout_ms: None,
        }
    }
}

/// Sharded counter defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterSettings {
    /// Shards used when the caller does not specify a count
    pub default_shard_count: u32,
}

impl Default for CounterSettings {
    fn default() -> Self {
        Self {
            default_shard_count: 5,
        }
    }
}

/// Query helper tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Page size used by query iterators
    pub chunk_size: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self { chunk_size: 500 }
    }
}

/// Top-level configuration loaded from `cachestore.toml`
///
/// # Example
///
/// ```toml
/// [cache]
/// enabled = true
/// entity_prefix = "MCENTITY"
///
/// [retry]
/// max_attempts = 10
///
/// [preallocation]
/// Invoice = 20
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStoreConfig {
    /// Look-aside cache behaviour
    pub cache: CacheSettings,
    /// Dedup tracking
    pub tracking: TrackingSettings,
    /// Transaction retry bounds (unbounded by default)
    pub retry: RetryPolicy,
    /// Cache lock acquisition
    pub lock: LockSettings,
    /// Sharded counters
    pub counters: CounterSettings,
    /// Per-kind id preallocation batch sizes (default 1)
    pub preallocation: HashMap<String, usize>,
    /// Query helpers
    pub query: QuerySettings,
}

impl CacheStoreConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CacheStoreConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == Some(0) {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.counters.default_shard_count == 0 {
            return Err(Error::Config(
                "counters.default_shard_count must be at least 1".into(),
            ));
        }
        if self.query.chunk_size == 0 {
            return Err(Error::Config("query.chunk_size must be at least 1".into()));
        }
        if let Some((kind, _)) = self.preallocation.iter().find(|(_, n)| **n == 0) {
            return Err(Error::Config(format!(
                "preallocation.{kind} must be at least 1"
            )));
        }
        Ok(())
    }

    /// Returns the default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# cachestore configuration

[cache]
# Serve reads from the look-aside cache and write through after each store write
enabled = true
# Prefix of entity cache keys
entity_prefix = "MCENTITY"
# Expiry of cached entities in seconds (omit for no expiry)
# entity_ttl_secs = 3600

[tracking]
# Serve repeat gets within one unit of work from the session's own map
track_fetches = false
# Fail when the same key is put twice in one unit of work
single_put = false

[retry]
# Conflict retries are unbounded unless a bound is set here
# max_attempts = 10
# max_elapsed_ms = 5000

[retry.backoff]
initial_ms = 0
max_ms = 0
jitter = false

[lock.backoff]
initial_ms = 1
max_ms = 50
jitter = true

# [lock]
# acquire_timeout_ms = 30000

[counters]
default_shard_count = 5

[query]
chunk_size = 500

# [preallocation]
# Invoice = 20
"#
    }
}
