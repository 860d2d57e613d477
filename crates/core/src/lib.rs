//! Core types and traits for cachestore
//!
//! This crate defines the foundational types used throughout the system:
//! - Key: hierarchical entity key (kind, id or name, optional parent)
//! - Value: property value enum
//! - Entity: keyed property bag with indexing flags and transient attributes
//! - Query: kind/ancestor/filter/sort query model with opaque cursors
//! - Error: error type shared by every crate
//! - Traits: collaborator seams (BackingStore, DistributedCache, SchemaProvider)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entity;
pub mod error;
pub mod query;
pub mod traits;
pub mod types;
pub mod value;

pub use entity::{Attributes, Entity, Property};
pub use error::{Error, Result};
pub use query::{Cursor, FetchOptions, Filter, FilterOp, Query, QueryResults, SortDirection};
pub use traits::{
    BackingStore, CacheValue, DistributedCache, FieldType, Identifiable, SchemaProvider,
    TxnHandle,
};
pub use types::{Key, KeyId, KeyRange};
pub use value::Value;
