//! Entity: a keyed property bag
//!
//! Entities are plain values. The data access layer hands out clones, the
//! cache stores serialized snapshots, and the store keeps its own copies,
//! so mutating an `Entity` never affects anyone else's view of the record.

use crate::types::Key;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One property value plus its indexing flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Stored value
    pub value: Value,
    /// Whether queries may filter on this property
    pub indexed: bool,
}

/// Transient per-instance metadata
///
/// Never serialized, never compared, and never copied: a clone of an
/// entity starts with an empty attribute map.
#[derive(Default)]
pub struct Attributes {
    map: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    /// Store an attribute, replacing any previous value under `name`
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.map.insert(name.into(), Arc::new(value));
    }

    /// Fetch an attribute if present and of type `T`
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.map.get(name).and_then(|v| v.downcast_ref::<T>())
    }

    /// Remove an attribute
    pub fn remove(&mut self, name: &str) -> bool {
        self.map.remove(name).is_some()
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no attributes are set
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Clone for Attributes {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

/// A record in the backing store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    key: Key,
    properties: BTreeMap<String, Property>,
    #[serde(skip)]
    is_new: bool,
    #[serde(skip)]
    is_dirty: bool,
    #[serde(skip)]
    attributes: Attributes,
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.properties == other.properties
    }
}

impl Entity {
    /// Create a new, never-persisted entity
    pub fn new(key: Key) -> Self {
        Self {
            key,
            properties: BTreeMap::new(),
            is_new: true,
            is_dirty: true,
            attributes: Attributes::default(),
        }
    }

    /// Create an entity with an incomplete key of `kind`
    pub fn of_kind(kind: impl Into<String>) -> Self {
        Self::new(Key::incomplete(kind))
    }

    /// Key of this entity
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Kind of this entity
    pub fn kind(&self) -> &str {
        self.key.kind()
    }

    /// Replace the key (used when an incomplete key gets its id)
    pub fn set_key(&mut self, key: Key) {
        self.key = key;
    }

    /// True until the entity has been written once
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// True when there are local changes not yet written
    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    /// Force the dirty flag on
    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    /// Clear the new and dirty flags after a successful write or load
    pub fn mark_persisted(&mut self) {
        self.is_new = false;
        self.is_dirty = false;
    }

    /// Set an indexed property
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.insert_property(name.into(), value.into(), true);
    }

    /// Set an unindexed property
    pub fn set_unindexed_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.insert_property(name.into(), value.into(), false);
    }

    fn insert_property(&mut self, name: String, value: Value, indexed: bool) {
        let changed = match self.properties.get(&name) {
            Some(existing) => existing.value != value || existing.indexed != indexed,
            None => true,
        };
        if changed {
            self.is_dirty = true;
        }
        self.properties.insert(name, Property { value, indexed });
    }

    /// Get a property value
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).map(|p| &p.value)
    }

    /// Whether a property is present
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Whether a property is present and indexed
    pub fn is_indexed(&self, name: &str) -> bool {
        self.properties.get(name).map_or(false, |p| p.indexed)
    }

    /// Change the indexing flag of an existing property
    pub fn set_indexed(&mut self, name: &str, indexed: bool) -> bool {
        match self.properties.get_mut(name) {
            Some(p) if p.indexed != indexed => {
                p.indexed = indexed;
                self.is_dirty = true;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Remove a property, returning its value
    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        let removed = self.properties.remove(name).map(|p| p.value);
        if removed.is_some() {
            self.is_dirty = true;
        }
        removed
    }

    /// Iterate over properties in name order
    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of properties
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Overwrite this entity's properties with another entity's properties
    ///
    /// The key is left untouched.
    pub fn copy_properties_from(&mut self, other: &Entity) {
        if self.properties != other.properties {
            self.properties = other.properties.clone();
            self.is_dirty = true;
        }
    }

    /// Rewrite references to `old` (in the key's ancestor chain and in
    /// property values) to point at `new`
    ///
    /// Returns the names of properties that were rewritten.
    pub fn replace_key_references(&mut self, old: &Key, new: &Key) -> Vec<String> {
        if let Some(rewritten) = self.key.with_replaced_ancestor(old, new) {
            self.key = rewritten;
        }
        self.rewrite_property_keys(&mut |k| {
            if k == old {
                Some(new.clone())
            } else {
                k.with_replaced_ancestor(old, new)
            }
        })
    }

    /// Rewrite key-valued properties (including inside arrays) for which
    /// `f` returns a replacement
    ///
    /// Returns the names of properties that were rewritten.
    pub fn rewrite_property_keys(&mut self, f: &mut dyn FnMut(&Key) -> Option<Key>) -> Vec<String> {
        let mut touched = Vec::new();
        for (name, property) in self.properties.iter_mut() {
            if property.value.rewrite_keys(f) > 0 {
                touched.push(name.clone());
            }
        }
        if !touched.is_empty() {
            self.is_dirty = true;
        }
        touched
    }

    /// Transient attributes attached to this instance
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Mutable access to transient attributes
    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// Return a copy with only the key (keys-only query projection)
    pub fn key_only(&self) -> Entity {
        Entity {
            key: self.key.clone(),
            properties: BTreeMap::new(),
            is_new: false,
            is_dirty: false,
            attributes: Attributes::default(),
        }
    }
}
