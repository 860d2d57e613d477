//! Key types for cachestore
//!
//! This module defines:
//! - KeyId: the identifying part of a key (numeric id, string name, or
//!   a provisional token while the key is still incomplete)
//! - Key: kind + KeyId + optional parent (ancestor chain)
//! - KeyRange: a contiguous block of allocated numeric ids
//!
//! ## Key rendering
//!
//! `Display` renders the full ancestor path, e.g. `Folder(1)/File("a.txt")`.
//! The rendering is stable and is the basis of cache keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of provisional tokens for incomplete keys
static PROVISIONAL: AtomicU64 = AtomicU64::new(1);

/// Identifying part of a key
///
/// Variant order matters: derived `Ord` sorts incomplete keys first,
/// then numeric ids, then names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyId {
    /// Not yet allocated. The token keeps distinct unsaved records apart.
    Incomplete(u64),
    /// Numeric id (store-allocated or caller-chosen)
    Id(i64),
    /// String name
    Name(String),
}

/// Hierarchical key identifying one entity
///
/// Equality is structural. A complete key never changes; completing an
/// incomplete key produces a new `Key` value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    parent: Option<Box<Key>>,
    kind: String,
    id: KeyId,
}

impl Key {
    /// Create an incomplete key for a record that has not been persisted
    pub fn incomplete(kind: impl Into<String>) -> Self {
        Self {
            parent: None,
            kind: kind.into(),
            id: KeyId::Incomplete(PROVISIONAL.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Create a key with a numeric id
    pub fn with_id(kind: impl Into<String>, id: i64) -> Self {
        Self {
            parent: None,
            kind: kind.into(),
            id: KeyId::Id(id),
        }
    }

    /// Create a key with a string name
    pub fn with_name(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            parent: None,
            kind: kind.into(),
            id: KeyId::Name(name.into()),
        }
    }

    /// Attach a parent, placing this key inside the parent's entity group
    pub fn child_of(mut self, parent: Key) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Kind (type name) of the keyed entity
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Identifying part of the key
    pub fn key_id(&self) -> &KeyId {
        &self.id
    }

    /// Numeric id, if the key has one
    pub fn id(&self) -> Option<i64> {
        match self.id {
            KeyId::Id(id) => Some(id),
            _ => None,
        }
    }

    /// String name, if the key has one
    pub fn name(&self) -> Option<&str> {
        match &self.id {
            KeyId::Name(name) => Some(name),
            _ => None,
        }
    }

    /// Parent key, if any
    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_deref()
    }

    /// Top-most ancestor; identifies the entity group
    pub fn root(&self) -> &Key {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// True when this key has an id or a name
    pub fn is_complete(&self) -> bool {
        !matches!(self.id, KeyId::Incomplete(_))
    }

    /// True when `ancestor` is this key or appears in its parent chain
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        let mut current = Some(self);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = key.parent();
        }
        false
    }

    /// Return a copy of this key completed with `id`, keeping kind and parent
    pub fn completed_with(&self, id: i64) -> Key {
        Key {
            parent: self.parent.clone(),
            kind: self.kind.clone(),
            id: KeyId::Id(id),
        }
    }

    /// Return a copy of this key under a different parent
    pub fn with_parent(&self, parent: Option<Key>) -> Key {
        Key {
            parent: parent.map(Box::new),
            kind: self.kind.clone(),
            id: self.id.clone(),
        }
    }

    /// Return a copy whose parent chain has every occurrence of `old`
    /// replaced with `new`. Returns `None` when nothing changed.
    pub fn with_replaced_ancestor(&self, old: &Key, new: &Key) -> Option<Key> {
        let parent = self.parent.as_deref()?;
        let replaced = if parent == old {
            new.clone()
        } else {
            parent.with_replaced_ancestor(old, new)?
        };
        Some(Key {
            parent: Some(Box::new(replaced)),
            kind: self.kind.clone(),
            id: self.id.clone(),
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{}/", parent)?;
        }
        match &self.id {
            KeyId::Incomplete(token) => write!(f, "{}(?{})", self.kind, token),
            KeyId::Id(id) => write!(f, "{}({})", self.kind, id),
            KeyId::Name(name) => write!(f, "{}({:?})", self.kind, name),
        }
    }
}

/// Contiguous block of ids allocated for one kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Kind the ids were allocated for
    pub kind: String,
    /// Parent the ids were allocated under
    pub parent: Option<Key>,
    /// First id (inclusive)
    pub start: i64,
    /// Last id (inclusive)
    pub end: i64,
}

impl KeyRange {
    /// Number of ids in the range
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start + 1) as usize
        }
    }

    /// True when the range holds no ids
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the allocated ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = i64> {
        self.start..=self.end
    }

    /// Iterate over complete keys built from the allocated ids
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.ids().map(move |id| {
            let key = Key::with_id(self.kind.clone(), id);
            match &self.parent {
                Some(parent) => key.child_of(parent.clone()),
                None => key,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_keys_are_distinct() {
        let a = Key::incomplete("Folder");
        let b = Key::incomplete("Folder");
        assert_ne!(a, b);
        assert!(!a.is_complete());
        assert_eq!(a.kind(), "Folder");
    }

    #[test]
    fn test_complete_keys_equal_structurally() {
        let a = Key::with_id("User", 7).child_of(Key::with_name("Org", "acme"));
        let b = Key::with_id("User", 7).child_of(Key::with_name("Org", "acme"));
        assert_eq!(a, b);
        assert!(a.is_complete());
        assert_eq!(a.id(), Some(7));
        assert_eq!(a.name(), None);
    }

    #[test]
    fn test_display_renders_ancestor_path() {
        let key = Key::with_name("File", "a.txt").child_of(Key::with_id("Folder", 1));
        assert_eq!(key.to_string(), "Folder(1)/File(\"a.txt\")");
    }

    #[test]
    fn test_root_and_has_ancestor() {
        let org = Key::with_name("Org", "acme");
        let team = Key::with_id("Team", 2).child_of(org.clone());
        let user = Key::with_id("User", 3).child_of(team.clone());

        assert_eq!(user.root(), &org);
        assert!(user.has_ancestor(&team));
        assert!(user.has_ancestor(&org));
        assert!(user.has_ancestor(&user));
        assert!(!team.has_ancestor(&user));
    }

    #[test]
    fn test_completed_with_keeps_parent() {
        let parent = Key::with_id("Folder", 1);
        let key = Key::incomplete("File").child_of(parent.clone());
        let done = key.completed_with(42);

        assert!(done.is_complete());
        assert_eq!(done.id(), Some(42));
        assert_eq!(done.parent(), Some(&parent));
    }

    #[test]
    fn test_with_replaced_ancestor() {
        let provisional = Key::incomplete("Folder");
        let file = Key::with_name("File", "a").child_of(provisional.clone());
        let allocated = Key::with_id("Folder", 9);

        let rewritten = file.with_replaced_ancestor(&provisional, &allocated).unwrap();
        assert_eq!(rewritten.parent(), Some(&allocated));
        assert_eq!(rewritten.name(), Some("a"));

        let unrelated = Key::with_id("Folder", 1);
        assert!(file.with_replaced_ancestor(&unrelated, &allocated).is_none());
    }

    #[test]
    fn test_with_parent() {
        let key = Key::with_id("File", 1).child_of(Key::with_id("Folder", 1));
        let moved = key.with_parent(Some(Key::with_id("Folder", 2)));
        assert_eq!(moved.parent(), Some(&Key::with_id("Folder", 2)));
        assert_eq!(moved.with_parent(None).parent(), None);
    }

    #[test]
    fn test_ordering_groups_children_under_parent() {
        let parent = Key::with_id("Folder", 1);
        let a = Key::with_id("File", 1).child_of(parent.clone());
        let b = Key::with_id("File", 2).child_of(parent);
        assert!(a < b);
        assert!(Key::with_id("A", 5) < Key::with_name("A", "x"));
    }

    #[test]
    fn test_key_range() {
        let range = KeyRange {
            kind: "User".to_string(),
            parent: None,
            start: 10,
            end: 12,
        };
        assert_eq!(range.len(), 3);
        let keys: Vec<Key> = range.keys().collect();
        assert_eq!(keys[0], Key::with_id("User", 10));
        assert_eq!(keys[2], Key::with_id("User", 12));

        let empty = KeyRange {
            kind: "User".to_string(),
            parent: None,
            start: 5,
            end: 4,
        };
        assert!(empty.is_empty());
    }

    #[test]
    fn test_key_serde_roundtrip_json() {
        let key = Key::with_name("File", "a").child_of(Key::with_id("Folder", 1));
        let json = serde_json::to_string(&key).unwrap();
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }

    fn chain(ids: &[i64]) -> Key {
        let mut key = Key::incomplete("Root");
        for (depth, &id) in ids.iter().enumerate() {
            key = Key::with_id(format!("Level{depth}"), id).child_of(key);
        }
        key
    }

    fn depth(key: &Key) -> usize {
        1 + key.parent().map_or(0, depth)
    }

    proptest::proptest! {
        #[test]
        fn prop_replacing_root_keeps_shape(
            ids in proptest::collection::vec(1i64..1000, 1..6),
            new_id in 1i64..1000,
        ) {
            let key = chain(&ids);
            let old_root = key.root().clone();
            let new_root = Key::with_id("Root", new_id);

            let rewritten = key.with_replaced_ancestor(&old_root, &new_root).unwrap();
            proptest::prop_assert_eq!(rewritten.root(), &new_root);
            proptest::prop_assert!(!rewritten.has_ancestor(&old_root));
            proptest::prop_assert_eq!(depth(&rewritten), depth(&key));
            proptest::prop_assert_eq!(rewritten.id(), key.id());
            proptest::prop_assert_eq!(rewritten.kind(), key.kind());
        }
    }
}
