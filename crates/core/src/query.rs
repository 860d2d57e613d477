//! Query model shared by the data access layer and store implementations
//!
//! A `Query` selects entities of one kind, optionally under an ancestor,
//! filtered by property predicates and sorted by property values (key order
//! breaks ties). Paging uses `FetchOptions` with either an offset or an
//! opaque `Cursor` returned by a previous page.

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::types::Key;
use crate::value::Value;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
}

impl FilterOp {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            FilterOp::Equal => ordering == Ordering::Equal,
            FilterOp::NotEqual => ordering != Ordering::Equal,
            FilterOp::LessThan => ordering == Ordering::Less,
            FilterOp::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOp::GreaterThan => ordering == Ordering::Greater,
            FilterOp::GreaterThanOrEqual => ordering != Ordering::Less,
        }
    }
}

/// Property predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Property name
    pub field: String,
    /// Operator
    pub op: FilterOp,
    /// Operand
    pub value: Value,
}

impl Filter {
    /// Equality filter
    pub fn equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Equal, value)
    }

    /// Filter with an explicit operator
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Whether `entity` satisfies this filter
    ///
    /// Unindexed and missing properties never match. Array properties match
    /// when any element does.
    pub fn matches(&self, entity: &Entity) -> bool {
        if !entity.is_indexed(&self.field) {
            return false;
        }
        match entity.property(&self.field) {
            Some(Value::Array(items)) => items.iter().any(|v| self.matches_value(v)),
            Some(v) => self.matches_value(v),
            None => false,
        }
    }

    fn matches_value(&self, candidate: &Value) -> bool {
        candidate
            .compare(&self.value)
            .map_or(false, |ordering| self.op.accepts(ordering))
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    /// Smallest first
    Ascending,
    /// Largest first
    Descending,
}

/// Kind query with optional ancestor, filters and sort orders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Kind to select
    pub kind: String,
    /// Restrict to descendants of this key (inclusive)
    pub ancestor: Option<Key>,
    /// Conjunction of predicates
    pub filters: Vec<Filter>,
    /// Sort orders, applied before key order
    pub sort: Vec<(String, SortDirection)>,
    /// Return keys only
    pub keys_only: bool,
}

impl Query {
    /// Query every entity of `kind`
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ancestor: None,
            filters: Vec::new(),
            sort: Vec::new(),
            keys_only: false,
        }
    }

    /// Add a filter
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add an equality filter
    pub fn filter_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::equal(field, value))
    }

    /// Restrict to descendants of `ancestor`
    pub fn ancestor(mut self, ancestor: Key) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    /// Add a sort order
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    /// Project to keys only
    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    /// Whether `entity` is selected by this query
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.kind() == self.kind
            && self
                .ancestor
                .as_ref()
                .map_or(true, |a| entity.key().has_ancestor(a))
            && self.filters.iter().all(|f| f.matches(entity))
    }

    /// Order two selected entities by the sort orders, then by key
    pub fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        for (field, direction) in &self.sort {
            let ordering = match (a.property(field), b.property(field)) {
                (Some(x), Some(y)) => x.compare(y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.key().cmp(b.key())
    }
}

/// Opaque position in a query's result sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    /// Cursor pointing just past `position` results
    pub fn at(position: u64) -> Self {
        Cursor(URL_SAFE_NO_PAD.encode(position.to_be_bytes()))
    }

    /// Parse a cursor previously rendered with `Display`
    pub fn parse(s: &str) -> Result<Self> {
        let cursor = Cursor(s.to_string());
        cursor.position()?;
        Ok(cursor)
    }

    /// Number of results before this cursor
    pub fn position(&self) -> Result<u64> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|e| Error::invalid_argument(format!("malformed cursor: {e}")))?;
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::invalid_argument("malformed cursor: wrong length"))?;
        Ok(u64::from_be_bytes(array))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Paging options for a query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Maximum number of results
    pub limit: Option<usize>,
    /// Results to skip (ignored when a cursor is given)
    pub offset: usize,
    /// Resume from a previous page
    pub start_cursor: Option<Cursor>,
}

impl FetchOptions {
    /// Options with a limit
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Set the start cursor
    pub fn start_at(mut self, cursor: Option<Cursor>) -> Self {
        self.start_cursor = cursor;
        self
    }

    /// Set the offset
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// One page of query results
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResults {
    /// Matching entities (key-only projections for keys-only queries)
    pub entities: Vec<Entity>,
    /// Cursor after the last returned result
    pub end_cursor: Option<Cursor>,
    /// Whether more results exist beyond this page
    pub more_results: bool,
}

impl QueryResults {
    /// Keys of the returned entities
    pub fn keys(&self) -> Vec<Key> {
        self.entities.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, age: i64) -> Entity {
        let mut e = Entity::new(Key::with_id("User", id));
        e.set_property("age", age);
        e.set_unindexed_property("bio", "hidden");
        e
    }

    #[test]
    fn test_filter_operators() {
        let e = user(1, 30);
        assert!(Filter::equal("age", 30i64).matches(&e));
        assert!(Filter::new("age", FilterOp::GreaterThan, 20i64).matches(&e));
        assert!(Filter::new("age", FilterOp::LessThanOrEqual, 30i64).matches(&e));
        assert!(!Filter::new("age", FilterOp::LessThan, 30i64).matches(&e));
        assert!(Filter::new("age", FilterOp::NotEqual, 31i64).matches(&e));
    }

    #[test]
    fn test_filter_skips_unindexed_and_mismatched_types() {
        let e = user(1, 30);
        assert!(!Filter::equal("bio", "hidden").matches(&e));
        assert!(!Filter::equal("age", "30").matches(&e));
        assert!(!Filter::equal("missing", 1i64).matches(&e));
    }

    #[test]
    fn test_filter_matches_any_array_element() {
        let mut e = Entity::new(Key::with_id("Post", 1));
        e.set_property("tags", vec![Value::from("rust"), Value::from("db")]);
        assert!(Filter::equal("tags", "db").matches(&e));
        assert!(!Filter::equal("tags", "go").matches(&e));
    }

    #[test]
    fn test_query_kind_and_ancestor() {
        let folder = Key::with_id("Folder", 1);
        let file = Entity::new(Key::with_id("File", 2).child_of(folder.clone()));
        let other = Entity::new(Key::with_id("File", 3));

        let q = Query::new("File").ancestor(folder);
        assert!(q.matches(&file));
        assert!(!q.matches(&other));
        assert!(!Query::new("Folder").matches(&file));
    }

    #[test]
    fn test_query_sort_then_key() {
        let q = Query::new("User").order_by("age", SortDirection::Descending);
        let a = user(1, 20);
        let b = user(2, 40);
        let c = user(3, 40);
        assert_eq!(q.compare(&b, &a), Ordering::Less);
        assert_eq!(q.compare(&b, &c), Ordering::Less);
    }

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = Cursor::at(42);
        let parsed = Cursor::parse(&cursor.to_string()).unwrap();
        assert_eq!(parsed.position().unwrap(), 42);
        assert!(Cursor::parse("not a cursor!").is_err());
    }
}
