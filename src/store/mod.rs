//! Document storage for the percolation engine
//!
//! The engine only needs a handful of primitives from its store: lookup by
//! id, filtered lookup with an optional projection, insert, whole-document
//! replace, removal, and one atomic find-and-modify. That last primitive is
//! the only synchronisation the engine relies on, so implementations must
//! select, modify and return the document without letting another caller in
//! between.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// A stored document. Every document carries its identity in `id`.
pub type Document = Value;

/// Error types for store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Document {id} already exists in '{collection}'")]
    Duplicate { collection: String, id: Uuid },

    #[error("Document {id} not found in '{collection}'")]
    NotFound { collection: String, id: Uuid },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

/// Selection criteria over documents
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All,
    Id(Uuid),
    /// The value at the dotted path equals the given value. Absent is null.
    Eq(String, Value),
    /// The value at the dotted path is a list containing the given value
    Contains(String, Value),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(path.into(), value.into())
    }

    pub fn contains(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Contains(path.into(), value.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::All => other,
            Filter::And(mut all) => {
                all.push(other);
                Filter::And(all)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Id(id) => document_id(doc).ok() == Some(*id),
            Filter::Eq(path, value) => lookup(doc, path).unwrap_or(&Value::Null) == value,
            Filter::Contains(path, value) => match lookup(doc, path) {
                Some(Value::Array(items)) => items.contains(value),
                _ => false,
            },
            Filter::And(all) => all.iter().all(|f| f.matches(doc)),
        }
    }

    /// Field assignments implied by equality terms, used to seed a document
    /// when an upsert matched nothing.
    pub fn equalities(&self) -> Vec<(String, Value)> {
        match self {
            Filter::Eq(path, value) => vec![(path.clone(), value.clone())],
            Filter::And(all) => all.iter().flat_map(|f| f.equalities()).collect(),
            _ => Vec::new(),
        }
    }
}

/// A set of field assignments applied in order. Paths may be dotted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    assignments: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push((path.into(), value.into()));
        self
    }

    pub fn assignments(&self) -> &[(String, Value)] {
        &self.assignments
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn apply(&self, doc: &mut Document) -> Result<(), StoreError> {
        for (path, value) in &self.assignments {
            assign(doc, path, value.clone())?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Ordered sort keys
#[derive(Clone, Debug, PartialEq)]
pub struct Sort {
    keys: Vec<(String, Direction)>,
}

impl Sort {
    pub fn by(path: impl Into<String>, direction: Direction) -> Self {
        Self {
            keys: vec![(path.into(), direction)],
        }
    }

    pub fn then(mut self, path: impl Into<String>, direction: Direction) -> Self {
        self.keys.push((path.into(), direction));
        self
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (path, direction) in &self.keys {
            let left = lookup(a, path).unwrap_or(&Value::Null);
            let right = lookup(b, path).unwrap_or(&Value::Null);
            let ord = compare_values(left, right);
            let ord = match direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Which copy of the document `atomic_update` hands back
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    Before,
    #[default]
    After,
}

/// Trait for document stores
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document by its identity
    async fn find_one(&self, collection: &str, id: Uuid) -> Result<Option<Document>, StoreError>;

    /// Fetch every matching document, keeping only `projection` fields if given
    async fn find_many(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Insert a new document, failing if its id is taken
    async fn insert(&self, collection: &str, doc: Document) -> Result<(), StoreError>;

    /// Insert or replace a whole document, returning the copy it replaced
    async fn replace(&self, collection: &str, doc: Document) -> Result<Option<Document>, StoreError>;

    /// Replace a document only if it is still stored, returning the copy it
    /// replaced. `None` means nothing was written.
    async fn replace_existing(
        &self,
        collection: &str,
        doc: Document,
    ) -> Result<Option<Document>, StoreError>;

    /// Atomically pick the first match under `sort`, apply `update` to it and
    /// return it. `None` if nothing matched.
    async fn atomic_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        sort: Option<&Sort>,
        returning: ReturnDocument,
    ) -> Result<Option<Document>, StoreError>;

    /// Remove every matching document, returning how many went
    async fn remove(&self, collection: &str, filter: &Filter) -> Result<usize, StoreError>;
}

/// The identity of a stored document
pub fn document_id(doc: &Document) -> Result<Uuid, StoreError> {
    doc.get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| StoreError::InvalidDocument("document has no valid 'id'".to_string()))
}

/// Keep the `id` plus the top-level members named by `fields`.
pub fn project(doc: &Document, fields: &[&str]) -> Document {
    let Value::Object(map) = doc else {
        return doc.clone();
    };
    let keep: Map<String, Value> = map
        .iter()
        .filter(|(k, _)| {
            k.as_str() == "id" || fields.iter().any(|f| f.split('.').next() == Some(k.as_str()))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(keep)
}

fn lookup<'d>(doc: &'d Value, path: &str) -> Option<&'d Value> {
    path.split('.').try_fold(doc, |value, key| value.get(key))
}

fn assign(doc: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    let mut keys = path.split('.').peekable();
    let mut cursor = doc;
    while let Some(key) = keys.next() {
        if cursor.is_null() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return Err(StoreError::InvalidDocument(format!(
                "cannot assign '{}': '{}' is not an object",
                path, key
            )));
        };
        if keys.peek().is_none() {
            map.insert(key.to_string(), value);
            return Ok(());
        }
        cursor = map.entry(key.to_string()).or_insert(Value::Null);
    }
    Ok(())
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by type first, then by value.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x.cmp(&y)
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x.cmp(&y)
            } else {
                let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
