//! Nodes: the documents that act as parents and own operations
//!
//! A node is a flat JSON document. Besides its application fields it carries
//! an identity, a kind tag, an optional version counter and two timestamps.
//! The kind tag is what lets a polymorphic parent reference be materialised
//! without knowing the concrete kind up front.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::address::Addressable;
use crate::error::{PercolatorError, Result};

/// Unique identifier for a node
pub type NodeId = Uuid;

/// Field names the node itself owns. They can never be application fields.
pub const RESERVED_FIELDS: &[&str] = &["id", "kind", "version", "created_at", "updated_at"];

/// A document that can be a parent and own operations
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    pub kind: String,

    /// Incremented on every save when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Application fields, stored at the top level of the document. Names in
    /// [`RESERVED_FIELDS`] are refused by [`Node::set`] and [`Node::to_document`].
    #[serde(flatten)]
    pub fields: Map<String, Value>,

    #[serde(skip)]
    persisted: bool,
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            version: None,
            created_at: None,
            updated_at: None,
            fields: Map::new(),
            persisted: false,
        }
    }

    /// Track a version counter for this node.
    pub fn versioned(mut self) -> Self {
        self.version.get_or_insert(0);
        self
    }

    /// Builder-style field assignment
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Deserialize a field, `None` if it is absent or null.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>> {
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    /// Set an application field. Reserved names are ignored.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        if is_reserved(&field) {
            log::warn!("Ignoring write to reserved field '{}' of {} {}", field, self.kind, self.id);
            return;
        }
        self.fields.insert(field, value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Whether this instance was loaded from, or written to, the store.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    pub fn to_document(&self) -> Result<Value> {
        if let Some(field) = self.fields.keys().find(|field| is_reserved(field)) {
            return Err(PercolatorError::Composition(format!(
                "'{}' is a reserved field of {} {}",
                field, self.kind, self.id
            )));
        }
        Ok(serde_json::to_value(self)?)
    }

    /// Build an unpersisted node from a document.
    pub fn from_document(doc: Value) -> Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }

    /// Build a node from a document read out of the store.
    pub(crate) fn load(doc: Value) -> Result<Self> {
        let mut node = Self::from_document(doc)?;
        node.persisted = true;
        Ok(node)
    }
}

fn is_reserved(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

impl Addressable for Node {
    fn member(&self, name: &str) -> Option<Cow<'_, Value>> {
        if let Some(value) = self.fields.get(name) {
            return Some(Cow::Borrowed(value));
        }
        match name {
            "id" => Some(Cow::Owned(Value::String(self.id.to_string()))),
            "kind" => Some(Cow::Owned(Value::String(self.kind.clone()))),
            "version" => self.version.map(|v| Cow::Owned(Value::from(v))),
            _ => None,
        }
    }
}

/// Per-kind declaration of a node type
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSpec {
    pub kind: String,
    /// When non-empty, only changes at these addresses propagate
    pub exports: Vec<String>,
}

impl NodeSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            exports: Vec::new(),
        }
    }

    pub fn export(mut self, addr: impl Into<String>) -> Self {
        self.exports.push(addr.into());
        self
    }
}
