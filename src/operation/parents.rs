//! Labeled parent references
//!
//! A [`ParentSet`] maps each parent label to an ordered list of node ids. On
//! the wire it is flattened into `{ids, meta}`: `ids` is the concatenation
//! of every label's list taken in sorted label order, `meta` holds how many
//! ids each label owns. Sorting the labels keeps the wire form identical no
//! matter what order the labels were declared in.
//!
//! Labels are address segment names, so a label can always head a
//! dependency address and is stored exactly as given.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::is_valid_name;
use crate::node::NodeId;

/// Error types for parent set construction and mutation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParentSetError {
    #[error("Parent meta counts {counted} ids but {actual} were given")]
    LengthMismatch { counted: usize, actual: usize },

    #[error("Parent label '{0}' is not a valid name")]
    InvalidLabel(String),

    #[error("Parent label '{0}' is not declared")]
    UnknownLabel(String),
}

/// The persisted form of a [`ParentSet`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentSetWire {
    pub ids: Vec<NodeId>,
    pub meta: BTreeMap<String, usize>,
}

/// Parent ids grouped by label
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ParentSetWire", into = "ParentSetWire")]
pub struct ParentSet {
    parents: BTreeMap<String, Vec<NodeId>>,
    frozen: bool,
}

impl ParentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids under `label`, empty if the label is unknown.
    pub fn get(&self, label: &str) -> &[NodeId] {
        self.parents.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace the ids under `label`. Once frozen, only known labels are
    /// accepted.
    pub fn set(&mut self, label: &str, ids: Vec<NodeId>) -> Result<(), ParentSetError> {
        if !self.parents.contains_key(label) {
            if self.frozen {
                return Err(ParentSetError::UnknownLabel(label.to_string()));
            }
            if !is_valid_name(label) {
                return Err(ParentSetError::InvalidLabel(label.to_string()));
            }
        }
        self.parents.insert(label.to_string(), ids);
        Ok(())
    }

    /// Make sure `label` exists, with no ids if it is new.
    pub fn declare(&mut self, label: &str) -> Result<(), ParentSetError> {
        if self.parents.contains_key(label) {
            return Ok(());
        }
        self.set(label, Vec::new())
    }

    pub fn push(&mut self, label: &str, id: NodeId) -> Result<(), ParentSetError> {
        match self.parents.get_mut(label) {
            Some(ids) => {
                ids.push(id);
                Ok(())
            }
            None => self.set(label, vec![id]),
        }
    }

    /// Drop every reference to `id`. Returns whether anything was removed.
    pub fn remove_id(&mut self, id: NodeId) -> bool {
        let mut removed = false;
        for ids in self.parents.values_mut() {
            let before = ids.len();
            ids.retain(|other| *other != id);
            removed |= ids.len() != before;
        }
        removed
    }

    /// The label owning flat position `position` of the wire `ids` list.
    pub fn label_at(&self, position: usize) -> Option<&str> {
        let mut end = 0;
        for (label, ids) in &self.parents {
            end += ids.len();
            if position < end {
                return Some(label);
            }
        }
        None
    }

    /// Every label under which `id` is referenced.
    pub fn labels_of(&self, id: NodeId) -> Vec<&str> {
        let mut labels: Vec<&str> = self
            .ids()
            .enumerate()
            .filter(|(_, other)| *other == id)
            .filter_map(|(position, _)| self.label_at(position))
            .collect();
        labels.dedup();
        labels
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.parents.keys().map(String::as_str)
    }

    /// Total number of referenced ids across all labels
    pub fn len(&self) -> usize {
        self.parents.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The flat id list, in wire order
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.parents.values().flat_map(|ids| ids.iter().copied())
    }

    pub fn meta(&self) -> BTreeMap<String, usize> {
        self.parents
            .iter()
            .map(|(label, ids)| (label.clone(), ids.len()))
            .collect()
    }

    /// Lock the label set. Per-label lists stay mutable.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn to_wire(&self) -> ParentSetWire {
        ParentSetWire {
            ids: self.ids().collect(),
            meta: self.meta(),
        }
    }

    pub fn from_wire(wire: ParentSetWire) -> Result<Self, ParentSetError> {
        let counted: usize = wire.meta.values().sum();
        if counted != wire.ids.len() {
            return Err(ParentSetError::LengthMismatch {
                counted,
                actual: wire.ids.len(),
            });
        }

        if let Some(label) = wire.meta.keys().find(|label| !is_valid_name(label)) {
            return Err(ParentSetError::InvalidLabel(label.clone()));
        }

        let mut ids = wire.ids.into_iter();
        let parents = wire
            .meta
            .into_iter()
            .map(|(label, count)| (label, ids.by_ref().take(count).collect()))
            .collect();

        Ok(Self {
            parents,
            frozen: false,
        })
    }
}

impl TryFrom<ParentSetWire> for ParentSet {
    type Error = ParentSetError;

    fn try_from(wire: ParentSetWire) -> Result<Self, Self::Error> {
        ParentSet::from_wire(wire)
    }
}

impl From<ParentSet> for ParentSetWire {
    fn from(set: ParentSet) -> Self {
        set.to_wire()
    }
}
