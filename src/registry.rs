//! Registry of node kinds and operation types
//!
//! Built once at startup and then shared read-only behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PercolatorError, Result};
use crate::node::NodeSpec;
use crate::operation::{Operation, OperationRecord, OperationSpec};

pub struct Registry {
    nodes: HashMap<String, NodeSpec>,
    operations: HashMap<String, Arc<OperationSpec>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            operations: HashMap::new(),
        }
    }

    /// Register a node kind. Kinds that are never registered have no exports.
    pub fn register_node(&mut self, spec: NodeSpec) -> Result<()> {
        if self.nodes.contains_key(&spec.kind) {
            return Err(PercolatorError::Collision(format!(
                "node kind '{}' registered twice",
                spec.kind
            )));
        }
        self.nodes.insert(spec.kind.clone(), spec);
        Ok(())
    }

    /// Register an operation type.
    pub fn register_operation(&mut self, spec: OperationSpec) -> Result<Arc<OperationSpec>> {
        if self.operations.contains_key(spec.name()) {
            return Err(PercolatorError::Collision(format!(
                "operation type '{}' registered twice",
                spec.name()
            )));
        }
        let spec = Arc::new(spec);
        self.operations.insert(spec.name().to_string(), spec.clone());
        Ok(spec)
    }

    pub fn node(&self, kind: &str) -> Option<&NodeSpec> {
        self.nodes.get(kind)
    }

    /// Exported addresses of `kind`, empty when everything propagates.
    pub fn exports(&self, kind: &str) -> &[String] {
        self.nodes
            .get(kind)
            .map(|spec| spec.exports.as_slice())
            .unwrap_or(&[])
    }

    pub fn operation(&self, name: &str) -> Result<&Arc<OperationSpec>> {
        self.operations.get(name).ok_or_else(|| {
            PercolatorError::Composition(format!("unknown operation type '{}'", name))
        })
    }

    /// Operation types spawned when a node of `kind` is first persisted
    pub fn observers_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Arc<OperationSpec>> + 'a {
        self.operations
            .values()
            .filter(move |spec| spec.observes() == Some(kind))
    }

    /// Operation types owned by nodes of `kind`
    pub fn owned_by<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Arc<OperationSpec>> + 'a {
        self.operations
            .values()
            .filter(move |spec| spec.owner_kind() == Some(kind))
    }

    /// Rehydrate a stored record with its registered type.
    pub fn hydrate(&self, record: OperationRecord) -> Result<Operation> {
        let spec = self.operation(&record.kind)?.clone();
        Operation::from_record(record, spec)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> OperationSpec {
        OperationSpec::builder(name)
            .parent("parent", "animals")
            .depends_on("parent.farm")
            .owned_by("owner")
            .compute(|_| Ok(()))
            .finalize()
            .unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        registry
            .register_node(NodeSpec::new("hive").export("bee_census"))
            .unwrap();
        registry.register_operation(spec("pets")).unwrap();

        assert_eq!(registry.exports("hive"), &["bee_census".to_string()]);
        assert!(registry.exports("unknown").is_empty());
        assert_eq!(registry.operation("pets").unwrap().name(), "pets");
        assert!(matches!(
            registry.operation("nope"),
            Err(PercolatorError::Composition(_))
        ));
        assert_eq!(registry.owned_by("owner").count(), 1);
        assert_eq!(registry.observers_of("animals").count(), 0);
    }

    #[test]
    fn test_double_registration_collides() {
        let mut registry = Registry::new();
        registry.register_operation(spec("pets")).unwrap();
        assert!(matches!(
            registry.register_operation(spec("pets")),
            Err(PercolatorError::Collision(_))
        ));

        registry.register_node(NodeSpec::new("hive")).unwrap();
        assert!(matches!(
            registry.register_node(NodeSpec::new("hive")),
            Err(PercolatorError::Collision(_))
        ));
    }
}
