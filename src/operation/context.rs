//! The value handed to a compute step

use std::collections::BTreeMap;

use anyhow::{anyhow, Context as _};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::node::Node;

use super::OperationId;

static NULL: Value = Value::Null;

/// Gathered inputs: each dependency address mapped to every value it resolved to
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Inputs(BTreeMap<String, Vec<Value>>);

impl Inputs {
    pub(crate) fn insert(&mut self, addr: String, values: Vec<Value>) {
        self.0.insert(addr, values);
    }

    pub fn get(&self, addr: &str) -> Option<&[Value]> {
        self.0.get(addr).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Everything a compute step may read or write.
///
/// Inputs come from the operation's gathered dependencies. The owning node
/// is the only existing document a compute step may change; new documents
/// can be queued with [`create`](Self::create).
pub struct ComputeContext {
    operation: OperationId,
    inputs: Inputs,
    node: Option<Node>,
    created: Vec<Node>,
}

impl ComputeContext {
    pub fn new(operation: OperationId, inputs: Inputs, node: Option<Node>) -> Self {
        Self {
            operation,
            inputs,
            node,
            created: Vec::new(),
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation
    }

    /// The first value resolved for `addr`, null if there was none.
    pub fn input(&self, addr: &str) -> &Value {
        self.inputs
            .get(addr)
            .and_then(|values| values.first())
            .unwrap_or(&NULL)
    }

    /// Every value resolved for `addr`, in resolution order.
    pub fn inputs(&self, addr: &str) -> &[Value] {
        self.inputs.get(addr).unwrap_or(&[])
    }

    pub fn input_as<T: DeserializeOwned>(&self, addr: &str) -> anyhow::Result<T> {
        serde_json::from_value(self.input(addr).clone())
            .with_context(|| format!("input '{}' has an unexpected shape", addr))
    }

    /// Every non-null value resolved for `addr`, deserialized.
    pub fn inputs_as<T: DeserializeOwned>(&self, addr: &str) -> anyhow::Result<Vec<T>> {
        self.inputs(addr)
            .iter()
            .filter(|value| !value.is_null())
            .map(|value| {
                serde_json::from_value(value.clone())
                    .with_context(|| format!("input '{}' has an unexpected shape", addr))
            })
            .collect()
    }

    pub fn all_inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn node_mut(&mut self) -> anyhow::Result<&mut Node> {
        let operation = self.operation;
        self.node
            .as_mut()
            .ok_or_else(|| anyhow!("operation {} has no owning node", operation))
    }

    /// Queue a new node to be saved once the compute step succeeds.
    pub fn create(&mut self, node: Node) {
        self.created.push(node);
    }

    pub(crate) fn into_parts(self) -> (Option<Node>, Vec<Node>) {
        (self.node, self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn context() -> ComputeContext {
        let mut inputs = Inputs::default();
        inputs.insert("parent.farm".into(), vec![json!(["pig"])]);
        inputs.insert("terms.value".into(), vec![json!(1), Value::Null, json!(3)]);
        ComputeContext::new(Uuid::new_v4(), inputs, Some(Node::new("animals")))
    }

    #[test]
    fn test_input_lookup() {
        let ctx = context();
        assert_eq!(ctx.input("parent.farm"), &json!(["pig"]));
        assert_eq!(ctx.input("parent.wild"), &Value::Null);
        assert_eq!(ctx.inputs("terms.value").len(), 3);

        let farm: Vec<String> = ctx.input_as("parent.farm").unwrap();
        assert_eq!(farm, vec!["pig"]);
        let terms: Vec<i64> = ctx.inputs_as("terms.value").unwrap();
        assert_eq!(terms, vec![1, 3]);
        let wild: Option<Vec<String>> = ctx.input_as("parent.wild").unwrap();
        assert!(wild.is_none());
    }

    #[test]
    fn test_node_access() {
        let mut ctx = context();
        ctx.node_mut().unwrap().set("pets", json!([]));
        ctx.create(Node::new("log"));
        let (node, created) = ctx.into_parts();
        assert_eq!(node.unwrap().get("pets"), Some(&json!([])));
        assert_eq!(created.len(), 1);

        let mut orphan = ComputeContext::new(Uuid::new_v4(), Inputs::default(), None);
        assert!(orphan.node_mut().is_err());
    }
}
