//! Operations: the units of recomputation
//!
//! An [`Operation`] pairs a persisted [`OperationRecord`] with the immutable
//! [`OperationSpec`] of its type. The record is what lives in the store:
//! parents, staleness, lifecycle state, priority and an insertion token used
//! to break priority ties in FIFO order.

mod context;
mod descriptor;
mod parents;
mod state;

pub use context::{ComputeContext, Inputs};
pub use descriptor::{
    Cardinality, ComputeFn, OperationBuilder, OperationSpec, ParentSpec, OBSERVED_LABEL,
};
pub use parents::{ParentSet, ParentSetError, ParentSetWire};
pub use state::{OperationState, Transition};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::address::{fetch_address, Diff, FetchOptions};
use crate::error::{PercolatorError, Result};
use crate::node::{Node, NodeId};
use crate::store::DocumentStore;

/// Unique identifier for an operation
pub type OperationId = Uuid;

static LAST_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Monotonic tiebreaker between operations of equal priority
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InsertionToken(u64);

impl InsertionToken {
    /// Microseconds since the epoch, bumped past the last token handed out in
    /// this process.
    pub fn next() -> Self {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let bump = |last: u64| now.max(last + 1);
        let last = LAST_TOKEN
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(bump(last)))
            .unwrap_or_else(|last| last);
        Self(bump(last))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// The stored shape of an operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    /// Name of the operation type
    pub kind: String,
    #[serde(default)]
    pub node_ref: Option<NodeId>,
    pub parents: ParentSet,
    pub stale: bool,
    pub state: OperationState,
    pub priority: i64,
    pub insertion_token: InsertionToken,
}

impl OperationRecord {
    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_document(doc: Value) -> Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }
}

struct ParentCache {
    ids: Vec<NodeId>,
    docs: HashMap<NodeId, Value>,
}

/// An operation instance together with its type
pub struct Operation {
    record: OperationRecord,
    spec: Arc<OperationSpec>,
    persisted: bool,
    parent_cache: Option<ParentCache>,
}

impl Operation {
    /// A fresh, unpersisted instance: naive and stale.
    pub fn new(spec: Arc<OperationSpec>, node_ref: Option<NodeId>, default_priority: i64) -> Self {
        let record = OperationRecord {
            id: Uuid::new_v4(),
            kind: spec.name().to_string(),
            node_ref,
            parents: spec.empty_parent_set(),
            stale: true,
            state: OperationState::Naive,
            priority: spec.priority().unwrap_or(default_priority),
            insertion_token: InsertionToken::next(),
        };
        Self {
            record,
            spec,
            persisted: false,
            parent_cache: None,
        }
    }

    /// Rehydrate a stored record. Every stored label must be declared.
    pub fn from_record(mut record: OperationRecord, spec: Arc<OperationSpec>) -> Result<Self> {
        if record.kind != spec.name() {
            return Err(PercolatorError::TypeMismatch(format!(
                "record of '{}' loaded as '{}'",
                record.kind,
                spec.name()
            )));
        }
        if let Some(label) = record.parents.labels().find(|l| spec.parent(l).is_none()) {
            return Err(PercolatorError::Composition(format!(
                "stored operation {} references undeclared label '{}'",
                record.id, label
            )));
        }
        for parent in spec.parents() {
            record.parents.declare(&parent.label)?;
        }
        record.parents.freeze();

        Ok(Self {
            record,
            spec,
            persisted: true,
            parent_cache: None,
        })
    }

    pub fn id(&self) -> OperationId {
        self.record.id
    }

    pub fn kind(&self) -> &str {
        &self.record.kind
    }

    pub fn node_ref(&self) -> Option<NodeId> {
        self.record.node_ref
    }

    pub fn state(&self) -> OperationState {
        self.record.state
    }

    pub fn is_stale(&self) -> bool {
        self.record.stale
    }

    pub fn priority(&self) -> i64 {
        self.record.priority
    }

    pub fn insertion_token(&self) -> InsertionToken {
        self.record.insertion_token
    }

    pub fn parents(&self) -> &ParentSet {
        &self.record.parents
    }

    pub fn spec(&self) -> &Arc<OperationSpec> {
        &self.spec
    }

    pub fn record(&self) -> &OperationRecord {
        &self.record
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    /// Take on a newer stored record of this same operation.
    pub(crate) fn refresh(&mut self, record: OperationRecord) -> Result<()> {
        let fresh = Operation::from_record(record, self.spec.clone())?;
        if fresh.record.parents.to_wire() != self.record.parents.to_wire() {
            self.parent_cache = None;
        }
        self.record = fresh.record;
        self.persisted = true;
        Ok(())
    }

    pub fn set_priority(&mut self, priority: i64) {
        self.record.priority = priority;
    }

    pub fn transition(&mut self, transition: Transition) -> Result<()> {
        self.record.state = self.record.state.apply(transition)?;
        Ok(())
    }

    fn parent_spec(&self, label: &str) -> Result<&ParentSpec> {
        self.spec.parent(label).ok_or_else(|| {
            PercolatorError::Composition(format!(
                "'{}' has no parent label '{}'",
                self.spec.name(),
                label
            ))
        })
    }

    fn check_kind(&self, spec: &ParentSpec, node: &Node) -> Result<()> {
        if spec.accepts(&node.kind) {
            Ok(())
        } else {
            Err(PercolatorError::Composition(format!(
                "label '{}' of '{}' takes '{}' nodes, got '{}'",
                spec.label,
                self.spec.name(),
                spec.kind.as_deref().unwrap_or("any"),
                node.kind
            )))
        }
    }

    /// Ids currently under `label`
    pub fn parent_ids(&self, label: &str) -> Result<&[NodeId]> {
        self.parent_spec(label)?;
        Ok(self.record.parents.get(label))
    }

    /// Point a singular label at `node`, or clear it with `None`.
    pub fn set_parent(&mut self, label: &str, node: Option<&Node>) -> Result<()> {
        let spec = self.parent_spec(label)?.clone();
        if spec.is_plural() {
            return Err(PercolatorError::Composition(format!(
                "label '{}' is plural; use set_parents",
                label
            )));
        }
        if let Some(node) = node {
            self.check_kind(&spec, node)?;
        }
        let ids = node.map(|n| vec![n.id]).unwrap_or_default();
        self.record.parents.set(label, ids)?;
        Ok(())
    }

    /// Replace every parent under a plural label.
    pub fn set_parents(&mut self, label: &str, nodes: &[&Node]) -> Result<()> {
        let spec = self.parent_spec(label)?.clone();
        if !spec.is_plural() {
            return Err(PercolatorError::Composition(format!(
                "label '{}' is singular; use set_parent",
                label
            )));
        }
        for node in nodes {
            self.check_kind(&spec, node)?;
        }
        self.record
            .parents
            .set(label, nodes.iter().map(|n| n.id).collect())?;
        Ok(())
    }

    /// Append one parent to a plural label.
    pub fn push_parent(&mut self, label: &str, node: &Node) -> Result<()> {
        let spec = self.parent_spec(label)?.clone();
        if !spec.is_plural() {
            return Err(PercolatorError::Composition(format!(
                "label '{}' is singular; use set_parent",
                label
            )));
        }
        self.check_kind(&spec, node)?;
        self.record.parents.push(label, node.id)?;
        Ok(())
    }

    /// Set raw ids under `label`. Kinds are checked when the parents are
    /// gathered instead.
    pub fn set_parent_ids(&mut self, label: &str, ids: Vec<NodeId>) -> Result<()> {
        let spec = self.parent_spec(label)?;
        if !spec.is_plural() && ids.len() > 1 {
            return Err(PercolatorError::Composition(format!(
                "label '{}' is singular but was given {} ids",
                label,
                ids.len()
            )));
        }
        self.record.parents.set(label, ids)?;
        Ok(())
    }

    /// Dependencies of this instance that changed on `parent_id`, across
    /// every label it is referenced under.
    pub fn relevant_changes(&self, parent_id: NodeId, diff: &Diff) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for label in self.record.parents.labels_of(parent_id) {
            changed.extend(self.spec.relevant_changes(label, parent_id, diff)?);
        }
        Ok(changed)
    }

    /// Forget cached parent documents so the next gather reads them again.
    pub fn clear_parent_cache(&mut self) {
        self.parent_cache = None;
    }

    /// Resolve every dependency against the materialised parents.
    ///
    /// Parent documents are fetched once and reused while the parent ids
    /// stay the same.
    pub async fn gather(&mut self, store: &dyn DocumentStore, collection: &str) -> Result<Inputs> {
        let ids: Vec<NodeId> = self.record.parents.ids().collect();
        let fresh = matches!(&self.parent_cache, Some(cache) if cache.ids == ids);
        if !fresh {
            let mut docs = HashMap::with_capacity(ids.len());
            for id in &ids {
                if docs.contains_key(id) {
                    continue;
                }
                let doc = store.find_one(collection, *id).await?.ok_or_else(|| {
                    PercolatorError::MissingData(format!(
                        "parent {} of operation {} not found",
                        id,
                        self.record.id
                    ))
                })?;
                docs.insert(*id, doc);
            }
            self.parent_cache = Some(ParentCache { ids, docs });
        }

        let Some(cache) = &self.parent_cache else {
            return Ok(Inputs::default());
        };

        let mut root = Map::new();
        for spec in self.spec.parents() {
            let mut members = Vec::new();
            for id in self.record.parents.get(&spec.label) {
                let doc = cache.docs.get(id).cloned().unwrap_or(Value::Null);
                let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
                if !spec.accepts(kind) {
                    return Err(PercolatorError::MissingData(format!(
                        "parent {} under '{}' is a '{}', not a '{}'",
                        id,
                        spec.label,
                        kind,
                        spec.kind.as_deref().unwrap_or("any")
                    )));
                }
                members.push(doc);
            }
            let value = if spec.is_plural() {
                Value::Array(members)
            } else {
                members.into_iter().next().unwrap_or(Value::Null)
            };
            root.insert(spec.label.clone(), value);
        }

        let mut inputs = Inputs::default();
        for dep in self.spec.dependencies() {
            let values = fetch_address(dep, &root, FetchOptions::plural())?;
            inputs.insert(dep.to_string(), values);
        }
        Ok(inputs)
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("record", &self.record)
            .field("persisted", &self.persisted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn pets_spec() -> Arc<OperationSpec> {
        Arc::new(
            OperationSpec::builder("pets")
                .parent("parent", "animals")
                .parents("friends", "animals")
                .depends_on("parent.farm")
                .depends_on("parent.wild")
                .depends_on("friends.farm")
                .compute(|_| Ok(()))
                .finalize()
                .unwrap(),
        )
    }

    #[test]
    fn test_insertion_tokens_increase() {
        let mut last = InsertionToken::next();
        for _ in 0..1000 {
            let next = InsertionToken::next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_new_operation_is_naive_and_stale() {
        let op = Operation::new(pets_spec(), None, 7);
        assert_eq!(op.state(), OperationState::Naive);
        assert!(op.is_stale());
        assert_eq!(op.priority(), 7);
        assert!(!op.is_persisted());
        assert!(op.parents().is_frozen());
    }

    #[test]
    fn test_parent_accessors_check_kind_and_cardinality() {
        let mut op = Operation::new(pets_spec(), None, 0);
        let animals = Node::new("animals");
        let stranger = Node::new("vegetables");

        op.set_parent("parent", Some(&animals)).unwrap();
        assert_eq!(op.parent_ids("parent").unwrap(), &[animals.id]);
        assert!(matches!(
            op.set_parent("parent", Some(&stranger)),
            Err(PercolatorError::Composition(_))
        ));
        assert!(op.set_parent("friends", Some(&animals)).is_err());
        assert!(op.push_parent("parent", &animals).is_err());
        assert!(op.parent_ids("nobody").is_err());
        assert!(op.set_parent_ids("parent", vec![animals.id, stranger.id]).is_err());

        op.push_parent("friends", &animals).unwrap();
        op.push_parent("friends", &animals).unwrap();
        assert_eq!(op.parents().len(), 3);

        op.set_parent("parent", None).unwrap();
        assert!(op.parent_ids("parent").unwrap().is_empty());
    }

    #[test]
    fn test_record_round_trip() {
        let mut op = Operation::new(pets_spec(), Some(Uuid::new_v4()), 0);
        op.set_parent("parent", Some(&Node::new("animals"))).unwrap();

        let doc = op.record().to_document().unwrap();
        assert_eq!(doc["state"], json!("naive"));
        assert_eq!(doc["parents"]["meta"]["parent"], json!(1));

        let record = OperationRecord::from_document(doc).unwrap();
        let back = Operation::from_record(record, pets_spec()).unwrap();
        assert_eq!(back.record(), op.record());
        assert!(back.is_persisted());
    }

    #[test]
    fn test_from_record_rejects_undeclared_labels() {
        let mut record = Operation::new(pets_spec(), None, 0).record().clone();
        let mut parents = ParentSet::new();
        parents.set("ghost", vec![Uuid::new_v4()]).unwrap();
        record.parents = parents;
        assert!(matches!(
            Operation::from_record(record, pets_spec()),
            Err(PercolatorError::Composition(_))
        ));
    }

    #[tokio::test]
    async fn test_gather_resolves_dependencies() {
        let store = MemoryStore::new();
        let parent = Node::new("animals")
            .with("farm", json!(["pig"]))
            .with("wild", json!(["sloth"]));
        let friend_a = Node::new("animals").with("farm", json!(["cow"]));
        let friend_b = Node::new("animals").with("farm", json!(["hen"]));
        for node in [&parent, &friend_a, &friend_b] {
            store.insert("nodes", node.to_document().unwrap()).await.unwrap();
        }

        let mut op = Operation::new(pets_spec(), None, 0);
        op.set_parent("parent", Some(&parent)).unwrap();
        op.set_parents("friends", &[&friend_a, &friend_b]).unwrap();

        let inputs = op.gather(&store, "nodes").await.unwrap();
        assert_eq!(inputs.get("parent.farm").unwrap(), &[json!(["pig"])]);
        assert_eq!(
            inputs.get("friends.farm").unwrap(),
            &[json!(["cow"]), json!(["hen"])]
        );
    }

    #[tokio::test]
    async fn test_gather_reports_missing_parent() {
        let store = MemoryStore::new();
        let mut op = Operation::new(pets_spec(), None, 0);
        op.set_parent("parent", Some(&Node::new("animals"))).unwrap();
        assert!(matches!(
            op.gather(&store, "nodes").await,
            Err(PercolatorError::MissingData(_))
        ));
    }

    #[tokio::test]
    async fn test_gather_with_no_parents_resolves_to_null() {
        let store = MemoryStore::new();
        let mut op = Operation::new(pets_spec(), None, 0);
        let inputs = op.gather(&store, "nodes").await.unwrap();
        assert_eq!(inputs.get("parent.farm").unwrap(), &[Value::Null]);
        assert!(inputs.get("friends.farm").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gather_checks_stored_kind() {
        let store = MemoryStore::new();
        let impostor = Node::new("vegetables");
        store.insert("nodes", impostor.to_document().unwrap()).await.unwrap();

        let mut op = Operation::new(pets_spec(), None, 0);
        op.set_parent_ids("parent", vec![impostor.id]).unwrap();
        assert!(matches!(
            op.gather(&store, "nodes").await,
            Err(PercolatorError::MissingData(_))
        ));
    }
}
