//! The storage-facing layer
//!
//! Every write that can affect an operation goes through [`Engine`]: saving
//! or destroying a node always runs propagation afterwards, and operation
//! records are only ever written with the minimal set of fields the caller
//! means to change.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::{PercolatorError, Result};
use crate::node::{Node, NodeId};
use crate::operation::{
    ComputeContext, Operation, OperationId, OperationRecord, OperationState, Transition,
    OBSERVED_LABEL,
};
use crate::propagation::{PropagateOptions, PropagationCoordinator, PropagationReport};
use crate::registry::Registry;
use crate::store::{Direction, Document, DocumentStore, Filter, ReturnDocument, Sort, Update};

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn DocumentStore>,
    registry: Arc<Registry>,
    config: Arc<EngineConfig>,
    propagation: PropagationCoordinator,
}

impl Engine {
    pub fn new(store: Arc<dyn DocumentStore>, registry: Registry, config: EngineConfig) -> Self {
        let registry = Arc::new(registry);
        let config = Arc::new(config);
        let propagation =
            PropagationCoordinator::new(store.clone(), registry.clone(), config.clone());
        Self {
            store,
            registry,
            config,
            propagation,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn nodes(&self) -> &str {
        &self.config.nodes_collection
    }

    fn operations(&self) -> &str {
        &self.config.operations_collection
    }

    // ---- Nodes ----

    /// Write `node` and propagate the change.
    pub async fn save_node(&self, node: &mut Node) -> Result<PropagationReport> {
        self.save_node_with(node, PropagateOptions::default()).await
    }

    /// Write `node` and propagate with explicit options.
    pub async fn save_node_with(
        &self,
        node: &mut Node,
        opts: PropagateOptions,
    ) -> Result<PropagationReport> {
        stamp(node);
        let doc = node.to_document()?;
        let previous = self.store.replace(self.nodes(), doc.clone()).await?;
        self.after_write(node, doc, previous, opts).await
    }

    /// Write back a node that must still be stored. `None` if it has been
    /// destroyed since it was read; nothing is written then.
    async fn update_node(&self, node: &mut Node) -> Result<Option<PropagationReport>> {
        stamp(node);
        let doc = node.to_document()?;
        match self.store.replace_existing(self.nodes(), doc.clone()).await? {
            Some(previous) => Ok(Some(
                self.after_write(node, doc, Some(previous), PropagateOptions::default())
                    .await?,
            )),
            None => Ok(None),
        }
    }

    async fn after_write(
        &self,
        node: &mut Node,
        doc: Document,
        previous: Option<Document>,
        opts: PropagateOptions,
    ) -> Result<PropagationReport> {
        let first_write = previous.is_none();
        node.mark_persisted();

        if first_write {
            self.on_first_write(node).await?;
        }

        let diff = PropagationCoordinator::diff_for(doc, previous, &opts);
        self.propagation.on_write(node, &diff, opts.force).await
    }

    /// Propagate `node` as it stands without writing it, diffing against
    /// the stored copy unless a baseline is given.
    pub async fn propagate(&self, node: &Node, opts: PropagateOptions) -> Result<PropagationReport> {
        let previous = self.store.find_one(self.nodes(), node.id).await?;
        let diff = PropagationCoordinator::diff_for(node.to_document()?, previous, &opts);
        self.propagation.on_write(node, &diff, opts.force).await
    }

    async fn on_first_write(&self, node: &Node) -> Result<()> {
        let naive = Filter::eq("node_ref", node.id.to_string())
            .and(Filter::eq("state", OperationState::Naive.as_str()));
        let mature = Update::new().set("state", OperationState::Available.as_str());
        let mut matured = 0;
        while self
            .store
            .atomic_update(self.operations(), &naive, &mature, None, ReturnDocument::After)
            .await?
            .is_some()
        {
            matured += 1;
        }
        if matured > 0 {
            log::debug!("Matured {} operations owned by {}", matured, node.id);
        }

        for spec in self.registry.observers_of(&node.kind) {
            let mut op = Operation::new(spec.clone(), None, self.config.default_priority);
            op.set_parent(OBSERVED_LABEL, Some(node))?;
            op.transition(Transition::Mature)?;
            self.store
                .insert(self.operations(), op.record().to_document()?)
                .await?;
            log::debug!("Spawned observer '{}' for {} {}", spec.name(), node.kind, node.id);
        }
        Ok(())
    }

    pub async fn find_node(&self, id: NodeId) -> Result<Option<Node>> {
        match self.store.find_one(self.nodes(), id).await? {
            Some(doc) => Ok(Some(Node::load(doc)?)),
            None => Ok(None),
        }
    }

    /// Nodes of `kind` matching `filter`
    pub async fn find_nodes(&self, kind: &str, filter: Filter) -> Result<Vec<Node>> {
        let filter = Filter::eq("kind", kind).and(filter);
        self.store
            .find_many(self.nodes(), &filter, None)
            .await?
            .into_iter()
            .map(Node::load)
            .collect()
    }

    /// Replace `node` with its stored copy.
    pub async fn reload_node(&self, node: &mut Node) -> Result<()> {
        *node = self
            .find_node(node.id)
            .await?
            .ok_or_else(|| PercolatorError::MissingData(format!("node {} not found", node.id)))?;
        Ok(())
    }

    /// Remove a node together with the operations it owns, then detach it
    /// from everything that referenced it.
    pub async fn destroy_node(&self, id: NodeId) -> Result<PropagationReport> {
        let removed = self.store.remove(self.nodes(), &Filter::Id(id)).await?;
        if removed == 0 {
            return Err(PercolatorError::MissingData(format!("node {} not found", id)));
        }

        let owned = self
            .store
            .remove(self.operations(), &Filter::eq("node_ref", id.to_string()))
            .await?;
        if owned > 0 {
            log::debug!("Removed {} operations owned by {}", owned, id);
        }

        self.propagation.on_destroy(id).await
    }

    /// Apply `update` to the first node of `kind` matching `filter` and
    /// propagate against its prior state, or create the node if none matches.
    pub async fn upsert(&self, kind: &str, filter: Filter, update: Update) -> Result<Node> {
        let scoped = Filter::eq("kind", kind).and(filter.clone());
        let stamped = update.clone().set("updated_at", Value::String(Utc::now().to_rfc3339()));

        if let Some(node) = self.update_matching(&scoped, &stamped, false).await? {
            return Ok(node);
        }

        let mut doc = Node::new(kind).to_document()?;
        let seed = filter
            .equalities()
            .into_iter()
            .chain(update.assignments().iter().cloned())
            .fold(Update::new(), |acc, (path, value)| acc.set(path, value));
        seed.apply(&mut doc)?;
        let mut node = Node::from_document(doc)?;

        // Another writer may have created a match since the first attempt.
        if let Some(node) = self.update_matching(&scoped, &stamped, true).await? {
            return Ok(node);
        }

        self.save_node(&mut node).await?;
        Ok(node)
    }

    async fn update_matching(
        &self,
        filter: &Filter,
        update: &Update,
        force: bool,
    ) -> Result<Option<Node>> {
        let Some(before) = self
            .store
            .atomic_update(self.nodes(), filter, update, None, ReturnDocument::Before)
            .await?
        else {
            return Ok(None);
        };

        let mut after = before.clone();
        update.apply(&mut after)?;
        let node = Node::load(after.clone())?;
        let opts = PropagateOptions {
            force,
            against: Some(before),
        };
        let diff = PropagationCoordinator::diff_for(after, None, &opts);
        self.propagation.on_write(&node, &diff, force).await?;
        Ok(Some(node))
    }

    // ---- Operations ----

    /// A new, unsaved operation of type `name` owned by `owner`.
    pub fn new_operation(&self, name: &str, owner: Option<&Node>) -> Result<Operation> {
        let spec = self.registry.operation(name)?.clone();
        match (spec.owner_kind(), owner) {
            (Some(kind), Some(node)) if kind != node.kind => {
                return Err(PercolatorError::Composition(format!(
                    "'{}' belongs to '{}' nodes, not '{}'",
                    name, kind, node.kind
                )));
            }
            (Some(kind), None) => {
                return Err(PercolatorError::Composition(format!(
                    "'{}' needs an owning '{}' node",
                    name, kind
                )));
            }
            _ => {}
        }
        Ok(Operation::new(
            spec,
            owner.map(|node| node.id),
            self.config.default_priority,
        ))
    }

    /// Persist a new operation. It becomes available straight away if it
    /// has no owner or its owner has already been written.
    pub async fn create_operation(&self, op: &mut Operation) -> Result<()> {
        if op.is_persisted() {
            return Err(PercolatorError::State(format!(
                "operation {} is already persisted",
                op.id()
            )));
        }

        let ready = match op.node_ref() {
            None => true,
            Some(owner) => {
                let existing = Filter::eq("node_ref", owner.to_string())
                    .and(Filter::eq("kind", op.kind()));
                if !self
                    .store
                    .find_many(self.operations(), &existing, Some(&["kind"][..]))
                    .await?
                    .is_empty()
                {
                    return Err(PercolatorError::Collision(format!(
                        "node {} already has a '{}' operation",
                        owner,
                        op.kind()
                    )));
                }
                self.store.find_one(self.nodes(), owner).await?.is_some()
            }
        };

        if ready && op.state() == OperationState::Naive {
            op.transition(Transition::Mature)?;
        }
        self.store
            .insert(self.operations(), op.record().to_document()?)
            .await?;
        op.mark_persisted();
        Ok(())
    }

    /// Write changes to an operation's parents or priority. A changed set of
    /// parents marks the operation stale.
    pub async fn save_operation(&self, op: &mut Operation) -> Result<()> {
        if !op.is_persisted() {
            return self.create_operation(op).await;
        }

        let stored = self
            .store
            .find_one(self.operations(), op.id())
            .await?
            .ok_or_else(|| PercolatorError::MissingData(format!("operation {} not found", op.id())))?;
        let stored = OperationRecord::from_document(stored)?;

        let mut update = Update::new().set("priority", op.priority());
        if stored.parents.to_wire() != op.parents().to_wire() {
            update = update
                .set("parents", serde_json::to_value(op.parents())?)
                .set("stale", true);
            op.clear_parent_cache();
        }

        let written = self
            .store
            .atomic_update(
                self.operations(),
                &Filter::Id(op.id()),
                &update,
                None,
                ReturnDocument::After,
            )
            .await?
            .ok_or_else(|| PercolatorError::MissingData(format!("operation {} not found", op.id())))?;
        op.refresh(OperationRecord::from_document(written)?)?;
        Ok(())
    }

    pub async fn find_operation(&self, id: OperationId) -> Result<Option<Operation>> {
        match self.store.find_one(self.operations(), id).await? {
            Some(doc) => Ok(Some(self.registry.hydrate(OperationRecord::from_document(doc)?)?)),
            None => Ok(None),
        }
    }

    /// Re-read an operation's stored record.
    pub async fn reload_operation(&self, op: &mut Operation) -> Result<()> {
        let doc = self
            .store
            .find_one(self.operations(), op.id())
            .await?
            .ok_or_else(|| PercolatorError::MissingData(format!("operation {} not found", op.id())))?;
        op.refresh(OperationRecord::from_document(doc)?)?;
        Ok(())
    }

    /// Operations owned by `node`
    pub async fn operations_for_node(&self, node: NodeId) -> Result<Vec<Operation>> {
        self.find_operations(Filter::eq("node_ref", node.to_string()))
            .await
    }

    pub async fn find_operations(&self, filter: Filter) -> Result<Vec<Operation>> {
        self.store
            .find_many(self.operations(), &filter, None)
            .await?
            .into_iter()
            .map(|doc| self.registry.hydrate(OperationRecord::from_document(doc)?))
            .collect()
    }

    /// Operations that still need work, whatever their state
    pub async fn count_stale(&self) -> Result<usize> {
        Ok(self
            .store
            .find_many(self.operations(), &Filter::eq("stale", true), Some(&["stale"][..]))
            .await?
            .len())
    }

    /// Move an operation out of `error`, keeping its staleness.
    pub async fn revive(&self, id: OperationId) -> Result<()> {
        let revived = self
            .store
            .atomic_update(
                self.operations(),
                &Filter::Id(id).and(Filter::eq("state", OperationState::Error.as_str())),
                &Update::new().set("state", OperationState::Available.as_str()),
                None,
                ReturnDocument::After,
            )
            .await?;
        if revived.is_some() {
            log::info!("Revived operation {}", id);
            return Ok(());
        }
        let state = self.stored_state(id).await?;
        state.apply(Transition::Revive).map(|_| ())
    }

    async fn stored_state(&self, id: OperationId) -> Result<OperationState> {
        let doc = self
            .store
            .find_one(self.operations(), id)
            .await?
            .ok_or_else(|| PercolatorError::MissingData(format!("operation {} not found", id)))?;
        Ok(OperationRecord::from_document(doc)?.state)
    }

    /// Claim a specific operation and run it, stale or not.
    pub async fn perform(&self, id: OperationId) -> Result<()> {
        let claimed = self
            .store
            .atomic_update(
                self.operations(),
                &Filter::Id(id).and(Filter::eq("state", OperationState::Available.as_str())),
                &claim_update(),
                None,
                ReturnDocument::After,
            )
            .await?;
        match claimed {
            Some(doc) => self.run_claimed(doc).await.map(|_| ()),
            None => {
                let state = self.stored_state(id).await?;
                state.apply(Transition::Acquire).map(|_| ())
            }
        }
    }

    /// Run an operation this worker has just claimed. On failure the
    /// operation is choked before the error is returned.
    pub(crate) async fn run_claimed(&self, doc: Document) -> Result<OperationId> {
        let record = OperationRecord::from_document(doc)?;
        let id = record.id;
        log::debug!("Claimed operation {} ({})", id, record.kind);

        match self.execute(record).await {
            Ok(()) => {
                log::debug!("Performed operation {}", id);
                Ok(id)
            }
            Err(err) => {
                log::warn!("Operation {} failed: {}", id, err);
                if let Err(choke_err) = self.choke(id).await {
                    log::warn!("Could not mark operation {} as failed: {}", id, choke_err);
                }
                Err(err)
            }
        }
    }

    async fn execute(&self, record: OperationRecord) -> Result<()> {
        let mut op = self.registry.hydrate(record)?;
        let inputs = op.gather(self.store.as_ref(), self.nodes()).await?;

        let owner = match op.node_ref() {
            Some(id) => Some(self.find_node(id).await?.ok_or_else(|| {
                PercolatorError::MissingData(format!("owner {} of operation {} not found", id, op.id()))
            })?),
            None => None,
        };
        let loaded = owner.as_ref().map(|node| node.fields.clone());

        let mut ctx = ComputeContext::new(op.id(), inputs, owner);
        (op.spec().compute_fn())(&mut ctx).map_err(|cause| PercolatorError::Compute {
            operation: op.id(),
            cause,
        })?;

        let (owner, created) = ctx.into_parts();
        if let Some(mut node) = owner {
            let changed = loaded.as_ref() != Some(&node.fields);
            if changed && self.update_node(&mut node).await?.is_none() {
                log::debug!(
                    "Owner {} of operation {} was destroyed while it ran",
                    node.id,
                    op.id()
                );
            }
        }
        for mut node in created {
            self.save_node(&mut node).await?;
        }

        if op.spec().is_one_shot() {
            self.store
                .remove(self.operations(), &Filter::Id(op.id()))
                .await?;
            return Ok(());
        }
        self.release(op.id()).await
    }

    async fn release(&self, id: OperationId) -> Result<()> {
        let released = self
            .store
            .atomic_update(
                self.operations(),
                &Filter::Id(id).and(Filter::eq("state", OperationState::Held.as_str())),
                &Update::new().set("state", OperationState::Available.as_str()),
                None,
                ReturnDocument::After,
            )
            .await?;
        if released.is_none() {
            log::debug!("Operation {} vanished while held", id);
        }
        Ok(())
    }

    async fn choke(&self, id: OperationId) -> Result<()> {
        self.store
            .atomic_update(
                self.operations(),
                &Filter::Id(id).and(Filter::eq("state", OperationState::Held.as_str())),
                &Update::new()
                    .set("state", OperationState::Error.as_str())
                    .set("stale", true),
                None,
                ReturnDocument::After,
            )
            .await?;
        Ok(())
    }

    /// Claim the most urgent stale, available operation, if there is one.
    pub(crate) async fn claim_next(&self) -> Result<Option<Document>> {
        let eligible = Filter::eq("state", OperationState::Available.as_str())
            .and(Filter::eq("stale", true));
        let order = Sort::by("priority", Direction::Ascending)
            .then("insertion_token", Direction::Ascending);
        Ok(self
            .store
            .atomic_update(
                self.operations(),
                &eligible,
                &claim_update(),
                Some(&order),
                ReturnDocument::After,
            )
            .await?)
    }
}

/// Bump timestamps and version ahead of a write.
fn stamp(node: &mut Node) {
    let now = Utc::now();
    node.created_at.get_or_insert(now);
    node.updated_at = Some(now);
    if let Some(version) = node.version.as_mut() {
        *version += 1;
    }
}

fn claim_update() -> Update {
    Update::new()
        .set("state", OperationState::Held.as_str())
        .set("stale", false)
}
