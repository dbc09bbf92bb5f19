//! Staleness propagation
//!
//! After a node is written, every operation that references it is checked
//! against the write's [`Diff`]. Operations whose dependencies on that node
//! changed are flagged stale with a single-field atomic update, so a worker
//! currently holding the operation keeps its state and simply finds the
//! operation stale again when it releases.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::address::Diff;
use crate::config::EngineConfig;
use crate::error::{PercolatorError, Result};
use crate::node::{Node, NodeId};
use crate::operation::{OperationId, ParentSet, OBSERVED_LABEL};
use crate::registry::Registry;
use crate::store::{DocumentStore, Filter, ReturnDocument, Update};

/// How a write should propagate
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropagateOptions {
    /// Mark every referencing operation stale regardless of the diff
    pub force: bool,
    /// Diff against this document instead of the stored copy
    pub against: Option<Value>,
}

impl PropagateOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            against: None,
        }
    }

    pub fn against(baseline: Value) -> Self {
        Self {
            force: false,
            against: Some(baseline),
        }
    }
}

/// What a propagation pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Operations referencing the node
    pub examined: usize,
    /// Operations flipped from fresh to stale
    pub marked_stale: usize,
    /// Operations removed because the node they observed is gone
    pub removed: usize,
    /// The export whitelist showed nothing relevant changed
    pub skipped_by_exports: bool,
    /// Operations whose dependencies could not be resolved against the
    /// write, marked stale without a diff
    pub unresolved: usize,
}

/// Just enough of an operation record to decide whether it is affected
#[derive(Debug, Deserialize)]
struct OperationRef {
    id: OperationId,
    kind: String,
    parents: ParentSet,
}

const REF_PROJECTION: &[&str] = &["kind", "parents"];

#[derive(Clone)]
pub struct PropagationCoordinator {
    store: Arc<dyn DocumentStore>,
    registry: Arc<Registry>,
    config: Arc<EngineConfig>,
}

impl PropagationCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<Registry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// The diff a write of `live` should propagate, given the copy it
    /// replaced and any caller-supplied baseline.
    pub fn diff_for(live: Value, previous: Option<Value>, opts: &PropagateOptions) -> Diff {
        match (&opts.against, previous) {
            (Some(baseline), _) => Diff::between(live, baseline.clone()),
            (None, Some(previous)) => Diff::between(live, previous),
            (None, None) => Diff::unpersisted(live),
        }
    }

    async fn referencing(&self, id: NodeId) -> Result<Vec<OperationRef>> {
        let docs = self
            .store
            .find_many(
                &self.config.operations_collection,
                &Filter::contains("parents.ids", id.to_string()),
                Some(REF_PROJECTION),
            )
            .await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(PercolatorError::from))
            .collect()
    }

    /// Propagate a write of `node` described by `diff`.
    pub async fn on_write(&self, node: &Node, diff: &Diff, force: bool) -> Result<PropagationReport> {
        let mut report = PropagationReport::default();

        let exports = self.registry.exports(&node.kind);
        let exported_changed = || match diff.any_changed(exports) {
            Ok(changed) => changed,
            Err(err) => {
                log::warn!("Could not diff exports of {} {}: {}", node.kind, node.id, err);
                true
            }
        };
        if !force && !exports.is_empty() && !exported_changed() {
            log::debug!("No exported field of {} {} changed", node.kind, node.id);
            report.skipped_by_exports = true;
            return Ok(report);
        }

        let candidates = self.referencing(node.id).await?;
        report.examined = candidates.len();

        // Answers shared by every instance of a type, per label
        let mut relevant: HashMap<(String, String), bool> = HashMap::new();

        for candidate in candidates {
            let affected = if force {
                true
            } else {
                let Ok(spec) = self.registry.operation(&candidate.kind) else {
                    log::warn!(
                        "Skipping operation {} of unregistered type '{}'",
                        candidate.id,
                        candidate.kind
                    );
                    continue;
                };

                let mut affected = false;
                for label in candidate.parents.labels_of(node.id) {
                    let key = (candidate.kind.clone(), label.to_string());
                    let cached = if spec.has_indexed_dependency(label) {
                        None
                    } else {
                        relevant.get(&key).copied()
                    };
                    let hit = match cached {
                        Some(hit) => hit,
                        None => match spec.relevant_changes(label, node.id, diff) {
                            Ok(changed) => {
                                let hit = !changed.is_empty();
                                if !spec.has_indexed_dependency(label) {
                                    relevant.insert(key, hit);
                                }
                                hit
                            }
                            // Unresolvable dependencies count as changed.
                            Err(err) => {
                                log::warn!(
                                    "Could not diff dependencies of operation {} on {}: {}",
                                    candidate.id,
                                    node.id,
                                    err
                                );
                                report.unresolved += 1;
                                true
                            }
                        },
                    };
                    if hit {
                        affected = true;
                        break;
                    }
                }
                affected
            };

            if affected && self.mark_stale(candidate.id).await? {
                report.marked_stale += 1;
            }
        }

        if report.marked_stale > 0 {
            log::debug!(
                "Write to {} {} marked {} of {} operations stale",
                node.kind,
                node.id,
                report.marked_stale,
                report.examined
            );
        }
        Ok(report)
    }

    /// Flag one operation stale. Returns false if it already was, or is gone.
    pub async fn mark_stale(&self, id: OperationId) -> Result<bool> {
        let updated = self
            .store
            .atomic_update(
                &self.config.operations_collection,
                &Filter::Id(id).and(Filter::eq("stale", false)),
                &Update::new().set("stale", true),
                None,
                ReturnDocument::After,
            )
            .await?;
        Ok(updated.is_some())
    }

    /// Detach a destroyed node from every operation that referenced it.
    ///
    /// Creation observers of the node are removed; everything else loses the
    /// reference and is forced stale.
    pub async fn on_destroy(&self, id: NodeId) -> Result<PropagationReport> {
        let mut report = PropagationReport::default();
        let candidates = self.referencing(id).await?;
        report.examined = candidates.len();

        for mut candidate in candidates {
            let observer = self
                .registry
                .operation(&candidate.kind)
                .map(|spec| spec.observes().is_some())
                .unwrap_or(false);

            if observer && candidate.parents.labels_of(id).contains(&OBSERVED_LABEL) {
                report.removed += self
                    .store
                    .remove(&self.config.operations_collection, &Filter::Id(candidate.id))
                    .await?;
                continue;
            }

            candidate.parents.remove_id(id);
            let update = Update::new()
                .set("parents", serde_json::to_value(&candidate.parents)?)
                .set("stale", true);
            let updated = self
                .store
                .atomic_update(
                    &self.config.operations_collection,
                    &Filter::Id(candidate.id),
                    &update,
                    None,
                    ReturnDocument::After,
                )
                .await?;
            if updated.is_some() {
                report.marked_stale += 1;
            }
        }

        log::debug!(
            "Destroying {} detached {} operations and removed {}",
            id,
            report.marked_stale,
            report.removed
        );
        Ok(report)
    }
}
