//! Operation type declarations
//!
//! Each operation type is declared once at startup through an
//! [`OperationBuilder`] and frozen into an [`OperationSpec`]. The spec names
//! the parent labels, the dependency addresses read from them and the
//! compute step; it is never mutated after `finalize`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::address::{is_valid_name, Address, Diff, Selector};
use crate::error::{PercolatorError, Result};
use crate::node::NodeId;

use super::context::ComputeContext;
use super::parents::ParentSet;

/// Label given to the single parent of a creation observer
pub const OBSERVED_LABEL: &str = "observed";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// Typed description of one parent label
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentSpec {
    pub label: String,
    pub cardinality: Cardinality,
    /// Required node kind, `None` for polymorphic labels
    pub kind: Option<String>,
    pub polymorphic: bool,
}

impl ParentSpec {
    /// Whether a node of `kind` may sit under this label.
    pub fn accepts(&self, kind: &str) -> bool {
        self.polymorphic || self.kind.as_deref().map_or(true, |k| k == kind)
    }

    pub fn is_plural(&self) -> bool {
        self.cardinality == Cardinality::Many
    }
}

/// The compute step of an operation type
pub type ComputeFn = Arc<dyn Fn(&mut ComputeContext) -> anyhow::Result<()> + Send + Sync>;

/// Immutable declaration of an operation type
#[derive(Clone)]
pub struct OperationSpec {
    name: String,
    parents: Vec<ParentSpec>,
    dependencies: Vec<Address>,
    priority: Option<i64>,
    owner_kind: Option<String>,
    one_shot: bool,
    observes: Option<String>,
    compute: ComputeFn,
}

impl OperationSpec {
    pub fn builder(name: impl Into<String>) -> OperationBuilder {
        OperationBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parents(&self) -> &[ParentSpec] {
        &self.parents
    }

    pub fn parent(&self, label: &str) -> Option<&ParentSpec> {
        self.parents.iter().find(|p| p.label == label)
    }

    pub fn dependencies(&self) -> &[Address] {
        &self.dependencies
    }

    /// Priority override; the engine default applies when `None`
    pub fn priority(&self) -> Option<i64> {
        self.priority
    }

    pub fn owner_kind(&self) -> Option<&str> {
        self.owner_kind.as_deref()
    }

    /// Removed after its first successful run
    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    /// The node kind whose creation spawns an instance of this type
    pub fn observes(&self) -> Option<&str> {
        self.observes.as_deref()
    }

    pub(crate) fn compute_fn(&self) -> &ComputeFn {
        &self.compute
    }

    /// A parent set with every declared label present and the label set frozen
    pub fn empty_parent_set(&self) -> ParentSet {
        let mut set = ParentSet::new();
        for parent in &self.parents {
            // Labels are unique, and a fresh set is not frozen.
            let _ = set.declare(&parent.label);
        }
        set.freeze();
        set
    }

    /// Whether some dependency on `label` picks a specific parent by id.
    /// Answers from [`relevant_changes`](Self::relevant_changes) for such
    /// labels depend on the parent id and cannot be shared.
    pub fn has_indexed_dependency(&self, label: &str) -> bool {
        self.dependencies
            .iter()
            .any(|dep| dep.head().name == label && dep.head().is_indexed())
    }

    /// The dependencies rooted at `label` whose value on `parent_id` changed
    /// according to `diff`. A dependency naming the bare label compares the
    /// whole document.
    pub fn relevant_changes(
        &self,
        label: &str,
        parent_id: NodeId,
        diff: &Diff,
    ) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for dep in &self.dependencies {
            let head = dep.head();
            if head.name != label {
                continue;
            }
            if let Selector::Index(index) = &head.selector {
                if *index != parent_id.to_string() {
                    continue;
                }
            }
            let hit = match dep.tail() {
                Some(tail) => diff.path_changed(tail.as_str())?,
                None => diff.changed(),
            };
            if hit {
                changed.push(dep.to_string());
            }
        }
        Ok(changed)
    }
}

impl fmt::Debug for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSpec")
            .field("name", &self.name)
            .field("parents", &self.parents)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .field("owner_kind", &self.owner_kind)
            .field("one_shot", &self.one_shot)
            .field("observes", &self.observes)
            .finish_non_exhaustive()
    }
}

/// Builder for [`OperationSpec`]
///
/// Problems found while building are held back and reported by
/// [`finalize`](Self::finalize).
pub struct OperationBuilder {
    name: String,
    parents: Vec<ParentSpec>,
    dependencies: Vec<String>,
    priority: Option<i64>,
    owner_kind: Option<String>,
    one_shot: bool,
    observes: Option<String>,
    compute: Option<ComputeFn>,
    problems: Vec<PercolatorError>,
}

impl OperationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parents: Vec::new(),
            dependencies: Vec::new(),
            priority: None,
            owner_kind: None,
            one_shot: false,
            observes: None,
            compute: None,
            problems: Vec::new(),
        }
    }

    fn add_parent(mut self, spec: ParentSpec) -> Self {
        if !is_valid_name(&spec.label) {
            self.problems.push(PercolatorError::Composition(format!(
                "parent label '{}' of '{}' is not a valid name",
                spec.label, self.name
            )));
        } else if self.parents.iter().any(|p| p.label == spec.label) {
            self.problems.push(PercolatorError::Composition(format!(
                "parent label '{}' declared twice on '{}'",
                spec.label, self.name
            )));
        } else {
            self.parents.push(spec);
        }
        self
    }

    /// A single parent of the given kind
    pub fn parent(self, label: impl Into<String>, kind: impl Into<String>) -> Self {
        self.add_parent(ParentSpec {
            label: label.into(),
            cardinality: Cardinality::One,
            kind: Some(kind.into()),
            polymorphic: false,
        })
    }

    /// Any number of parents of the given kind
    pub fn parents(self, label: impl Into<String>, kind: impl Into<String>) -> Self {
        self.add_parent(ParentSpec {
            label: label.into(),
            cardinality: Cardinality::Many,
            kind: Some(kind.into()),
            polymorphic: false,
        })
    }

    /// A single parent of any kind
    pub fn polymorphic_parent(self, label: impl Into<String>) -> Self {
        self.add_parent(ParentSpec {
            label: label.into(),
            cardinality: Cardinality::One,
            kind: None,
            polymorphic: true,
        })
    }

    /// Any number of parents of any kind. Not supported; `finalize` fails.
    pub fn polymorphic_parents(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        self.problems.push(PercolatorError::Composition(format!(
            "polymorphic label '{}' on '{}' must be singular",
            label, self.name
        )));
        self
    }

    pub fn depends_on(mut self, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        if !self.dependencies.contains(&addr) {
            self.dependencies.push(addr);
        }
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn owned_by(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        if let Some(existing) = &self.owner_kind {
            self.problems.push(PercolatorError::Collision(format!(
                "'{}' is already owned by '{}', cannot attach to '{}'",
                self.name, existing, kind
            )));
        } else {
            self.owner_kind = Some(kind);
        }
        self
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// Spawn one instance whenever a node of `kind` is first persisted, with
    /// that node under the `observed` label.
    pub fn observes_creation_of(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        self.observes = Some(kind.clone());
        self.one_shot = true;
        self.parent(OBSERVED_LABEL, kind)
    }

    pub fn compute<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ComputeContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.compute = Some(Arc::new(f));
        self
    }

    pub fn finalize(mut self) -> Result<OperationSpec> {
        if let Some(problem) = self.problems.drain(..).next() {
            return Err(problem);
        }

        let compute = self.compute.ok_or_else(|| {
            PercolatorError::Composition(format!("'{}' has no compute step", self.name))
        })?;

        if self.observes.is_some() && self.owner_kind.is_some() {
            return Err(PercolatorError::Composition(format!(
                "creation observer '{}' cannot have an owner",
                self.name
            )));
        }

        let labels: BTreeSet<&str> = self.parents.iter().map(|p| p.label.as_str()).collect();
        let mut dependencies = Vec::with_capacity(self.dependencies.len());
        for raw in &self.dependencies {
            let address = Address::parse(raw)?;
            if !labels.contains(address.head().name.as_str()) {
                return Err(PercolatorError::Composition(format!(
                    "dependency '{}' of '{}' does not start with a declared parent label",
                    raw, self.name
                )));
            }
            dependencies.push(address);
        }

        Ok(OperationSpec {
            name: self.name,
            parents: self.parents,
            dependencies,
            priority: self.priority,
            owner_kind: self.owner_kind,
            one_shot: self.one_shot,
            observes: self.observes,
            compute,
        })
    }
}
