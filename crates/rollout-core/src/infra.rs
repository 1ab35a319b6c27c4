//! Infrastructure desired state and the provisioner abstraction.
//!
//! The desired state is an opaque declarative document. The pipeline only
//! looks at resource identifiers and their dependency order; resource bodies
//! are handed to the provisioner untouched.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{Error, Result};

/// Identifier of an infrastructure resource (e.g., "aws_ecs_service.app").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub id: ResourceId,
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
    /// Backend-specific body.
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl ResourceDecl {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(id),
            depends_on: Vec::new(),
            properties: serde_json::Value::Null,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(ResourceId::new(id));
        self
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }
}

/// Declared infrastructure for a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    /// Input variables for the backend (e.g., terraform `-var`s).
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl DesiredState {
    /// Resources in an order where every dependency precedes its dependents.
    ///
    /// Declaration order is kept among resources with no ordering constraint.
    pub fn apply_order(&self) -> Result<Vec<&ResourceDecl>> {
        let by_id: HashMap<&ResourceId, &ResourceDecl> =
            self.resources.iter().map(|r| (&r.id, r)).collect();

        if by_id.len() != self.resources.len() {
            return Err(Error::InvalidInput(
                "duplicate resource identifier in desired state".to_string(),
            ));
        }

        for resource in &self.resources {
            for dep in &resource.depends_on {
                if !by_id.contains_key(dep) {
                    return Err(Error::InvalidInput(format!(
                        "resource '{}' depends on unknown resource '{}'",
                        resource.id, dep
                    )));
                }
            }
        }

        let mut order = Vec::with_capacity(self.resources.len());
        let mut done = HashSet::new();
        let mut in_progress = HashSet::new();

        for resource in &self.resources {
            visit(resource, &by_id, &mut done, &mut in_progress, &mut order)?;
        }

        Ok(order)
    }
}

fn visit<'a>(
    resource: &'a ResourceDecl,
    by_id: &HashMap<&'a ResourceId, &'a ResourceDecl>,
    done: &mut HashSet<&'a ResourceId>,
    in_progress: &mut HashSet<&'a ResourceId>,
    order: &mut Vec<&'a ResourceDecl>,
) -> Result<()> {
    if done.contains(&resource.id) {
        return Ok(());
    }
    if !in_progress.insert(&resource.id) {
        return Err(Error::InvalidInput(format!(
            "dependency cycle through resource '{}'",
            resource.id
        )));
    }

    for dep in &resource.depends_on {
        if let Some(&dep_decl) = by_id.get(dep) {
            visit(dep_decl, by_id, done, in_progress, order)?;
        }
    }

    in_progress.remove(&resource.id);
    done.insert(&resource.id);
    order.push(resource);
    Ok(())
}

/// A resource that could not be brought to its desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFailure {
    pub id: ResourceId,
    pub reason: String,
}

/// Per-resource outcome of a reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    /// Resources created, updated or deleted by this call.
    pub applied: Vec<ResourceId>,
    /// Resources already matching the desired state.
    #[serde(default)]
    pub unchanged: Vec<ResourceId>,
    pub failed: Vec<ResourceFailure>,
}

impl ReconcileResult {
    /// Nothing needed changing.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.failed.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failure_summary(&self) -> String {
        self.failed
            .iter()
            .map(|f| format!("{}: {}", f.id, f.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Trait for infrastructure provisioners.
///
/// Reconciling must be idempotent: a second call with identical input
/// applies nothing.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Name of this provisioner backend.
    fn name(&self) -> &'static str;

    /// Converge actual infrastructure toward the desired state, applying only
    /// the difference.
    async fn reconcile(&self, desired: &DesiredState) -> Result<ReconcileResult>;
}
