//! In-memory provisioner.

use async_trait::async_trait;
use rollout_core::infra::{DesiredState, Provisioner, ReconcileResult, ResourceFailure, ResourceId};
use rollout_core::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Provisioner over an observed-state map.
///
/// Each declared resource is compared with what was last applied; only
/// resources whose properties differ are written, and resources no longer
/// declared are removed.
#[derive(Default)]
pub struct MemoryProvisioner {
    observed: Mutex<HashMap<ResourceId, Value>>,
    faults: Mutex<HashMap<ResourceId, String>>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every apply of `id` fail with `reason` until cleared.
    pub fn inject_failure(&self, id: impl Into<String>, reason: impl Into<String>) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ResourceId::new(id), reason.into());
    }

    pub fn clear_failures(&self) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Currently applied properties of a resource.
    pub fn observed(&self, id: &str) -> Option<Value> {
        self.observed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ResourceId::new(id))
            .cloned()
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn reconcile(&self, desired: &DesiredState) -> Result<ReconcileResult> {
        let order = desired.apply_order()?;
        let faults = self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut observed = self.observed.lock().unwrap_or_else(|e| e.into_inner());

        let mut result = ReconcileResult::default();
        let mut failed: HashSet<&ResourceId> = HashSet::new();

        for decl in order {
            if decl.depends_on.iter().any(|dep| failed.contains(dep)) {
                failed.insert(&decl.id);
                result.failed.push(ResourceFailure {
                    id: decl.id.clone(),
                    reason: "dependency failed".to_string(),
                });
                continue;
            }

            if observed.get(&decl.id) == Some(&decl.properties) {
                result.unchanged.push(decl.id.clone());
                continue;
            }

            if let Some(reason) = faults.get(&decl.id) {
                warn!(resource = %decl.id, reason = %reason, "Resource apply failed");
                failed.insert(&decl.id);
                result.failed.push(ResourceFailure {
                    id: decl.id.clone(),
                    reason: reason.clone(),
                });
                continue;
            }

            debug!(resource = %decl.id, "Applying resource");
            observed.insert(decl.id.clone(), decl.properties.clone());
            result.applied.push(decl.id.clone());
        }

        let declared: HashSet<&ResourceId> = desired.resources.iter().map(|r| &r.id).collect();
        let mut removed: Vec<ResourceId> = observed
            .keys()
            .filter(|id| !declared.contains(id))
            .cloned()
            .collect();
        removed.sort();
        for id in removed {
            debug!(resource = %id, "Removing undeclared resource");
            observed.remove(&id);
            result.applied.push(id);
        }

        info!(
            applied = result.applied.len(),
            unchanged = result.unchanged.len(),
            failed = result.failed.len(),
            "Reconciled in-memory infrastructure"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_core::infra::ResourceDecl;
    use serde_json::json;

    fn desired() -> DesiredState {
        DesiredState {
            resources: vec![
                ResourceDecl::new("service")
                    .depends_on("cluster")
                    .with_properties(json!({"desired_count": 2})),
                ResourceDecl::new("cluster").depends_on("network"),
                ResourceDecl::new("network").with_properties(json!({"cidr": "10.0.0.0/16"})),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_noop() {
        let provisioner = MemoryProvisioner::new();

        let first = provisioner.reconcile(&desired()).await.unwrap();
        assert_eq!(first.applied.len(), 3);
        assert_eq!(first.applied[0], ResourceId::new("network"));

        let second = provisioner.reconcile(&desired()).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged.len(), 3);
    }

    #[tokio::test]
    async fn test_only_changed_resources_are_applied() {
        let provisioner = MemoryProvisioner::new();
        provisioner.reconcile(&desired()).await.unwrap();

        let mut changed = desired();
        changed.resources[0].properties = json!({"desired_count": 4});
        let result = provisioner.reconcile(&changed).await.unwrap();

        assert_eq!(result.applied, vec![ResourceId::new("service")]);
        assert_eq!(
            provisioner.observed("service"),
            Some(json!({"desired_count": 4}))
        );
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_per_resource() {
        let provisioner = MemoryProvisioner::new();
        provisioner.inject_failure("cluster", "quota exceeded");

        let result = provisioner.reconcile(&desired()).await.unwrap();

        assert_eq!(result.applied, vec![ResourceId::new("network")]);
        assert_eq!(result.failed.len(), 2);
        assert_eq!(result.failed[0].reason, "quota exceeded");
        assert_eq!(result.failed[1].id, ResourceId::new("service"));
        assert_eq!(result.failed[1].reason, "dependency failed");
        assert!(provisioner.observed("service").is_none());

        provisioner.clear_failures();
        let retry = provisioner.reconcile(&desired()).await.unwrap();
        assert_eq!(retry.applied.len(), 2);
        assert_eq!(retry.unchanged, vec![ResourceId::new("network")]);
    }

    #[tokio::test]
    async fn test_undeclared_resources_are_removed() {
        let provisioner = MemoryProvisioner::new();
        provisioner.reconcile(&desired()).await.unwrap();

        let mut smaller = desired();
        smaller.resources.remove(0);
        let result = provisioner.reconcile(&smaller).await.unwrap();

        assert_eq!(result.applied, vec![ResourceId::new("service")]);
        assert!(provisioner.observed("service").is_none());
    }
}
