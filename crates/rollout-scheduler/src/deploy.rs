//! Deploy stage: rolls a published artifact out to the compute platform.

use rollout_core::artifact::ArtifactRef;
use rollout_core::clock::Clock;
use rollout_core::deployer::{ComputePlatform, DeployResult};
use rollout_core::store::{DeploymentRecord, DeploymentStateStore};
use rollout_core::{Error, Result, RunId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::verify::HealthVerifier;

/// Replaces a service's running artifact and tracks the last known-good one.
pub struct ServiceDeployer {
    platform: Arc<dyn ComputePlatform>,
    state: Arc<dyn DeploymentStateStore>,
    verifier: Arc<HealthVerifier>,
    clock: Arc<dyn Clock>,
    ready_timeout: Duration,
}

impl ServiceDeployer {
    pub fn new(
        platform: Arc<dyn ComputePlatform>,
        state: Arc<dyn DeploymentStateStore>,
        verifier: Arc<HealthVerifier>,
        clock: Arc<dyn Clock>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            platform,
            state,
            verifier,
            clock,
            ready_timeout,
        }
    }

    /// Start a rolling update and wait until at least one new instance is
    /// ready. Deployment state is left untouched.
    ///
    /// A rejected update fails with `DeploymentFailed` and nothing changed.
    /// An accepted update that never becomes ready fails with `NotReady`.
    pub async fn deploy(&self, service: &str, artifact: &ArtifactRef) -> Result<DeployResult> {
        let previous = self
            .state
            .get(service)
            .await
            .map_err(|e| Error::DeploymentFailed(format!("cannot read deployment state: {e}")))?
            .map(|record| record.artifact);

        info!(
            service = %service,
            platform = self.platform.name(),
            artifact = %artifact,
            "Deploying artifact"
        );

        let task_set = self
            .platform
            .update_service(service, artifact)
            .await
            .map_err(|e| match e {
                Error::DeploymentFailed(_) => e,
                other => Error::DeploymentFailed(other.to_string()),
            })?;

        let ready = self.verifier.await_ready(service, self.ready_timeout).await;
        if !ready.is_stable() {
            warn!(service = %service, task_set = %task_set.as_str(), "No new instance became ready");
            return Err(Error::NotReady(format!(
                "no instance of {} became ready: {}",
                artifact.digest,
                ready.describe()
            )));
        }

        Ok(DeployResult {
            service: service.to_string(),
            artifact: artifact.clone(),
            previous,
            task_set,
        })
    }

    /// Record `artifact` as the service's last known-good deployment.
    pub async fn commit(
        &self,
        service: &str,
        artifact: &ArtifactRef,
        run_id: Option<RunId>,
    ) -> Result<Option<DeploymentRecord>> {
        let record = DeploymentRecord {
            service: service.to_string(),
            artifact: artifact.clone(),
            run_id,
            updated_at: self.clock.now(),
        };
        let replaced = self.state.put(record).await?;
        info!(service = %service, digest = %artifact.digest, "Recorded known-good artifact");
        Ok(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollout_config::VerifyPolicy;
    use rollout_core::clock::ManualClock;
    use rollout_core::deployer::ServiceHealth;
    use rollout_db::MemoryDeploymentState;
    use rollout_deployer::MemoryPlatform;

    fn artifact(digest: &str) -> ArtifactRef {
        ArtifactRef {
            repository: "local/rates".to_string(),
            digest: digest.to_string(),
            tag: "t".to_string(),
            published_at: Utc::now(),
        }
    }

    fn deployer(platform: Arc<MemoryPlatform>, state: Arc<MemoryDeploymentState>) -> ServiceDeployer {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let verifier = Arc::new(HealthVerifier::new(
            platform.clone(),
            VerifyPolicy::default(),
            clock.clone(),
        ));
        ServiceDeployer::new(platform, state, verifier, clock, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_deploy_reports_previous_known_good() {
        let platform = Arc::new(MemoryPlatform::new(2));
        let state = Arc::new(MemoryDeploymentState::new());
        let deployer = deployer(platform.clone(), state.clone());

        deployer.commit("rates", &artifact("sha256:v1"), None).await.unwrap();
        let result = deployer.deploy("rates", &artifact("sha256:v2")).await.unwrap();

        assert_eq!(result.previous.unwrap().digest, "sha256:v1");
        assert_eq!(result.task_set.as_str(), "rates-1");
        assert_eq!(platform.current("rates").unwrap().digest, "sha256:v2");
        // Deploying does not move the known-good pointer.
        assert_eq!(
            state.get("rates").await.unwrap().unwrap().artifact.digest,
            "sha256:v1"
        );
    }

    #[tokio::test]
    async fn test_rejected_update_is_deploy_failure() {
        let platform = Arc::new(MemoryPlatform::new(1));
        platform.reject_updates("rates", "quota exceeded");
        let deployer = deployer(platform, Arc::new(MemoryDeploymentState::new()));

        let err = deployer.deploy("rates", &artifact("sha256:v2")).await.unwrap_err();
        assert!(matches!(err, Error::DeploymentFailed(ref m) if m.contains("quota exceeded")));
    }

    #[tokio::test]
    async fn test_accepted_but_never_ready_is_not_ready() {
        let platform = Arc::new(MemoryPlatform::new(2));
        platform.script_health(
            "sha256:v2",
            vec![ServiceHealth {
                healthy: 0,
                desired: 2,
                recent_restarts: 0,
            }],
        );
        let deployer = deployer(platform.clone(), Arc::new(MemoryDeploymentState::new()));

        let err = deployer.deploy("rates", &artifact("sha256:v2")).await.unwrap_err();
        assert!(matches!(err, Error::NotReady(ref m) if m.contains("became ready")));
        assert_eq!(platform.current("rates").unwrap().digest, "sha256:v2");
    }

    #[tokio::test]
    async fn test_commit_returns_replaced_record() {
        let deployer = deployer(
            Arc::new(MemoryPlatform::default()),
            Arc::new(MemoryDeploymentState::new()),
        );
        let run_id = RunId::new();

        assert!(deployer.commit("rates", &artifact("sha256:v1"), None).await.unwrap().is_none());
        let replaced = deployer
            .commit("rates", &artifact("sha256:v2"), Some(run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replaced.artifact.digest, "sha256:v1");
    }
}
