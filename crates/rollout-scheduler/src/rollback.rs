//! Restores a service to its last known-good artifact.

use rollout_core::clock::Clock;
use rollout_core::deployer::RollbackResult;
use rollout_core::store::DeploymentStateStore;
use rollout_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::deploy::ServiceDeployer;
use crate::verify::HealthVerifier;

/// Redeploys the last known-good artifact and verifies it.
///
/// A rollback is attempted once. If it fails the service needs an operator.
pub struct RollbackController {
    state: Arc<dyn DeploymentStateStore>,
    deployer: Arc<ServiceDeployer>,
    verifier: Arc<HealthVerifier>,
    clock: Arc<dyn Clock>,
    verify_timeout: Duration,
}

impl RollbackController {
    pub fn new(
        state: Arc<dyn DeploymentStateStore>,
        deployer: Arc<ServiceDeployer>,
        verifier: Arc<HealthVerifier>,
        clock: Arc<dyn Clock>,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            state,
            deployer,
            verifier,
            clock,
            verify_timeout,
        }
    }

    pub async fn rollback(&self, service: &str) -> Result<RollbackResult> {
        let record = self
            .state
            .get(service)
            .await
            .map_err(|e| Error::RollbackFailed(format!("cannot read deployment state: {e}")))?
            .ok_or_else(|| {
                Error::RollbackFailed(format!("no known-good artifact recorded for {service}"))
            })?;

        warn!(service = %service, artifact = %record.artifact, "Rolling back");

        self.deployer
            .deploy(service, &record.artifact)
            .await
            .map_err(|e| {
                error!(service = %service, error = %e, "Rollback deploy failed");
                Error::RollbackFailed(format!("redeploy of {} failed: {e}", record.artifact.digest))
            })?;

        let verify = self.verifier.await_stable(service, self.verify_timeout).await;
        if !verify.is_stable() {
            error!(service = %service, outcome = %verify.outcome, "Rolled back artifact is not stable");
            return Err(Error::RollbackFailed(format!(
                "{} did not stabilize: {}",
                record.artifact.digest,
                verify.describe()
            )));
        }

        info!(service = %service, artifact = %record.artifact, "Rollback complete");
        Ok(RollbackResult {
            service: service.to_string(),
            restored: record.artifact,
            verify,
            finished_at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollout_config::VerifyPolicy;
    use rollout_core::artifact::ArtifactRef;
    use rollout_core::clock::ManualClock;
    use rollout_core::deployer::{ComputePlatform, ServiceHealth};
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

    struct Fixture {
        platform: Arc<MemoryPlatform>,
        deployer: Arc<ServiceDeployer>,
        controller: RollbackController,
    }

    fn fixture() -> Fixture {
        let platform = Arc::new(MemoryPlatform::new(2));
        let state: Arc<dyn DeploymentStateStore> = Arc::new(MemoryDeploymentState::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let verifier = Arc::new(HealthVerifier::new(
            platform.clone(),
            VerifyPolicy::default(),
            clock.clone(),
        ));
        let deployer = Arc::new(ServiceDeployer::new(
            platform.clone(),
            state.clone(),
            verifier.clone(),
            clock.clone(),
            Duration::from_secs(60),
        ));
        let controller = RollbackController::new(
            state,
            deployer.clone(),
            verifier,
            clock,
            Duration::from_secs(300),
        );
        Fixture {
            platform,
            deployer,
            controller,
        }
    }

    #[tokio::test]
    async fn test_rollback_restores_known_good() {
        let f = fixture();
        f.deployer.commit("rates", &artifact("sha256:v1"), None).await.unwrap();
        f.platform.update_service("rates", &artifact("sha256:v2")).await.unwrap();

        let result = f.controller.rollback("rates").await.unwrap();

        assert_eq!(result.restored.digest, "sha256:v1");
        assert!(result.verify.is_stable());
        assert_eq!(f.platform.current("rates").unwrap().digest, "sha256:v1");
    }

    #[tokio::test]
    async fn test_rollback_without_known_good_fails() {
        let f = fixture();
        f.platform.update_service("rates", &artifact("sha256:v2")).await.unwrap();

        let err = f.controller.rollback("rates").await.unwrap_err();

        assert!(matches!(err, Error::RollbackFailed(ref m) if m.contains("no known-good")));
        assert_eq!(f.platform.history("rates").len(), 1);
    }

    #[tokio::test]
    async fn test_unstable_restore_fails_without_retry() {
        let f = fixture();
        f.deployer.commit("rates", &artifact("sha256:v1"), None).await.unwrap();
        f.platform.script_health(
            "sha256:v1",
            vec![ServiceHealth {
                healthy: 1,
                desired: 2,
                recent_restarts: 0,
            }],
        );

        let err = f.controller.rollback("rates").await.unwrap_err();

        assert!(matches!(err, Error::RollbackFailed(ref m) if m.contains("did not stabilize")));
        assert_eq!(f.platform.history("rates").len(), 1);
    }
}
