//! Publish stage: pushes built artifacts with bounded retries.

use rollout_config::RetryPolicy;
use rollout_core::artifact::{ArtifactRef, ArtifactRegistry, BuiltArtifact, PushedArtifact};
use rollout_core::clock::Clock;
use rollout_core::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a publish call along with how many attempts it took.
#[derive(Debug)]
pub struct PublishOutcome {
    pub result: Result<ArtifactRef>,
    pub attempts: u32,
}

/// Publishes artifacts to a registry.
///
/// Content already present under the same digest is returned as is, so
/// publishing twice yields the same reference and stores nothing new.
pub struct RegistryPublisher {
    registry: Arc<dyn ArtifactRegistry>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RegistryPublisher {
    pub fn new(registry: Arc<dyn ArtifactRegistry>, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            retry,
            clock,
        }
    }

    pub fn registry(&self) -> &dyn ArtifactRegistry {
        self.registry.as_ref()
    }

    pub async fn publish(&self, artifact: &BuiltArtifact) -> PublishOutcome {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.try_publish(artifact).await {
                Ok(published) => {
                    info!(
                        artifact = %published,
                        attempts,
                        "Artifact published"
                    );
                    return PublishOutcome {
                        result: Ok(published),
                        attempts,
                    };
                }
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    let delay = self.retry.backoff(attempts);
                    warn!(
                        digest = %artifact.digest,
                        attempt = attempts,
                        error = %e,
                        retry_in = ?delay,
                        "Transient publish failure, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
                Err(e) => {
                    warn!(digest = %artifact.digest, attempts, error = %e, "Publish failed");
                    return PublishOutcome {
                        result: Err(e),
                        attempts,
                    };
                }
            }
        }
    }

    async fn try_publish(&self, artifact: &BuiltArtifact) -> Result<ArtifactRef> {
        if let Some(existing) = self.registry.resolve(&artifact.digest).await? {
            info!(digest = %existing.digest, "Artifact already published");
            return Ok(self.reference(existing, artifact));
        }

        let pushed = self.registry.push(artifact).await?;
        Ok(self.reference(pushed, artifact))
    }

    fn reference(&self, pushed: PushedArtifact, artifact: &BuiltArtifact) -> ArtifactRef {
        let tag = if pushed.tag.is_empty() {
            artifact.tag.clone()
        } else {
            pushed.tag
        };
        ArtifactRef {
            repository: self.registry.repository().to_string(),
            digest: pushed.digest,
            tag,
            published_at: pushed.pushed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollout_core::clock::ManualClock;
    use rollout_executor::MemoryRegistry;
    use std::time::Duration;

    fn artifact() -> BuiltArtifact {
        BuiltArtifact {
            image: "rates:abc1234".to_string(),
            digest: "sha256:0123abcd".to_string(),
            tag: "abc1234".to_string(),
            size: 1024,
            built_at: Utc::now(),
        }
    }

    fn publisher(registry: Arc<MemoryRegistry>, clock: Arc<ManualClock>) -> RegistryPublisher {
        RegistryPublisher::new(registry, RetryPolicy::default(), clock)
    }

    #[tokio::test]
    async fn test_publish_twice_is_idempotent() {
        let registry = Arc::new(MemoryRegistry::new("local/rates"));
        let publisher = publisher(registry.clone(), Arc::new(ManualClock::default()));

        let first = publisher.publish(&artifact()).await.result.unwrap();
        let second = publisher.publish(&artifact()).await.result.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.repository, "local/rates");
        assert_eq!(registry.stored_count(), 1);
        assert_eq!(registry.push_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_with_backoff() {
        let registry = Arc::new(MemoryRegistry::new("local/rates"));
        registry.fail_next_pushes(2);
        let clock = Arc::new(ManualClock::default());
        let publisher = publisher(registry.clone(), clock.clone());

        let outcome = publisher.publish(&artifact()).await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(registry.stored_count(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let registry = Arc::new(MemoryRegistry::new("local/rates"));
        registry.fail_next_pushes(5);
        let publisher = publisher(registry.clone(), Arc::new(ManualClock::default()));

        let outcome = publisher.publish(&artifact()).await;

        let err = outcome.result.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(registry.push_count(), 3);
        assert_eq!(registry.stored_count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let registry = Arc::new(MemoryRegistry::new("local/rates"));
        registry.reject_pushes("denied: requested access to the resource is denied");
        let clock = Arc::new(ManualClock::default());
        let publisher = publisher(registry.clone(), clock.clone());

        let outcome = publisher.publish(&artifact()).await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert!(clock.sleeps().is_empty());
    }
}
