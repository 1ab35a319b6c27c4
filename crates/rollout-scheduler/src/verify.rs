//! Health verification of a deployed service.

use rollout_config::VerifyPolicy;
use rollout_core::clock::Clock;
use rollout_core::deployer::{ComputePlatform, ServiceHealth, VerifyOutcome, VerifyResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a poll loop waits for.
struct Target {
    /// Healthy instances required. `None` means the desired count, and
    /// at least one.
    required: Option<u32>,
    window: Duration,
    detect_crash_loop: bool,
}

/// Polls a platform until a service is healthy or a deadline passes.
pub struct HealthVerifier {
    platform: Arc<dyn ComputePlatform>,
    policy: VerifyPolicy,
    clock: Arc<dyn Clock>,
}

impl HealthVerifier {
    pub fn new(platform: Arc<dyn ComputePlatform>, policy: VerifyPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            platform,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &VerifyPolicy {
        &self.policy
    }

    /// Wait until the minimum healthy count has held for the whole
    /// stabilization window.
    ///
    /// A failed health probe counts as an unhealthy observation.
    pub async fn await_stable(&self, service: &str, timeout: Duration) -> VerifyResult {
        let target = Target {
            required: self.policy.min_healthy,
            window: self.policy.window,
            detect_crash_loop: true,
        };
        self.poll(service, timeout, target).await
    }

    /// Wait until at least one instance of the new artifact is healthy.
    pub async fn await_ready(&self, service: &str, timeout: Duration) -> VerifyResult {
        let target = Target {
            required: Some(1),
            window: Duration::ZERO,
            detect_crash_loop: false,
        };
        self.poll(service, timeout, target).await
    }

    async fn poll(&self, service: &str, timeout: Duration, target: Target) -> VerifyResult {
        let start = self.clock.now();
        let mut healthy_since = None;
        let mut last_health: Option<ServiceHealth> = None;
        let mut polls = 0;

        let finish = |outcome, last_health, polls, now: chrono::DateTime<chrono::Utc>| VerifyResult {
            service: service.to_string(),
            outcome,
            last_health,
            polls,
            elapsed: (now - start).to_std().unwrap_or_default(),
        };

        loop {
            polls += 1;
            let now = self.clock.now();

            match self.platform.service_health(service).await {
                Ok(health) => {
                    last_health = Some(health);
                    debug!(service = %service, %health, "Health observed");

                    if target.detect_crash_loop && health.recent_restarts > self.policy.max_restarts {
                        warn!(service = %service, %health, "Instances are crash looping");
                        return finish(VerifyOutcome::CrashLoop, last_health, polls, now);
                    }

                    // A service with no running instances is never healthy.
                    let required = target.required.unwrap_or(health.desired).max(1);
                    if health.healthy >= required {
                        let since = *healthy_since.get_or_insert(now);
                        let held = (now - since).to_std().unwrap_or_default();
                        if held >= target.window {
                            info!(service = %service, %health, polls, "Service is stable");
                            return finish(VerifyOutcome::Stable, last_health, polls, now);
                        }
                    } else {
                        healthy_since = None;
                    }
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "Health probe failed");
                    healthy_since = None;
                }
            }

            let elapsed = (now - start).to_std().unwrap_or_default();
            if elapsed >= timeout {
                warn!(service = %service, polls, "Service did not stabilize in time");
                return finish(VerifyOutcome::TimedOut, last_health, polls, now);
            }

            let remaining = timeout - elapsed;
            self.clock.sleep(self.policy.interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollout_core::artifact::ArtifactRef;
    use rollout_core::clock::ManualClock;
    use rollout_deployer::MemoryPlatform;

    fn artifact(digest: &str) -> ArtifactRef {
        ArtifactRef {
            repository: "local/rates".to_string(),
            digest: digest.to_string(),
            tag: "v2".to_string(),
            published_at: Utc::now(),
        }
    }

    fn health(healthy: u32, desired: u32, recent_restarts: u32) -> ServiceHealth {
        ServiceHealth {
            healthy,
            desired,
            recent_restarts,
        }
    }

    async fn deployed(observations: Vec<ServiceHealth>) -> Arc<MemoryPlatform> {
        let platform = Arc::new(MemoryPlatform::new(2));
        platform.script_health("sha256:v2", observations);
        platform
            .update_service("rates", &artifact("sha256:v2"))
            .await
            .unwrap();
        platform
    }

    fn verifier(platform: Arc<MemoryPlatform>, clock: Arc<ManualClock>) -> HealthVerifier {
        HealthVerifier::new(platform, VerifyPolicy::default(), clock)
    }

    #[tokio::test]
    async fn test_stable_after_window() {
        let platform = deployed(vec![health(2, 2, 0)]).await;
        let clock = Arc::new(ManualClock::default());
        let verifier = verifier(platform, clock);

        let result = verifier.await_stable("rates", Duration::from_secs(300)).await;

        assert_eq!(result.outcome, VerifyOutcome::Stable);
        // Healthy at 0s and still healthy 30s later with a 5s interval.
        assert_eq!(result.polls, 7);
        assert_eq!(result.elapsed, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_window_restarts_after_unhealthy_observation() {
        let mut observations = vec![health(2, 2, 0); 3];
        observations.push(health(1, 2, 0));
        observations.push(health(2, 2, 0));
        let platform = deployed(observations).await;
        let verifier = verifier(platform, Arc::new(ManualClock::default()));

        let result = verifier.await_stable("rates", Duration::from_secs(300)).await;

        assert!(result.is_stable());
        // Window restarts at the fifth poll (20s) and holds until 50s.
        assert_eq!(result.elapsed, Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_partial_health_times_out() {
        let platform = deployed(vec![health(1, 2, 0)]).await;
        let verifier = verifier(platform, Arc::new(ManualClock::default()));

        let result = verifier.await_stable("rates", Duration::from_secs(300)).await;

        assert_eq!(result.outcome, VerifyOutcome::TimedOut);
        assert_eq!(result.last_health, Some(health(1, 2, 0)));
        assert_eq!(result.elapsed, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_min_healthy_overrides_desired() {
        let platform = deployed(vec![health(1, 2, 0)]).await;
        let policy = VerifyPolicy {
            min_healthy: Some(1),
            ..VerifyPolicy::default()
        };
        let verifier = HealthVerifier::new(platform, policy, Arc::new(ManualClock::default()));

        let result = verifier.await_stable("rates", Duration::from_secs(300)).await;
        assert!(result.is_stable());
    }

    #[tokio::test]
    async fn test_scaled_to_zero_is_not_stable() {
        let platform = deployed(vec![health(0, 0, 0)]).await;
        let verifier = verifier(platform, Arc::new(ManualClock::default()));

        let result = verifier.await_stable("rates", Duration::from_secs(60)).await;

        assert_eq!(result.outcome, VerifyOutcome::TimedOut);
        assert_eq!(result.last_health, Some(health(0, 0, 0)));
    }

    #[tokio::test]
    async fn test_crash_loop_detected() {
        let platform = deployed(vec![health(2, 2, 0), health(1, 2, 4)]).await;
        let verifier = verifier(platform, Arc::new(ManualClock::default()));

        let result = verifier.await_stable("rates", Duration::from_secs(300)).await;

        assert_eq!(result.outcome, VerifyOutcome::CrashLoop);
        assert_eq!(result.polls, 2);
    }

    #[tokio::test]
    async fn test_failed_probe_counts_as_unhealthy() {
        let platform = deployed(vec![health(2, 2, 0)]).await;
        platform.fail_probes("rates", 2);
        let verifier = verifier(platform, Arc::new(ManualClock::default()));

        let result = verifier.await_stable("rates", Duration::from_secs(300)).await;

        assert!(result.is_stable());
        // Two failed probes at 0s and 5s, then healthy from 10s to 40s.
        assert_eq!(result.elapsed, Duration::from_secs(40));
    }

    #[tokio::test]
    async fn test_ready_needs_one_healthy_instance() {
        let platform = deployed(vec![health(0, 2, 0), health(1, 2, 0)]).await;
        let verifier = verifier(platform, Arc::new(ManualClock::default()));

        let result = verifier.await_ready("rates", Duration::from_secs(60)).await;

        assert!(result.is_stable());
        assert_eq!(result.polls, 2);
    }

    #[tokio::test]
    async fn test_unknown_service_times_out() {
        let platform = Arc::new(MemoryPlatform::new(1));
        let verifier = verifier(platform, Arc::new(ManualClock::default()));

        let result = verifier.await_ready("missing", Duration::from_secs(10)).await;

        assert_eq!(result.outcome, VerifyOutcome::TimedOut);
        assert!(result.last_health.is_none());
    }
}
