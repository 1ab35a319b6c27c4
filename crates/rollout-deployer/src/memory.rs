//! In-memory compute platform.

use async_trait::async_trait;
use rollout_core::artifact::ArtifactRef;
use rollout_core::deployer::{ComputePlatform, ServiceHealth, TaskSetId};
use rollout_core::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Default)]
struct ServiceState {
    desired: u32,
    current: Option<ArtifactRef>,
    history: Vec<ArtifactRef>,
    generation: u64,
    rejection: Option<String>,
    failing_probes: u32,
}

/// Platform that records updates and reports scripted health.
///
/// Health is scripted per artifact digest, so a bad new artifact and a good
/// previous one can be modeled in the same test. Unscripted artifacts report
/// every desired instance healthy.
pub struct MemoryPlatform {
    default_desired: u32,
    services: Mutex<HashMap<String, ServiceState>>,
    health: Mutex<HashMap<String, VecDeque<ServiceHealth>>>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryPlatform {
    /// Services not configured explicitly run `default_desired` instances.
    pub fn new(default_desired: u32) -> Self {
        Self {
            default_desired,
            services: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
        }
    }

    fn with_service<T>(&self, service: &str, f: impl FnOnce(&mut ServiceState) -> T) -> T {
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        let state = services
            .entry(service.to_string())
            .or_insert_with(|| ServiceState {
                desired: self.default_desired,
                ..Default::default()
            });
        f(state)
    }

    pub fn set_desired(&self, service: &str, desired: u32) {
        self.with_service(service, |s| s.desired = desired);
    }

    /// Observations reported while `digest` is rolled out, one per poll.
    /// The last one repeats once the sequence is exhausted.
    pub fn script_health(&self, digest: &str, observations: Vec<ServiceHealth>) {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(digest.to_string(), observations.into());
    }

    /// Reject every update of `service`.
    pub fn reject_updates(&self, service: &str, reason: impl Into<String>) {
        let reason = reason.into();
        self.with_service(service, |s| s.rejection = Some(reason));
    }

    /// Fail the next `count` health probes of `service`.
    pub fn fail_probes(&self, service: &str, count: u32) {
        self.with_service(service, |s| s.failing_probes = count);
    }

    /// Artifact currently rolled out.
    pub fn current(&self, service: &str) -> Option<ArtifactRef> {
        self.with_service(service, |s| s.current.clone())
    }

    /// Every artifact rolled out, oldest first.
    pub fn history(&self, service: &str) -> Vec<ArtifactRef> {
        self.with_service(service, |s| s.history.clone())
    }

    fn scripted_health(&self, digest: &str) -> Option<ServiceHealth> {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let queue = health.get_mut(digest)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        }
    }
}

#[async_trait]
impl ComputePlatform for MemoryPlatform {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn update_service(&self, service: &str, artifact: &ArtifactRef) -> Result<TaskSetId> {
        let generation = self.with_service(service, |s| {
            if let Some(reason) = &s.rejection {
                return Err(Error::DeploymentFailed(reason.clone()));
            }
            s.generation += 1;
            s.current = Some(artifact.clone());
            s.history.push(artifact.clone());
            Ok(s.generation)
        })?;

        info!(service = %service, artifact = %artifact, generation, "Rolled out artifact");
        Ok(TaskSetId::new(format!("{service}-{generation}")))
    }

    async fn service_health(&self, service: &str) -> Result<ServiceHealth> {
        let (current, desired, probe_fails) = self.with_service(service, |s| {
            let fails = s.failing_probes > 0;
            s.failing_probes = s.failing_probes.saturating_sub(1);
            (s.current.clone(), s.desired, fails)
        });

        if probe_fails {
            return Err(Error::Internal(format!("health probe for {service} failed")));
        }

        let Some(current) = current else {
            return Err(Error::NotFound(format!("service {service} has no rollout")));
        };

        Ok(self
            .scripted_health(&current.digest)
            .unwrap_or(ServiceHealth {
                healthy: desired,
                desired,
                recent_restarts: 0,
            }))
    }
}
