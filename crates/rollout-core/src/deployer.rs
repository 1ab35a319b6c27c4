//! Compute platform trait and deployment outcome types.
//!
//! Platforms run services (Kubernetes deployments, ECS services, ...). The
//! pipeline only asks them to roll a service onto a new artifact and reports
//! back instance health.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;
use crate::artifact::ArtifactRef;

/// Platform identifier of the instance set started by an update
/// (a ReplicaSet revision, an ECS task set, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct TaskSetId(String);

impl TaskSetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Health snapshot of a service's instances running the target artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub healthy: u32,
    pub desired: u32,
    /// Restarts of target instances within the platform's recent window.
    pub recent_restarts: u32,
}

impl std::fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} healthy, {} recent restarts",
            self.healthy, self.desired, self.recent_restarts
        )
    }
}

/// Trait for managed compute platforms.
#[async_trait]
pub trait ComputePlatform: Send + Sync {
    /// Name of this platform.
    fn name(&self) -> &'static str;

    /// Start a rolling replacement of the service's running artifact.
    ///
    /// New instances are started before old ones are removed; the call
    /// returns once the platform accepted the update.
    async fn update_service(&self, service: &str, artifact: &ArtifactRef) -> Result<TaskSetId>;

    /// Current health of the instances running the most recent update.
    async fn service_health(&self, service: &str) -> Result<ServiceHealth>;
}

/// Outcome of a successful deploy call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub service: String,
    pub artifact: ArtifactRef,
    /// Last known-good artifact before this deploy, if any.
    pub previous: Option<ArtifactRef>,
    pub task_set: TaskSetId,
}

/// How a verification ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// Minimum healthy instances held for the whole stabilization window.
    Stable,
    /// The timeout elapsed before the service stabilized.
    TimedOut,
    /// Instances kept restarting.
    CrashLoop,
}

impl std::fmt::Display for VerifyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyOutcome::Stable => write!(f, "stable"),
            VerifyOutcome::TimedOut => write!(f, "timed out"),
            VerifyOutcome::CrashLoop => write!(f, "crash loop"),
        }
    }
}

/// Outcome of waiting for a service to become healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub service: String,
    pub outcome: VerifyOutcome,
    /// Last observed health, if any probe succeeded.
    pub last_health: Option<ServiceHealth>,
    pub polls: u32,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl VerifyResult {
    pub fn is_stable(&self) -> bool {
        self.outcome == VerifyOutcome::Stable
    }

    pub fn describe(&self) -> String {
        match &self.last_health {
            Some(health) => format!(
                "{} after {} polls ({:?}); last observed {}",
                self.outcome, self.polls, self.elapsed, health
            ),
            None => format!(
                "{} after {} polls ({:?}); no successful health probe",
                self.outcome, self.polls, self.elapsed
            ),
        }
    }
}

/// Outcome of a rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub service: String,
    /// Artifact the service was rolled back to.
    pub restored: ArtifactRef,
    pub verify: VerifyResult,
    pub finished_at: DateTime<Utc>,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
