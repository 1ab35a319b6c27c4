//! Persistence traits for run records and deployment state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactRef;
use crate::pipeline::{Run, RunStatus, StageResult};
use crate::{Result, RunId};

/// Append-only record of runs and their stage results.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a newly created run.
    async fn create(&self, run: &Run) -> Result<()>;

    /// Append a stage result. Results are never updated in place.
    async fn append(&self, run_id: RunId, result: &StageResult) -> Result<()>;

    /// Record a status change (start or terminal status).
    async fn set_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Fetch a run with all its stage results.
    async fn get(&self, run_id: RunId) -> Result<Run>;

    /// Most recent runs for a service, newest first.
    async fn list_for_service(&self, service: &str, limit: usize) -> Result<Vec<Run>>;
}

/// Last known-good deployment of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub service: String,
    pub artifact: ArtifactRef,
    /// Run that verified this artifact, if it came from a run.
    pub run_id: Option<RunId>,
    pub updated_at: DateTime<Utc>,
}

/// Keyed store of last known-good artifacts per service.
///
/// Records are replaced atomically and never deleted, so once a service has
/// had one verified deploy a rollback target always exists.
#[async_trait]
pub trait DeploymentStateStore: Send + Sync {
    async fn get(&self, service: &str) -> Result<Option<DeploymentRecord>>;

    /// Replace the known-good artifact, returning the record it replaced.
    async fn put(&self, record: DeploymentRecord) -> Result<Option<DeploymentRecord>>;
}
