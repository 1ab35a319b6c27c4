//! Deployment state repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollout_core::artifact::ArtifactRef;
use rollout_core::store::{DeploymentRecord, DeploymentStateStore};
use rollout_core::RunId;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

use crate::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct StateRow {
    service: String,
    artifact: Json<ArtifactRef>,
    run_id: Option<Uuid>,
    updated_at: DateTime<Utc>,
}

impl From<StateRow> for DeploymentRecord {
    fn from(row: StateRow) -> Self {
        DeploymentRecord {
            service: row.service,
            artifact: row.artifact.0,
            run_id: row.run_id.map(RunId::from_uuid),
            updated_at: row.updated_at,
        }
    }
}

/// PostgreSQL implementation of [`DeploymentStateStore`].
pub struct PgDeploymentState {
    pool: PgPool,
}

impl PgDeploymentState {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, service: &str) -> DbResult<Option<DeploymentRecord>> {
        let row = sqlx::query_as::<_, StateRow>(
            "SELECT service, artifact, run_id, updated_at FROM deployment_state WHERE service = $1",
        )
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DeploymentRecord::from))
    }

    /// Upsert in a single statement. Every CTE sees the same snapshot, so
    /// `previous` is the row as it was before the write.
    async fn upsert(&self, record: &DeploymentRecord) -> DbResult<Option<DeploymentRecord>> {
        let previous = sqlx::query_as::<_, StateRow>(
            r#"
            WITH previous AS (
                SELECT service, artifact, run_id, updated_at
                FROM deployment_state
                WHERE service = $1
            ),
            upsert AS (
                INSERT INTO deployment_state (service, artifact, run_id, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (service) DO UPDATE
                SET artifact = EXCLUDED.artifact,
                    run_id = EXCLUDED.run_id,
                    updated_at = EXCLUDED.updated_at
            )
            SELECT service, artifact, run_id, updated_at FROM previous
            "#,
        )
        .bind(&record.service)
        .bind(Json(&record.artifact))
        .bind(record.run_id.map(|id| *id.as_uuid()))
        .bind(record.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        debug!(service = %record.service, digest = %record.artifact.digest, "Stored deployment state");
        Ok(previous.map(DeploymentRecord::from))
    }
}

#[async_trait]
impl DeploymentStateStore for PgDeploymentState {
    async fn get(&self, service: &str) -> rollout_core::Result<Option<DeploymentRecord>> {
        Ok(self.fetch(service).await?)
    }

    async fn put(&self, record: DeploymentRecord) -> rollout_core::Result<Option<DeploymentRecord>> {
        Ok(self.upsert(&record).await?)
    }
}
