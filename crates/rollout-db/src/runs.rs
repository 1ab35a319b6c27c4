//! Run repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollout_core::pipeline::{Run, RunStatus, StageResult, Trigger};
use rollout_core::store::RunStore;
use rollout_core::RunId;
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::{DbError, DbResult};

const OPEN_STATUSES: [&str; 2] = ["pending", "running"];

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    service: String,
    revision_id: String,
    trigger_kind: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct StageRow {
    run_id: Uuid,
    result: Json<StageResult>,
}

impl RunRow {
    fn into_run(self, stages: Vec<StageResult>) -> DbResult<Run> {
        let corrupt = |e: rollout_core::Error| DbError::Corrupt(format!("run {}: {}", self.id, e));
        let trigger = Trigger {
            revision_id: self.revision_id.clone(),
            trigger_kind: self.trigger_kind.parse().map_err(corrupt)?,
            target_service: self.service.clone(),
        };
        let status: RunStatus = self.status.parse().map_err(corrupt)?;

        Ok(Run {
            id: RunId::from_uuid(self.id),
            trigger,
            status,
            stage: stages.last().map(|s| s.stage),
            stages,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

/// PostgreSQL implementation of [`RunStore`].
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_run(&self, run: &Run) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (id, service, revision_id, trigger_kind, status, created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.service())
        .bind(&run.trigger.revision_id)
        .bind(run.trigger.trigger_kind.to_string())
        .bind(run.status.to_string())
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Duplicate(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn insert_stage(&self, run_id: RunId, stage: &StageResult) -> DbResult<()> {
        // Appends only while the run is open; seq continues the run's sequence.
        let result = sqlx::query(
            r#"
            INSERT INTO stage_results (run_id, seq, stage, status, result)
            SELECT $1,
                   COALESCE((SELECT MAX(seq) + 1 FROM stage_results WHERE run_id = $1), 0),
                   $2, $3, $4
            WHERE EXISTS (SELECT 1 FROM runs WHERE id = $1 AND status = ANY($5))
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(stage.stage.as_str())
        .bind(stage.status.to_string())
        .bind(Json(stage))
        .bind(&OPEN_STATUSES[..])
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(format!(
                "stage {} of run {}",
                stage.stage, run_id
            )),
            _ => DbError::Database(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(self.closed_or_missing(run_id).await);
        }
        Ok(())
    }

    async fn update_status(&self, run_id: RunId, status: RunStatus, at: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2,
                started_at = CASE WHEN $2 = 'running' THEN $3 ELSE started_at END,
                finished_at = CASE WHEN $4 THEN $3 ELSE finished_at END
            WHERE id = $1 AND status = ANY($5)
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(status.to_string())
        .bind(at)
        .bind(status.is_terminal())
        .bind(&OPEN_STATUSES[..])
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.closed_or_missing(run_id).await);
        }
        Ok(())
    }

    async fn closed_or_missing(&self, run_id: RunId) -> DbError {
        let exists: DbResult<Option<(String,)>> = sqlx::query_as("SELECT status FROM runs WHERE id = $1")
            .bind(run_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from);

        match exists {
            Ok(Some((status,))) => {
                DbError::Conflict(format!("run {run_id} is {status} and cannot change"))
            }
            Ok(None) => DbError::NotFound(format!("run {run_id}")),
            Err(e) => e,
        }
    }

    async fn stages_for(&self, run_ids: &[Uuid]) -> DbResult<HashMap<Uuid, Vec<StageResult>>> {
        let rows = sqlx::query_as::<_, StageRow>(
            "SELECT run_id, result FROM stage_results WHERE run_id = ANY($1) ORDER BY run_id, seq",
        )
        .bind(run_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut stages: HashMap<Uuid, Vec<StageResult>> = HashMap::new();
        for row in rows {
            stages.entry(row.run_id).or_default().push(row.result.0);
        }
        Ok(stages)
    }

    async fn fetch_run(&self, run_id: RunId) -> DbResult<Run> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = $1")
            .bind(run_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("run {}", run_id)))?;

        let mut stages = self.stages_for(&[row.id]).await?;
        let run_stages = stages.remove(&row.id).unwrap_or_default();
        row.into_run(run_stages)
    }

    async fn fetch_for_service(&self, service: &str, limit: usize) -> DbResult<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM runs
            WHERE service = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(service)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut stages = self.stages_for(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let run_stages = stages.remove(&row.id).unwrap_or_default();
                row.into_run(run_stages)
            })
            .collect()
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create(&self, run: &Run) -> rollout_core::Result<()> {
        self.insert_run(run).await?;
        for stage in &run.stages {
            self.insert_stage(run.id, stage).await?;
        }
        Ok(())
    }

    async fn append(&self, run_id: RunId, result: &StageResult) -> rollout_core::Result<()> {
        Ok(self.insert_stage(run_id, result).await?)
    }

    async fn set_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> rollout_core::Result<()> {
        Ok(self.update_status(run_id, status, at).await?)
    }

    async fn get(&self, run_id: RunId) -> rollout_core::Result<Run> {
        Ok(self.fetch_run(run_id).await?)
    }

    async fn list_for_service(&self, service: &str, limit: usize) -> rollout_core::Result<Vec<Run>> {
        Ok(self.fetch_for_service(service, limit).await?)
    }
}
