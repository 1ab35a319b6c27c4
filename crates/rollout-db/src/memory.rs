//! In-memory stores with the same semantics as the PostgreSQL ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollout_core::pipeline::{Run, RunStatus, StageResult};
use rollout_core::store::{DeploymentRecord, DeploymentStateStore, RunStore};
use rollout_core::{Error, Result, RunId};
use std::collections::HashMap;
use std::sync::Mutex;

/// Run records held in a map.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<RunId, Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_open_run<T>(&self, run_id: RunId, f: impl FnOnce(&mut Run) -> T) -> Result<T> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
        if run.is_terminal() {
            return Err(Error::Storage(format!(
                "run {run_id} is {} and cannot change",
                run.status
            )));
        }
        Ok(f(run))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.contains_key(&run.id) {
            return Err(Error::Storage(format!("duplicate: run {}", run.id)));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn append(&self, run_id: RunId, result: &StageResult) -> Result<()> {
        self.with_open_run(run_id, |run| {
            if run.stages.iter().any(|r| r.stage == result.stage) {
                return Err(Error::Storage(format!(
                    "duplicate: stage {} of run {run_id}",
                    result.stage
                )));
            }
            run.stage = Some(result.stage);
            run.stages.push(result.clone());
            Ok(())
        })?
    }

    async fn set_status(&self, run_id: RunId, status: RunStatus, at: DateTime<Utc>) -> Result<()> {
        self.with_open_run(run_id, |run| {
            run.status = status;
            if status == RunStatus::Running {
                run.started_at = Some(at);
            }
            if status.is_terminal() {
                run.finished_at = Some(at);
            }
        })
    }

    async fn get(&self, run_id: RunId) -> Result<Run> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))
    }

    async fn list_for_service(&self, service: &str, limit: usize) -> Result<Vec<Run>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<Run> = runs
            .values()
            .filter(|r| r.service() == service)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(limit);
        Ok(matching)
    }
}

/// Deployment state held in a map.
#[derive(Default)]
pub struct MemoryDeploymentState {
    records: Mutex<HashMap<String, DeploymentRecord>>,
}

impl MemoryDeploymentState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStateStore for MemoryDeploymentState {
    async fn get(&self, service: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .cloned())
    }

    async fn put(&self, record: DeploymentRecord) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.service.clone(), record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_core::artifact::ArtifactRef;
    use rollout_core::pipeline::{Stage, StageOutput, Trigger, TriggerKind};

    fn run(service: &str) -> Run {
        Run::new(Trigger::new("abc123", TriggerKind::Push, service))
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let store = MemoryRunStore::new();
        let run = run("rates");
        store.create(&run).await.unwrap();
        store
            .set_status(run.id, RunStatus::Running, Utc::now())
            .await
            .unwrap();

        let gate = StageResult::passed(Stage::Gate, StageOutput::None, Utc::now());
        store.append(run.id, &gate).await.unwrap();

        let loaded = store.get(run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert!(loaded.started_at.is_some());
        assert_eq!(loaded.stages, vec![gate]);
    }

    #[tokio::test]
    async fn test_terminal_run_rejects_writes() {
        let store = MemoryRunStore::new();
        let run = run("rates");
        store.create(&run).await.unwrap();
        store
            .set_status(run.id, RunStatus::Cancelled, Utc::now())
            .await
            .unwrap();

        let gate = StageResult::passed(Stage::Gate, StageOutput::None, Utc::now());
        assert!(store.append(run.id, &gate).await.is_err());
        assert!(
            store
                .set_status(run.id, RunStatus::Succeeded, Utc::now())
                .await
                .is_err()
        );
        assert_eq!(store.get(run.id).await.unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stage_results_are_not_replaced() {
        let store = MemoryRunStore::new();
        let run = run("rates");
        store.create(&run).await.unwrap();

        let gate = StageResult::passed(Stage::Gate, StageOutput::None, Utc::now());
        store.append(run.id, &gate).await.unwrap();
        assert!(store.append(run.id, &gate).await.is_err());
    }

    #[tokio::test]
    async fn test_list_for_service_newest_first() {
        let store = MemoryRunStore::new();
        let first = run("rates");
        let mut second = run("rates");
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        store.create(&first).await.unwrap();
        store.create(&second).await.unwrap();
        store.create(&run("other")).await.unwrap();

        let runs = store.list_for_service("rates", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);

        assert_eq!(store.list_for_service("rates", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_run() {
        let store = MemoryRunStore::new();
        assert!(matches!(
            store.get(RunId::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deployment_state_put_returns_previous() {
        let state = MemoryDeploymentState::new();
        let record = |digest: &str| DeploymentRecord {
            service: "rates".to_string(),
            artifact: ArtifactRef {
                repository: "local/rates".to_string(),
                digest: digest.to_string(),
                tag: "t".to_string(),
                published_at: Utc::now(),
            },
            run_id: None,
            updated_at: Utc::now(),
        };

        assert!(state.put(record("sha256:v1")).await.unwrap().is_none());
        let previous = state.put(record("sha256:v2")).await.unwrap().unwrap();

        assert_eq!(previous.artifact.digest, "sha256:v1");
        assert_eq!(
            state.get("rates").await.unwrap().unwrap().artifact.digest,
            "sha256:v2"
        );
    }
}
