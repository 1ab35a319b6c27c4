//! API routes.

pub mod health;
pub mod runs;
pub mod services;

use crate::AppState;
use crate::ws::ws_handler;
use axum::Router;
use axum::routing::get;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .route("/ws", get(ws_handler))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/runs", runs::router())
        .nest("/services", services::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, Response, StatusCode};
    use rollout_config::parse_pipeline_config;
    use rollout_core::clock::{Clock, SystemClock};
    use rollout_core::gate::{Category, CheckReport, GateCheck};
    use rollout_core::store::DeploymentStateStore;
    use rollout_core::{Error, Result};
    use rollout_db::{MemoryDeploymentState, MemoryRunStore};
    use rollout_scheduler::{PipelineOrchestrator, ServicePipeline, backends_for};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    const PIPELINE: &str = r#"
pipeline "rates" {
    service "rates"
}
deploy "memory" ready-timeout="1s"
verify interval="10ms" window="0s" timeout="1s"
"#;

    /// Passes once a permit is available.
    struct HeldCheck {
        permits: Arc<Semaphore>,
    }

    #[async_trait]
    impl GateCheck for HeldCheck {
        fn name(&self) -> &str {
            "held"
        }

        fn category(&self) -> Category {
            Category::Test
        }

        async fn run(&self, _revision: &str) -> Result<CheckReport> {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            Ok(CheckReport::clean())
        }
    }

    async fn test_state(permits: Arc<Semaphore>) -> AppState {
        let config = parse_pipeline_config(PIPELINE).unwrap();
        let mut backends = backends_for(&config).await.unwrap();
        backends.checks = vec![Arc::new(HeldCheck { permits })];

        let deployments: Arc<dyn DeploymentStateStore> = Arc::new(MemoryDeploymentState::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pipeline = ServicePipeline::new(config, backends, deployments.clone(), clock);
        let orchestrator = PipelineOrchestrator::new([pipeline], Arc::new(MemoryRunStore::new()));
        AppState::new(orchestrator, deployments)
    }

    async fn open_state() -> AppState {
        test_state(Arc::new(Semaphore::new(Semaphore::MAX_PERMITS))).await
    }

    async fn send(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> Response<Body> {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        router(state.clone())
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn trigger(service: &str) -> Value {
        json!({
            "revisionId": "abc1234def",
            "triggerKind": "push",
            "targetService": service,
        })
    }

    async fn start_run(state: &AppState) -> String {
        let response = send(state, "POST", "/api/v1/runs", Some(trigger("rates"))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        json_body(response).await["id"].as_str().unwrap().to_string()
    }

    /// Poll the run until it reaches `status`.
    async fn wait_for_status(state: &AppState, id: &str, status: &str) -> Value {
        for _ in 0..200 {
            let response = send(state, "GET", &format!("/api/v1/runs/{id}"), None).await;
            assert_eq!(response.status(), StatusCode::OK);
            let run = json_body(response).await;
            if run["status"] == status {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_health() {
        let state = open_state().await;

        let response = send(&state, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let ready = json_body(send(&state, "GET", "/health/ready", None).await).await;
        assert_eq!(ready["services"], json!(["rates"]));
    }

    #[tokio::test]
    async fn test_triggered_run_records_known_good_artifact() {
        let state = open_state().await;

        let id = start_run(&state).await;
        let run = wait_for_status(&state, &id, "succeeded").await;
        assert_eq!(run["stages"].as_array().unwrap().len(), 6);

        let response = send(&state, "GET", "/api/v1/services/rates/state", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let record = json_body(response).await;
        assert_eq!(record["service"], "rates");
        assert_eq!(record["run_id"], json!(id));

        let runs = json_body(send(&state, "GET", "/api/v1/services/rates/runs", None).await).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_trigger_conflicts_while_run_is_active() {
        let permits = Arc::new(Semaphore::new(0));
        let state = test_state(permits.clone()).await;

        let id = start_run(&state).await;
        let response = send(&state, "POST", "/api/v1/runs", Some(trigger("rates"))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("already in progress"));

        permits.add_permits(1);
        wait_for_status(&state, &id, "succeeded").await;
    }

    #[tokio::test]
    async fn test_cancel_active_run() {
        let state = test_state(Arc::new(Semaphore::new(0))).await;

        let id = start_run(&state).await;
        let response = send(&state, "POST", &format!("/api/v1/runs/{id}/cancel"), None).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let run = wait_for_status(&state, &id, "cancelled").await;
        assert_eq!(run["stages"][0]["stage"], "gate");

        // Once finished, the run can no longer be cancelled.
        let response = send(&state, "POST", &format!("/api/v1/runs/{id}/cancel"), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_service_is_bad_request() {
        let state = open_state().await;

        let response = send(&state, "POST", "/api/v1/runs", Some(trigger("ledger"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_revision_is_bad_request() {
        let state = open_state().await;
        let mut body = trigger("rates");
        body["revisionId"] = json!("  ");

        let response = send(&state, "POST", "/api/v1/runs", Some(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_lookup_errors() {
        let state = open_state().await;

        let response = send(&state, "GET", "/api/v1/runs/not-a-uuid", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let missing = rollout_core::RunId::new();
        let response = send(&state, "GET", &format!("/api/v1/runs/{missing}"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&state, "POST", &format!("/api/v1/runs/{missing}/cancel"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_state_without_deployment_is_not_found() {
        let state = open_state().await;

        let response = send(&state, "GET", "/api/v1/services/rates/state", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&state, "GET", "/api/v1/services/ledger/state", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
