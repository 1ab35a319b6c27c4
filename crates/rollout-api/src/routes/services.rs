//! Per-service endpoints: deployment state, run history and rollback.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use rollout_core::deployer::RollbackResult;
use rollout_core::pipeline::Run;
use rollout_core::store::DeploymentRecord;
use rollout_core::RunId;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_services))
        .route("/{service}/state", get(get_state))
        .route("/{service}/runs", get(list_runs))
        .route("/{service}/rollback", post(rollback))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceResponse {
    service: String,
    active_run: Option<RunId>,
}

fn ensure_configured(state: &AppState, service: &str) -> Result<(), ApiError> {
    if state.orchestrator.pipeline(service).is_none() {
        return Err(ApiError::NotFound(format!("no pipeline for service {service}")));
    }
    Ok(())
}

async fn list_services(State(state): State<AppState>) -> Json<Vec<ServiceResponse>> {
    let services = state
        .orchestrator
        .services()
        .into_iter()
        .map(|service| ServiceResponse {
            service: service.to_string(),
            active_run: state.orchestrator.active_run(service),
        })
        .collect();
    Json(services)
}

async fn get_state(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    ensure_configured(&state, &service)?;
    let record = state.deployments.get(&service).await?.ok_or_else(|| {
        ApiError::NotFound(format!("no known-good artifact recorded for {service}"))
    })?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

async fn list_runs(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    ensure_configured(&state, &service)?;
    let runs = state.runs().list_for_service(&service, query.limit).await?;
    Ok(Json(runs))
}

/// Roll back to the last known-good artifact. Waits for verification.
async fn rollback(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<RollbackResult>, ApiError> {
    ensure_configured(&state, &service)?;
    let result = state.orchestrator.rollback(&service).await?;
    Ok(Json(result))
}
