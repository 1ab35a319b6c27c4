//! Run trigger, query and cancellation endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rollout_core::pipeline::{Run, Trigger};
use rollout_core::{Error, RunId};
use serde::Serialize;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(trigger_run))
        .route("/{id}", get(get_run))
        .route("/{id}/cancel", post(cancel_run))
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    id: RunId,
}

fn parse_run_id(id: &str) -> Result<RunId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid run id: {id}")))
}

/// Start a run in the background. The response only acknowledges the
/// trigger; progress is read from the run record.
async fn trigger_run(
    State(state): State<AppState>,
    Json(trigger): Json<Trigger>,
) -> Result<(StatusCode, Json<RunAccepted>), ApiError> {
    let handle = state.orchestrator.start(trigger).await.map_err(|e| match e {
        // The target of the trigger is part of the request body.
        Error::NotFound(msg) => ApiError::BadRequest(msg),
        other => other.into(),
    })?;

    info!(run_id = %handle.id(), service = %handle.service(), "Run accepted");
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { id: handle.id() })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state.runs().get(run_id).await?;
    Ok(Json(run))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunAccepted>), ApiError> {
    let run_id = parse_run_id(&id)?;

    if let Err(e) = state.orchestrator.cancel(run_id) {
        // Tell a finished run apart from one that never existed.
        let run = state.runs().get(run_id).await?;
        if run.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "run {run_id} already finished with status {}",
                run.status
            )));
        }
        return Err(e.into());
    }

    Ok((StatusCode::ACCEPTED, Json(RunAccepted { id: run_id })))
}
