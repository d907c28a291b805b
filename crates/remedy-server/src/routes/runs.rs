//! Run submission, inspection, cancellation and approval.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;
use uuid::Uuid;

use remedy_types::{ArtifactList, Run, RunCreated, RunDetail, RunRequest};

use crate::auth::Caller;
use crate::error::ServerError;
use crate::state::AppState;

/// POST /playbook/run
pub async fn submit_run_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<RunCreated>), ServerError> {
    let created = state.engine.submit_run(&request, caller.0.as_ref())?;
    info!(run_id = %created.run_id, playbook_id = %request.id, "Run submitted");
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /playbook/run/{id}
pub async fn get_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDetail>, ServerError> {
    Ok(Json(state.engine.get_run_detail(run_id)?))
}

/// POST /playbook/run/{id}/cancel
pub async fn cancel_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Run>, ServerError> {
    Ok(Json(state.engine.cancel_run(run_id)?))
}

/// GET /playbook/run/{id}/actions/{action_id}/artifacts
pub async fn list_artifacts_handler(
    State(state): State<AppState>,
    Path((run_id, action_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ArtifactList>, ServerError> {
    Ok(Json(state.engine.list_artifacts(run_id, action_id)?))
}

/// POST /playbook/{playbook_id}/run/{run_id}/approve
pub async fn approve_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((playbook_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Run>, ServerError> {
    let principal = caller.require()?;
    Ok(Json(state.engine.approve(playbook_id, run_id, principal)?))
}

/// POST /playbook/{playbook_id}/run/{run_id}/reject
pub async fn reject_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((playbook_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Run>, ServerError> {
    let principal = caller.require()?;
    Ok(Json(state.engine.reject(playbook_id, run_id, principal)?))
}
