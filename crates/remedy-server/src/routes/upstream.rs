//! Agent upstream endpoints: pull, push and artifact upload.

use std::io;

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tracing::debug;

use remedy_types::{ActionEnvelope, Artifact, PushData};

use crate::error::ServerError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    pub agent_name: String,
}

/// GET /upstream/playbook-action?agent_name=
///
/// `{}` when the agent has nothing to do.
pub async fn pull_handler(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
) -> Result<Json<ActionEnvelope>, ServerError> {
    if query.agent_name.trim().is_empty() {
        return Err(ServerError::BadRequest("agent_name is required".into()));
    }
    let envelope = state
        .engine
        .pull(&query.agent_name)?
        .map(ActionEnvelope::from)
        .unwrap_or_default();
    Ok(Json(envelope))
}

/// POST /upstream/push
pub async fn push_handler(
    State(state): State<AppState>,
    Json(data): Json<PushData>,
) -> Result<StatusCode, ServerError> {
    debug!(
        actions = data.actions.len(),
        artifacts = data.artifacts.len(),
        "Push received"
    );
    state.engine.push(data)?;
    Ok(StatusCode::OK)
}

/// POST /upstream/artifact/{id}
///
/// The body is streamed straight into the artifact store.
pub async fn upload_artifact_handler(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
    body: Body,
) -> Result<Json<Artifact>, ServerError> {
    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);
    let artifact = state.engine.receive_artifact(&artifact_id, reader).await?;
    Ok(Json(artifact))
}
