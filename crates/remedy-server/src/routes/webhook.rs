//! Webhook receiver.

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use tracing::info;

use remedy_engine::WebhookRequest;

use crate::error::ServerError;
use crate::state::AppState;

/// POST /webhook/{*path}
///
/// Authenticated by the playbook's own webhook settings, not the API token.
pub async fn webhook_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let mut request = WebhookRequest::new(body.to_vec());
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    request.query = query;

    let run = state.engine.handle_webhook(&path, &request).await?;
    info!(run_id = %run.id, path, "Webhook accepted");
    Ok(StatusCode::OK)
}
