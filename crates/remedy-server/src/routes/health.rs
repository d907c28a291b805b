//! Host liveness and runtime summary.

use axum::extract::State;
use axum::{Json, Router, routing::get};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// What `/health` reports about this process.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Runs currently executing in this process.
    pub runs_in_flight: usize,
    /// Whether artifact uploads can be stored.
    pub artifacts_enabled: bool,
}

/// GET /health, served without a token.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = &state.engine;
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        runs_in_flight: engine.scheduler().in_flight(),
        artifacts_enabled: engine.artifacts().is_some(),
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use remedy_config::RemedyConfig;
    use remedy_engine::Engine;
    use remedy_store::Store;
    use tower::ServiceExt;

    use crate::config::ServerConfig;

    #[tokio::test]
    async fn test_health_reports_engine_state() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = Engine::new(RemedyConfig::default(), store).unwrap();
        let state = AppState::new(engine, ServerConfig::default());
        let app = health_routes().with_state(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.runs_in_flight, 0);
        assert!(!health.artifacts_enabled);
    }
}
