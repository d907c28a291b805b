//! HTTP surface for Remedy.
//!
//! Serves the run API (submit, inspect, cancel, approve, reject), the
//! webhook receiver and the upstream endpoints agents pull work from.
//!
//! # Example
//!
//! ```ignore
//! use remedy_server::{Server, ServerConfig};
//!
//! let engine = Engine::open(config.clone())?;
//! let server = Server::new(engine, ServerConfig::from_remedy(&config)?);
//! server.run(shutdown).await?;
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use auth::{Caller, auth_middleware};
pub use config::ServerConfig;
pub use error::{ErrorResponse, Result, ServerError};
pub use state::AppState;

use std::net::SocketAddr;

use axum::{Router, extract::DefaultBodyLimit, middleware};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use remedy_engine::Engine;

/// The Remedy HTTP server.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(engine: Engine, config: ServerConfig) -> Self {
        Self {
            state: AppState::new(engine, config),
        }
    }

    pub fn from_state(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        use axum::routing::post;

        Router::new()
            .merge(routes::health_routes())
            // Webhooks authenticate with the playbook's own scheme.
            .route("/webhook/{*path}", post(routes::webhook_handler))
            .merge(self.api_routes())
            .layer(DefaultBodyLimit::max(self.state.config().max_body_size))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Routes behind the bearer token.
    fn api_routes(&self) -> Router<AppState> {
        use axum::routing::{get, post};

        Router::new()
            .route("/playbook/run", post(routes::submit_run_handler))
            .route("/playbook/run/{id}", get(routes::get_run_handler))
            .route("/playbook/run/{id}/cancel", post(routes::cancel_run_handler))
            .route(
                "/playbook/run/{id}/actions/{action_id}/artifacts",
                get(routes::list_artifacts_handler),
            )
            .route(
                "/playbook/{playbook_id}/run/{run_id}/approve",
                post(routes::approve_handler),
            )
            .route(
                "/playbook/{playbook_id}/run/{run_id}/reject",
                post(routes::reject_handler),
            )
            .route("/upstream/playbook-action", get(routes::pull_handler))
            .route("/upstream/push", post(routes::push_handler))
            .route(
                "/upstream/artifact/{id}",
                post(routes::upload_artifact_handler),
            )
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::auth_middleware,
            ))
    }

    /// Serve on the configured address until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.state.config().bind_address;
        self.run_on(addr, shutdown).await
    }

    /// Serve on a specific address until `shutdown` fires.
    pub async fn run_on(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let router = self.router();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to bind {addr}: {e}")))?;
        info!(addr = %addr, "Server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| ServerError::Internal(format!("Server error: {e}")))?;

        info!("Server stopped");
        Ok(())
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.state.config().bind_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, Response, StatusCode, header::CONTENT_TYPE},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use remedy_client::USER_HEADER;
    use remedy_config::RemedyConfig;
    use remedy_store::Store;
    use remedy_types::{
        ApprovalSpec, Approvers, ExecAction, GithubAuth, Person, Playbook, PlaybookAction,
        PlaybookSpec, RunStatus, Triggers, WebhookAuth, WebhookTrigger,
    };

    const TOKEN: &str = "t0k";

    fn engine() -> Engine {
        let store = Arc::new(Store::open_in_memory().unwrap());
        Engine::new(RemedyConfig::default(), store).unwrap()
    }

    fn app(engine: &Engine, token: Option<&str>) -> Router {
        Server::new(engine.clone(), ServerConfig::new(token.map(String::from))).router()
    }

    fn exec(name: &str) -> PlaybookAction {
        PlaybookAction {
            name: name.into(),
            exec: Some(ExecAction {
                script: "true".into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn save(engine: &Engine, name: &str, spec: PlaybookSpec) -> Playbook {
        engine
            .store()
            .upsert_playbook(&Playbook::new(name, spec))
            .unwrap()
    }

    fn post_json(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response: Response<Body> = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn submit(app: Router, body: Value) -> (StatusCode, Value) {
        let request = post_json("/playbook/run")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(app, request).await
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let engine = engine();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app(&engine, Some(TOKEN)), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let engine = engine();
        let request = Request::builder()
            .uri(format!("/playbook/run/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(&engine, Some(TOKEN)), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_submit_and_inspect_run() {
        let engine = engine();
        let playbook = save(
            &engine,
            "p",
            PlaybookSpec {
                actions: vec![exec("a")],
                ..Default::default()
            },
        );
        let (status, created) = submit(app(&engine, None), json!({"id": playbook.id})).await;
        assert_eq!(status, StatusCode::CREATED);
        let run_id = created["run_id"].as_str().unwrap().to_string();
        assert!(created["starts_at"].is_string());

        let request = Request::builder()
            .uri(format!("/playbook/run/{run_id}"))
            .body(Body::empty())
            .unwrap();
        let (status, detail) = send(app(&engine, None), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["run"]["id"], run_id.as_str());
        assert_eq!(detail["run"]["status"], "scheduled");
    }

    #[tokio::test]
    async fn test_submit_errors() {
        let engine = engine();
        let (status, body) = submit(app(&engine, None), json!({"id": Uuid::new_v4()})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        let playbook = save(
            &engine,
            "p",
            PlaybookSpec {
                actions: vec![exec("a")],
                ..Default::default()
            },
        );
        let (status, _) = submit(
            app(&engine, None),
            json!({"id": playbook.id, "params": {"undeclared": "1"}}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let engine = engine();
        let playbook = save(
            &engine,
            "p",
            PlaybookSpec {
                actions: vec![exec("a")],
                ..Default::default()
            },
        );
        let (_, created) = submit(app(&engine, None), json!({"id": playbook.id})).await;
        let uri = format!("/playbook/run/{}/cancel", created["run_id"].as_str().unwrap());

        let cancel = || {
            post_json(&uri)
                .body(Body::from("{}"))
                .unwrap()
        };
        let (status, run) = send(app(&engine, None), cancel()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["status"], "cancelled");

        let (status, _) = send(app(&engine, None), cancel()).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_approve_requires_caller() {
        let engine = engine();
        engine
            .store()
            .upsert_person(&Person {
                id: Uuid::new_v4(),
                name: "Jane".into(),
                email: "jane@x".into(),
            })
            .unwrap();
        let playbook = save(
            &engine,
            "p",
            PlaybookSpec {
                approval: Some(ApprovalSpec {
                    approvers: Approvers {
                        people: vec!["jane@x".into()],
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                actions: vec![exec("a")],
                ..Default::default()
            },
        );
        let (_, created) = submit(app(&engine, None), json!({"id": playbook.id})).await;
        let uri = format!(
            "/playbook/{}/run/{}/approve",
            playbook.id,
            created["run_id"].as_str().unwrap()
        );

        let anonymous = post_json(&uri).body(Body::from("{}")).unwrap();
        let (status, _) = send(app(&engine, None), anonymous).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let jane = post_json(&uri)
            .header(USER_HEADER, "jane@x")
            .body(Body::from("{}"))
            .unwrap();
        let (status, run) = send(app(&engine, None), jane).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["status"], "scheduled");
    }

    #[tokio::test]
    async fn test_github_webhook() {
        let engine = engine();
        save(
            &engine,
            "hooked",
            PlaybookSpec {
                on: Triggers {
                    webhook: Some(WebhookTrigger {
                        path: "x".into(),
                        authentication: Some(WebhookAuth {
                            github: Some(GithubAuth {
                                token: "It's a Secret to Everybody".into(),
                            }),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
                actions: vec![exec("a")],
                ..Default::default()
            },
        );
        let signature =
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        let hook = |body: &'static str| {
            Request::builder()
                .method("POST")
                .uri("/webhook/x")
                .header("X-Hub-Signature-256", signature)
                .body(Body::from(body))
                .unwrap()
        };

        // The API token does not apply to webhooks.
        let (status, _) = send(app(&engine, Some(TOKEN)), hook("Hello, World!")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(app(&engine, Some(TOKEN)), hook("Bye, World!")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let runs = engine.store().runs_with_status(RunStatus::Scheduled).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(
            runs[0].request.as_ref().unwrap()["body"],
            "Hello, World!"
        );
    }

    #[tokio::test]
    async fn test_unknown_webhook_path() {
        let engine = engine();
        let request = Request::builder()
            .method("POST")
            .uri("/webhook/nowhere")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(&engine, None), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pull_with_no_work_is_empty_envelope() {
        let engine = engine();
        let request = Request::builder()
            .uri("/upstream/playbook-action?agent_name=a1")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(&engine, Some(TOKEN)), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));

        let push = post_json("/upstream/push")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body(Body::from(json!({"actions": [], "artifacts": []}).to_string()))
            .unwrap();
        let (status, _) = send(app(&engine, Some(TOKEN)), push).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_artifact_upload_without_store_is_not_implemented() {
        let engine = engine();
        let request = Request::builder()
            .method("POST")
            .uri(format!("/upstream/artifact/{}", Uuid::new_v4()))
            .body(Body::from("data"))
            .unwrap();
        let (status, _) = send(app(&engine, None), request).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_artifact_upload_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RemedyConfig::default();
        config.artifacts = Some(remedy_config::ArtifactsConfig {
            connection: Some(format!("file://{}", dir.path().display())),
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = Engine::new(config, store).unwrap();

        let upload = |id: String| {
            Request::builder()
                .method("POST")
                .uri(format!("/upstream/artifact/{id}"))
                .body(Body::from("data"))
                .unwrap()
        };
        let (status, _) = send(app(&engine, None), upload("not-a-uuid".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(app(&engine, None), upload(Uuid::new_v4().to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
