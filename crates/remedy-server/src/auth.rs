//! Authentication middleware.
//!
//! API routes take a bearer token when one is configured. The acting user,
//! needed for approvals and recorded as a run's creator, is named by the
//! `X-Remedy-User` header and resolved to a person and their teams.
//!
//! Token comparison is constant-time.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::debug;

use remedy_client::USER_HEADER;
use remedy_types::Principal;

use crate::error::ServerError;
use crate::state::AppState;

/// The user a request acts as, if it named one.
#[derive(Debug, Clone, Default)]
pub struct Caller(pub Option<Principal>);

impl Caller {
    /// The principal, or 401 when the request named nobody.
    pub fn require(&self) -> Result<&Principal, ServerError> {
        self.0
            .as_ref()
            .ok_or_else(|| ServerError::Unauthorized(format!("missing {USER_HEADER} header")))
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() == b.len() {
        a.ct_eq(b).into()
    } else {
        let _ = a.ct_eq(a);
        false
    }
}

/// Validate the bearer token and attach the [`Caller`].
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ServerError> {
    validate_token(&request, &state)?;
    let caller = resolve_caller(&request, &state)?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

fn validate_token(request: &Request<Body>, state: &AppState) -> Result<(), ServerError> {
    let Some(expected) = state.config().auth_token.as_deref() else {
        return Ok(());
    };
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or_else(|| ServerError::Unauthorized("missing authorization token".into()))?;
    let value = header
        .to_str()
        .map_err(|_| ServerError::BadRequest("invalid authorization format".into()))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ServerError::BadRequest("invalid authorization format".into()))?;

    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(ServerError::Unauthorized("invalid token".into()))
    }
}

fn resolve_caller(request: &Request<Body>, state: &AppState) -> Result<Caller, ServerError> {
    let Some(header) = request.headers().get(USER_HEADER) else {
        return Ok(Caller(None));
    };
    let email = header
        .to_str()
        .map_err(|_| ServerError::BadRequest(format!("invalid {USER_HEADER} header")))?
        .trim();
    if email.is_empty() {
        return Ok(Caller(None));
    }
    let principal = state.engine.principal(email)?;
    debug!(user = email, teams = principal.teams.len(), "Resolved caller");
    Ok(Caller(Some(principal)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        Extension, Router,
        http::{Request, StatusCode},
        middleware,
        routing::get,
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use remedy_config::RemedyConfig;
    use remedy_engine::Engine;
    use remedy_store::Store;
    use remedy_types::Person;

    use crate::config::ServerConfig;

    fn state(token: Option<&str>) -> AppState {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_person(&Person {
                id: Uuid::new_v4(),
                name: "Jane".into(),
                email: "jane@x".into(),
            })
            .unwrap();
        let engine = Engine::new(RemedyConfig::default(), store).unwrap();
        AppState::new(engine, ServerConfig::new(token.map(String::from)))
    }

    async fn whoami(Extension(caller): Extension<Caller>) -> String {
        caller
            .0
            .map(|p| p.email().to_string())
            .unwrap_or_else(|| "anonymous".into())
    }

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
            .with_state(state)
    }

    async fn call(app: Router, headers: &[(&str, &str)]) -> (StatusCode, String) {
        let mut builder = Request::builder().uri("/whoami");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[tokio::test]
    async fn test_no_token_configured() {
        let (status, body) = call(app(state(None)), &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "anonymous");
    }

    #[tokio::test]
    async fn test_token_required() {
        let app = app(state(Some("t0k")));
        assert_eq!(call(app.clone(), &[]).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(
            call(app.clone(), &[("authorization", "Bearer nope")]).await.0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            call(app.clone(), &[("authorization", "Basic abc")]).await.0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            call(app, &[("authorization", "Bearer t0k")]).await.0,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_caller_resolved_from_header() {
        let app = app(state(None));
        let (status, body) = call(app.clone(), &[(USER_HEADER, "jane@x")]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "jane@x");

        let (status, _) = call(app, &[(USER_HEADER, "ghost@x")]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
