//! Webhook authentication and request capture.
//!
//! A playbook with a webhook trigger is addressed by its path. The inbound
//! request is authenticated with the single scheme the trigger configures,
//! then captured as `{headers, body, params}` for templating.

mod basic;
mod github;
mod jwt;
mod svix;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use remedy_types::{WebhookAuth, WebhookAuthScheme};

use crate::error::{EngineError, Result};

pub use jwt::JwksCache;

/// An inbound webhook request. Header names are lowercase.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Bearer token of the `Authorization` header.
    pub(crate) fn bearer(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
    }

    /// `{headers, body, params}`. A JSON body is parsed, anything else is
    /// kept as text.
    pub fn to_value(&self) -> Value {
        let headers: Map<String, Value> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let params: Map<String, Value> = self
            .query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let body = serde_json::from_slice(&self.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned()));

        let mut value = Map::new();
        value.insert("headers".into(), Value::Object(headers));
        value.insert("body".into(), body);
        value.insert("params".into(), Value::Object(params));
        Value::Object(value)
    }
}

/// Verifies webhook requests against a trigger's authentication.
///
/// Clones share one JWKS cache.
#[derive(Clone)]
pub struct WebhookAuthenticator {
    jwks: JwksCache,
}

impl WebhookAuthenticator {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            jwks: JwksCache::new(http),
        }
    }

    /// `Ok` when `request` satisfies `auth`, `Unauthorized` otherwise.
    pub async fn verify(&self, auth: Option<&WebhookAuth>, request: &WebhookRequest) -> Result<()> {
        let scheme = match auth {
            Some(auth) => auth.scheme().map_err(EngineError::Validation)?,
            None => WebhookAuthScheme::None,
        };
        match scheme {
            WebhookAuthScheme::None => Ok(()),
            WebhookAuthScheme::Basic(basic) => basic::verify(basic, request),
            WebhookAuthScheme::Github(github) => github::verify(github, request),
            WebhookAuthScheme::Svix(svix) => svix::verify(svix, request),
            WebhookAuthScheme::Jwt(jwt) => self.jwks.verify(jwt, request).await,
        }
        .inspect_err(|e| debug!(error = %e, "Webhook authentication failed"))
    }

    pub fn jwks(&self) -> &JwksCache {
        &self.jwks
    }
}

impl Default for WebhookAuthenticator {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

pub(crate) fn unauthorized(reason: impl Into<String>) -> EngineError {
    EngineError::Unauthorized(reason.into())
}

/// Parse an optional tolerance, falling back to `default`.
pub(crate) fn tolerance(spec: Option<&str>, default: Duration) -> Result<Duration> {
    match spec {
        Some(s) => remedy_types::parse_duration(s).map_err(EngineError::from),
        None => Ok(default),
    }
}
