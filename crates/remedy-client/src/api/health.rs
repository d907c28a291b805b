//! Health API.

use serde::Deserialize;

use crate::client::RemedyClient;
use crate::error::{Error, Result};

/// Body of `GET /health`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(default)]
    pub runs_in_flight: usize,
    #[serde(default)]
    pub artifacts_enabled: bool,
}

/// Health API client. The endpoint needs no authentication.
pub struct HealthApi {
    client: RemedyClient,
}

impl HealthApi {
    pub(crate) fn new(client: RemedyClient) -> Self {
        Self { client }
    }

    /// Check basic health.
    pub async fn check(&self) -> Result<HealthResponse> {
        let inner = self.client.inner();
        let url = self.client.url("health")?;
        let response = inner.http.get(url).timeout(inner.timeout).send().await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Error::Api {
                status: response.status().as_u16(),
                code: "health_check_failed".to_string(),
                message: "Health check failed".to_string(),
            })
        }
    }

    /// Simple connectivity check.
    pub async fn is_healthy(&self) -> bool {
        self.check().await.is_ok()
    }
}
