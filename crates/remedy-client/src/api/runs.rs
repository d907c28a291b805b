//! Runs API.

use uuid::Uuid;

use remedy_types::{ArtifactList, Run, RunCreated, RunDetail, RunRequest};

use crate::client::RemedyClient;
use crate::error::Result;

/// Runs API client.
pub struct RunsApi {
    client: RemedyClient,
}

impl RunsApi {
    pub(crate) fn new(client: RemedyClient) -> Self {
        Self { client }
    }

    /// Submit a run of a playbook.
    pub async fn submit(&self, request: &RunRequest) -> Result<RunCreated> {
        self.client.post("playbook/run", request).await
    }

    /// Get a run and its actions.
    pub async fn get(&self, run_id: Uuid) -> Result<RunDetail> {
        self.client.get(&format!("playbook/run/{run_id}")).await
    }

    /// Cancel a run that has not finished.
    pub async fn cancel(&self, run_id: Uuid) -> Result<Run> {
        self.client
            .post(&format!("playbook/run/{run_id}/cancel"), &serde_json::json!({}))
            .await
    }

    /// Approve a pending run as the authenticated user.
    pub async fn approve(&self, playbook_id: Uuid, run_id: Uuid) -> Result<Run> {
        self.client
            .post(
                &format!("playbook/{playbook_id}/run/{run_id}/approve"),
                &serde_json::json!({}),
            )
            .await
    }

    /// Reject a pending run as the authenticated user.
    pub async fn reject(&self, playbook_id: Uuid, run_id: Uuid) -> Result<Run> {
        self.client
            .post(
                &format!("playbook/{playbook_id}/run/{run_id}/reject"),
                &serde_json::json!({}),
            )
            .await
    }

    /// List the artifacts one action produced.
    pub async fn artifacts(&self, run_id: Uuid, action_id: Uuid) -> Result<ArtifactList> {
        self.client
            .get(&format!("playbook/run/{run_id}/actions/{action_id}/artifacts"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RemedyClient {
        RemedyClient::builder()
            .base_url(server.uri())
            .auth_token("t0k")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit() {
        let server = MockServer::start().await;
        let playbook = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/playbook/run"))
            .and(header("authorization", "Bearer t0k"))
            .and(body_json(json!({"id": playbook, "params": {"path": "/tmp"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "run_id": run_id,
                "starts_at": "2026-01-01T00:00:00Z",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = client(&server)
            .runs()
            .submit(&RunRequest::new(playbook).with_param("path", "/tmp"))
            .await
            .unwrap();
        assert_eq!(created.run_id, run_id);
    }

    #[tokio::test]
    async fn test_approve_sends_acting_user() {
        let server = MockServer::start().await;
        let playbook = Uuid::new_v4();
        let run = remedy_types::Run::new(playbook);
        Mock::given(method("POST"))
            .and(path(format!("/playbook/{playbook}/run/{}/approve", run.id)))
            .and(header("x-remedy-user", "jane@x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&run))
            .expect(1)
            .mount(&server)
            .await;

        let client = RemedyClient::builder()
            .base_url(server.uri())
            .user("jane@x")
            .build()
            .unwrap();
        let approved = client.runs().approve(playbook, run.id).await.unwrap();
        assert_eq!(approved.id, run.id);
    }

    #[tokio::test]
    async fn test_validation_error_carries_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/playbook/run"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": "validation",
                "message": "unknown parameter 'x'",
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .runs()
            .submit(&RunRequest::new(Uuid::new_v4()).with_param("x", "1"))
            .await
            .unwrap_err();
        match err {
            Error::Api { status, code, message } => {
                assert_eq!(status, 400);
                assert_eq!(code, "validation");
                assert!(message.contains("'x'"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "code": "not_found",
                "message": "run",
            })))
            .mount(&server)
            .await;

        let err = client(&server).runs().get(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
