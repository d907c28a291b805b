//! Agent upstream API: pull work, push results, upload artifact data.

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

use remedy_types::{ActionEnvelope, ActionForAgent, Artifact, PushData};

use crate::client::RemedyClient;
use crate::error::Result;

/// The host an agent reports to.
///
/// Implemented over HTTP by [`UpstreamApi`]; anything else that can hand out
/// actions and accept results (an in-process host in tests) works too.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Claim the next action placed on `agent_name`, if any.
    async fn pull(&self, agent_name: &str) -> Result<Option<ActionForAgent>>;

    /// Send finished actions and artifact metadata.
    async fn push(&self, data: &PushData) -> Result<()>;

    /// Stream the content of one artifact already announced by [`push`](Self::push).
    async fn upload_artifact(&self, artifact: &Artifact, content: tokio::fs::File) -> Result<()>;
}

#[derive(Serialize)]
struct PullQuery<'a> {
    agent_name: &'a str,
}

/// Upstream API client.
#[derive(Clone)]
pub struct UpstreamApi {
    client: RemedyClient,
}

impl UpstreamApi {
    pub(crate) fn new(client: RemedyClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for UpstreamApi {
    async fn pull(&self, agent_name: &str) -> Result<Option<ActionForAgent>> {
        let envelope: ActionEnvelope = self
            .client
            .get_with_query("upstream/playbook-action", &PullQuery { agent_name })
            .await?;
        Ok(envelope.into_action())
    }

    async fn push(&self, data: &PushData) -> Result<()> {
        debug!(
            actions = data.actions.len(),
            artifacts = data.artifacts.len(),
            "Pushing to upstream"
        );
        self.client.post_empty("upstream/push", data).await
    }

    async fn upload_artifact(&self, artifact: &Artifact, content: tokio::fs::File) -> Result<()> {
        let body = reqwest::Body::wrap_stream(ReaderStream::new(content));
        let content_type = if artifact.content_type.is_empty() {
            "application/octet-stream"
        } else {
            artifact.content_type.as_str()
        };
        self.client
            .post_body(&format!("upstream/artifact/{}", artifact.id), body, content_type)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_bytes, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use remedy_types::{Run, RunAction};

    fn upstream(server: &MockServer) -> UpstreamApi {
        RemedyClient::builder()
            .base_url(server.uri())
            .auth_token("agent-token")
            .build()
            .unwrap()
            .upstream()
    }

    #[tokio::test]
    async fn test_pull_empty_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upstream/playbook-action"))
            .and(query_param("agent_name", "a1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        assert!(upstream(&server).pull("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_action() {
        let server = MockServer::start().await;
        let run = Run::new(Uuid::new_v4());
        let action = RunAction::new(run.id, "remote");
        let envelope = json!({
            "run": run,
            "action": action,
            "action_spec": {"name": "remote", "exec": {"script": "echo hi"}},
            "env": {"config": {"name": "db"}},
        });
        Mock::given(method("GET"))
            .and(path("/upstream/playbook-action"))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope))
            .mount(&server)
            .await;

        let work = upstream(&server).pull("a1").await.unwrap().unwrap();
        assert_eq!(work.run.id, run.id);
        assert_eq!(work.action.name, "remote");
        assert_eq!(work.env["config"]["name"], "db");
    }

    #[tokio::test]
    async fn test_push_rejected_by_host() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upstream/push"))
            .and(header("authorization", "Bearer agent-token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = upstream(&server)
            .push(&PushData::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_upload_streams_file() {
        let server = MockServer::start().await;
        let mut artifact = Artifact::new(Uuid::new_v4(), "playbooks/r1/report.txt");
        artifact.content_type = "text/plain".into();
        Mock::given(method("POST"))
            .and(path(format!("/upstream/artifact/{}", artifact.id)))
            .and(header("content-type", "text/plain"))
            .and(body_bytes(b"report body".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let file_path = dir.path().join("report.txt");
        tokio::fs::write(&file_path, b"report body").await.unwrap();
        let file = tokio::fs::File::open(&file_path).await.unwrap();

        upstream(&server).upload_artifact(&artifact, file).await.unwrap();
    }
}
