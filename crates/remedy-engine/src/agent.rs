//! Agent bridge.
//!
//! The host side ([`UpstreamHost`]) hands out actions placed on an agent and
//! folds pushed results back into its store. The agent side
//! ([`AgentWorker`]) pulls those actions, executes them locally, and pushes
//! terminal rows and artifact content back.
//!
//! Delivery is at most once per row: the agent marks a row pushed only after
//! the host accepted it, and the host upserts by id so a repeated push is
//! harmless. Ordering across pushes is not preserved.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use remedy_client::Upstream;
use remedy_store::Store;
use remedy_types::{
    ActionForAgent, ActionStatus, Artifact, PushData, RunAction, RunStatus, channels, now,
};

use crate::artifacts::ArtifactStore;
use crate::error::{EngineError, Result};
use crate::notifier::Notifier;
use crate::runner::Runner;

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Host side of the bridge.
#[derive(Clone)]
pub struct UpstreamHost {
    store: Arc<Store>,
    notifier: Notifier,
    artifacts: Option<ArtifactStore>,
}

impl UpstreamHost {
    pub fn new(store: Arc<Store>, notifier: Notifier, artifacts: Option<ArtifactStore>) -> Self {
        Self {
            store,
            notifier,
            artifacts,
        }
    }

    /// Hand out the next action delegated to `agent_name`, recording the
    /// agent's heartbeat. The action is `running` once handed out.
    pub fn pull(&self, agent_name: &str) -> Result<Option<ActionForAgent>> {
        let agent_name = agent_name.trim();
        if agent_name.is_empty() {
            return Err(EngineError::Validation("agent_name is required".into()));
        }
        let agent = self.store.touch_agent(agent_name)?;

        let Some((run, action, data)) = self.store.claim_agent_action(agent.id)? else {
            return Ok(None);
        };
        let action_spec = serde_json::from_value(data.spec)?;
        info!(
            run_id = %run.id,
            action = %action.name,
            agent = %agent.name,
            "Action handed to agent"
        );
        self.notifier.publish(channels::RUN_UPDATED);
        Ok(Some(ActionForAgent {
            run,
            action,
            action_spec,
            env: data.env,
        }))
    }

    /// Fold pushed rows into the store and resume runs whose delegated
    /// actions are all back.
    pub fn push(&self, data: PushData) -> Result<()> {
        let mut touched = HashSet::new();
        let mut known_actions = HashSet::new();

        for mut action in data.actions {
            if self.store.get_run(action.run_id)?.is_none() {
                debug!(run_id = %action.run_id, action = %action.name, "Ignoring pushed action of unknown run");
                continue;
            }
            if let Some(existing) = self.store.get_action(action.id)?
                && existing.status.is_terminal()
            {
                debug!(
                    action_id = %action.id,
                    status = %existing.status,
                    "Ignoring pushed result for action already final on host"
                );
                continue;
            }
            action.is_pushed = true;
            self.store.upsert_action(&action)?;
            debug!(run_id = %action.run_id, action = %action.name, status = %action.status, "Received action result");
            known_actions.insert(action.id);
            touched.insert(action.run_id);
        }

        for mut artifact in data.artifacts {
            let existing = self.store.get_artifact(artifact.id)?;
            if existing.is_none()
                && !known_actions.contains(&artifact.run_action_id)
                && self.store.get_action(artifact.run_action_id)?.is_none()
            {
                debug!(artifact_id = %artifact.id, "Ignoring pushed artifact of unknown action");
                continue;
            }
            artifact.is_pushed = true;
            artifact.is_data_pushed = existing.is_some_and(|a| a.is_data_pushed);
            artifact.connection = self.artifacts.as_ref().map(|s| s.connection().to_string());
            self.store.upsert_artifact(&artifact)?;
        }

        for run_id in touched {
            self.resume_if_ready(run_id)?;
        }
        Ok(())
    }

    /// Store uploaded content for an artifact announced by a push.
    pub async fn receive_artifact<R>(&self, artifact_id: &str, content: R) -> Result<Artifact>
    where
        R: AsyncRead + Unpin,
    {
        let Some(blobs) = &self.artifacts else {
            return Err(EngineError::NotImplemented(
                "no artifact connection is configured".into(),
            ));
        };
        let id = Uuid::parse_str(artifact_id)
            .map_err(|_| EngineError::Validation(format!("'{artifact_id}' is not a valid artifact id")))?;
        let mut artifact = self
            .store
            .get_artifact(id)?
            .ok_or_else(|| EngineError::NotFound(format!("artifact {id}")))?;

        let size = blobs.receive(&artifact, content).await?;
        self.store.mark_artifact_data_pushed(id)?;
        artifact.is_data_pushed = true;
        info!(artifact_id = %id, path = %artifact.path, size, "Received artifact content");
        Ok(artifact)
    }

    /// A waiting run becomes claimable again once no action is out on an
    /// agent.
    fn resume_if_ready(&self, run_id: Uuid) -> Result<()> {
        let Some(run) = self.store.get_run(run_id)? else {
            return Ok(());
        };
        if run.status != RunStatus::Waiting {
            return Ok(());
        }
        let outstanding = self.store.count_actions(run_id, ActionStatus::ScheduledOnAgent)?
            + self.store.count_actions(run_id, ActionStatus::Running)?;
        if outstanding > 0 {
            return Ok(());
        }
        self.store
            .schedule_run(run_id, now())
            .map_err(EngineError::from_store)?;
        self.notifier.publish(channels::RUN_UPDATED);
        info!(run_id = %run_id, "Delegated actions returned, run rescheduled");
        Ok(())
    }
}

/// Agent-side cadence.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub name: String,
    /// Idle time between pulls that found no work.
    pub poll_interval: Duration,
    pub push_interval: Duration,
    pub push_batch_size: usize,
}

/// Agent side of the bridge.
pub struct AgentWorker {
    store: Arc<Store>,
    runner: Arc<Runner>,
    upstream: Arc<dyn Upstream>,
    artifacts: Option<ArtifactStore>,
    settings: AgentSettings,
}

impl AgentWorker {
    pub fn new(
        store: Arc<Store>,
        runner: Arc<Runner>,
        upstream: Arc<dyn Upstream>,
        artifacts: Option<ArtifactStore>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            store,
            runner,
            upstream,
            artifacts,
            settings,
        }
    }

    /// Pull one action and execute it. Returns the finished action, or
    /// `None` when the host had no work.
    pub async fn pull_once(&self, cancel: &CancellationToken) -> Result<Option<RunAction>> {
        let Some(item) = self.upstream.pull(&self.settings.name).await? else {
            return Ok(None);
        };
        info!(run_id = %item.run.id, action = %item.action.name, "Pulled action from upstream");
        let done = self.runner.execute_delegated(item, cancel).await?;
        Ok(Some(done))
    }

    /// Push every terminal, unpushed row in batches, then upload pending
    /// artifact content one artifact at a time. Returns the number of rows
    /// pushed.
    pub async fn push_once(&self) -> Result<usize> {
        let batch = self.settings.push_batch_size.max(1);
        let mut pushed = 0;
        loop {
            let data = PushData {
                actions: self.store.unpushed_actions(batch)?,
                artifacts: self.store.unpushed_artifacts(batch)?,
            };
            if data.is_empty() {
                break;
            }
            self.upstream.push(&data).await?;

            let action_ids: Vec<Uuid> = data.actions.iter().map(|a| a.id).collect();
            let artifact_ids: Vec<Uuid> = data.artifacts.iter().map(|a| a.id).collect();
            self.store.mark_actions_pushed(&action_ids)?;
            self.store.mark_artifacts_pushed(&artifact_ids)?;
            pushed += action_ids.len() + artifact_ids.len();
            debug!(actions = action_ids.len(), artifacts = artifact_ids.len(), "Pushed batch upstream");
        }

        self.upload_pending(batch).await?;
        Ok(pushed)
    }

    async fn upload_pending(&self, batch: usize) -> Result<usize> {
        let Some(blobs) = &self.artifacts else {
            return Ok(0);
        };
        let mut uploaded = 0;
        for artifact in self.store.artifacts_pending_data(batch)? {
            let file = match blobs.open(&artifact).await {
                Ok(file) => file,
                Err(EngineError::NotFound(_)) => {
                    warn!(artifact_id = %artifact.id, path = %artifact.path, "Artifact content missing locally, not uploading");
                    self.store.mark_artifact_data_pushed(artifact.id)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.upstream.upload_artifact(&artifact, file).await?;
            self.store.mark_artifact_data_pushed(artifact.id)?;
            uploaded += 1;
            debug!(artifact_id = %artifact.id, "Uploaded artifact content");
        }
        Ok(uploaded)
    }

    /// Pull and push until `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(agent = %self.settings.name, "Agent worker started");
        tokio::join!(self.pull_loop(&shutdown), self.push_loop(&shutdown));
        info!(agent = %self.settings.name, "Agent worker stopped");
    }

    async fn pull_loop(&self, shutdown: &CancellationToken) {
        while !shutdown.is_cancelled() {
            let idle = match self.pull_once(shutdown).await {
                Ok(Some(_)) => continue,
                Ok(None) => self.settings.poll_interval,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Upstream pull failed");
                    ERROR_BACKOFF
                }
                Err(e) => {
                    error!(error = %e, "Upstream pull failed");
                    ERROR_BACKOFF
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }
    }

    async fn push_loop(&self, shutdown: &CancellationToken) {
        loop {
            if let Err(e) = self.push_once().await {
                warn!(error = %e, "Upstream push failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.push_interval) => {}
            }
        }
        // Flush what finished during shutdown.
        if let Err(e) = self.push_once().await {
            warn!(error = %e, "Final upstream push failed");
        }
    }
}

/// [`Upstream`] over an in-process host, for running host and agent in one
/// process.
pub struct LocalUpstream {
    host: UpstreamHost,
}

impl LocalUpstream {
    pub fn new(host: UpstreamHost) -> Self {
        Self { host }
    }
}

fn to_client(e: EngineError) -> remedy_client::Error {
    let status = match &e {
        EngineError::Validation(_) => 400,
        EngineError::NotFound(_) => 404,
        EngineError::NotImplemented(_) => 501,
        _ => 500,
    };
    remedy_client::Error::Api {
        status,
        code: "engine".into(),
        message: e.to_string(),
    }
}

#[async_trait::async_trait]
impl Upstream for LocalUpstream {
    async fn pull(&self, agent_name: &str) -> remedy_client::Result<Option<ActionForAgent>> {
        self.host.pull(agent_name).map_err(to_client)
    }

    async fn push(&self, data: &PushData) -> remedy_client::Result<()> {
        self.host.push(data.clone()).map_err(to_client)
    }

    async fn upload_artifact(
        &self,
        artifact: &Artifact,
        content: tokio::fs::File,
    ) -> remedy_client::Result<()> {
        self.host
            .receive_artifact(&artifact.id.to_string(), content)
            .await
            .map(|_| ())
            .map_err(to_client)
    }
}
