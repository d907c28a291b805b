//! The engine facade.
//!
//! [`Engine`] wires the store, notifier, matcher, scheduler, runner,
//! approval gate, agent bridge and webhook authenticator together, and is
//! the one handle the HTTP surface and the binary talk to.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use remedy_client::Upstream;
use remedy_config::RemedyConfig;
use remedy_store::Store;
use remedy_types::{
    ActionForAgent, Artifact, ArtifactList, Event, Principal, PushData, Resource, Run, RunCreated,
    RunDetail, RunRequest, channels,
};

use crate::agent::{AgentSettings, AgentWorker, UpstreamHost};
use crate::approval::ApprovalGate;
use crate::artifacts::ArtifactStore;
use crate::cel::CelEngine;
use crate::error::{EngineError, Result};
use crate::events::{ConsumerSettings, EventConsumer};
use crate::loader::{PlaybookEvent, PlaybookLoader};
use crate::matcher::Matcher;
use crate::notifier::Notifier;
use crate::params::{ParamRequest, fill_defaults, prepare_params};
use crate::runner::Runner;
use crate::runs::{NewRun, create_run};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::webhook::{WebhookAuthenticator, WebhookRequest};

/// The playbook execution engine.
#[derive(Clone)]
pub struct Engine {
    config: Arc<RemedyConfig>,
    store: Arc<Store>,
    notifier: Notifier,
    cel: Arc<CelEngine>,
    artifacts: Option<ArtifactStore>,
    runner: Arc<Runner>,
    scheduler: Arc<Scheduler>,
    matcher: Arc<Matcher>,
    events: Arc<EventConsumer>,
    approvals: Arc<ApprovalGate>,
    upstream: UpstreamHost,
    webhooks: WebhookAuthenticator,
}

impl Engine {
    /// Build an engine over an open store.
    pub fn new(config: RemedyConfig, store: Arc<Store>) -> Result<Self> {
        let config = Arc::new(config);
        let engine_config = config.engine();
        let notifier = Notifier::new();
        let cel = Arc::new(CelEngine::new());

        let artifacts = config
            .artifact_connection()
            .map(ArtifactStore::from_url)
            .transpose()?;

        let runner = Arc::new(Runner::new(
            store.clone(),
            notifier.clone(),
            cel.clone(),
            config.clone(),
            artifacts.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            runner.clone(),
            notifier.clone(),
            SchedulerSettings {
                workers: engine_config.workers,
                poll_interval: engine_config.poll_interval(),
            },
        ));
        let matcher = Arc::new(Matcher::new(
            store.clone(),
            notifier.clone(),
            cel.clone(),
            engine_config.playbook_cache_ttl(),
        ));
        let events = Arc::new(EventConsumer::new(
            store.clone(),
            notifier.clone(),
            matcher.clone(),
            ConsumerSettings {
                batch_size: engine_config.event_batch_size,
                max_attempts: engine_config.event_max_attempts,
                poll_interval: engine_config.poll_interval(),
            },
        ));
        let approvals = Arc::new(ApprovalGate::new(store.clone(), notifier.clone()));
        let upstream = UpstreamHost::new(store.clone(), notifier.clone(), artifacts.clone());

        Ok(Self {
            config,
            store,
            notifier,
            cel,
            artifacts,
            runner,
            scheduler,
            matcher,
            events,
            approvals,
            upstream,
            webhooks: WebhookAuthenticator::default(),
        })
    }

    /// Open the configured store and build an engine over it.
    pub fn open(config: RemedyConfig) -> Result<Self> {
        let path = config.store().effective_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Arc::new(Store::open(&path)?);
        info!(path = %path.display(), "Store opened");
        Self::new(config, store)
    }

    pub fn config(&self) -> &RemedyConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    pub fn events(&self) -> &Arc<EventConsumer> {
        &self.events
    }

    pub fn artifacts(&self) -> Option<&ArtifactStore> {
        self.artifacts.as_ref()
    }

    pub fn upstream_host(&self) -> &UpstreamHost {
        &self.upstream
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Runs
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate a run request and create the run.
    pub fn submit_run(&self, request: &RunRequest, user: Option<&Principal>) -> Result<RunCreated> {
        let playbook = self
            .store
            .get_playbook(request.id)?
            .ok_or_else(|| EngineError::NotFound(format!("playbook {}", request.id)))?;

        let resource = match request.target()? {
            Some(target) => Some(
                self.store
                    .get_resource(target)?
                    .ok_or_else(|| EngineError::NotFound(format!("{} {}", target.kind, target.id)))?,
            ),
            None => None,
        };

        let params = prepare_params(
            &self.cel,
            ParamRequest {
                playbook: &playbook,
                resource: resource.as_ref(),
                supplied: &request.params,
                user,
                request: None,
            },
        )?;

        let run = create_run(
            &self.store,
            &self.notifier,
            NewRun {
                playbook: &playbook,
                resource: resource.as_ref(),
                params,
                created_by: user.map(Principal::id),
                request: None,
                delay: None,
            },
        )?;
        Ok(RunCreated {
            run_id: run.id,
            starts_at: run.scheduled_time,
        })
    }

    /// A run with its actions.
    pub fn get_run_detail(&self, run_id: Uuid) -> Result<RunDetail> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
        let actions = self.store.list_actions(run_id)?;
        Ok(RunDetail { run, actions })
    }

    /// Cancel a run and signal its worker if it is executing here.
    pub fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        let run = self
            .store
            .cancel_run(run_id)
            .map_err(EngineError::from_store)?;
        let signalled = self.scheduler.cancel(run_id);
        self.notifier.publish(channels::RUN_UPDATED);
        info!(run_id = %run_id, signalled, "Run cancelled");
        Ok(run)
    }

    pub fn approve(&self, playbook_id: Uuid, run_id: Uuid, principal: &Principal) -> Result<Run> {
        self.approvals.approve(playbook_id, run_id, principal)
    }

    pub fn reject(&self, playbook_id: Uuid, run_id: Uuid, principal: &Principal) -> Result<Run> {
        self.approvals.reject(playbook_id, run_id, principal)
    }

    /// Artifacts of one action of a run.
    pub fn list_artifacts(&self, run_id: Uuid, action_id: Uuid) -> Result<ArtifactList> {
        self.store
            .get_action(action_id)?
            .filter(|a| a.run_id == run_id)
            .ok_or_else(|| EngineError::NotFound(format!("action {action_id} of run {run_id}")))?;
        Ok(ArtifactList {
            artifacts: self.store.list_artifacts(action_id)?,
        })
    }

    /// The person (and their teams) behind an email address.
    pub fn principal(&self, email: &str) -> Result<Principal> {
        self.store
            .principal_for_email(email)?
            .ok_or_else(|| EngineError::Unauthorized(format!("unknown user '{email}'")))
    }

    /// Load a resource for callers outside the engine.
    pub fn resource(&self, target: remedy_types::Target) -> Result<Option<Resource>> {
        Ok(self.store.get_resource(target)?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Events and webhooks
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a change event to the queue.
    pub fn publish_event(&self, event: &Event) -> Result<()> {
        self.events.publish(event)
    }

    /// Authenticate a webhook call and create the playbook run it triggers.
    pub async fn handle_webhook(&self, path: &str, request: &WebhookRequest) -> Result<Run> {
        let playbook = self
            .store
            .find_playbook_by_webhook(path)?
            .ok_or_else(|| EngineError::NotFound(format!("webhook '{path}'")))?;
        let auth = playbook
            .spec
            .on
            .webhook
            .as_ref()
            .and_then(|w| w.authentication.as_ref());

        if let Err(e) = self.webhooks.verify(auth, request).await {
            warn!(playbook = %playbook.name, path, error = %e, "Webhook rejected");
            return Err(e);
        }

        let payload = request.to_value();
        let params = fill_defaults(
            ParamRequest {
                playbook: &playbook,
                resource: None,
                supplied: &HashMap::new(),
                user: None,
                request: Some(&payload),
            },
            HashMap::new(),
        )?;

        let run = create_run(
            &self.store,
            &self.notifier,
            NewRun {
                playbook: &playbook,
                resource: None,
                params,
                created_by: None,
                request: Some(payload),
                delay: playbook.spec.delay(),
            },
        )?;
        debug!(run_id = %run.id, path, "Webhook triggered run");
        Ok(run)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Agent bridge, host side
    // ─────────────────────────────────────────────────────────────────────────

    pub fn pull(&self, agent_name: &str) -> Result<Option<ActionForAgent>> {
        self.upstream.pull(agent_name)
    }

    pub fn push(&self, data: PushData) -> Result<()> {
        self.upstream.push(data)
    }

    pub async fn receive_artifact<R>(&self, artifact_id: &str, content: R) -> Result<Artifact>
    where
        R: AsyncRead + Unpin,
    {
        self.upstream.receive_artifact(artifact_id, content).await
    }

    /// An agent worker that pulls from `upstream` with this engine's runner.
    pub fn agent_worker(&self, upstream: Arc<dyn Upstream>) -> Option<Arc<AgentWorker>> {
        let agent = self.config.agent.clone().filter(|a| !a.name.is_empty())?;
        Some(Arc::new(AgentWorker::new(
            self.store.clone(),
            self.runner.clone(),
            upstream,
            self.artifacts.clone(),
            AgentSettings {
                name: agent.name.clone(),
                poll_interval: self.config.engine().poll_interval(),
                push_interval: agent.push_interval(),
                push_batch_size: agent.push_batch_size.max(1),
            },
        )))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the playbook directory, if configured. Returns the loader so the
    /// caller can watch it.
    pub fn load_playbooks(&self) -> Result<Option<PlaybookLoader>> {
        let Some(dir) = self.config.playbooks().dir else {
            return Ok(None);
        };
        let loader = PlaybookLoader::new(dir, self.store.clone(), self.notifier.clone())?;
        loader.load_all();
        Ok(Some(loader))
    }

    /// Start the background loops: scheduler, event consumer, cache
    /// invalidation and the playbook directory watcher. Every loop stops
    /// when `shutdown` fires.
    pub fn start(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut tasks = Vec::new();

        if let Some(loader) = self.load_playbooks()?
            && self.config.playbooks().watch
        {
            let (mut changes, watcher) = loader.watch()?;
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let _watcher = watcher;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        change = changes.recv() => match change {
                            Some(PlaybookEvent::Error { path, error }) => {
                                warn!(path = %path.display(), error = %error, "Playbook reload failed");
                            }
                            Some(change) => debug!(?change, "Playbook directory changed"),
                            None => break,
                        },
                    }
                }
            }));
        }

        tasks.push(tokio::spawn(
            self.scheduler.clone().run(shutdown.clone()),
        ));
        tasks.push(tokio::spawn(self.events.clone().run(shutdown.clone())));
        tasks.push(tokio::spawn(self.matcher.clone().watch_specs(shutdown)));

        info!(
            workers = self.config.engine().workers,
            artifacts = self.artifacts.is_some(),
            "Engine started"
        );
        Ok(tasks)
    }
}
