//! Executes claimed runs.
//!
//! A run is a sequence of actions executed strictly in playbook order. The
//! runner is a reducer over the persisted state: it loads every action row
//! the run already has, replays terminal ones into the template environment,
//! and continues from the first action without a terminal row. A run that
//! went to sleep resumes on the sleeping action, looked up by name.
//!
//! The runner releases the run (and its worker) at three points: before a
//! delayed action (the run sleeps), when an action is delegated to an agent
//! (the run waits), and when the run reaches a terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use remedy_config::RemedyConfig;
use remedy_store::Store;
use remedy_types::{
    ActionForAgent, ActionStatus, AgentData, Playbook, PlaybookAction, Principal, Resource, Run,
    RunAction, RunStatus, Timestamp, channels, now,
};

use crate::actions::{self, ActionContext, ActionOutput};
use crate::artifacts::ArtifactStore;
use crate::cel::{CelEngine, Gate, PriorOutcome};
use crate::error::{EngineError, Result};
use crate::matcher::resource_env;
use crate::notifier::Notifier;
use crate::origin::gitops_source;
use crate::runs::place;
use crate::template::TemplateEnv;

/// Where a run stands when the runner hands it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
    /// The next action is delayed; the run is `sleeping`.
    Sleeping,
    /// An action was delegated to an agent; the run is `waiting`.
    Waiting,
}

/// Executes runs and single delegated actions.
pub struct Runner {
    store: Arc<Store>,
    notifier: Notifier,
    cel: Arc<CelEngine>,
    config: Arc<RemedyConfig>,
    artifacts: Option<ArtifactStore>,
    http: reqwest::Client,
}

impl Runner {
    pub fn new(
        store: Arc<Store>,
        notifier: Notifier,
        cel: Arc<CelEngine>,
        config: Arc<RemedyConfig>,
        artifacts: Option<ArtifactStore>,
    ) -> Self {
        Self {
            store,
            notifier,
            cel,
            config,
            artifacts,
            http: reqwest::Client::new(),
        }
    }

    /// Execute a run that has been claimed (`status = running`).
    pub async fn execute(&self, run: Run, cancel: &CancellationToken) -> Result<RunOutcome> {
        let Some(playbook) = self.store.get_playbook(run.playbook_id)? else {
            warn!(run_id = %run.id, playbook_id = %run.playbook_id, "Playbook of run no longer exists");
            return self.settle(&run, RunStatus::Failed, Some("playbook not found"));
        };

        let existing: HashMap<String, RunAction> = self
            .store
            .list_actions(run.id)?
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();

        let resuming = match self.store.sleeping_action(run.id)? {
            Some(sleeping) if playbook.action(&sleeping.name).is_none() => {
                warn!(run_id = %run.id, action = %sleeping.name, "Sleeping action is no longer in the playbook");
                let error = format!("action '{}' no longer exists in the playbook", sleeping.name);
                return self.settle(&run, RunStatus::Failed, Some(&error));
            }
            Some(sleeping) => Some(sleeping.name),
            None => None,
        };

        let mut env = self.run_env(&run, &playbook)?;
        let deadline = self.deadline(&playbook, first_start(&run, existing.values()));
        let mut prior = PriorOutcome::default();
        let mut first_error: Option<String> = None;

        info!(run_id = %run.id, playbook = %playbook.name, resuming = ?resuming, "Executing run");

        for spec in &playbook.spec.actions {
            let mut action = match existing.get(&spec.name) {
                Some(done) if done.status.is_terminal() => {
                    env.record_action(done);
                    note_outcome(&mut prior, &mut first_error, done);
                    continue;
                }
                Some(delegated) if delegated.status == ActionStatus::ScheduledOnAgent => {
                    self.store.transition_run(run.id, RunStatus::Waiting, None)?;
                    self.notifier.publish(channels::RUN_UPDATED);
                    return Ok(RunOutcome::Waiting);
                }
                Some(pending) => pending.clone(),
                None => RunAction::new(run.id, spec.name.clone()),
            };
            let is_new = !existing.contains_key(&spec.name);

            if cancel.is_cancelled() {
                return self.abandon(&run, &mut action, is_new, EngineError::Cancelled);
            }
            if now() >= deadline {
                return self.abandon(&run, &mut action, is_new, EngineError::Timeout);
            }

            let gate = self.cel.evaluate_gate(spec.filter.as_deref(), env.vars(), prior);
            match gate {
                Ok(Gate::Run) => {}
                Ok(Gate::Skip) => {
                    action.status = ActionStatus::Skipped;
                    action.result = None;
                    action.end_time = Some(now());
                    self.persist(&action, is_new)?;
                    debug!(run_id = %run.id, action = %spec.name, "Action skipped");
                    env.record_action(&action);
                    continue;
                }
                Err(e) => {
                    action.status = ActionStatus::Failed;
                    action.error = Some(e.to_string());
                    action.end_time = Some(now());
                    self.persist(&action, is_new)?;
                    warn!(run_id = %run.id, action = %spec.name, error = %e, "Action gate failed");
                    env.record_action(&action);
                    note_outcome(&mut prior, &mut first_error, &action);
                    continue;
                }
            }

            let resumes_here = resuming.as_deref() == Some(spec.name.as_str());
            if let Some(delay) = spec.delay().filter(|d| !d.is_zero())
                && !resumes_here
            {
                let until = add(now(), delay);
                action.status = ActionStatus::Sleeping;
                action.start_time = None;
                action.scheduled_time = until;
                self.persist(&action, is_new)?;
                self.store.sleep_run(run.id, until)?;
                self.notifier.publish(channels::RUN_UPDATED);
                info!(run_id = %run.id, action = %spec.name, until = %until, "Run sleeping before delayed action");
                return Ok(RunOutcome::Sleeping);
            }

            let agent = if spec.runs_on.is_empty() {
                run.agent_id
            } else {
                let resource = self.resource(&run)?;
                place(&self.store, &spec.runs_on, resource.as_ref())?
            };
            if let Some(agent_id) = agent {
                return self.delegate(&run, action, is_new, spec, &env, agent_id);
            }

            action.status = ActionStatus::Running;
            action.start_time = Some(now());
            action.error = None;
            self.persist(&action, is_new)?;

            let timeout = self.action_timeout(spec).min(remaining(deadline));
            let outcome = match render_action(&env, spec) {
                Ok(rendered) => {
                    let ctx = self.context(&run, &action, &env);
                    run_with_limits(&ctx, &rendered, timeout, cancel).await
                }
                Err(e) => Err(e),
            };
            let cancelled = matches!(outcome, Err(EngineError::Cancelled));
            self.finish(&run, &mut action, outcome).await?;
            env.record_action(&action);
            note_outcome(&mut prior, &mut first_error, &action);

            if cancelled {
                return self.settle(&run, RunStatus::Failed, Some("cancelled"));
            }
        }

        match first_error {
            Some(error) => self.settle(&run, RunStatus::Failed, Some(&error)),
            None => self.settle(&run, RunStatus::Completed, None),
        }
    }

    /// Execute one action handed to this process by an upstream host.
    ///
    /// The run and action rows are mirrored into the local store so the
    /// terminal result can be pushed back later.
    pub async fn execute_delegated(
        &self,
        item: ActionForAgent,
        cancel: &CancellationToken,
    ) -> Result<RunAction> {
        let ActionForAgent {
            run,
            mut action,
            action_spec,
            env,
        } = item;

        self.store.upsert_run(&run)?;
        action.status = ActionStatus::Running;
        action.start_time = Some(now());
        action.is_pushed = false;
        self.store.upsert_action(&action)?;

        let env = TemplateEnv::from_value(env);
        let timeout = self.action_timeout(&action_spec);
        let outcome = match render_action(&env, &action_spec) {
            Ok(rendered) => {
                let ctx = self.context(&run, &action, &env);
                run_with_limits(&ctx, &rendered, timeout, cancel).await
            }
            Err(e) => Err(e),
        };
        self.finish(&run, &mut action, outcome).await?;
        Ok(action)
    }

    /// Mark a running run failed, e.g. after its task panicked.
    pub fn fail_run(&self, run_id: Uuid, error: &str) -> Result<()> {
        if let Some(run) = self.store.get_run(run_id)?
            && run.status.can_transition(RunStatus::Failed)
        {
            self.store.transition_run(run_id, RunStatus::Failed, Some(error))?;
            self.notifier.publish(channels::RUN_UPDATED);
        }
        Ok(())
    }

    fn delegate(
        &self,
        run: &Run,
        mut action: RunAction,
        is_new: bool,
        spec: &PlaybookAction,
        env: &TemplateEnv,
        agent_id: Uuid,
    ) -> Result<RunOutcome> {
        action.status = ActionStatus::ScheduledOnAgent;
        action.agent_id = Some(agent_id);
        self.persist(&action, is_new)?;
        self.store.insert_agent_data(&AgentData {
            run_id: run.id,
            action_id: action.id,
            spec: serde_json::to_value(spec)?,
            env: env.to_value(),
        })?;
        self.store.transition_run(run.id, RunStatus::Waiting, None)?;
        self.notifier.publish(channels::RUN_UPDATED);
        info!(run_id = %run.id, action = %action.name, agent_id = %agent_id, "Action delegated to agent");
        Ok(RunOutcome::Waiting)
    }

    /// Record an action that never started and end the run.
    fn abandon(
        &self,
        run: &Run,
        action: &mut RunAction,
        is_new: bool,
        error: EngineError,
    ) -> Result<RunOutcome> {
        let message = error.to_string();
        action.status = ActionStatus::Failed;
        action.error = Some(message.clone());
        action.end_time = Some(now());
        self.persist(action, is_new)?;
        warn!(run_id = %run.id, action = %action.name, error = %message, "Run stopped before action");
        self.settle(run, RunStatus::Failed, Some(&message))
    }

    /// Move the run to a terminal state unless something else (a cancel)
    /// already did.
    fn settle(&self, run: &Run, to: RunStatus, error: Option<&str>) -> Result<RunOutcome> {
        let current = self.store.require_run(run.id)?;
        if current.status.is_terminal() {
            debug!(run_id = %run.id, status = %current.status, "Run already terminal");
            return Ok(outcome_of(current.status));
        }
        let done = self.store.transition_run(run.id, to, error)?;
        self.notifier.publish(channels::RUN_UPDATED);
        match error {
            Some(error) => warn!(run_id = %run.id, status = %done.status, error = %error, "Run finished"),
            None => info!(run_id = %run.id, status = %done.status, "Run finished"),
        }
        Ok(outcome_of(done.status))
    }

    fn persist(&self, action: &RunAction, is_new: bool) -> Result<()> {
        if is_new {
            self.store.upsert_action(action)?;
        } else {
            self.store.update_action(action)?;
        }
        Ok(())
    }

    /// Persist the outcome of an executed action.
    async fn finish(
        &self,
        run: &Run,
        action: &mut RunAction,
        outcome: Result<ActionOutput>,
    ) -> Result<()> {
        action.end_time = Some(now());
        match outcome {
            Ok(output) => {
                for artifact in &output.artifacts {
                    self.store.upsert_artifact(artifact)?;
                }
                action.result = Some(self.bound_result(run, action, output.result).await?);
                match output.failure {
                    Some(failure) => {
                        action.status = ActionStatus::Failed;
                        action.error = Some(failure);
                    }
                    None => action.status = ActionStatus::Completed,
                }
            }
            Err(e) => {
                action.status = ActionStatus::Failed;
                action.error = Some(e.to_string());
            }
        }
        self.store.update_action(action)?;
        self.notifier.publish(channels::RUN_UPDATED);

        match &action.error {
            Some(error) => warn!(run_id = %run.id, action = %action.name, error = %error, "Action failed"),
            None => info!(run_id = %run.id, action = %action.name, "Action completed"),
        }
        Ok(())
    }

    /// Results over `max_result_bytes` are replaced by a pointer to an
    /// artifact holding the full JSON.
    async fn bound_result(&self, run: &Run, action: &RunAction, result: Value) -> Result<Value> {
        let limit = self.config.engine().max_result_bytes;
        let bytes = serde_json::to_vec(&result)?;
        if bytes.len() <= limit {
            return Ok(result);
        }

        if let Some(store) = &self.artifacts {
            let declared = format!("{}/result.json", action.id);
            match store.save_bytes(run.id, action.id, &declared, &bytes).await {
                Ok(artifact) => {
                    self.store.upsert_artifact(&artifact)?;
                    return Ok(json!({ "artifact": artifact.id, "truncated": true }));
                }
                Err(e) => {
                    warn!(run_id = %run.id, action = %action.name, error = %e, "Failed to spill result to artifact");
                }
            }
        }
        Ok(json!({ "truncated": true, "size": bytes.len() }))
    }

    fn context(&self, run: &Run, action: &RunAction, env: &TemplateEnv) -> ActionContext {
        ActionContext {
            run: run.clone(),
            action: action.clone(),
            env: env.clone(),
            config: self.config.clone(),
            artifacts: self.artifacts.clone(),
            http: self.http.clone(),
        }
    }

    fn resource(&self, run: &Run) -> Result<Option<Resource>> {
        match run.target() {
            Some(target) => Ok(self.store.get_resource(target)?),
            None => Ok(None),
        }
    }

    fn run_env(&self, run: &Run, playbook: &Playbook) -> Result<TemplateEnv> {
        let resource = self.resource(run)?;
        let user = match run.created_by {
            Some(id) => match self.store.get_person(id)? {
                Some(person) => Some(Principal {
                    teams: self.store.teams_for_person(person.id)?,
                    person,
                }),
                None => None,
            },
            None => None,
        };

        let mut env = resource_env(&self.store, resource.as_ref())?
            .with_params(&run.parameters)
            .with_user(user.as_ref())
            .with_request(run.request.as_ref());
        if let Some(agent_id) = run.agent_id
            && let Some(agent) = self.store.get_agent(agent_id)?
        {
            env.set("agent", serde_json::to_value(agent)?);
        }
        if let Some(Resource::Config(item)) = &resource {
            env.set("gitops", gitops_source(&self.store, item)?);
        }
        env.set(
            "run",
            json!({ "id": run.id, "playbook_id": run.playbook_id, "parameters": run.parameters }),
        );
        env.set(
            "playbook",
            json!({ "id": playbook.id, "name": playbook.name, "namespace": playbook.namespace }),
        );
        Ok(env)
    }

    fn action_timeout(&self, spec: &PlaybookAction) -> Duration {
        spec.timeout().unwrap_or_else(|| {
            let defaults = &self.config.engine().default_timeouts;
            match spec.kind() {
                Ok(kind) => defaults.for_kind(kind.name()),
                Err(_) => defaults.for_kind("exec"),
            }
        })
    }

    /// Run deadline: first start plus every action's timeout and delay.
    fn deadline(&self, playbook: &Playbook, started: Timestamp) -> Timestamp {
        let budget: Duration = playbook
            .spec
            .actions
            .iter()
            .map(|a| self.action_timeout(a) + a.delay().unwrap_or_default())
            .sum();
        add(started, budget)
    }
}

async fn run_with_limits(
    ctx: &ActionContext,
    spec: &PlaybookAction,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ActionOutput> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = tokio::time::timeout(timeout, actions::execute(ctx, spec)) => {
            result.unwrap_or(Err(EngineError::Timeout))
        }
    }
}

/// Expand templates in every string of the action. The pod spec keeps the
/// JSON type of single-expression values; everything else renders to text.
fn render_action(env: &TemplateEnv, spec: &PlaybookAction) -> Result<PlaybookAction> {
    let mut raw = spec.clone();
    raw.filter = None;
    let mut value = serde_json::to_value(&raw)?;
    let pod_spec = value.pointer_mut("/pod/spec").map(Value::take);

    let mut rendered = render_strings(env, &value)?;
    if let Some(pod_spec) = pod_spec
        && let Some(Value::Object(pod)) = rendered.pointer_mut("/pod")
    {
        pod.insert("spec".to_string(), env.render_value(&pod_spec)?);
    }
    Ok(serde_json::from_value(rendered)?)
}

fn render_strings(env: &TemplateEnv, value: &Value) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(env.render(s)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_strings(env, v))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), render_strings(env, v)?)))
                .collect::<Result<_>>()?,
        ),
        other => other.clone(),
    })
}

fn note_outcome(prior: &mut PriorOutcome, first_error: &mut Option<String>, action: &RunAction) {
    if action.failed() {
        prior.failed = true;
        prior.timed_out |= action.timed_out();
        if first_error.is_none() {
            *first_error = Some(
                action
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("action '{}' failed", action.name)),
            );
        }
    }
}

fn outcome_of(status: RunStatus) -> RunOutcome {
    match status {
        RunStatus::Completed => RunOutcome::Completed,
        RunStatus::Cancelled => RunOutcome::Cancelled,
        RunStatus::Sleeping => RunOutcome::Sleeping,
        RunStatus::Waiting | RunStatus::WaitingPlaybook => RunOutcome::Waiting,
        _ => RunOutcome::Failed,
    }
}

/// Earliest start recorded for the run. The run's own `start_time` moves on
/// every claim, so action rows are consulted first.
fn first_start<'a>(run: &Run, actions: impl Iterator<Item = &'a RunAction>) -> Timestamp {
    actions
        .filter_map(|a| a.start_time)
        .chain(run.start_time)
        .min()
        .unwrap_or_else(now)
}

fn add(at: Timestamp, d: Duration) -> Timestamp {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn remaining(deadline: Timestamp) -> Duration {
    (deadline - now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_types::{ConfigItem, ExecAction, PlaybookSpec, Target};

    struct Fixture {
        store: Arc<Store>,
        runner: Runner,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let runner = Runner::new(
            store.clone(),
            Notifier::new(),
            Arc::new(CelEngine::new()),
            Arc::new(RemedyConfig::default()),
            Some(ArtifactStore::at(dir.path())),
        );
        Fixture {
            store,
            runner,
            _dir: dir,
        }
    }

    fn exec(name: &str, script: &str) -> PlaybookAction {
        PlaybookAction {
            name: name.into(),
            exec: Some(ExecAction {
                script: script.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn claimed(store: &Store, actions: Vec<PlaybookAction>) -> Run {
        let pb = store
            .upsert_playbook(&Playbook::new(
                "p",
                PlaybookSpec {
                    actions,
                    ..Default::default()
                },
            ))
            .unwrap();
        let run = Run::new(pb.id);
        store.insert_run(&run).unwrap();
        assert!(store.claim_run(run.id).unwrap());
        store.require_run(run.id).unwrap()
    }

    fn statuses(store: &Store, run: &Run) -> Vec<(String, ActionStatus)> {
        store
            .list_actions(run.id)
            .unwrap()
            .into_iter()
            .map(|a| (a.name, a.status))
            .collect()
    }

    #[tokio::test]
    async fn test_actions_see_previous_results() {
        let f = fixture();
        let run = claimed(
            &f.store,
            vec![
                exec("first", "printf 42"),
                exec("second", "printf \"got {{last_action.stdout}}\""),
            ],
        );
        let outcome = f.runner.execute(run.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let second = f.store.get_action_by_name(run.id, "second").unwrap().unwrap();
        assert_eq!(second.result.unwrap()["stdout"], "got 42");
        let done = f.store.require_run(run.id).unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.end_time.is_some());
    }

    #[tokio::test]
    async fn test_failure_skips_rest_but_runs_compensation() {
        let f = fixture();
        let mut cleanup = exec("cleanup", "echo cleaning");
        cleanup.filter = Some("failure()".into());
        let run = claimed(
            &f.store,
            vec![exec("break", "exit 2"), exec("next", "echo never"), cleanup],
        );
        let outcome = f.runner.execute(run.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(
            statuses(&f.store, &run),
            vec![
                ("break".to_string(), ActionStatus::Failed),
                ("next".to_string(), ActionStatus::Skipped),
                ("cleanup".to_string(), ActionStatus::Completed),
            ]
        );
        let done = f.store.require_run(run.id).unwrap();
        assert!(done.error.unwrap().starts_with("exit status 2"));
    }

    #[tokio::test]
    async fn test_bad_gate_fails_action() {
        let f = fixture();
        let mut gated = exec("gated", "echo hi");
        gated.filter = Some("this is not cel (".into());
        let run = claimed(&f.store, vec![gated]);
        let outcome = f.runner.execute(run.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(statuses(&f.store, &run)[0].1, ActionStatus::Failed);
    }

    #[tokio::test]
    async fn test_delay_puts_run_to_sleep_then_resumes() {
        let f = fixture();
        let mut later = exec("later", "echo after");
        later.delay = Some("1h".into());
        let run = claimed(&f.store, vec![exec("now", "echo go"), later]);

        let outcome = f.runner.execute(run.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Sleeping);
        let sleeping = f.store.require_run(run.id).unwrap();
        assert_eq!(sleeping.status, RunStatus::Sleeping);
        assert!(sleeping.scheduled_time > now() + chrono::Duration::minutes(59));
        assert_eq!(
            f.store.sleeping_action(run.id).unwrap().unwrap().name,
            "later"
        );

        // Wake it early by rescheduling, then claim again.
        f.store.schedule_run(run.id, now()).unwrap();
        assert!(f.store.claim_run(run.id).unwrap());
        let resumed = f.store.require_run(run.id).unwrap();
        let outcome = f.runner.execute(resumed, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(f.store.list_actions(run.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_action_timeout() {
        let f = fixture();
        let mut slow = exec("slow", "sleep 5");
        slow.timeout = Some("100ms".into());
        let mut after = exec("after", "echo timed out");
        after.filter = Some("timeout()".into());
        let run = claimed(&f.store, vec![slow, after]);

        let outcome = f.runner.execute(run.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        let slow = f.store.get_action_by_name(run.id, "slow").unwrap().unwrap();
        assert_eq!(slow.error.as_deref(), Some("timeout"));
        assert_eq!(
            f.store.get_action_by_name(run.id, "after").unwrap().unwrap().status,
            ActionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancellation_fails_current_action() {
        let f = fixture();
        let run = claimed(&f.store, vec![exec("slow", "sleep 5")]);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = f.runner.execute(run.clone(), &token).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        let slow = f.store.get_action_by_name(run.id, "slow").unwrap().unwrap();
        assert_eq!(slow.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_runs_on_agent_delegates() {
        let f = fixture();
        let mut remote = exec("remote", "echo {{config.name}}");
        remote.runs_on = vec!["a1".into()];
        let item = ConfigItem {
            id: Uuid::new_v4(),
            name: "db".into(),
            ..Default::default()
        };
        f.store.upsert_config_item(&item).unwrap();

        let pb = f
            .store
            .upsert_playbook(&Playbook::new(
                "p",
                PlaybookSpec {
                    actions: vec![remote],
                    ..Default::default()
                },
            ))
            .unwrap();
        let run = Run::new(pb.id).with_target(Some(Target::config(item.id)));
        f.store.insert_run(&run).unwrap();
        f.store.claim_run(run.id).unwrap();
        let run = f.store.require_run(run.id).unwrap();

        let outcome = f.runner.execute(run.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Waiting);
        assert_eq!(f.store.require_run(run.id).unwrap().status, RunStatus::Waiting);

        let agent = f.store.get_agent_by_name("a1").unwrap().unwrap();
        let (_, action, data) = f.store.claim_agent_action(agent.id).unwrap().unwrap();
        assert_eq!(action.name, "remote");
        // The spec travels unrendered with the environment to render it.
        assert_eq!(data.spec["exec"]["script"], "echo {{config.name}}");
        assert_eq!(data.env["config"]["name"], "db");
    }

    #[tokio::test]
    async fn test_actions_see_gitops_source_of_config() {
        let f = fixture();
        let item = ConfigItem {
            id: Uuid::new_v4(),
            name: "web".into(),
            config_type: "Kubernetes::Deployment".into(),
            config: json!({
                "metadata": {
                    "name": "web",
                    "annotations": { "config.kubernetes.io/origin": "path: apps/web/deploy.yaml" },
                },
            }),
            ..Default::default()
        };
        f.store.upsert_config_item(&item).unwrap();
        let pb = f
            .store
            .upsert_playbook(&Playbook::new(
                "p",
                PlaybookSpec {
                    actions: vec![exec("where", "printf {{gitops.git.dir}}")],
                    ..Default::default()
                },
            ))
            .unwrap();
        let run = Run::new(pb.id).with_target(Some(Target::config(item.id)));
        f.store.insert_run(&run).unwrap();
        f.store.claim_run(run.id).unwrap();
        let run = f.store.require_run(run.id).unwrap();

        let outcome = f.runner.execute(run.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        let action = f.store.get_action_by_name(run.id, "where").unwrap().unwrap();
        assert_eq!(action.result.unwrap()["stdout"], "apps/web");
    }

    #[tokio::test]
    async fn test_large_result_spills_to_artifact() {
        let f = fixture();
        let run = claimed(&f.store, vec![exec("big", "head -c 100000 /dev/zero | tr '\\0' x")]);
        f.runner.execute(run.clone(), &CancellationToken::new()).await.unwrap();

        let big = f.store.get_action_by_name(run.id, "big").unwrap().unwrap();
        let result = big.result.unwrap();
        assert_eq!(result["truncated"], true);
        let artifact_id: Uuid = serde_json::from_value(result["artifact"].clone()).unwrap();
        let artifact = f.store.get_artifact(artifact_id).unwrap().unwrap();
        assert!(artifact.size > 100_000);
        assert_eq!(artifact.content_type, "application/json");
    }

    #[tokio::test]
    async fn test_missing_resume_action_fails_run() {
        let f = fixture();
        let run = claimed(&f.store, vec![exec("a", "true")]);
        let mut ghost = RunAction::new(run.id, "removed");
        ghost.status = ActionStatus::Sleeping;
        f.store.insert_action(&ghost).unwrap();

        let outcome = f.runner.execute(run.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert!(
            f.store
                .require_run(run.id)
                .unwrap()
                .error
                .unwrap()
                .contains("removed")
        );
    }

    #[test]
    fn test_render_action_keeps_pod_types() {
        let mut env = TemplateEnv::new();
        env.set("params", json!({"replicas": "3", "image": "nginx"}));
        env.set("config", json!({"spec": {"port": 8080}}));
        let spec = PlaybookAction {
            name: "p".into(),
            pod: Some(remedy_types::PodAction {
                name: "{{params.image}}".into(),
                spec: json!({"port": "{{config.spec.port}}"}),
                ..Default::default()
            }),
            ..Default::default()
        };
        let rendered = render_action(&env, &spec).unwrap();
        let pod = rendered.pod.unwrap();
        assert_eq!(pod.name, "nginx");
        assert_eq!(pod.spec["port"], 8080);
    }
}
