//! Materialising runs.
//!
//! Every run source (API submission, event match, webhook) ends here once
//! its parameters are final, so status, schedule and agent placement are
//! decided the same way for all of them.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use remedy_store::Store;
use remedy_types::{Playbook, Resource, Run, RunStatus, channels, now};

use crate::error::{EngineError, Result};
use crate::notifier::Notifier;

/// The agent name that pins a run to the host.
pub const LOCAL_AGENT: &str = "local";

/// Everything needed to insert a new run.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub playbook: &'a Playbook,
    pub resource: Option<&'a Resource>,
    pub params: HashMap<String, String>,
    pub created_by: Option<Uuid>,
    pub request: Option<Value>,
    /// Extra delay before the run becomes claimable.
    pub delay: Option<Duration>,
}

/// Insert a run in `pending` (approval required) or `scheduled`, and wake
/// the scheduler.
pub fn create_run(store: &Store, notifier: &Notifier, new: NewRun<'_>) -> Result<Run> {
    let playbook = new.playbook;
    let run = prepare_run(store, new)?;
    store.insert_run(&run).map_err(EngineError::from_store)?;
    created(notifier, &run, &playbook.name);
    Ok(run)
}

/// Insert every run in one transaction. Used where a batch comes from a
/// single retryable source, so a retry never duplicates part of it.
pub fn create_runs(store: &Store, notifier: &Notifier, runs: &[(Run, &Playbook)]) -> Result<()> {
    if runs.is_empty() {
        return Ok(());
    }
    let rows: Vec<Run> = runs.iter().map(|(run, _)| run.clone()).collect();
    store.insert_runs(&rows).map_err(EngineError::from_store)?;
    for (run, playbook) in runs {
        created(notifier, run, &playbook.name);
    }
    Ok(())
}

/// Build the run row without storing it.
pub fn prepare_run(store: &Store, new: NewRun<'_>) -> Result<Run> {
    let mut run = Run::new(new.playbook.id).with_target(new.resource.map(Resource::target));
    run.parameters = new.params;
    run.created_by = new.created_by;
    run.request = new.request;
    run.agent_id = placement(store, new.playbook, new.resource)?;
    if new.playbook.requires_approval() {
        run.status = RunStatus::Pending;
    }
    if let Some(delay) = new.delay {
        run.scheduled_time = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now().checked_add_signed(d))
            .ok_or_else(|| EngineError::Validation(format!("delay out of range: {delay:?}")))?;
    }
    Ok(run)
}

fn created(notifier: &Notifier, run: &Run, playbook: &str) {
    info!(
        run_id = %run.id,
        playbook = %playbook,
        status = %run.status,
        "Run created"
    );
    notifier.publish(channels::RUN_CREATED);
}

/// Decide where a run executes.
///
/// With no `runsOn`, the host. Otherwise the resource's own agent when it is
/// listed, the host when `local` is listed, else the first listed agent.
pub fn placement(
    store: &Store,
    playbook: &Playbook,
    resource: Option<&Resource>,
) -> Result<Option<Uuid>> {
    place(store, &playbook.spec.runs_on, resource)
}

/// [`placement`] for an explicit `runsOn` list, e.g. an action's override.
pub fn place(store: &Store, runs_on: &[String], resource: Option<&Resource>) -> Result<Option<Uuid>> {
    if runs_on.is_empty() {
        return Ok(None);
    }

    if let Some(agent_id) = resource.and_then(Resource::agent_id)
        && let Some(agent) = store.get_agent(agent_id)?
        && runs_on.iter().any(|n| n == &agent.name)
    {
        return Ok(Some(agent.id));
    }

    if runs_on.iter().any(|n| n == LOCAL_AGENT) {
        return Ok(None);
    }

    let agent = store.get_or_create_agent(&runs_on[0])?;
    Ok(Some(agent.id))
}
