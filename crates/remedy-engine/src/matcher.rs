//! Event to playbook matching.
//!
//! For each change event the matcher finds the playbooks subscribed to its
//! `class.event` name, checks every trigger's labels and CEL filter against
//! the event's resource, and creates one run per matching playbook.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use remedy_store::Store;
use remedy_types::{
    Event, EventClass, EventTrigger, Playbook, Resource, Run, Target, channels,
};

use crate::cache::{DEFAULT_CAPACITY, TtlCache};
use crate::cel::CelEngine;
use crate::error::{EngineError, Result};
use crate::notifier::Notifier;
use crate::params::{ParamRequest, fill_defaults};
use crate::runs::{NewRun, create_runs, prepare_run};
use crate::template::TemplateEnv;

type CacheKey = (String, String);

/// Resolves events into runs.
pub struct Matcher {
    store: Arc<Store>,
    notifier: Notifier,
    cel: Arc<CelEngine>,
    playbooks: TtlCache<CacheKey, Arc<Vec<Playbook>>>,
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("cached_event_kinds", &self.playbooks.len())
            .finish_non_exhaustive()
    }
}

impl Matcher {
    pub fn new(store: Arc<Store>, notifier: Notifier, cel: Arc<CelEngine>, ttl: Duration) -> Self {
        Self {
            store,
            notifier,
            cel,
            playbooks: TtlCache::new(DEFAULT_CAPACITY, ttl),
        }
    }

    /// Drop every cached playbook lookup. Called on `playbook_spec_updated`.
    pub fn invalidate(&self) {
        self.playbooks.clear();
        debug!("Event playbook cache cleared");
    }

    /// Clear the cache on every `playbook_spec_updated` until `shutdown`.
    pub async fn watch_specs(self: Arc<Self>, shutdown: CancellationToken) {
        let mut updates = self.notifier.subscribe(&[channels::PLAYBOOK_SPEC_UPDATED]);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = updates.recv() => self.invalidate(),
            }
        }
    }

    /// Create the runs `event` triggers.
    ///
    /// Events that name no resource, or whose resource no longer exists,
    /// match nothing. Store failures propagate so the event is retried.
    pub fn handle(&self, event: &Event) -> Result<Vec<Run>> {
        let Some(class) = event.class() else {
            debug!(event = %event.name, "Event name has no class, ignoring");
            return Ok(Vec::new());
        };

        let candidates = self.candidates(&class)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let Some(kind) = class.target_kind() else {
            debug!(event = %event.name, "Event class has no resource kind, ignoring");
            return Ok(Vec::new());
        };
        let Some(id) = event.resource_id() else {
            warn!(event_id = %event.id, event = %event.name, "Event carries no resource id");
            return Ok(Vec::new());
        };
        let Some(resource) = self.store.get_resource(Target { kind, id })? else {
            warn!(event_id = %event.id, resource_id = %id, "Event resource not found");
            return Ok(Vec::new());
        };

        let vars = self.environment(&resource)?;
        let mut runs = Vec::new();
        for playbook in candidates.iter() {
            let Some(trigger) = playbook
                .spec
                .on
                .for_class(&class.class)
                .iter()
                .filter(|t| t.event == class.event)
                .find(|t| self.trigger_matches(t, &resource, &vars))
            else {
                continue;
            };

            let labels = trigger.labels.clone();
            let req = ParamRequest {
                playbook,
                resource: Some(&resource),
                supplied: &labels,
                user: None,
                request: None,
            };
            let params = match fill_defaults(req, labels.clone()) {
                Ok(p) => p,
                Err(e) => {
                    warn!(
                        playbook = %playbook.name,
                        event_id = %event.id,
                        error = %e,
                        "Skipping playbook, parameters could not be prepared"
                    );
                    continue;
                }
            };

            let new = NewRun {
                playbook,
                resource: Some(&resource),
                params,
                created_by: None,
                request: None,
                delay: playbook.spec.delay(),
            };
            match prepare_run(&self.store, new) {
                Ok(run) => runs.push((run, playbook)),
                Err(EngineError::Validation(reason)) => {
                    warn!(
                        playbook = %playbook.name,
                        event_id = %event.id,
                        error = %reason,
                        "Skipping playbook, run could not be prepared"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        create_runs(&self.store, &self.notifier, &runs)?;
        let runs: Vec<Run> = runs.into_iter().map(|(run, _)| run).collect();
        if !runs.is_empty() {
            info!(
                event_id = %event.id,
                event = %event.name,
                runs = runs.len(),
                "Event matched playbooks"
            );
        }
        Ok(runs)
    }

    /// Labels must all be present; a filter, when set, must evaluate to
    /// `true`. A filter that fails to compile or evaluate is a non-match.
    pub fn trigger_matches(
        &self,
        trigger: &EventTrigger,
        resource: &Resource,
        vars: &Map<String, Value>,
    ) -> bool {
        if !resource.has_labels(&trigger.labels) {
            return false;
        }
        let Some(filter) = trigger.filter.as_deref().filter(|f| !f.trim().is_empty()) else {
            return true;
        };
        match self.cel.evaluate_bool(filter, vars) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(filter = %filter, error = %e, "Trigger filter failed, treating as no match");
                false
            }
        }
    }

    fn candidates(&self, class: &EventClass) -> Result<Arc<Vec<Playbook>>> {
        let key = (class.class.clone(), class.event.clone());
        self.playbooks.get_or_try_insert_with(key, || {
            let found = self
                .store
                .find_playbooks_for_event(&class.class, &class.event)?;
            debug!(event = %class, playbooks = found.len(), "Loaded playbooks for event");
            Ok(Arc::new(found))
        })
    }

    fn environment(&self, resource: &Resource) -> Result<Map<String, Value>> {
        Ok(resource_env(&self.store, Some(resource))?.vars().clone())
    }
}

/// The resource-typed environment shared by trigger filters and action
/// templates. Slots not relevant to the resource stay null.
pub(crate) fn resource_env(store: &Store, resource: Option<&Resource>) -> Result<TemplateEnv> {
    let mut env = TemplateEnv::new().with_resource(resource);
    env.set("check_summary", Value::Null);
    let Some(resource) = resource else {
        return Ok(env);
    };

    if let Resource::Check(check) = resource {
        env.set("check_summary", json!({ "status": check.status }));
        if let Some(canary_id) = check.canary_id
            && let Some(canary) = store.get_canary(canary_id)?
        {
            env.set("canary", serde_json::to_value(canary)?);
        }
    }
    if let Some(agent_id) = resource.agent_id()
        && let Some(agent) = store.get_agent(agent_id)?
    {
        env.set("agent", serde_json::to_value(agent)?);
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use remedy_types::{Component, ExecAction, PlaybookAction, PlaybookSpec, RunStatus, Triggers};
    use uuid::Uuid;

    fn matcher(store: Arc<Store>) -> Matcher {
        Matcher::new(
            store,
            Notifier::new(),
            Arc::new(CelEngine::new()),
            Duration::from_secs(3600),
        )
    }

    fn unhealthy_playbook() -> Playbook {
        Playbook::new(
            "restart-entity",
            PlaybookSpec {
                on: Triggers {
                    component: vec![EventTrigger {
                        event: "unhealthy".into(),
                        filter: Some(r#"component.type == "Entity""#.into()),
                        labels: [("telemetry".to_string(), "enabled".to_string())].into(),
                    }],
                    ..Default::default()
                },
                actions: vec![PlaybookAction {
                    name: "restart".into(),
                    exec: Some(ExecAction {
                        script: "echo restart".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    fn component(store: &Store, name: &str, labels: &[(&str, &str)]) -> Component {
        let c = Component {
            id: Uuid::new_v4(),
            name: name.into(),
            component_type: "Entity".into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            status: "unhealthy".into(),
            ..Default::default()
        };
        store.upsert_component(&c).unwrap();
        c
    }

    #[test]
    fn test_label_and_filter_match_creates_run() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_playbook(&unhealthy_playbook()).unwrap();
        let m = matcher(store.clone());

        let logistics = component(&store, "logistics", &[("telemetry", "enabled")]);
        let runs = m
            .handle(&Event::for_resource("component.unhealthy", logistics.id))
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].component_id, Some(logistics.id));
        assert_eq!(runs[0].status, RunStatus::Scheduled);
        assert_eq!(runs[0].parameters["telemetry"], "enabled");

        let other = component(&store, "billing", &[]);
        let runs = m
            .handle(&Event::for_resource("component.unhealthy", other.id))
            .unwrap();
        assert!(runs.is_empty());
    }

    #[test]
    fn test_unschedulable_playbook_does_not_fail_the_event() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let restart = store.upsert_playbook(&unhealthy_playbook()).unwrap();
        let mut far = unhealthy_playbook();
        far.name = "far-future".into();
        far.spec.delay = Some("100000000d".into());
        let m = matcher(store.clone());
        m.playbooks.insert(
            ("component".into(), "unhealthy".into()),
            Arc::new(vec![restart.clone(), far]),
        );

        let c = component(&store, "logistics", &[("telemetry", "enabled")]);
        let runs = m
            .handle(&Event::for_resource("component.unhealthy", c.id))
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].playbook_id, restart.id);
        assert_eq!(store.list_runs(Some(restart.id), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_broken_filter_is_non_match() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut pb = unhealthy_playbook();
        pb.spec.on.component[0].filter = Some("component.type ==".into());
        store.upsert_playbook(&pb).unwrap();
        let m = matcher(store.clone());

        let c = component(&store, "logistics", &[("telemetry", "enabled")]);
        let runs = m
            .handle(&Event::for_resource("component.unhealthy", c.id))
            .unwrap();
        assert!(runs.is_empty());
    }

    #[test]
    fn test_missing_resource_and_unknown_event() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_playbook(&unhealthy_playbook()).unwrap();
        let m = matcher(store);

        assert!(
            m.handle(&Event::for_resource("component.unhealthy", Uuid::new_v4()))
                .unwrap()
                .is_empty()
        );
        assert!(m.handle(&Event::new("component.unhealthy")).unwrap().is_empty());
        assert!(m.handle(&Event::new("garbage")).unwrap().is_empty());
    }

    #[test]
    fn test_cache_invalidation_sees_new_playbooks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let m = matcher(store.clone());
        let c = component(&store, "logistics", &[("telemetry", "enabled")]);
        let event = Event::for_resource("component.unhealthy", c.id);

        assert!(m.handle(&event).unwrap().is_empty());
        store.upsert_playbook(&unhealthy_playbook()).unwrap();
        // Still served from the cached empty lookup.
        assert!(m.handle(&event).unwrap().is_empty());

        m.invalidate();
        assert_eq!(m.handle(&event).unwrap().len(), 1);
    }
}
