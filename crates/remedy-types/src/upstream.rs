//! Wire types exchanged between an agent and its upstream host.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::playbook::PlaybookAction;
use crate::run::{Run, RunAction};

/// Spec and template environment stored for an action delegated to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentData {
    pub run_id: Uuid,
    pub action_id: Uuid,
    /// The playbook action, before template expansion.
    pub spec: Value,
    /// Template environment captured by the host at delegation time.
    pub env: Value,
}

/// A unit of work handed to an agent.
#[derive(Debug, Clone)]
pub struct ActionForAgent {
    pub run: Run,
    pub action: RunAction,
    pub action_spec: PlaybookAction,
    pub env: Value,
}

/// Response of `GET /upstream/playbook-action`. Empty (`{}`) means no work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionEnvelope {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub run: Option<Run>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action: Option<RunAction>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action_spec: Option<PlaybookAction>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub env: Option<Value>,
}

impl ActionEnvelope {
    pub fn is_empty(&self) -> bool {
        self.action.is_none()
    }

    /// Unpack into a complete work item; `None` for the empty envelope.
    pub fn into_action(self) -> Option<ActionForAgent> {
        Some(ActionForAgent {
            run: self.run?,
            action: self.action?,
            action_spec: self.action_spec?,
            env: self.env.unwrap_or(Value::Null),
        })
    }
}

impl From<ActionForAgent> for ActionEnvelope {
    fn from(a: ActionForAgent) -> Self {
        Self {
            run: Some(a.run),
            action: Some(a.action),
            action_spec: Some(a.action_spec),
            env: Some(a.env),
        }
    }
}

/// Body of `POST /upstream/push`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushData {
    #[serde(default)]
    pub actions: Vec<RunAction>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl PushData {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.artifacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_envelope() {
        let env: ActionEnvelope = serde_json::from_str("{}").unwrap();
        assert!(env.is_empty());
        assert!(env.into_action().is_none());
        assert_eq!(
            serde_json::to_string(&ActionEnvelope::default()).unwrap(),
            "{}"
        );
    }

    #[test]
    fn test_envelope_from_action() {
        let run = Run::new(Uuid::new_v4());
        let action = RunAction::new(run.id, "a");
        let item = ActionForAgent {
            run,
            action,
            action_spec: PlaybookAction {
                name: "a".into(),
                ..Default::default()
            },
            env: serde_json::json!({"params": {}}),
        };
        let env = ActionEnvelope::from(item);
        let json = serde_json::to_string(&env).unwrap();
        let back: ActionEnvelope = serde_json::from_str(&json).unwrap();
        let item = back.into_action().unwrap();
        assert_eq!(item.action.name, "a");
    }
}
