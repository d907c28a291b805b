//! Runs, run actions, approvals and their state machines.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, TypesError};
use crate::resource::{Target, TargetKind};
use crate::{Timestamp, now};

/// One execution of a playbook against at most one target resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub playbook_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub component_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub check_id: Option<Uuid>,
    /// Merged and template-expanded parameters; the authoritative input.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub status: RunStatus,
    pub scheduled_time: Timestamp,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    /// Agent that executes this run's actions. `None` means the host.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_by: Option<Uuid>,
    /// Inbound webhook request (`{headers, body, params}`), if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub created_at: Timestamp,
}

impl Run {
    /// Create a run scheduled for immediate execution.
    pub fn new(playbook_id: Uuid) -> Self {
        let ts = now();
        Self {
            id: Uuid::new_v4(),
            playbook_id,
            config_id: None,
            component_id: None,
            check_id: None,
            parameters: HashMap::new(),
            status: RunStatus::Scheduled,
            scheduled_time: ts,
            start_time: None,
            end_time: None,
            agent_id: None,
            created_by: None,
            request: None,
            error: None,
            created_at: ts,
        }
    }

    /// Point the run at a target, clearing any previous one.
    pub fn with_target(mut self, target: Option<Target>) -> Self {
        self.config_id = None;
        self.component_id = None;
        self.check_id = None;
        if let Some(t) = target {
            match t.kind {
                TargetKind::Config => self.config_id = Some(t.id),
                TargetKind::Component => self.component_id = Some(t.id),
                TargetKind::Check => self.check_id = Some(t.id),
            }
        }
        self
    }

    /// The run's target, if it has one.
    pub fn target(&self) -> Option<Target> {
        self.config_id
            .map(Target::config)
            .or_else(|| self.component_id.map(Target::component))
            .or_else(|| self.check_id.map(Target::check))
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for approval.
    Pending,
    Scheduled,
    Running,
    Sleeping,
    /// Waiting on a remote agent to finish an action.
    Waiting,
    /// Waiting on a child run.
    WaitingPlaybook,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 9] = [
        RunStatus::Pending,
        RunStatus::Scheduled,
        RunStatus::Running,
        RunStatus::Sleeping,
        RunStatus::Waiting,
        RunStatus::WaitingPlaybook,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Scheduled => "scheduled",
            RunStatus::Running => "running",
            RunStatus::Sleeping => "sleeping",
            RunStatus::Waiting => "waiting",
            RunStatus::WaitingPlaybook => "waiting_playbook",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the state machine permits `self -> to`.
    pub fn can_transition(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Cancelled) => true,
            (Pending, Scheduled) => true,
            (Scheduled, Running) => true,
            (Running, Sleeping | Waiting | WaitingPlaybook | Completed | Failed) => true,
            (Sleeping | Waiting | WaitingPlaybook, Scheduled) => true,
            _ => false,
        }
    }

    /// Like [`can_transition`](Self::can_transition), as a `Result`.
    pub fn check_transition(&self, to: RunStatus) -> Result<()> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(TypesError::IllegalTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        RunStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| TypesError::UnknownStatus(s.to_string()))
    }
}

/// Execution record for one playbook action within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAction {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Name of the playbook action this record executes.
    pub name: String,
    pub status: ActionStatus,
    pub scheduled_time: Timestamp,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_id: Option<Uuid>,
    /// Whether the row has been pushed upstream (agent side).
    #[serde(default)]
    pub is_pushed: bool,
}

impl RunAction {
    pub fn new(run_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            name: name.into(),
            status: ActionStatus::Scheduled,
            scheduled_time: now(),
            start_time: None,
            end_time: None,
            result: None,
            error: None,
            agent_id: None,
            is_pushed: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ActionStatus::Completed
    }

    pub fn failed(&self) -> bool {
        self.status == ActionStatus::Failed
    }

    pub fn timed_out(&self) -> bool {
        self.failed() && self.error.as_deref() == Some("timeout")
    }
}

/// Status of a run action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Sleeping,
    Skipped,
    ScheduledOnAgent,
    Cancelled,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 8] = [
        ActionStatus::Scheduled,
        ActionStatus::Running,
        ActionStatus::Completed,
        ActionStatus::Failed,
        ActionStatus::Sleeping,
        ActionStatus::Skipped,
        ActionStatus::ScheduledOnAgent,
        ActionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Scheduled => "scheduled",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Sleeping => "sleeping",
            ActionStatus::Skipped => "skipped",
            ActionStatus::ScheduledOnAgent => "scheduled_on_agent",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed
                | ActionStatus::Failed
                | ActionStatus::Skipped
                | ActionStatus::Cancelled
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        ActionStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| TypesError::UnknownStatus(s.to_string()))
    }
}

/// A recorded consent for a pending run, by a person or on behalf of a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub person_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub team_id: Option<Uuid>,
    pub created_at: Timestamp,
}

impl Approval {
    pub fn by_person(run_id: Uuid, person_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            person_id: Some(person_id),
            team_id: None,
            created_at: now(),
        }
    }

    pub fn by_team(run_id: Uuid, person_id: Uuid, team_id: Uuid) -> Self {
        Self {
            team_id: Some(team_id),
            ..Self::by_person(run_id, person_id)
        }
    }
}
