//! Shared entity model for Remedy.
//!
//! Every crate in the workspace speaks in these types: playbook
//! specifications, runs and their actions, the change events that trigger
//! them, approvals, artifacts, and the read-only resource catalog the engine
//! reacts to.

pub mod api;
pub mod artifact;
pub mod duration;
pub mod error;
pub mod event;
pub mod playbook;
pub mod resource;
pub mod run;
pub mod upstream;

pub use api::{ArtifactList, RunCreated, RunDetail, RunRequest};
pub use artifact::Artifact;
pub use duration::{format_duration, parse_duration};
pub use error::{Result, TypesError};
pub use event::{Event, EventClass, channels};
pub use playbook::{
    ActionKind, ApprovalSpec, ApprovalType, Approvers, BasicAuth, CommitSpec, EventTrigger,
    ExecAction, GitFile, GitRepo, GitopsAction, GithubAuth, HttpAction, JwtAuth,
    NotificationAction, ParameterType, Playbook, PlaybookAction, PlaybookParameter, PlaybookSpec,
    PodAction, PullRequestSpec, ResourceSelector, SqlAction, SvixAuth, Triggers, WebhookAuth,
    WebhookAuthScheme, WebhookTrigger,
};
pub use resource::{
    Agent, Canary, Check, Component, ConfigItem, Person, Principal, Resource, Target, TargetKind,
    Team,
};
pub use run::{ActionStatus, Approval, Run, RunAction, RunStatus};
pub use upstream::{ActionEnvelope, ActionForAgent, AgentData, PushData};

/// Shorthand for UTC timestamps used across the model.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Current time in UTC.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
