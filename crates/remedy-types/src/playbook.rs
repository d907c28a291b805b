//! Playbook specifications.
//!
//! A playbook is a declarative, versioned workflow: triggers that decide when
//! it runs, a parameter schema, resource filters that decide what it may run
//! against, an approval policy, and an ordered list of actions.
//!
//! ```yaml
//! name: restart-deployment
//! namespace: default
//! spec:
//!   on:
//!     component:
//!       - event: unhealthy
//!         filter: component.type == "Entity"
//!         labels: { telemetry: enabled }
//!   parameters:
//!     - name: replicas
//!       default: "{{config.config.spec.replicas}}"
//!   actions:
//!     - name: scale
//!       exec:
//!         script: kubectl scale --replicas={{params.replicas}} deploy/{{config.name}}
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::duration::parse_duration;
use crate::error::{Result, TypesError};
use crate::resource::TargetKind;
use crate::{Timestamp, now};

// ─────────────────────────────────────────────────────────────────────────────
// Playbook
// ─────────────────────────────────────────────────────────────────────────────

/// A stored playbook: identity plus its specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub spec: PlaybookSpec,
    #[serde(default = "now")]
    pub created_at: Timestamp,
    #[serde(default = "now")]
    pub updated_at: Timestamp,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Playbook {
    /// Create a playbook with a fresh id in the default namespace.
    pub fn new(name: impl Into<String>, spec: PlaybookSpec) -> Self {
        let ts = now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            namespace: default_namespace(),
            spec,
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Validate the specification invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TypesError::playbook("<unnamed>", "name cannot be empty"));
        }
        self.spec.validate(&self.name)
    }

    /// Look up an action by name.
    pub fn action(&self, name: &str) -> Option<&PlaybookAction> {
        self.spec.actions.iter().find(|a| a.name == name)
    }

    /// Whether runs of this playbook need approval before they are scheduled.
    pub fn requires_approval(&self) -> bool {
        self.spec
            .approval
            .as_ref()
            .is_some_and(|a| !a.approvers.is_empty())
    }
}

/// The declarative body of a playbook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub on: Triggers,
    #[serde(default)]
    pub parameters: Vec<PlaybookParameter>,
    #[serde(default)]
    pub actions: Vec<PlaybookAction>,
    /// Config items this playbook may target.
    #[serde(default)]
    pub configs: Vec<ResourceSelector>,
    /// Components this playbook may target.
    #[serde(default)]
    pub components: Vec<ResourceSelector>,
    /// Health checks this playbook may target.
    #[serde(default)]
    pub checks: Vec<ResourceSelector>,
    #[serde(default)]
    pub approval: Option<ApprovalSpec>,
    /// Agents on which the actions run by default (empty = host).
    #[serde(default)]
    pub runs_on: Vec<String>,
    /// Delay before the first action of event-triggered runs.
    #[serde(default)]
    pub delay: Option<String>,
}

impl PlaybookSpec {
    /// Validate invariants: at least one action, unique non-empty action
    /// names, exactly one kind per action, parseable durations, and at most
    /// one webhook authentication scheme.
    pub fn validate(&self, playbook: &str) -> Result<()> {
        if self.actions.is_empty() {
            return Err(TypesError::playbook(playbook, "must have at least one action"));
        }

        let mut names = HashSet::new();
        for action in &self.actions {
            if action.name.trim().is_empty() {
                return Err(TypesError::playbook(playbook, "action name cannot be empty"));
            }
            if !names.insert(action.name.as_str()) {
                return Err(TypesError::playbook(
                    playbook,
                    format!("duplicate action name '{}'", action.name),
                ));
            }
            action
                .kind()
                .map_err(|reason| TypesError::playbook(playbook, reason))?;
            for (field, value) in [("delay", &action.delay), ("timeout", &action.timeout)] {
                if let Some(v) = value {
                    bounded_duration(v).map_err(|_| {
                        TypesError::playbook(
                            playbook,
                            format!("action '{}' has invalid {field} '{v}'", action.name),
                        )
                    })?;
                }
            }
        }

        let mut params = HashSet::new();
        for param in &self.parameters {
            if param.name.trim().is_empty() {
                return Err(TypesError::playbook(playbook, "parameter name cannot be empty"));
            }
            if !params.insert(param.name.as_str()) {
                return Err(TypesError::playbook(
                    playbook,
                    format!("duplicate parameter '{}'", param.name),
                ));
            }
        }

        if let Some(delay) = &self.delay {
            bounded_duration(delay).map_err(|_| {
                TypesError::playbook(playbook, format!("invalid delay '{delay}'"))
            })?;
        }

        if let Some(webhook) = &self.on.webhook {
            if webhook.path.trim().is_empty() {
                return Err(TypesError::playbook(playbook, "webhook path cannot be empty"));
            }
            if let Some(auth) = &webhook.authentication {
                auth.scheme()
                    .map_err(|reason| TypesError::playbook(playbook, reason))?;
            }
        }

        Ok(())
    }

    /// Resource selectors for the given target kind.
    pub fn selectors(&self, kind: TargetKind) -> &[ResourceSelector] {
        match kind {
            TargetKind::Config => &self.configs,
            TargetKind::Component => &self.components,
            TargetKind::Check => &self.checks,
        }
    }

    /// The configured run-start delay, if any.
    pub fn delay(&self) -> Option<Duration> {
        self.delay.as_deref().and_then(|d| parse_duration(d).ok())
    }
}

/// Longest delay or timeout a playbook may declare.
pub const MAX_PLAYBOOK_DURATION: Duration = Duration::from_secs(366 * 24 * 3600);

fn bounded_duration(value: &str) -> Result<Duration> {
    let d = parse_duration(value)?;
    if d > MAX_PLAYBOOK_DURATION {
        return Err(TypesError::InvalidDuration(value.to_string()));
    }
    Ok(d)
}

// ─────────────────────────────────────────────────────────────────────────────
// Triggers
// ─────────────────────────────────────────────────────────────────────────────

/// Events and webhooks that instantiate a playbook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(default)]
    pub config: Vec<EventTrigger>,
    #[serde(default)]
    pub component: Vec<EventTrigger>,
    #[serde(default, alias = "canary")]
    pub check: Vec<EventTrigger>,
    #[serde(default)]
    pub webhook: Option<WebhookTrigger>,
}

impl Triggers {
    /// Triggers registered for an event class (`config`, `component`, `check`).
    pub fn for_class(&self, class: &str) -> &[EventTrigger] {
        match class {
            "config" => &self.config,
            "component" => &self.component,
            "check" | "canary" => &self.check,
            _ => &[],
        }
    }
}

/// A single event subscription with optional filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTrigger {
    /// Event name within the class, e.g. `unhealthy`, `created`, `failed`.
    pub event: String,
    /// CEL predicate over the resource environment.
    #[serde(default)]
    pub filter: Option<String>,
    /// Labels the resource must carry (exact match).
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Inbound webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTrigger {
    pub path: String,
    #[serde(default)]
    pub authentication: Option<WebhookAuth>,
}

/// Webhook authentication. Exactly one scheme may be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookAuth {
    #[serde(default)]
    pub basic: Option<BasicAuth>,
    #[serde(default)]
    pub github: Option<GithubAuth>,
    #[serde(default)]
    pub svix: Option<SvixAuth>,
    #[serde(default)]
    pub jwt: Option<JwtAuth>,
}

/// The single configured webhook authentication scheme.
#[derive(Debug, Clone, Copy)]
pub enum WebhookAuthScheme<'a> {
    None,
    Basic(&'a BasicAuth),
    Github(&'a GithubAuth),
    Svix(&'a SvixAuth),
    Jwt(&'a JwtAuth),
}

impl WebhookAuth {
    /// Resolve the configured scheme, rejecting configs that set more than one.
    pub fn scheme(&self) -> std::result::Result<WebhookAuthScheme<'_>, String> {
        let mut schemes = Vec::new();
        if let Some(b) = &self.basic {
            schemes.push(WebhookAuthScheme::Basic(b));
        }
        if let Some(g) = &self.github {
            schemes.push(WebhookAuthScheme::Github(g));
        }
        if let Some(s) = &self.svix {
            schemes.push(WebhookAuthScheme::Svix(s));
        }
        if let Some(j) = &self.jwt {
            schemes.push(WebhookAuthScheme::Jwt(j));
        }
        match schemes.len() {
            0 => Ok(WebhookAuthScheme::None),
            1 => Ok(schemes[0]),
            n => Err(format!(
                "webhook authentication must set exactly one scheme, found {n}"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubAuth {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SvixAuth {
    /// Signing secret, `whsec_`-prefixed base64.
    pub secret: String,
    /// Allowed clock skew, default 5m.
    #[serde(default)]
    pub timestamp_tolerance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtAuth {
    pub jwks_uri: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameters
// ─────────────────────────────────────────────────────────────────────────────

/// A declared run parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybookParameter {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    /// Default value; may contain `{{...}}` template expressions.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Type-specific properties (e.g. `options` for lists).
    #[serde(default)]
    pub properties: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[default]
    Text,
    Checkbox,
    List,
    Code,
    Config,
    Component,
    Check,
    People,
    Team,
}

// ─────────────────────────────────────────────────────────────────────────────
// Resource selectors
// ─────────────────────────────────────────────────────────────────────────────

/// Narrows which resources a playbook may target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSelector {
    /// Allowed resource types (empty = any).
    #[serde(default)]
    pub types: Vec<String>,
    /// Exact-match labels (or tags) the resource must carry.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Optional resource name.
    #[serde(default)]
    pub name: Option<String>,
    /// CEL predicate evaluated with the resource bound under its class name.
    #[serde(default)]
    pub filter: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Approval
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalSpec {
    #[serde(default, rename = "type")]
    pub approval_type: ApprovalType,
    #[serde(default)]
    pub approvers: Approvers,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    #[default]
    Any,
    All,
}

/// People are identified by email, teams by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Approvers {
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub teams: Vec<String>,
}

impl Approvers {
    pub fn is_empty(&self) -> bool {
        self.people.is_empty() && self.teams.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actions
// ─────────────────────────────────────────────────────────────────────────────

/// One step of a playbook. Exactly one of the kind fields must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookAction {
    pub name: String,
    /// Gate expression: `always()`, `skip()`, `success()`, `failure()`,
    /// `timeout()` or any CEL predicate.
    #[serde(default, rename = "if")]
    pub filter: Option<String>,
    #[serde(default)]
    pub delay: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    /// Agents this action runs on (overrides the playbook's `runsOn`).
    #[serde(default)]
    pub runs_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<SqlAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitops: Option<GitopsAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationAction>,
}

/// Borrowed view of the single configured action kind.
#[derive(Debug, Clone, Copy)]
pub enum ActionKind<'a> {
    Exec(&'a ExecAction),
    Http(&'a HttpAction),
    Sql(&'a SqlAction),
    Pod(&'a PodAction),
    Gitops(&'a GitopsAction),
    Notification(&'a NotificationAction),
}

impl ActionKind<'_> {
    /// Stable lowercase name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Exec(_) => "exec",
            ActionKind::Http(_) => "http",
            ActionKind::Sql(_) => "sql",
            ActionKind::Pod(_) => "pod",
            ActionKind::Gitops(_) => "gitops",
            ActionKind::Notification(_) => "notification",
        }
    }
}

impl PlaybookAction {
    /// Resolve the action kind; errors unless exactly one kind is set.
    pub fn kind(&self) -> std::result::Result<ActionKind<'_>, String> {
        let mut kinds = Vec::with_capacity(1);
        if let Some(a) = &self.exec {
            kinds.push(ActionKind::Exec(a));
        }
        if let Some(a) = &self.http {
            kinds.push(ActionKind::Http(a));
        }
        if let Some(a) = &self.sql {
            kinds.push(ActionKind::Sql(a));
        }
        if let Some(a) = &self.pod {
            kinds.push(ActionKind::Pod(a));
        }
        if let Some(a) = &self.gitops {
            kinds.push(ActionKind::Gitops(a));
        }
        if let Some(a) = &self.notification {
            kinds.push(ActionKind::Notification(a));
        }
        match kinds.len() {
            1 => Ok(kinds[0]),
            0 => Err(format!("action '{}' has no kind", self.name)),
            n => Err(format!("action '{}' has {n} kinds, expected one", self.name)),
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay.as_deref().and_then(|d| parse_duration(d).ok())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(|d| parse_duration(d).ok())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    /// Shell script, run with `sh -c` inside a scratch directory.
    pub script: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Glob patterns (relative to the scratch dir) collected as artifacts.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpAction {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Named connection whose credentials are applied to the request.
    #[serde(default)]
    pub connection: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlAction {
    pub connection: String,
    pub query: String,
    /// Bound positionally to `?1`, `?2`, ...
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodAction {
    pub name: String,
    /// Pod spec, as it would appear under `spec:` in a manifest.
    pub spec: Value,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Kubernetes connection (kubeconfig/context); absent = ambient config.
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitopsAction {
    pub repo: GitRepo,
    #[serde(default)]
    pub commit: CommitSpec,
    /// Files to create or overwrite.
    #[serde(default)]
    pub files: Vec<GitFile>,
    /// Glob patterns of files to delete (`**` supported).
    #[serde(default)]
    pub delete: Vec<String>,
    #[serde(default)]
    pub pr: Option<PullRequestSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitRepo {
    pub url: String,
    /// Branch cloned from; defaults to `main`.
    #[serde(default)]
    pub base: Option<String>,
    /// Branch pushed to; defaults to `base`.
    #[serde(default)]
    pub branch: Option<String>,
    /// Named git connection providing credentials.
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitSpec {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestSpec {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationAction {
    /// Named connection (`webhook`/`slack`) or `log`.
    pub connection: String,
    #[serde(default)]
    pub title: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(name: &str) -> PlaybookAction {
        PlaybookAction {
            name: name.to_string(),
            exec: Some(ExecAction {
                script: "echo hi".into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn spec(actions: Vec<PlaybookAction>) -> PlaybookSpec {
        PlaybookSpec {
            actions,
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_playbook() {
        let pb = Playbook::new("ok", spec(vec![exec("a"), exec("b")]));
        assert!(pb.validate().is_ok());
        assert!(pb.action("b").is_some());
        assert!(!pb.requires_approval());
    }

    #[test]
    fn test_requires_action() {
        let pb = Playbook::new("empty", spec(vec![]));
        let err = pb.validate().unwrap_err().to_string();
        assert!(err.contains("at least one action"));
    }

    #[test]
    fn test_duplicate_action_names() {
        let pb = Playbook::new("dup", spec(vec![exec("a"), exec("a")]));
        assert!(pb.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_action_needs_exactly_one_kind() {
        let none = PlaybookAction {
            name: "x".into(),
            ..Default::default()
        };
        assert!(none.kind().is_err());

        let mut two = exec("y");
        two.http = Some(HttpAction {
            url: "http://x".into(),
            ..Default::default()
        });
        let err = two.kind().unwrap_err();
        assert!(err.contains("2 kinds"));
        assert_eq!(exec("z").kind().unwrap().name(), "exec");
    }

    #[test]
    fn test_invalid_delay_rejected() {
        let mut a = exec("a");
        a.delay = Some("soon".into());
        let pb = Playbook::new("delay", spec(vec![a]));
        assert!(pb.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let mut s = spec(vec![exec("a")]);
        s.delay = Some("100000000d".into());
        assert!(Playbook::new("far", s).validate().is_err());

        let mut a = exec("a");
        a.timeout = Some("99999999999999999999999d".into());
        assert!(Playbook::new("huge", spec(vec![a])).validate().is_err());

        let mut s = spec(vec![exec("a")]);
        s.delay = Some("30d".into());
        assert!(Playbook::new("month", s).validate().is_ok());
    }

    #[test]
    fn test_webhook_auth_exclusive() {
        let auth = WebhookAuth {
            basic: Some(BasicAuth {
                username: "u".into(),
                password: "p".into(),
            }),
            github: Some(GithubAuth { token: "t".into() }),
            ..Default::default()
        };
        assert!(auth.scheme().is_err());

        let mut s = spec(vec![exec("a")]);
        s.on.webhook = Some(WebhookTrigger {
            path: "hook".into(),
            authentication: Some(auth),
        });
        assert!(Playbook::new("wh", s).validate().is_err());
    }

    #[test]
    fn test_parse_yaml_spec() {
        let yaml = r#"
name: restart
spec:
  on:
    component:
      - event: unhealthy
        filter: component.type == "Entity"
        labels:
          telemetry: enabled
  approval:
    type: all
    approvers:
      people: [john@x]
  actions:
    - name: A
      if: success()
      exec:
        script: printf hi
    - name: B
      delay: 3s
      http:
        url: http://example.com
"#;
        let pb: Playbook = serde_yaml::from_str(yaml).unwrap();
        pb.validate().unwrap();
        assert_eq!(pb.namespace, "default");
        assert_eq!(pb.spec.on.for_class("component").len(), 1);
        assert_eq!(pb.spec.actions[0].filter.as_deref(), Some("success()"));
        assert_eq!(pb.spec.actions[1].delay(), Some(Duration::from_secs(3)));
        assert_eq!(pb.spec.actions[1].http.as_ref().unwrap().method, "GET");
        assert!(pb.requires_approval());
        assert_eq!(
            pb.spec.approval.unwrap().approval_type,
            ApprovalType::All
        );
    }
}
