//! Configuration types.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [engine]
//! workers = 5
//!
//! [engine.default_timeouts]
//! exec = 300
//!
//! [connections.ops-db]
//! type = "sqlite"
//! url = "/var/lib/ops.db"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Application name for data directory resolution.
const APP_NAME: &str = "remedy";

// ─────────────────────────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemedyConfig {
    pub server: Option<ServerConfig>,
    pub store: Option<StoreConfig>,
    pub engine: Option<EngineConfig>,
    pub artifacts: Option<ArtifactsConfig>,
    pub agent: Option<AgentConfig>,
    pub playbooks: Option<PlaybooksConfig>,
    pub logging: Option<LoggingConfig>,

    /// Named connections (`[connections.<name>]`).
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

impl RemedyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: RemedyConfig) {
        if other.server.is_some() {
            self.server = other.server;
        }
        if other.store.is_some() {
            self.store = other.store;
        }
        if other.engine.is_some() {
            self.engine = other.engine;
        }
        if other.artifacts.is_some() {
            self.artifacts = other.artifacts;
        }
        if other.agent.is_some() {
            self.agent = other.agent;
        }
        if other.playbooks.is_some() {
            self.playbooks = other.playbooks;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
        for (name, conn) in other.connections {
            self.connections.insert(name, conn);
        }
    }

    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn store(&self) -> StoreConfig {
        self.store.clone().unwrap_or_default()
    }

    pub fn engine(&self) -> EngineConfig {
        self.engine.clone().unwrap_or_default()
    }

    pub fn playbooks(&self) -> PlaybooksConfig {
        self.playbooks.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Blob connection URL for artifacts, if configured.
    pub fn artifact_connection(&self) -> Option<&str> {
        self.artifacts
            .as_ref()
            .and_then(|a| a.connection.as_deref())
    }

    /// Look up a named connection.
    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| ConfigError::ConnectionNotFound(name.to_string()))
    }

    /// Whether the process runs as an agent rather than a host.
    pub fn is_agent(&self) -> bool {
        self.agent.as_ref().is_some_and(|a| !a.name.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to, `host:port`.
    pub bind: String,
    /// Bearer token required on API routes. `None` = localhost mode.
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            api_token: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database path. Default: `<data dir>/remedy/remedy.db`.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Effective database path with `~` expanded.
    pub fn effective_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => expand_tilde(p),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_NAME)
                .join("remedy.db"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker-pool size: runs executed concurrently.
    pub workers: usize,
    /// Self-poll interval for runs and events.
    pub poll_interval_secs: u64,
    /// Events claimed per consume call.
    pub event_batch_size: usize,
    /// Events at this many attempts are no longer claimed.
    pub event_max_attempts: u32,
    /// Results larger than this spill to an artifact.
    pub max_result_bytes: usize,
    /// TTL of the event-to-playbooks cache.
    pub playbook_cache_ttl_secs: u64,
    pub default_timeouts: DefaultTimeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval_secs: 5,
            event_batch_size: 10,
            event_max_attempts: 5,
            max_result_bytes: 64 * 1024,
            playbook_cache_ttl_secs: 3600,
            default_timeouts: DefaultTimeouts::default(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn playbook_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.playbook_cache_ttl_secs)
    }
}

/// Per-kind default action timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultTimeouts {
    pub exec: u64,
    pub http: u64,
    pub sql: u64,
    pub pod: u64,
    pub gitops: u64,
    pub notification: u64,
}

impl Default for DefaultTimeouts {
    fn default() -> Self {
        Self {
            exec: 300,
            http: 60,
            sql: 60,
            pod: 900,
            gitops: 600,
            notification: 30,
        }
    }
}

impl DefaultTimeouts {
    /// Default timeout for an action kind name (`exec`, `http`, ...).
    pub fn for_kind(&self, kind: &str) -> Duration {
        let secs = match kind {
            "exec" => self.exec,
            "http" => self.http,
            "sql" => self.sql,
            "pod" => self.pod,
            "gitops" => self.gitops,
            "notification" => self.notification,
            _ => self.exec,
        };
        Duration::from_secs(secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Artifacts, agent, playbooks, logging
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Blob store URL, e.g. `file:///var/lib/remedy/artifacts`.
    pub connection: Option<String>,
}

/// Agent mode: pull work from `upstream`, push results back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub upstream: String,
    pub token: Option<String>,
    pub push_interval_secs: u64,
    pub push_batch_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            upstream: String::new(),
            token: None,
            push_interval_secs: 5,
            push_batch_size: 50,
        }
    }
}

impl AgentConfig {
    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybooksConfig {
    /// Directory of YAML/JSON playbook definitions.
    pub dir: Option<PathBuf>,
    /// Reload on file changes.
    pub watch: bool,
}

impl Default for PlaybooksConfig {
    fn default() -> Self {
        Self {
            dir: None,
            watch: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rotated JSON log files. `None` disables file logging.
    pub dir: Option<PathBuf>,
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Connections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Sqlite,
    Webhook,
    Slack,
    Git,
    Kubernetes,
    Http,
}

/// A named set of credentials and an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Kubeconfig path (kubernetes).
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Kube context (kubernetes).
    #[serde(default)]
    pub context: Option<String>,
}

impl ConnectionConfig {
    pub fn new(kind: ConnectionType) -> Self {
        Self {
            kind,
            url: None,
            token: None,
            username: None,
            password: None,
            kubeconfig: None,
            context: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// The URL, or a `MissingField` error naming the connection.
    pub fn require_url(&self, name: &str) -> Result<&str> {
        self.url.as_deref().ok_or_else(|| ConfigError::MissingField {
            field: "url".to_string(),
            context: format!("connection '{name}'"),
        })
    }
}

fn expand_tilde(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RemedyConfig::new();
        let engine = config.engine();
        assert_eq!(engine.workers, 5);
        assert_eq!(engine.poll_interval(), Duration::from_secs(5));
        assert_eq!(
            engine.default_timeouts.for_kind("pod"),
            Duration::from_secs(900)
        );
        assert_eq!(config.server().bind, "127.0.0.1:8080");
        assert!(!config.is_agent());
        assert!(config.artifact_connection().is_none());
    }

    #[test]
    fn test_parse_full() {
        let config = RemedyConfig::from_toml(
            r#"
[server]
bind = "0.0.0.0:9000"
api_token = "secret"

[engine]
workers = 2

[engine.default_timeouts]
http = 5

[artifacts]
connection = "file:///tmp/artifacts"

[agent]
name = "a1"
upstream = "http://host:8080"

[connections.ops]
type = "sqlite"
url = "/tmp/ops.db"

[connections.chat]
type = "slack"
url = "https://hooks.slack.com/x"
"#,
        )
        .unwrap();

        assert_eq!(config.server().api_token.as_deref(), Some("secret"));
        let engine = config.engine();
        assert_eq!(engine.workers, 2);
        assert_eq!(engine.event_batch_size, 10);
        assert_eq!(engine.default_timeouts.http, 5);
        assert_eq!(engine.default_timeouts.exec, 300);
        assert!(config.is_agent());
        assert_eq!(config.agent.as_ref().unwrap().push_batch_size, 50);
        assert_eq!(config.connection("ops").unwrap().kind, ConnectionType::Sqlite);
        assert_eq!(
            config.connection("chat").unwrap().require_url("chat").unwrap(),
            "https://hooks.slack.com/x"
        );
        assert!(matches!(
            config.connection("nope"),
            Err(ConfigError::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn test_merge_overrides_and_unions_connections() {
        let mut base = RemedyConfig::from_toml(
            r#"
[engine]
workers = 3

[connections.a]
type = "webhook"
url = "http://a"
"#,
        )
        .unwrap();
        let overlay = RemedyConfig::from_toml(
            r#"
[engine]
workers = 8

[connections.b]
type = "git"
"#,
        )
        .unwrap();
        base.merge(overlay);
        assert_eq!(base.engine().workers, 8);
        assert_eq!(base.connections.len(), 2);
    }

    #[test]
    fn test_store_path_tilde() {
        let store = StoreConfig {
            path: Some(PathBuf::from("~/x/remedy.db")),
        };
        let p = store.effective_path();
        assert!(!p.starts_with("~"));
        assert!(p.ends_with("x/remedy.db"));
    }
}
