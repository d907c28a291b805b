//! Read-only resource catalog: the things runs target, plus identities.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Timestamp;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigItem {
    pub id: Uuid,
    pub name: String,
    /// Broad class, e.g. `EKSCluster`, `Kubernetes::Pod`.
    #[serde(rename = "class", default)]
    pub config_class: String,
    #[serde(rename = "type", default)]
    pub config_type: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub config: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Component {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type", default)]
    pub component_type: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Check {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type", default)]
    pub check_type: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub canary_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Canary {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_id: Option<Uuid>,
}

/// A remote executor known to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub last_seen: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Person {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
}

/// The authenticated caller, with the teams it belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    pub person: Person,
    #[serde(default)]
    pub teams: Vec<Team>,
}

impl Principal {
    pub fn id(&self) -> Uuid {
        self.person.id
    }

    pub fn email(&self) -> &str {
        &self.person.email
    }

    pub fn team(&self, name: &str) -> Option<&Team> {
        self.teams.iter().find(|t| t.name == name)
    }
}

/// Which resource class a run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Config,
    Component,
    Check,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Config => "config",
            TargetKind::Component => "component",
            TargetKind::Check => "check",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub id: Uuid,
}

impl Target {
    pub fn config(id: Uuid) -> Self {
        Self {
            kind: TargetKind::Config,
            id,
        }
    }

    pub fn component(id: Uuid) -> Self {
        Self {
            kind: TargetKind::Component,
            id,
        }
    }

    pub fn check(id: Uuid) -> Self {
        Self {
            kind: TargetKind::Check,
            id,
        }
    }
}

/// A loaded target resource of any class.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Resource {
    Config(ConfigItem),
    Component(Component),
    Check(Check),
}

impl Resource {
    pub fn kind(&self) -> TargetKind {
        match self {
            Resource::Config(_) => TargetKind::Config,
            Resource::Component(_) => TargetKind::Component,
            Resource::Check(_) => TargetKind::Check,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Resource::Config(c) => c.id,
            Resource::Component(c) => c.id,
            Resource::Check(c) => c.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Config(c) => &c.name,
            Resource::Component(c) => &c.name,
            Resource::Check(c) => &c.name,
        }
    }

    pub fn resource_type(&self) -> &str {
        match self {
            Resource::Config(c) => &c.config_type,
            Resource::Component(c) => &c.component_type,
            Resource::Check(c) => &c.check_type,
        }
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        match self {
            Resource::Config(c) => &c.labels,
            Resource::Component(c) => &c.labels,
            Resource::Check(c) => &c.labels,
        }
    }

    /// Agent that owns the resource, if it was scraped by one.
    pub fn agent_id(&self) -> Option<Uuid> {
        match self {
            Resource::Config(c) => c.agent_id,
            Resource::Component(c) => c.agent_id,
            Resource::Check(c) => c.agent_id,
        }
    }

    pub fn target(&self) -> Target {
        Target {
            kind: self.kind(),
            id: self.id(),
        }
    }

    /// Whether every `(k, v)` pair is present on the resource.
    pub fn has_labels(&self, wanted: &HashMap<String, String>) -> bool {
        let labels = self.labels();
        wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
