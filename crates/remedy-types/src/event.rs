//! Change events and notification channel names.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resource::TargetKind;
use crate::{Timestamp, now};

/// In-process notification channels.
pub mod channels {
    /// A run was inserted.
    pub const RUN_CREATED: &str = "run.created";
    /// A run changed state (approved, woken, resumed, cancelled).
    pub const RUN_UPDATED: &str = "run.updated";
    /// A playbook was inserted, updated or deleted.
    pub const PLAYBOOK_SPEC_UPDATED: &str = "playbook_spec_updated";
    /// An event was published to the queue.
    pub const EVENT_QUEUE_UPDATED: &str = "event_queue_updated";

    pub const ALL: [&str; 4] = [
        RUN_CREATED,
        RUN_UPDATED,
        PLAYBOOK_SPEC_UPDATED,
        EVENT_QUEUE_UPDATED,
    ];
}

/// A queued change event, e.g. `component.unhealthy` with `properties.id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub attempts: u32,
    pub last_attempt: Option<Timestamp>,
    pub error: Option<String>,
    pub created_at: Timestamp,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            properties: HashMap::new(),
            priority: 0,
            attempts: 0,
            last_attempt: None,
            error: None,
            created_at: now(),
        }
    }

    /// An event about a resource, carrying its id in `properties.id`.
    pub fn for_resource(name: impl Into<String>, id: Uuid) -> Self {
        let mut event = Self::new(name);
        event.properties.insert("id".to_string(), id.to_string());
        event
    }

    pub fn class(&self) -> Option<EventClass> {
        EventClass::parse(&self.name)
    }

    /// The resource id from `properties.id`.
    pub fn resource_id(&self) -> Option<Uuid> {
        self.properties.get("id").and_then(|s| s.parse().ok())
    }
}

/// A dotted event name split into its class and event parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventClass {
    pub class: String,
    pub event: String,
}

impl EventClass {
    /// Parse `class.event`. Returns `None` when either part is empty.
    pub fn parse(name: &str) -> Option<Self> {
        let (class, event) = name.split_once('.')?;
        if class.is_empty() || event.is_empty() {
            return None;
        }
        Some(Self {
            class: class.to_string(),
            event: event.to_string(),
        })
    }

    /// Resource kind this class refers to. `canary` events target checks.
    pub fn target_kind(&self) -> Option<TargetKind> {
        match self.class.as_str() {
            "config" => Some(TargetKind::Config),
            "component" => Some(TargetKind::Component),
            "check" | "canary" => Some(TargetKind::Check),
            _ => None,
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.event)
    }
}
