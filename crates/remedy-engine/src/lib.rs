//! Playbook execution engine for Remedy.
//!
//! A durable, event-driven workflow executor: change events and webhooks
//! select playbooks, runs are persisted with their final parameters, and a
//! worker pool executes each run's actions in order. Every state change is
//! a store commit, so workers are stateless and safe to restart.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────┐   ┌───────────┐   ┌────────┐
//! │ EventConsumer│──▶│ Matcher │──▶│ create_run│◀──│ Engine │◀── API / webhooks
//! └──────────────┘   └─────────┘   └─────┬─────┘   └────────┘
//!                                        ▼
//!                    ┌───────────┐   ┌────────┐   ┌──────────────┐
//!                    │ Scheduler │──▶│ Runner │──▶│ actions::*   │
//!                    └───────────┘   └───┬────┘   └──────────────┘
//!                                        ▼
//!                             UpstreamHost ◀── pull/push ── AgentWorker
//! ```

pub mod actions;
pub mod agent;
pub mod approval;
pub mod artifacts;
pub mod cache;
pub mod cel;
pub mod engine;
pub mod error;
pub mod events;
pub mod loader;
pub mod matcher;
pub mod notifier;
pub mod origin;
pub mod params;
pub mod runner;
pub mod runs;
pub mod scheduler;
pub mod template;
pub mod webhook;

pub use agent::{AgentSettings, AgentWorker, LocalUpstream, UpstreamHost};
pub use approval::ApprovalGate;
pub use artifacts::ArtifactStore;
pub use cel::CelEngine;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use events::{ConsumerSettings, EventConsumer};
pub use loader::{PlaybookEvent, PlaybookLoader, WatcherHandle};
pub use matcher::Matcher;
pub use notifier::{Notifier, Subscription};
pub use runner::{RunOutcome, Runner};
pub use runs::{LOCAL_AGENT, NewRun, create_run};
pub use scheduler::{Scheduler, SchedulerSettings};
pub use template::TemplateEnv;
pub use webhook::{WebhookAuthenticator, WebhookRequest};
