//! Action kinds.
//!
//! Every kind implements the same contract: given a rendered spec and the
//! run context, produce a JSON result plus any artifacts, or fail. The
//! runner owns gating, delays, timeouts and cancellation; a kind only has to
//! release what it acquires when its future is dropped.

mod exec;
mod gitops;
mod http;
mod notification;
mod pod;
mod sql;

use std::sync::Arc;

use serde_json::Value;

use remedy_config::RemedyConfig;
use remedy_types::{ActionKind, Artifact, PlaybookAction, Run, RunAction};

use crate::artifacts::ArtifactStore;
use crate::error::{EngineError, Result};
use crate::template::TemplateEnv;

pub use notification::LOG_CHANNEL;

/// Everything an action can see while it executes.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub run: Run,
    pub action: RunAction,
    pub env: TemplateEnv,
    pub config: Arc<RemedyConfig>,
    pub artifacts: Option<ArtifactStore>,
    pub http: reqwest::Client,
}

/// What an action produced.
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    pub result: Value,
    pub artifacts: Vec<Artifact>,
    /// Set when the action ran to completion but reported a failure
    /// (non-zero exit, HTTP status >= 400). The result is still recorded.
    pub failure: Option<String>,
}

impl ActionOutput {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn failed(result: Value, failure: impl Into<String>) -> Self {
        Self {
            result,
            failure: Some(failure.into()),
            ..Default::default()
        }
    }
}

/// Run a rendered action spec.
pub async fn execute(ctx: &ActionContext, spec: &PlaybookAction) -> Result<ActionOutput> {
    let kind = spec.kind().map_err(EngineError::Validation)?;
    match kind {
        ActionKind::Exec(a) => exec::run(ctx, a).await,
        ActionKind::Http(a) => http::run(ctx, a).await,
        ActionKind::Sql(a) => sql::run(ctx, a).await,
        ActionKind::Pod(a) => pod::run(ctx, a).await,
        ActionKind::Gitops(a) => gitops::run(ctx, a).await,
        ActionKind::Notification(a) => notification::run(ctx, a).await,
    }
}

/// Trim captured process output for inclusion in an error message.
pub(crate) fn tail(output: &str, max_chars: usize) -> &str {
    let trimmed = output.trim();
    match trimmed.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((idx, _)) => &trimmed[idx..],
        None => trimmed,
    }
}
