//! `notification`: deliver a message to a webhook, a Slack incoming webhook
//! or the engine log.

use serde_json::json;
use tracing::info;

use remedy_config::ConnectionType;
use remedy_types::NotificationAction;

use super::{ActionContext, ActionOutput};
use crate::error::{EngineError, Result};

/// Connection name that writes the notification to the log instead of
/// sending it anywhere.
pub const LOG_CHANNEL: &str = "log";

pub(super) async fn run(ctx: &ActionContext, spec: &NotificationAction) -> Result<ActionOutput> {
    if spec.connection == LOG_CHANNEL {
        info!(
            run_id = %ctx.run.id,
            action = %ctx.action.name,
            title = %spec.title,
            "{}",
            spec.message
        );
        return Ok(ActionOutput::ok(json!({ "channel": LOG_CHANNEL, "delivered": true })));
    }

    let conn = ctx.config.connection(&spec.connection)?;
    let url = conn.require_url(&spec.connection)?;
    let body = match conn.kind {
        ConnectionType::Slack => {
            let text = if spec.title.is_empty() {
                spec.message.clone()
            } else {
                format!("*{}*\n{}", spec.title, spec.message)
            };
            json!({ "text": text })
        }
        ConnectionType::Webhook | ConnectionType::Http => json!({
            "title": spec.title,
            "message": spec.message,
            "run_id": ctx.run.id,
            "playbook_id": ctx.run.playbook_id,
        }),
        other => {
            return Err(EngineError::Validation(format!(
                "connection '{}' of type {other:?} cannot deliver notifications",
                spec.connection
            )));
        }
    };

    let mut request = ctx.http.post(url).json(&body);
    if let Some(token) = &conn.token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| EngineError::ActionFailed(format!("notification failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(EngineError::ActionFailed(format!(
            "notification rejected with HTTP {status}: {detail}"
        )));
    }

    Ok(ActionOutput::ok(json!({
        "channel": spec.connection,
        "status": status.as_u16(),
        "delivered": true,
    })))
}
