//! `http`: one templated HTTP request.

use serde_json::{Map, Value, json};
use url::Url;

use remedy_types::HttpAction;

use super::{ActionContext, ActionOutput};
use crate::error::{EngineError, Result};

pub(super) async fn run(ctx: &ActionContext, spec: &HttpAction) -> Result<ActionOutput> {
    let method = reqwest::Method::from_bytes(spec.method.to_uppercase().as_bytes())
        .map_err(|_| EngineError::Validation(format!("unsupported HTTP method '{}'", spec.method)))?;

    let connection = match &spec.connection {
        Some(name) => Some(ctx.config.connection(name)?),
        None => None,
    };
    let url = resolve_url(&spec.url, connection.and_then(|c| c.url.as_deref()))?;

    let mut request = ctx.http.request(method, url);
    for (name, value) in &spec.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(conn) = connection {
        if let Some(token) = &conn.token {
            request = request.bearer_auth(token);
        } else if let Some(user) = &conn.username {
            request = request.basic_auth(user, conn.password.as_deref());
        }
    }
    if let Some(body) = &spec.body {
        request = request.body(body.clone());
    }

    let response = request
        .send()
        .await
        .map_err(|e| EngineError::ActionFailed(format!("request failed: {e}")))?;

    let status = response.status();
    let headers: Map<String, Value> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), json!(v))))
        .collect();
    let text = response
        .text()
        .await
        .map_err(|e| EngineError::ActionFailed(format!("reading response body: {e}")))?;
    let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

    let result = json!({
        "status": status.as_u16(),
        "headers": headers,
        "body": body,
    });

    if status.is_client_error() || status.is_server_error() {
        Ok(ActionOutput::failed(result, format!("HTTP {status}")))
    } else {
        Ok(ActionOutput::ok(result))
    }
}

/// An absolute `url`, or `url` joined onto the connection's base URL.
fn resolve_url(url: &str, base: Option<&str>) -> Result<Url> {
    match Url::parse(url) {
        Ok(u) => Ok(u),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base.ok_or_else(|| {
                EngineError::Validation(format!("relative URL '{url}' needs a connection with a url"))
            })?;
            Url::parse(base)
                .and_then(|b| b.join(url))
                .map_err(|e| EngineError::Validation(format!("invalid URL '{url}': {e}")))
        }
        Err(e) => Err(EngineError::Validation(format!("invalid URL '{url}': {e}"))),
    }
}
