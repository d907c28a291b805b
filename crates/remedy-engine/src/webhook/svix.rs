//! Svix (Standard Webhooks) signature verification.
//!
//! The signed content is `{id}.{timestamp}.{body}`, keyed by the base64
//! secret after its `whsec_` prefix. The signature header carries one or
//! more space-separated `v1,<base64>` entries; any match is accepted.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use remedy_types::{SvixAuth, now};

use super::{WebhookRequest, tolerance, unauthorized};
use crate::error::{EngineError, Result};

const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5 * 60);
const SECRET_PREFIX: &str = "whsec_";

/// Header value under the `svix-` name or its `webhook-` alias.
fn header<'a>(request: &'a WebhookRequest, suffix: &str) -> Option<&'a str> {
    request
        .header(&format!("svix-{suffix}"))
        .or_else(|| request.header(&format!("webhook-{suffix}")))
}

pub(super) fn verify(config: &SvixAuth, request: &WebhookRequest) -> Result<()> {
    let (Some(id), Some(signatures), Some(timestamp)) = (
        header(request, "id"),
        header(request, "signature"),
        header(request, "timestamp"),
    ) else {
        return Err(unauthorized("missing required svix headers"));
    };

    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| unauthorized("invalid svix timestamp"))?;
    let window = tolerance(config.timestamp_tolerance.as_deref(), DEFAULT_TOLERANCE)?;
    let skew = now().timestamp().abs_diff(ts);
    if skew > window.as_secs() {
        return Err(unauthorized("svix timestamp outside tolerance"));
    }

    let expected = sign(config, id, ts, &request.body)?;
    let matched = signatures
        .split_whitespace()
        .filter_map(|entry| entry.split_once(','))
        .filter(|(version, _)| *version == "v1")
        .filter_map(|(_, sig)| STANDARD.decode(sig).ok())
        .any(|sig| bool::from(sig.as_slice().ct_eq(expected.as_slice())));
    if matched {
        Ok(())
    } else {
        Err(unauthorized("no matching svix signature"))
    }
}

fn sign(config: &SvixAuth, id: &str, ts: i64, body: &[u8]) -> Result<Vec<u8>> {
    let secret = config
        .secret
        .strip_prefix(SECRET_PREFIX)
        .unwrap_or(&config.secret);
    let key = STANDARD
        .decode(secret)
        .map_err(|e| EngineError::Validation(format!("svix secret is not valid base64: {e}")))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|e| EngineError::Internal(format!("HMAC init: {e}")))?;
    mac.update(format!("{id}.{ts}.").as_bytes());
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}
