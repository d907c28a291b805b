//! HTTP Basic authentication.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use subtle::ConstantTimeEq;

use remedy_types::BasicAuth;

use super::{WebhookRequest, unauthorized};
use crate::error::Result;

pub(super) fn verify(config: &BasicAuth, request: &WebhookRequest) -> Result<()> {
    let header = request
        .header("authorization")
        .ok_or_else(|| unauthorized("missing Authorization header"))?;
    let encoded = header
        .split_once(' ')
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("basic"))
        .map(|(_, creds)| creds.trim())
        .ok_or_else(|| unauthorized("expected Basic credentials"))?;
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| unauthorized("malformed Basic credentials"))?;
    let decoded = String::from_utf8(decoded).map_err(|_| unauthorized("malformed Basic credentials"))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| unauthorized("malformed Basic credentials"))?;

    // Both comparisons always run.
    let user_ok = username.as_bytes().ct_eq(config.username.as_bytes());
    let pass_ok = password.as_bytes().ct_eq(config.password.as_bytes());
    if bool::from(user_ok & pass_ok) {
        Ok(())
    } else {
        Err(unauthorized("invalid credentials"))
    }
}
