//! GitHub `X-Hub-Signature-256` HMAC verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use remedy_types::GithubAuth;

use super::{WebhookRequest, unauthorized};
use crate::error::{EngineError, Result};

pub(super) const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub(super) fn verify(config: &GithubAuth, request: &WebhookRequest) -> Result<()> {
    let signature = request
        .header(SIGNATURE_HEADER)
        .ok_or_else(|| unauthorized("missing X-Hub-Signature-256 header"))?;
    let digest = signature.trim();
    let digest = digest.strip_prefix("sha256=").unwrap_or(digest);
    let expected = hex::decode(digest).map_err(|_| unauthorized("malformed signature"))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(config.token.as_bytes())
        .map_err(|e| EngineError::Internal(format!("HMAC init: {e}")))?;
    mac.update(&request.body);
    mac.verify_slice(&expected)
        .map_err(|_| unauthorized("signature mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "It's a Secret to Everybody";
    const SIGNATURE: &str =
        "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";

    fn config() -> GithubAuth {
        GithubAuth {
            token: TOKEN.into(),
        }
    }

    #[test]
    fn test_known_signature() {
        let req = WebhookRequest::new("Hello, World!").with_header("X-Hub-Signature-256", SIGNATURE);
        verify(&config(), &req).unwrap();
    }

    #[test]
    fn test_body_mismatch() {
        let req = WebhookRequest::new("Bye, World!").with_header("X-Hub-Signature-256", SIGNATURE);
        assert!(matches!(
            verify(&config(), &req),
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_missing_and_malformed() {
        assert!(verify(&config(), &WebhookRequest::new("Hello, World!")).is_err());
        let req = WebhookRequest::new("Hello, World!").with_header("X-Hub-Signature-256", "sha256=zz");
        assert!(verify(&config(), &req).is_err());
    }
}
