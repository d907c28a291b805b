//! Bearer JWT verification against a JWKS endpoint.
//!
//! Key sets are cached per URI for ten minutes. A stale set keeps serving
//! while a background task refreshes it. A token whose `kid` is not in the
//! cached set triggers a synchronous refetch, at most once every five
//! minutes per URI.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use remedy_types::JwtAuth;

use super::{WebhookRequest, unauthorized};
use crate::error::{EngineError, Result};

const JWKS_TTL: Duration = Duration::from_secs(10 * 60);
const REFETCH_LIMIT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
struct CachedKeys {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

/// Per-URI JWKS cache.
#[derive(Clone)]
pub struct JwksCache {
    http: reqwest::Client,
    entries: Arc<Mutex<HashMap<String, CachedKeys>>>,
    refreshing: Arc<Mutex<HashSet<String>>>,
}

impl JwksCache {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            entries: Arc::new(Mutex::new(HashMap::new())),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub(super) async fn verify(&self, config: &JwtAuth, request: &WebhookRequest) -> Result<()> {
        let token = request
            .bearer()
            .ok_or_else(|| unauthorized("missing bearer token"))?;
        let header = decode_header(token).map_err(classify)?;
        let jwk = self.key_for(&config.jwks_uri, header.kid.as_deref()).await?;
        let alg = key_algorithm(&jwk)?;
        if header.alg != alg {
            return Err(unauthorized(format!(
                "token algorithm {:?} does not match key algorithm {alg:?}",
                header.alg
            )));
        }
        let key = DecodingKey::from_jwk(&jwk).map_err(classify)?;

        let mut validation = Validation::new(alg);
        validation.validate_aud = false;
        decode::<Value>(token, &key, &validation).map_err(classify)?;
        Ok(())
    }

    /// The key set for `uri`, fetching it on first use.
    pub async fn keys(&self, uri: &str) -> Result<Arc<JwkSet>> {
        let cached = self.entries.lock().get(uri).cloned();
        match cached {
            None => self.fetch(uri).await,
            Some(c) if c.fetched_at.elapsed() > JWKS_TTL => {
                self.refresh_in_background(uri);
                Ok(c.keys)
            }
            Some(c) => Ok(c.keys),
        }
    }

    async fn key_for(&self, uri: &str, kid: Option<&str>) -> Result<Jwk> {
        let keys = self.keys(uri).await?;
        if let Some(jwk) = find(&keys, kid) {
            return Ok(jwk.clone());
        }

        let age = self.entries.lock().get(uri).map(|c| c.fetched_at.elapsed());
        if age.is_some_and(|age| age >= REFETCH_LIMIT) {
            debug!(uri, kid, "Unknown key id, refetching JWKS");
            let keys = self.fetch(uri).await?;
            if let Some(jwk) = find(&keys, kid) {
                return Ok(jwk.clone());
            }
        }
        Err(unauthorized(format!(
            "no key in JWKS matches kid {}",
            kid.unwrap_or("<none>")
        )))
    }

    async fn fetch(&self, uri: &str) -> Result<Arc<JwkSet>> {
        let keys: JwkSet = self
            .http
            .get(uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unauthorized(format!("token unverifiable, JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| unauthorized(format!("token unverifiable, JWKS unreadable: {e}")))?;
        let keys = Arc::new(keys);
        self.entries.lock().insert(
            uri.to_string(),
            CachedKeys {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        debug!(uri, keys = keys.keys.len(), "Fetched JWKS");
        Ok(keys)
    }

    fn refresh_in_background(&self, uri: &str) {
        if !self.refreshing.lock().insert(uri.to_string()) {
            return;
        }
        let this = self.clone();
        let uri = uri.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.fetch(&uri).await {
                warn!(uri = %uri, error = %e, "JWKS refresh failed");
            }
            this.refreshing.lock().remove(&uri);
        });
    }
}

/// The signing algorithm the key is published for. Keys without one are
/// not trusted with an algorithm picked by the token.
fn key_algorithm(jwk: &Jwk) -> Result<Algorithm> {
    let alg = jwk
        .common
        .key_algorithm
        .ok_or_else(|| unauthorized("JWKS key declares no algorithm"))?;
    Algorithm::from_str(&alg.to_string())
        .map_err(|_| unauthorized(format!("JWKS key algorithm {alg} cannot sign tokens")))
}

/// Key by id; a key set with a single key also serves tokens without `kid`.
fn find<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys.find(kid),
        None if keys.keys.len() == 1 => keys.keys.first(),
        None => None,
    }
}

/// Token problems are the caller's (401); key or crypto failures are ours.
fn classify(e: jsonwebtoken::errors::Error) -> EngineError {
    match e.kind() {
        ErrorKind::InvalidToken
        | ErrorKind::InvalidSignature
        | ErrorKind::ExpiredSignature
        | ErrorKind::ImmatureSignature
        | ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience
        | ErrorKind::InvalidSubject
        | ErrorKind::MissingRequiredClaim(_)
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::MissingAlgorithm
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => unauthorized(e.to_string()),
        _ => EngineError::Internal(format!("JWT verification: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &[u8] = b"webhook-signing-secret-0123456789";

    async fn jwks_server(expected_fetches: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{
                    "kty": "oct",
                    "kid": "k1",
                    "alg": "HS256",
                    "k": URL_SAFE_NO_PAD.encode(SECRET),
                }]
            })))
            .expect(expected_fetches)
            .mount(&server)
            .await;
        server
    }

    fn token(kid: &str, secret: &[u8], exp_offset: i64) -> String {
        signed(Algorithm::HS256, kid, secret, exp_offset)
    }

    fn signed(alg: Algorithm, kid: &str, secret: &[u8], exp_offset: i64) -> String {
        let header = Header {
            kid: Some(kid.into()),
            ..Header::new(alg)
        };
        let claims = json!({
            "sub": "alertmanager",
            "exp": remedy_types::now().timestamp() + exp_offset,
        });
        encode(&header, &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn request(token: &str) -> WebhookRequest {
        WebhookRequest::new("{}").with_header("Authorization", format!("Bearer {token}"))
    }

    fn config(server: &MockServer) -> JwtAuth {
        JwtAuth {
            jwks_uri: format!("{}/jwks", server.uri()),
        }
    }

    #[tokio::test]
    async fn test_valid_token_and_cached_keys() {
        let server = jwks_server(1).await;
        let cache = JwksCache::new(reqwest::Client::new());
        let config = config(&server);

        cache.verify(&config, &request(&token("k1", SECRET, 3600))).await.unwrap();
        cache.verify(&config, &request(&token("k1", SECRET, 3600))).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejections_are_unauthorized() {
        let server = jwks_server(1).await;
        let cache = JwksCache::new(reqwest::Client::new());
        let config = config(&server);

        let cases = [
            request(&token("k1", SECRET, -3600)),
            request(&token("k1", b"some-other-secret-entirely-000000", 3600)),
            // Unknown kid within the refetch limit does not refetch.
            request(&token("k2", SECRET, 3600)),
            request("not.a.jwt"),
            WebhookRequest::new("{}"),
        ];
        for req in &cases {
            assert!(
                matches!(cache.verify(&config, req).await, Err(EngineError::Unauthorized(_))),
                "expected 401 for {:?}",
                req.header("authorization")
            );
        }
    }

    #[tokio::test]
    async fn test_algorithm_comes_from_the_key() {
        let server = jwks_server(1).await;
        let cache = JwksCache::new(reqwest::Client::new());
        let config = config(&server);

        let hs384 = signed(Algorithm::HS384, "k1", SECRET, 3600);
        assert!(matches!(
            cache.verify(&config, &request(&hs384)).await,
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_key_without_algorithm_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{ "kty": "oct", "kid": "k1", "k": URL_SAFE_NO_PAD.encode(SECRET) }]
            })))
            .mount(&server)
            .await;
        let cache = JwksCache::new(reqwest::Client::new());

        assert!(matches!(
            cache.verify(&config(&server), &request(&token("k1", SECRET, 3600))).await,
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_jwks_is_unverifiable() {
        let cache = JwksCache::new(reqwest::Client::new());
        let config = JwtAuth {
            jwks_uri: "http://127.0.0.1:9/jwks".into(),
        };
        assert!(matches!(
            cache.verify(&config, &request(&token("k1", SECRET, 3600))).await,
            Err(EngineError::Unauthorized(_))
        ));
    }
}
