//! Bearer token verification against a JSON Web Key Set.
//!
//! Keys come from a remote JWKS document (cached, refreshed on expiry or when
//! a token names a key id we have not seen) or from a static list. A token is
//! accepted only if its signature checks out against a key of the matching
//! family, its standard claims validate, and it carries a string `sub`.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Unknown key ids trigger at most one refetch per this interval.
const MIN_FORCED_REFRESH: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("key set unavailable: {0}")]
    KeySetUnavailable(String),
}

fn unauthorized(reason: impl Into<String>) -> AuthError {
    AuthError::Unauthorized(reason.into())
}

/// Turns a bearer credential into the identity it was issued to.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// One entry of a JWKS document. Only the members needed to build a
/// decoding key are kept.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    #[serde(default)]
    pub kid: Option<String>,
    pub kty: String,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
    #[serde(default)]
    pub k: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone)]
pub enum KeySource {
    Static(Vec<Jwk>),
    Remote { url: String, cache_ttl: Duration },
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub issuer: Option<String>,
    pub audience: Vec<String>,
    pub source: KeySource,
    pub leeway_secs: u64,
}

impl VerifierConfig {
    pub fn remote(url: impl Into<String>, cache_ttl: Duration) -> Self {
        Self {
            issuer: None,
            audience: Vec::new(),
            source: KeySource::Remote {
                url: url.into(),
                cache_ttl,
            },
            leeway_secs: 30,
        }
    }

    pub fn static_keys(keys: Vec<Jwk>) -> Self {
        Self {
            issuer: None,
            audience: Vec::new(),
            source: KeySource::Static(keys),
            leeway_secs: 30,
        }
    }
}

/// Reads a JWKS document from disk for deployments that pin their keys.
pub fn load_key_file(path: &Path) -> Result<Vec<Jwk>, AuthError> {
    let raw = std::fs::read(path).map_err(|e| {
        AuthError::KeySetUnavailable(format!("read {}: {e}", path.display()))
    })?;
    let set: JwkSet = serde_json::from_slice(&raw).map_err(|e| {
        AuthError::KeySetUnavailable(format!("decode {}: {e}", path.display()))
    })?;
    if set.keys.is_empty() {
        return Err(AuthError::KeySetUnavailable(format!(
            "{} holds no keys",
            path.display()
        )));
    }
    Ok(set.keys)
}

struct CachedKeys {
    keys: Arc<Vec<Jwk>>,
    fetched_at: Instant,
}

pub struct JwksVerifier {
    config: VerifierConfig,
    client: reqwest::Client,
    cache: ArcSwapOption<CachedKeys>,
    refresh_lock: Mutex<()>,
}

impl JwksVerifier {
    pub fn new(config: VerifierConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::KeySetUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            config,
            client,
            cache: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
        })
    }

    async fn keys(&self, force: bool) -> Result<Arc<Vec<Jwk>>, AuthError> {
        let (url, ttl) = match &self.config.source {
            KeySource::Static(keys) => return Ok(Arc::new(keys.clone())),
            KeySource::Remote { url, cache_ttl } => (url, *cache_ttl),
        };

        if let Some(keys) = self.cached(force, ttl) {
            return Ok(keys);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(keys) = self.cached(force, ttl) {
            return Ok(keys);
        }

        let keys = Arc::new(self.fetch(url).await?);
        info!(
            component = "auth",
            event = "auth.jwks.refreshed",
            key_count = keys.len(),
            forced = force,
            "Refreshed key set"
        );
        self.cache.store(Some(Arc::new(CachedKeys {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        })));
        Ok(keys)
    }

    fn cached(&self, force: bool, ttl: Duration) -> Option<Arc<Vec<Jwk>>> {
        let cached = self.cache.load_full()?;
        let age = cached.fetched_at.elapsed();
        let usable = if force {
            age < MIN_FORCED_REFRESH
        } else {
            age < ttl
        };
        usable.then(|| cached.keys.clone())
    }

    async fn fetch(&self, url: &str) -> Result<Vec<Jwk>, AuthError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::KeySetUnavailable(format!("fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AuthError::KeySetUnavailable(format!(
                "fetch status {}",
                response.status()
            )));
        }
        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::KeySetUnavailable(format!("decode failed: {e}")))?;
        Ok(set.keys)
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_required_spec_claims::<&str>(&[]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = self.config.leeway_secs;
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(std::slice::from_ref(issuer));
        }
        if self.config.audience.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.audience);
        }
        validation
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| unauthorized(format!("malformed token: {e}")))?;
        let kid = header.kid.as_deref();

        let keys = self.keys(false).await?;
        let jwk = match select_key(&keys, kid, header.alg)? {
            Some(jwk) => jwk.clone(),
            None if kid.is_some() && matches!(self.config.source, KeySource::Remote { .. }) => {
                debug!(
                    component = "auth",
                    event = "auth.jwks.unknown_kid",
                    kid = ?kid,
                    "Unknown key id, refreshing key set"
                );
                let keys = self.keys(true).await?;
                select_key(&keys, kid, header.alg)?
                    .cloned()
                    .ok_or_else(|| unauthorized("no matching key"))?
            }
            None => return Err(unauthorized("no matching key")),
        };

        let key = decoding_key(&jwk)?;
        let data = jsonwebtoken::decode::<Value>(token, &key, &self.validation(header.alg))
            .map_err(|e| unauthorized(format!("verification failed: {e}")))?;

        subject_from_claims(&data.claims)
    }
}

fn algorithm_matches_kty(alg: Algorithm, kty: &str) -> bool {
    match kty {
        "oct" => matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512),
        "RSA" => matches!(
            alg,
            Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512
        ),
        "EC" => matches!(alg, Algorithm::ES256 | Algorithm::ES384),
        _ => false,
    }
}

/// Pick the key a token was signed with. Without a `kid` the choice must be
/// unambiguous.
fn select_key<'a>(
    keys: &'a [Jwk],
    kid: Option<&str>,
    alg: Algorithm,
) -> Result<Option<&'a Jwk>, AuthError> {
    let mut candidates = keys.iter().filter(|jwk| {
        let kid_ok = match kid {
            Some(kid) => jwk.kid.as_deref() == Some(kid),
            None => true,
        };
        let alg_ok = match jwk.alg.as_deref() {
            Some(declared) => Algorithm::from_str(declared).is_ok_and(|a| a == alg),
            None => true,
        };
        kid_ok && alg_ok && algorithm_matches_kty(alg, &jwk.kty)
    });

    let first = candidates.next();
    if kid.is_none() && first.is_some() && candidates.next().is_some() {
        return Err(unauthorized("token has no kid and several keys match"));
    }
    Ok(first)
}

fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, AuthError> {
    let missing = |member: &str| unauthorized(format!("jwk {} missing", member));
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_deref().ok_or_else(|| missing("n"))?;
            let e = jwk.e.as_deref().ok_or_else(|| missing("e"))?;
            DecodingKey::from_rsa_components(n, e)
                .map_err(|e| unauthorized(format!("bad rsa key: {e}")))
        }
        "EC" => {
            let x = jwk.x.as_deref().ok_or_else(|| missing("x"))?;
            let y = jwk.y.as_deref().ok_or_else(|| missing("y"))?;
            DecodingKey::from_ec_components(x, y)
                .map_err(|e| unauthorized(format!("bad ec key: {e}")))
        }
        "oct" => {
            let k = jwk.k.as_deref().ok_or_else(|| missing("k"))?;
            let secret = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(k.trim_end_matches('='))
                .map_err(|e| unauthorized(format!("bad oct key: {e}")))?;
            Ok(DecodingKey::from_secret(&secret))
        }
        other => Err(unauthorized(format!("unsupported key type {other}"))),
    }
}

fn subject_from_claims(claims: &Value) -> Result<String, AuthError> {
    match claims.get("sub") {
        Some(Value::String(sub)) if !sub.is_empty() => Ok(sub.clone()),
        Some(Value::String(_)) | Some(Value::Null) | None => {
            warn!(
                component = "auth",
                event = "auth.subject.missing",
                "Token verified but carries no subject"
            );
            Err(unauthorized("subject claim missing"))
        }
        Some(_) => Err(unauthorized("subject claim must be a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"capture-relay-test-secret";

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn hs256_jwk(kid: &str) -> Jwk {
        Jwk {
            kid: Some(kid.into()),
            kty: "oct".into(),
            alg: Some("HS256".into()),
            n: None,
            e: None,
            x: None,
            y: None,
            k: Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(SECRET)),
        }
    }

    fn sign(kid: Option<&str>, claims: Value, secret: &[u8]) -> String {
        let header = Header {
            alg: Algorithm::HS256,
            kid: kid.map(str::to_string),
            ..Header::default()
        };
        encode(&header, &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn verifier() -> JwksVerifier {
        let mut config = VerifierConfig::static_keys(vec![hs256_jwk("k1")]);
        config.issuer = Some("https://app.example".into());
        JwksVerifier::new(config).unwrap()
    }

    fn claims(sub: Value) -> Value {
        json!({
            "sub": sub,
            "iss": "https://app.example",
            "iat": now(),
            "exp": now() + 600,
        })
    }

    #[tokio::test]
    async fn accepts_valid_token_and_returns_subject() {
        let token = sign(Some("k1"), claims(json!("user-42")), SECRET);
        let identity = verifier().verify(&token).await.unwrap();
        assert_eq!(identity, "user-42");
    }

    #[tokio::test]
    async fn accepts_token_without_kid_when_one_key_matches() {
        let token = sign(None, claims(json!("user-7")), SECRET);
        assert_eq!(verifier().verify(&token).await.unwrap(), "user-7");
    }

    #[tokio::test]
    async fn rejects_missing_or_non_string_subject() {
        let mut no_sub = claims(json!("x"));
        no_sub.as_object_mut().unwrap().remove("sub");
        let token = sign(Some("k1"), no_sub, SECRET);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(AuthError::Unauthorized(_))
        ));

        let token = sign(Some("k1"), claims(json!(12345)), SECRET);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let token = sign(Some("k1"), claims(json!("user-1")), b"some-other-secret");
        assert!(matches!(
            verifier().verify(&token).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn accepts_token_without_expiry() {
        let no_exp = json!({
            "sub": "user-1",
            "iss": "https://app.example",
        });
        let token = sign(Some("k1"), no_exp, SECRET);
        assert_eq!(verifier().verify(&token).await.unwrap(), "user-1");
    }

    #[tokio::test]
    async fn rejects_not_yet_valid_token() {
        let future = json!({
            "sub": "user-1",
            "iss": "https://app.example",
            "nbf": now() + 3600,
        });
        let token = sign(Some("k1"), future, SECRET);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let expired = json!({
            "sub": "user-1",
            "iss": "https://app.example",
            "iat": now() - 7200,
            "exp": now() - 3600,
        });
        let token = sign(Some("k1"), expired, SECRET);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn rejects_wrong_issuer_and_unknown_kid() {
        let mut wrong_iss = claims(json!("user-1"));
        wrong_iss["iss"] = json!("https://evil.example");
        let token = sign(Some("k1"), wrong_iss, SECRET);
        assert!(verifier().verify(&token).await.is_err());

        let token = sign(Some("k2"), claims(json!("user-1")), SECRET);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn rejects_garbage() {
        assert!(matches!(
            verifier().verify("not-a-jwt").await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[test]
    fn ambiguous_keys_without_kid_are_rejected() {
        let keys = vec![hs256_jwk("a"), hs256_jwk("b")];
        assert!(select_key(&keys, None, Algorithm::HS256).is_err());
        assert!(select_key(&keys, Some("b"), Algorithm::HS256)
            .unwrap()
            .is_some());
    }

    #[test]
    fn key_family_must_match_algorithm() {
        let keys = vec![hs256_jwk("a")];
        assert!(select_key(&keys, Some("a"), Algorithm::RS256)
            .unwrap()
            .is_none());
    }

    async fn serve_jwks(hits: Arc<std::sync::atomic::AtomicUsize>) -> String {
        use axum::{routing::get, Json, Router};
        use std::sync::atomic::Ordering;

        let app = Router::new().route(
            "/jwks.json",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "keys": [{
                            "kid": "k1",
                            "kty": "oct",
                            "alg": "HS256",
                            "k": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(SECRET),
                        }]
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/jwks.json")
    }

    #[tokio::test]
    async fn remote_key_set_is_fetched_once_and_cached() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let url = serve_jwks(hits.clone()).await;
        let verifier =
            JwksVerifier::new(VerifierConfig::remote(url, Duration::from_secs(300))).unwrap();

        for sub in ["a", "b"] {
            let token = sign(Some("k1"), claims(json!(sub)), SECRET);
            assert_eq!(verifier.verify(&token).await.unwrap(), sub);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn key_file_backs_a_static_verifier() {
        let path = std::env::temp_dir().join(format!("capture-relay-jwks-{}.json", now()));
        let doc = json!({
            "keys": [{
                "kid": "k1",
                "kty": "oct",
                "alg": "HS256",
                "k": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(SECRET),
            }]
        });
        std::fs::write(&path, doc.to_string()).unwrap();

        let keys = load_key_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let verifier = JwksVerifier::new(VerifierConfig::static_keys(keys)).unwrap();
        let token = sign(Some("k1"), claims(json!("user-9")), SECRET);
        assert_eq!(verifier.verify(&token).await.unwrap(), "user-9");
    }

    #[test]
    fn empty_or_missing_key_file_is_reported() {
        let missing = std::env::temp_dir().join("capture-relay-no-such-jwks.json");
        assert!(matches!(
            load_key_file(&missing),
            Err(AuthError::KeySetUnavailable(_))
        ));

        let path = std::env::temp_dir().join(format!("capture-relay-empty-{}.json", now()));
        std::fs::write(&path, r#"{"keys":[]}"#).unwrap();
        let result = load_key_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(AuthError::KeySetUnavailable(_))));
    }

    #[tokio::test]
    async fn unreachable_key_set_is_reported() {
        let verifier = JwksVerifier::new(VerifierConfig::remote(
            "http://127.0.0.1:9/jwks.json",
            Duration::from_secs(300),
        ))
        .unwrap();
        let token = sign(Some("k1"), claims(json!("u")), SECRET);
        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::KeySetUnavailable(_))
        ));
    }
}
