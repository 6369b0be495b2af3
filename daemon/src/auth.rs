use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, jwk::JwkSet, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use areg_common::error::ApiError;
use areg_common::principal::{Principal, PrincipalKind, Role};

use crate::config::{Config, JWKS_TTL_SECS};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authentication")]
    MissingAuth,
    #[error("token rejected: {0}")]
    InvalidToken(String),
    #[error("token verification is not configured")]
    NotConfigured,
    #[error("token is missing the '{0}' claim")]
    MissingClaim(&'static str),
    #[error("failed to fetch JWKS")]
    JwksFetchFailed,
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Unauthenticated(e.to_string())
    }
}

/// Resolves a bearer token into a verified [`Principal`].
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    tenant: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    /// `scopes` array, or the OAuth2-style space-delimited `scope` string.
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    consumer: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[allow(dead_code)]
    exp: u64,
}

impl TokenClaims {
    fn into_principal(self) -> Result<Principal, AuthError> {
        let tenant = self.tenant.ok_or(AuthError::MissingClaim("tenant"))?;
        let mut scopes: HashSet<String> = self.scopes.into_iter().collect();
        if let Some(scope) = self.scope {
            scopes.extend(scope.split_whitespace().map(|s| s.to_string()));
        }
        // Unknown role names are ignored rather than rejected, so new
        // roles can roll out issuer-side first.
        let roles = self
            .roles
            .iter()
            .filter_map(|r| Role::from_str(r).ok())
            .collect();
        let kind = match self.kind.as_deref() {
            Some("service") => PrincipalKind::Service,
            _ => PrincipalKind::User,
        };
        Ok(Principal {
            id: self.sub,
            tenant,
            kind,
            roles,
            scopes,
            consumer: self.consumer,
            organization: self.org,
        })
    }
}

struct JwksCache {
    fetched_at: tokio::time::Instant,
    jwks: JwkSet,
}

enum VerifierMode {
    /// Production: keys fetched from the issuer's JWKS endpoint.
    Jwks { url: String },
    /// Development and tests: a shared HS256 secret.
    Hs256 { secret: String },
}

/// JWT verifier with a cached JWKS. The issuer and audience checks apply
/// in both modes when configured.
pub struct JwtVerifier {
    mode: VerifierMode,
    issuer: Option<String>,
    audience: Option<String>,
    http: Client,
    jwks_cache: RwLock<Option<JwksCache>>,
}

impl JwtVerifier {
    pub fn from_config(config: &Config) -> Result<Self, AuthError> {
        let mode = if let Some(url) = &config.jwks_url {
            VerifierMode::Jwks { url: url.clone() }
        } else if let Some(secret) = &config.hs256_secret {
            VerifierMode::Hs256 {
                secret: secret.clone(),
            }
        } else {
            return Err(AuthError::NotConfigured);
        };
        Ok(Self {
            mode,
            issuer: config.oauth_issuer.clone(),
            audience: config.oauth_audience.clone(),
            http: Client::new(),
            jwks_cache: RwLock::new(None),
        })
    }

    pub fn hs256(secret: &str) -> Self {
        Self {
            mode: VerifierMode::Hs256 {
                secret: secret.to_string(),
            },
            issuer: None,
            audience: None,
            http: Client::new(),
            jwks_cache: RwLock::new(None),
        }
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.validate_exp = true;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }

    async fn load_jwks(&self, url: &str) -> Result<JwkSet, AuthError> {
        let mut cache_guard = self.jwks_cache.write().await;
        if let Some(cache) = cache_guard.as_ref() {
            if cache.fetched_at.elapsed() < Duration::from_secs(JWKS_TTL_SECS) {
                return Ok(cache.jwks.clone());
            }
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|_| AuthError::JwksFetchFailed)?;
        let jwks = response
            .json::<JwkSet>()
            .await
            .map_err(|_| AuthError::JwksFetchFailed)?;
        *cache_guard = Some(JwksCache {
            fetched_at: tokio::time::Instant::now(),
            jwks: jwks.clone(),
        });
        Ok(jwks)
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = match &self.mode {
            VerifierMode::Hs256 { secret } => {
                let key = DecodingKey::from_secret(secret.as_bytes());
                decode::<TokenClaims>(token, &key, &self.validation(Algorithm::HS256))
                    .map_err(|e| AuthError::InvalidToken(e.to_string()))?
                    .claims
            }
            VerifierMode::Jwks { url } => {
                let header =
                    decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
                let kid = header
                    .kid
                    .ok_or_else(|| AuthError::InvalidToken("missing kid".to_string()))?;
                let jwks = self.load_jwks(url).await?;
                let jwk = jwks
                    .keys
                    .iter()
                    .find(|jwk| jwk.common.key_id.as_deref() == Some(&kid))
                    .ok_or_else(|| AuthError::InvalidToken("unknown kid".to_string()))?;
                let key = DecodingKey::from_jwk(jwk)
                    .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
                decode::<TokenClaims>(token, &key, &self.validation(header.alg))
                    .map_err(|e| AuthError::InvalidToken(e.to_string()))?
                    .claims
            }
        };
        claims.into_principal()
    }
}

/// The AuthZ gate: bearer extraction, token verification, static admin
/// API keys, and the role/tenant checks the handlers lean on.
pub struct AuthGate {
    verifier: Option<Arc<dyn TokenVerifier>>,
    api_keys: HashSet<String>,
    admin_tenant: String,
}

impl AuthGate {
    pub fn new(verifier: Option<Arc<dyn TokenVerifier>>, config: &Config) -> Self {
        Self {
            verifier,
            api_keys: config.admin_api_keys().into_iter().collect(),
            admin_tenant: config.admin_tenant.clone(),
        }
    }

    /// Authenticate a required bearer token.
    pub async fn authenticate(&self, bearer: Option<&str>) -> Result<Principal, ApiError> {
        let token = bearer.ok_or(AuthError::MissingAuth)?;

        if !self.api_keys.is_empty() && self.api_keys.contains(token) {
            return Ok(self.api_key_principal());
        }

        let verifier = self.verifier.as_ref().ok_or(AuthError::NotConfigured)?;
        Ok(verifier.verify(token).await?)
    }

    /// Authenticate a token when present; public endpoints accept both.
    pub async fn authenticate_optional(
        &self,
        bearer: Option<&str>,
    ) -> Result<Option<Principal>, ApiError> {
        match bearer {
            None => Ok(None),
            Some(token) => self.authenticate(Some(token)).await.map(Some),
        }
    }

    fn api_key_principal(&self) -> Principal {
        Principal {
            id: "api-key".to_string(),
            tenant: self.admin_tenant.clone(),
            kind: PrincipalKind::Service,
            roles: [Role::Administrator].into_iter().collect(),
            scopes: HashSet::new(),
            consumer: None,
            organization: None,
        }
    }

    pub fn require_administrator(&self, principal: &Principal) -> Result<(), ApiError> {
        if principal.is_administrator() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "this operation requires the Administrator role".to_string(),
            ))
        }
    }
}

/// Extract the bearer token from an Authorization header value.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(|token| token.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use areg_common::time::now_seconds;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "areg-test-secret";

    fn signed_token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("token")
    }

    fn default_claims() -> serde_json::Value {
        json!({
            "sub": "user-1",
            "tenant": "tenant-a",
            "roles": ["CatalogManager", "User", "SomethingUnknown"],
            "scope": "registry:read registry:write",
            "consumer": "team-search",
            "org": "Acme",
            "exp": now_seconds() + 3600,
        })
    }

    #[tokio::test]
    async fn hs256_token_resolves_to_principal() {
        let verifier = JwtVerifier::hs256(SECRET);
        let principal = verifier
            .verify(&signed_token(default_claims()))
            .await
            .expect("valid token");
        assert_eq!(principal.id, "user-1");
        assert_eq!(principal.tenant, "tenant-a");
        assert!(principal.can_publish());
        assert!(!principal.is_administrator());
        assert!(principal.has_scope("registry:write"));
        assert_eq!(principal.consumer.as_deref(), Some("team-search"));
        assert_eq!(principal.publisher_name(), "Acme");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let verifier = JwtVerifier::hs256(SECRET);
        let mut claims = default_claims();
        claims["exp"] = json!(now_seconds() - 3600);
        let err = verifier
            .verify(&signed_token(claims))
            .await
            .expect_err("expired");
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn tenant_claim_is_required() {
        let verifier = JwtVerifier::hs256(SECRET);
        let mut claims = default_claims();
        claims.as_object_mut().unwrap().remove("tenant");
        let err = verifier
            .verify(&signed_token(claims))
            .await
            .expect_err("no tenant");
        assert!(matches!(err, AuthError::MissingClaim("tenant")));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let verifier = JwtVerifier::hs256("other-secret");
        let err = verifier
            .verify(&signed_token(default_claims()))
            .await
            .expect_err("bad signature");
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn api_key_grants_administrator() {
        let mut config = Config::in_memory();
        config.admin_api_keys = Some("ops-key-1".to_string());
        let gate = AuthGate::new(Some(Arc::new(JwtVerifier::hs256(SECRET))), &config);

        let principal = gate.authenticate(Some("ops-key-1")).await.expect("key");
        assert!(principal.is_administrator());
        assert_eq!(principal.tenant, "system");

        let err = gate.authenticate(None).await.expect_err("missing auth");
        assert_eq!(err.http_status(), 401);
    }

    #[test]
    fn bearer_extraction_handles_casing() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
    }
}
