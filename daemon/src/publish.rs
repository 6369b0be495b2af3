use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey};
use log::{info, warn};
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use areg_common::card::{canonical_bytes, validate_card, CardSource, ValidCard};
use areg_common::error::ApiError;
use areg_common::principal::Principal;

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::fetcher::{FetchLimits, HttpFetcher};
use crate::index::{AgentView, IndexError, IndexJob, IndexWriter};
use crate::store::{
    agent_record_id, AgentStore, PeerRegistry, StoreError, UpsertOutcome, UpsertVersion,
};

use areg_common::api::{PublishRequest, PublishResponse};

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("failed to fetch signing keys")]
    JwksFetch,
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error("signing key not found in JWKS")]
    UnknownKey,
    #[error("signature verification failed")]
    Invalid,
}

/// Ingestion pipeline: validate, dedupe, version, persist, index,
/// invalidate caches. One instance serves both local publishes and the
/// federation manager acting as a synthetic publisher.
pub struct PublishService {
    store: Arc<AgentStore>,
    writer: Arc<IndexWriter>,
    cache: Arc<ResponseCache>,
    fetcher: Arc<dyn HttpFetcher>,
    config: Arc<Config>,
}

impl PublishService {
    pub fn new(
        store: Arc<AgentStore>,
        writer: Arc<IndexWriter>,
        cache: Arc<ResponseCache>,
        fetcher: Arc<dyn HttpFetcher>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            writer,
            cache,
            fetcher,
            config,
        }
    }

    /// Publish by value or by URL on behalf of an authenticated principal.
    /// The bool in the result is `created` (drives 201 vs 200).
    pub async fn publish(
        &self,
        principal: &Principal,
        request: PublishRequest,
    ) -> Result<PublishResponse, ApiError> {
        if !principal.can_publish() {
            return Err(ApiError::Forbidden(
                "publishing requires the CatalogManager role".to_string(),
            ));
        }
        if request.publisher.is_some() && !principal.is_administrator() {
            return Err(ApiError::Forbidden(
                "publisher override requires the Administrator role".to_string(),
            ));
        }

        let (raw, source, source_url) = match (&request.card, &request.card_url) {
            (Some(card), None) => (card.clone(), CardSource::ByValue, None),
            (None, Some(card_url)) => {
                let url = Url::parse(card_url)
                    .ok()
                    .filter(|u| u.scheme() == "http" || u.scheme() == "https")
                    .ok_or_else(|| {
                        ApiError::BadRequest("cardUrl must be an absolute http(s) URL".to_string())
                    })?;
                // Publisher-supplied URLs may redirect across hosts.
                let raw = self
                    .fetcher
                    .fetch_json(&url, None, &FetchLimits::default())
                    .await?;
                (raw, CardSource::ByUrl, Some(card_url.clone()))
            }
            _ => {
                return Err(ApiError::BadRequest(
                    "exactly one of card or cardUrl is required".to_string(),
                ))
            }
        };

        let valid = validate_card(&raw).map_err(|errors| ApiError::InvalidCard(errors.0))?;

        let publisher_name = request
            .publisher
            .clone()
            .unwrap_or_else(|| principal.publisher_name().to_string());

        // The declared provider must agree with the publisher identity
        // unless an Administrator says otherwise.
        if let Some(provider) = &valid.card.provider {
            if provider.organization != publisher_name && !principal.is_administrator() {
                return Err(ApiError::Forbidden(format!(
                    "provider organization '{}' does not match publisher '{}'",
                    provider.organization, publisher_name
                )));
            }
        }

        // Best-effort signature check: a broken signature from an
        // authorized publisher is logged, not rejected.
        if let Err(e) = self.verify_card_signature(&valid).await {
            warn!(
                "card signature for '{}' did not verify: {}",
                valid.card.name, e
            );
        }

        let input = UpsertVersion {
            tenant: principal.tenant.clone(),
            publisher_name,
            valid,
            public: request.public,
            source,
            source_url,
            federated_from: None,
            max_agents_per_publisher: Some(self.config.max_agents_per_client),
        };
        let outcome = self.commit_and_index(input).await?;

        counter!("registry_publish_total").increment(1);
        info!(
            "published {} v{} in tenant {} (created: {})",
            outcome.record.name, outcome.version.version, outcome.record.tenant, outcome.created
        );

        Ok(PublishResponse {
            agent_id: outcome.record.id.clone(),
            version_id: outcome.version.id.clone(),
            created: outcome.created,
        })
    }

    /// Apply a card advertised by a federated peer. The synthetic
    /// publisher namespace (`peer:{name}`) keeps these from ever colliding
    /// with local records; signature failures are fatal here.
    pub async fn apply_federated(
        &self,
        peer: &PeerRegistry,
        raw: &Value,
    ) -> Result<UpsertOutcome, ApiError> {
        let valid = validate_card(raw).map_err(|errors| ApiError::InvalidCard(errors.0))?;
        if valid.card.signature.is_some() {
            self.verify_card_signature(&valid)
                .await
                .map_err(|e| ApiError::Upstream(format!("federated card signature: {e}")))?;
        }

        let input = UpsertVersion {
            tenant: self.config.admin_tenant.clone(),
            publisher_name: peer.publisher_name(),
            valid,
            public: true,
            source: CardSource::Federated,
            source_url: None,
            federated_from: Some(peer.id.clone()),
            max_agents_per_publisher: None,
        };
        self.commit_and_index(input).await
    }

    /// Reserve index capacity first, then run the store transaction, then
    /// hand the job over through the reserved slot while the writer lock
    /// still holds commit order. A saturated queue fails the publish
    /// before anything is persisted, so publish stays atomic.
    async fn commit_and_index(&self, input: UpsertVersion) -> Result<UpsertOutcome, ApiError> {
        let agent_id = agent_record_id(&input.tenant, &input.publisher_name, &input.valid.card.name);
        let slot = self
            .writer
            .reserve(&agent_id, self.config.index_enqueue_timeout())
            .await
            .map_err(|e| match e {
                IndexError::Saturated => {
                    ApiError::Overloaded("search index queue is saturated".to_string())
                }
                other => ApiError::Internal(other.to_string()),
            })?;

        let tenant = input.tenant.clone();
        let publisher_name = input.publisher_name.clone();
        let outcome = self
            .store
            .upsert_version(input, move |record, version| {
                let view = AgentView::build(record, version, &publisher_name);
                slot.send(IndexJob::Upsert(Box::new(view)));
            })
            .await
            .map_err(map_store_error)?;

        // Invalidation runs after the commit and before the response, so a
        // same-tenant read that follows this publish cannot see stale data.
        self.cache.invalidate_tenant(&tenant);
        Ok(outcome)
    }

    /// Verify the card's detached JWS against the keys at its `jwksUrl`.
    /// The payload is the canonical card without the signature field.
    async fn verify_card_signature(&self, valid: &ValidCard) -> Result<(), SignatureError> {
        let Some(signature) = &valid.card.signature else {
            return Ok(());
        };
        let Some(jwks_url) = &signature.jwks_url else {
            // Structurally validated only; nothing to verify against.
            return Ok(());
        };

        let url = Url::parse(jwks_url).map_err(|_| SignatureError::JwksFetch)?;
        let jwks_raw = self
            .fetcher
            .fetch_json(&url, None, &FetchLimits::default())
            .await
            .map_err(|_| SignatureError::JwksFetch)?;
        let jwks: JwkSet =
            serde_json::from_value(jwks_raw).map_err(|_| SignatureError::JwksFetch)?;

        let protected_json = URL_SAFE_NO_PAD
            .decode(&signature.protected)
            .map_err(|_| SignatureError::Malformed("protected header".to_string()))?;
        let protected: Value = serde_json::from_slice(&protected_json)
            .map_err(|_| SignatureError::Malformed("protected header".to_string()))?;
        let alg = protected
            .get("alg")
            .and_then(Value::as_str)
            .and_then(|a| Algorithm::from_str(a).ok())
            .ok_or_else(|| SignatureError::Malformed("alg".to_string()))?;
        let kid = protected
            .get("kid")
            .and_then(Value::as_str)
            .ok_or_else(|| SignatureError::Malformed("kid".to_string()))?;

        let jwk = jwks
            .keys
            .iter()
            .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
            .ok_or(SignatureError::UnknownKey)?;
        let key = DecodingKey::from_jwk(jwk).map_err(|_| SignatureError::UnknownKey)?;

        let payload = signing_payload(&valid.canonical)
            .ok_or_else(|| SignatureError::Malformed("payload".to_string()))?;
        let message = format!("{}.{}", signature.protected, payload);

        match jsonwebtoken::crypto::verify(&signature.signature, message.as_bytes(), &key, alg) {
            Ok(true) => Ok(()),
            Ok(false) => Err(SignatureError::Invalid),
            Err(_) => Err(SignatureError::Invalid),
        }
    }
}

/// Base64url payload of the detached JWS: the canonical card minus its
/// own signature field.
fn signing_payload(canonical: &[u8]) -> Option<String> {
    let mut value: Value = serde_json::from_slice(canonical).ok()?;
    value.as_object_mut()?.remove("signature");
    Some(URL_SAFE_NO_PAD.encode(canonical_bytes(&value)))
}

pub fn map_store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::QuotaExceeded { limit } => {
            ApiError::Forbidden(format!("publisher quota of {limit} agents exhausted"))
        }
        StoreError::FederatedImmutable => ApiError::Forbidden(
            "federated agents cannot be modified by local publish".to_string(),
        ),
        StoreError::RecordNotFound | StoreError::PeerNotFound | StoreError::EntitlementNotFound => {
            ApiError::NotFound
        }
        other => ApiError::Internal(other.to_string()),
    }
}
