use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};

use areg_common::api::{
    AgentDetail, AgentPage, AgentSummary, IndexEntry, PageQuery, RegistryInfo, SearchRequest,
    WellKnownIndex,
};
use areg_common::config::{MAX_FILTER_SECURITY, MAX_FILTER_TAGS, MAX_PAGE_SIZE, MAX_QUERY_LENGTH};
use areg_common::crypto::Hash;
use areg_common::error::ApiError;
use areg_common::principal::Principal;
use areg_common::time::UnixMillis;

use crate::cache::{cache_key, ResponseCache};
use crate::config::Config;
use crate::index::SearchIndex;
use crate::store::{AgentRecord, AgentStore, AgentVersion};

/// Read side of the registry: list, search, get, and the well-known
/// surface, every path filtered through the visibility rule before
/// pagination.
pub struct DiscoveryService {
    store: Arc<AgentStore>,
    index: Arc<SearchIndex>,
    cache: Arc<ResponseCache>,
    config: Arc<Config>,
}

impl DiscoveryService {
    pub fn new(
        store: Arc<AgentStore>,
        index: Arc<SearchIndex>,
        cache: Arc<ResponseCache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            index,
            cache,
            config,
        }
    }

    /// A record is visible to a reader iff it is public, or the reader
    /// shares the tenant and holds an active entitlement. Hidden
    /// (retracted) records are visible to no one.
    async fn is_visible(&self, record: &AgentRecord, principal: Option<&Principal>) -> bool {
        if record.hidden {
            return false;
        }
        if record.public {
            return true;
        }
        match principal {
            None => false,
            Some(p) => {
                p.tenant == record.tenant && self.store.is_entitled(&record.id, p).await
            }
        }
    }

    async fn summarize(&self, record: &AgentRecord) -> Option<AgentSummary> {
        let version = self.store.get_version(&record.latest_version_id).await?;
        let publisher = self
            .store
            .publisher(&record.publisher_id)
            .await
            .map(|p| p.display_name)
            .unwrap_or_default();
        Some(summary_of(record, &version, publisher))
    }

    async fn page_of(
        &self,
        records: Vec<AgentRecord>,
        page: PageQuery,
    ) -> AgentPage {
        let (top, skip) = page.clamp();
        let total = records.len() as u64;
        let mut items = Vec::with_capacity(top.min(records.len()));
        for record in records.iter().skip(skip).take(top) {
            if let Some(summary) = self.summarize(record).await {
                items.push(summary);
            }
        }
        let consumed = skip.saturating_add(top) as u64;
        AgentPage {
            items,
            next_skip: (consumed < total).then_some(consumed),
            total: Some(total),
        }
    }

    /// `GET /agents/public` — cross-tenant, public records only, no auth.
    pub async fn list_public(&self, page: PageQuery) -> Result<Value, ApiError> {
        let (top, skip) = page.clamp();
        let key = cache_key("list_public", None, None, &format!("top={top}&skip={skip}"));
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let records = self.store.list_public().await;
        let body = to_json(&self.page_of(records, page).await)?;
        self.cache
            .put(key, body.clone(), self.config.cache_ttl_list());
        Ok(body)
    }

    /// `GET /agents/entitled` — tenant-scoped union of public and
    /// entitled records.
    pub async fn list_entitled(
        &self,
        principal: &Principal,
        page: PageQuery,
    ) -> Result<Value, ApiError> {
        let (top, skip) = page.clamp();
        let key = cache_key(
            "list_entitled",
            Some(&principal.tenant),
            Some(&principal.id),
            &format!("top={top}&skip={skip}"),
        );
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let entitled = self.store.entitled_agent_ids(principal).await;
        let records: Vec<AgentRecord> = self
            .store
            .list_tenant(&principal.tenant)
            .await
            .into_iter()
            .filter(|r| r.public || entitled.contains(&r.id))
            .collect();

        let body = to_json(&self.page_of(records, page).await)?;
        self.cache
            .put(key, body.clone(), self.config.cache_ttl_list());
        Ok(body)
    }

    /// `GET /agents/{id}` — record plus latest card when visible;
    /// invisibility is reported as absence.
    pub async fn get_agent(
        &self,
        id: &str,
        principal: Option<&Principal>,
    ) -> Result<AgentDetail, ApiError> {
        let agent_id = parse_agent_id(id)?;
        let record = self
            .store
            .get_record(&agent_id)
            .await
            .ok_or(ApiError::NotFound)?;
        if !self.is_visible(&record, principal).await {
            return Err(ApiError::NotFound);
        }
        let version = self
            .store
            .get_version(&record.latest_version_id)
            .await
            .ok_or(ApiError::NotFound)?;
        let summary = self.summarize(&record).await.ok_or(ApiError::NotFound)?;
        let card: Value =
            serde_json::from_str(&version.canonical).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(AgentDetail {
            summary,
            version_id: version.id.clone(),
            content_hash: version.content_hash.clone(),
            source: version.source,
            created_at: version.created_at,
            card,
        })
    }

    /// `GET /agents/{id}/card` — canonical card bytes of the latest
    /// version. Public cards are cached globally.
    pub async fn get_card(
        &self,
        id: &str,
        principal: Option<&Principal>,
    ) -> Result<Value, ApiError> {
        let agent_id = parse_agent_id(id)?;
        let key = cache_key("get_card", None, None, id);

        let record = self
            .store
            .get_record(&agent_id)
            .await
            .ok_or(ApiError::NotFound)?;
        if !self.is_visible(&record, principal).await {
            return Err(ApiError::NotFound);
        }
        if record.public && !record.hidden {
            if let Some(cached) = self.cache.get(&key) {
                return Ok(cached);
            }
        }

        let version = self
            .store
            .get_version(&record.latest_version_id)
            .await
            .ok_or(ApiError::NotFound)?;
        let card: Value =
            serde_json::from_str(&version.canonical).map_err(|e| ApiError::Internal(e.to_string()))?;
        if record.public {
            self.cache
                .put(key, card.clone(), self.config.cache_ttl_card());
        }
        Ok(card)
    }

    /// `POST /agents/search` — full-text and filter search inside the
    /// caller's visibility set; relevance first, then recency.
    pub async fn search(
        &self,
        principal: Option<&Principal>,
        request: SearchRequest,
    ) -> Result<AgentPage, ApiError> {
        if let Some(q) = &request.q {
            if q.len() > MAX_QUERY_LENGTH {
                return Err(ApiError::BadRequest("query too long".to_string()));
            }
        }
        if request.filters.tags.len() > MAX_FILTER_TAGS
            || request.filters.security.len() > MAX_FILTER_SECURITY
        {
            return Err(ApiError::BadRequest("filter input too large".to_string()));
        }

        let (top, skip) = request.page().clamp();
        let entitled = match principal {
            Some(p) => self.store.entitled_agent_ids(p).await,
            None => Default::default(),
        };
        let (views, total) = self.index.search(
            request.q.as_deref(),
            &request.filters,
            |view| {
                if view.public {
                    return true;
                }
                principal
                    .map(|p| p.tenant == view.tenant && entitled.contains(&view.agent_id))
                    .unwrap_or(false)
            },
            top,
            skip,
        );

        let mut items = Vec::with_capacity(views.len());
        for view in &views {
            // Project from the store head so search results carry the
            // same shape as the list endpoints.
            if let Some(record) = self.store.get_record(&view.agent_id).await {
                if let Some(summary) = self.summarize(&record).await {
                    items.push(summary);
                }
            }
        }
        let consumed = (skip + top) as u64;
        Ok(AgentPage {
            items,
            next_skip: (consumed < total as u64).then_some(consumed),
            total: Some(total as u64),
        })
    }

    /// `GET /.well-known/agents/index.json` — paginated public index with
    /// an opaque `(updated_at, id)` cursor.
    pub async fn well_known_index(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Value, ApiError> {
        let limit = limit.unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let params = format!("cursor={}&limit={limit}", cursor.unwrap_or(""));
        let key = cache_key("well_known_index", None, None, &params);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let after = cursor.map(decode_cursor).transpose()?;
        let records = self.store.list_public().await;
        let start = match after {
            None => 0,
            Some((updated_at, id)) => records
                .iter()
                .position(|r| {
                    (r.updated_at, r.id.clone()) < (updated_at, id.clone())
                })
                .unwrap_or(records.len()),
        };

        let page: Vec<&AgentRecord> = records.iter().skip(start).take(limit).collect();
        let mut agents = Vec::with_capacity(page.len());
        for record in &page {
            let Some(version) = self.store.get_version(&record.latest_version_id).await else {
                continue;
            };
            let publisher = self
                .store
                .publisher(&record.publisher_id)
                .await
                .map(|p| p.display_name)
                .unwrap_or_default();
            agents.push(IndexEntry {
                id: record.id.clone(),
                publisher,
                name: record.name.clone(),
                content_hash: version.content_hash.clone(),
                card_url: format!("{}/agents/{}/card", self.config.base_url, record.id),
                updated_at: record.updated_at,
            });
        }

        let next_cursor = (start + limit < records.len())
            .then(|| page.last().map(|r| encode_cursor(r.updated_at, &r.id)))
            .flatten();

        let body = to_json(&WellKnownIndex {
            registry: self.registry_info(),
            agents,
            next_cursor,
        })?;
        self.cache
            .put(key, body.clone(), self.config.cache_ttl_well_known());
        Ok(body)
    }

    /// `GET /.well-known/agent.json` — the registry's own card.
    pub async fn registry_card(&self) -> Result<Value, ApiError> {
        let key = cache_key("well_known_card", None, None, "self");
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        let info = self.registry_info();
        let card = json!({
            "name": info.name.clone(),
            "description": "Agent registry and discovery service",
            "url": info.base_url.clone(),
            "version": info.version,
            "capabilities": {},
            "securitySchemes": [
                {
                    "type": "oauth2",
                    "flow": "client_credentials",
                    "tokenUrl": format!("{}/oauth/token", info.base_url)
                }
            ],
            "skills": [
                {
                    "id": "agent-discovery",
                    "name": "Agent discovery",
                    "description": "List, search and fetch published agent cards",
                    "tags": ["registry", "discovery"]
                }
            ],
            "interface": {
                "preferredTransport": "http",
                "defaultInputModes": ["application/json"],
                "defaultOutputModes": ["application/json"]
            },
            "provider": {
                "organization": info.name,
                "url": info.base_url
            }
        });
        self.cache
            .put(key, card.clone(), self.config.cache_ttl_well_known());
        Ok(card)
    }

    fn registry_info(&self) -> RegistryInfo {
        RegistryInfo {
            name: self.config.registry_name.clone(),
            version: areg_common::config::VERSION.to_string(),
            base_url: self.config.base_url.clone(),
        }
    }
}

fn summary_of(record: &AgentRecord, version: &AgentVersion, publisher: String) -> AgentSummary {
    let mut tags: Vec<String> = Vec::new();
    for skill in &version.card.skills {
        for tag in &skill.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
    }
    AgentSummary {
        id: record.id.clone(),
        name: record.name.clone(),
        description: version.card.description.clone(),
        version: version.card.version.clone(),
        publisher,
        public: record.public,
        federated_from: record.federated_from.clone(),
        tags,
        updated_at: record.updated_at,
    }
}

fn parse_agent_id(id: &str) -> Result<Hash, ApiError> {
    // Malformed ids are indistinguishable from absent ones on purpose.
    Hash::from_str(id).map_err(|_| ApiError::NotFound)
}

fn encode_cursor(updated_at: UnixMillis, id: &Hash) -> String {
    URL_SAFE_NO_PAD.encode(format!("{updated_at}:{id}"))
}

fn decode_cursor(cursor: &str) -> Result<(UnixMillis, Hash), ApiError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| ApiError::InvalidCursor)?;
    let text = String::from_utf8(bytes).map_err(|_| ApiError::InvalidCursor)?;
    let (updated_at, id) = text.split_once(':').ok_or(ApiError::InvalidCursor)?;
    let updated_at = updated_at.parse().map_err(|_| ApiError::InvalidCursor)?;
    let id = Hash::from_str(id).map_err(|_| ApiError::InvalidCursor)?;
    Ok((updated_at, id))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrip() {
        let id = areg_common::crypto::hash(b"agent");
        let cursor = encode_cursor(1234, &id);
        let (updated_at, decoded) = decode_cursor(&cursor).expect("decode");
        assert_eq!(updated_at, 1234);
        assert_eq!(decoded, id);
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert!(matches!(
            decode_cursor("@@not-base64@@"),
            Err(ApiError::InvalidCursor)
        ));
        let valid_b64 = URL_SAFE_NO_PAD.encode("no-colon-here");
        assert!(matches!(
            decode_cursor(&valid_b64),
            Err(ApiError::InvalidCursor)
        ));
    }
}
