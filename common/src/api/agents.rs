use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::card::CardSource;
use crate::config::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::crypto::Hash;
use crate::principal::Role;
use crate::time::UnixMillis;

/// Body of `POST /agents/publish`: exactly one of `card` (by value) or
/// `cardUrl` (fetched by the registry) must be present.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_url: Option<String>,
    #[serde(default)]
    pub public: bool,
    /// Publisher override; requires Administrator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub agent_id: Hash,
    pub version_id: Hash,
    pub created: bool,
}

/// List/search item projection of an agent record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: Hash,
    pub name: String,
    pub description: String,
    pub version: String,
    pub publisher: String,
    pub public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federated_from: Option<Hash>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub updated_at: UnixMillis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetail {
    #[serde(flatten)]
    pub summary: AgentSummary,
    pub version_id: Hash,
    pub content_hash: Hash,
    pub source: CardSource,
    pub created_at: UnixMillis,
    pub card: Value,
}

/// `?top=&skip=` pagination of the list endpoints.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct PageQuery {
    pub top: Option<i64>,
    pub skip: Option<i64>,
}

impl PageQuery {
    /// Clamp to the documented bounds: `top` in [0, 100] (0 yields an empty
    /// page), default 20; negative `skip` treated as 0.
    pub fn clamp(&self) -> (usize, usize) {
        let top = match self.top {
            None => DEFAULT_PAGE_SIZE,
            Some(t) if t <= 0 => 0,
            Some(t) => (t as usize).min(MAX_PAGE_SIZE),
        };
        let skip = self.skip.map(|s| s.max(0) as usize).unwrap_or(0);
        (top, skip)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPage {
    pub items: Vec<AgentSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_skip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<i64>,
}

impl SearchRequest {
    pub fn page(&self) -> PageQuery {
        PageQuery {
            top: self.top,
            skip: self.skip,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,
}

/// `GET /.well-known/agents/index.json` page.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellKnownIndex {
    pub registry: RegistryInfo,
    pub agents: Vec<IndexEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Stable registry metadata header of the well-known index.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryInfo {
    pub name: String,
    pub version: String,
    pub base_url: String,
}

/// One advertised public agent. Peers sync from `(publisher, name,
/// contentHash)` and fetch the full card at `cardUrl`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: Hash,
    pub publisher: String,
    pub name: String,
    pub content_hash: Hash,
    pub card_url: String,
    pub updated_at: UnixMillis,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SubjectKind {
    Principal,
    Consumer,
    Role,
}

/// Body of `POST /agents/{id}/entitlements` (grant) and
/// `DELETE /agents/{id}/entitlements` (revoke).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementRequest {
    pub subject_kind: SubjectKind,
    pub subject: String,
}

impl EntitlementRequest {
    pub fn for_role(role: Role) -> Self {
        Self {
            subject_kind: SubjectKind::Role,
            subject: role.to_string(),
        }
    }
}
