use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use areg_common::api::{PeerStatus, SubjectKind, SyncOutcome};
use areg_common::card::{AgentCard, CardSource, ValidCard};
use areg_common::crypto::{hash_parts, Hash};
use areg_common::principal::Principal;
use areg_common::time::{now_millis, UnixMillis};

mod backend;
mod cache;
mod snapshot;

pub use backend::StoreState;
pub use cache::StoreCache;
pub use snapshot::SnapshotGuard;

// Kept sync runs per peer; older runs are dropped from the history.
const SYNC_RUN_HISTORY: usize = 50;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub created_at: UnixMillis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Publisher {
    pub id: Hash,
    pub tenant: String,
    pub display_name: String,
    pub created_at: UnixMillis,
}

/// Mutable head pointer for an agent within a tenant.
/// Unique by `(tenant, publisher, name)`; the id is the hash of that key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Hash,
    pub tenant: String,
    pub publisher_id: Hash,
    pub name: String,
    pub latest_version_id: Hash,
    pub public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federated_from: Option<Hash>,
    /// Set by federation retraction; hidden records stay out of every
    /// discovery surface but keep their version history.
    #[serde(default)]
    pub hidden: bool,
    pub created_at: UnixMillis,
    pub updated_at: UnixMillis,
}

/// Immutable published card version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentVersion {
    pub id: Hash,
    pub agent_id: Hash,
    pub version: String,
    pub card: AgentCard,
    /// Canonical JSON exactly as hashed at publish time; served back by
    /// the card endpoints so the content hash always verifies.
    pub canonical: String,
    pub content_hash: Hash,
    pub source: CardSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub created_at: UnixMillis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: Hash,
    pub tenant: String,
    pub subject_kind: SubjectKind,
    pub subject: String,
    pub agent_id: Hash,
    pub granted_at: UnixMillis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<UnixMillis>,
}

impl Entitlement {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    /// Resolution is a union over the reader's subjects (its own id, its
    /// consumer, each of its roles); the subject kind only disambiguates
    /// the grant's identity.
    pub fn matches(&self, principal: &Principal) -> bool {
        self.is_active()
            && principal
                .entitlement_subjects()
                .iter()
                .any(|subject| subject == &self.subject)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRegistry {
    pub id: Hash,
    pub name: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub sync_interval_s: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<UnixMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cursor: Option<String>,
    pub status: PeerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: UnixMillis,
}

impl PeerRegistry {
    /// Synthetic publisher name owning this peer's federated records.
    pub fn publisher_name(&self) -> String {
        format!("peer:{}", self.name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Hash,
    pub peer_id: Hash,
    pub started_at: UnixMillis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<UnixMillis>,
    pub outcome: SyncOutcome,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Durable record of an index operation that failed after store commit;
/// the reconciler retries these until they apply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepairEntry {
    pub agent_id: Hash,
    pub deleted: bool,
    pub attempts: u32,
    pub last_error: String,
    pub queued_at: UnixMillis,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to serialize entity")]
    Serialize,
    #[error("snapshot already active")]
    SnapshotAlreadyActive,
    #[error("snapshot not active")]
    SnapshotNotActive,
    #[error("agent record not found")]
    RecordNotFound,
    #[error("peer not found")]
    PeerNotFound,
    #[error("peer already exists")]
    PeerAlreadyExists,
    #[error("entitlement not found")]
    EntitlementNotFound,
    #[error("publisher quota exceeded: {limit} agents")]
    QuotaExceeded { limit: u32 },
    #[error("federated agents cannot be mutated by local publish")]
    FederatedImmutable,
}

pub fn publisher_id(tenant: &str, display_name: &str) -> Hash {
    hash_parts(&[b"publisher", tenant.as_bytes(), display_name.as_bytes()])
}

pub fn agent_record_id(tenant: &str, publisher_name: &str, agent_name: &str) -> Hash {
    hash_parts(&[
        b"agent",
        tenant.as_bytes(),
        publisher_name.as_bytes(),
        agent_name.as_bytes(),
    ])
}

pub fn version_id(agent_id: &Hash, content_hash: &Hash) -> Hash {
    hash_parts(&[b"version", agent_id.as_bytes(), content_hash.as_bytes()])
}

pub fn entitlement_id(tenant: &str, kind: SubjectKind, subject: &str, agent_id: &Hash) -> Hash {
    let kind = match kind {
        SubjectKind::Principal => "principal",
        SubjectKind::Consumer => "consumer",
        SubjectKind::Role => "role",
    };
    hash_parts(&[
        b"entitlement",
        tenant.as_bytes(),
        kind.as_bytes(),
        subject.as_bytes(),
        agent_id.as_bytes(),
    ])
}

pub fn peer_id(name: &str) -> Hash {
    hash_parts(&[b"peer", name.as_bytes()])
}

/// Input of the transactional publish upsert.
pub struct UpsertVersion {
    pub tenant: String,
    pub publisher_name: String,
    pub valid: ValidCard,
    pub public: bool,
    pub source: CardSource,
    pub source_url: Option<String>,
    pub federated_from: Option<Hash>,
    pub max_agents_per_publisher: Option<u32>,
}

#[derive(Debug)]
pub struct UpsertOutcome {
    pub record: AgentRecord,
    pub version: AgentVersion,
    pub created: bool,
}

/// The registry store: an in-memory projection with secondary indexes,
/// optionally persisted to sled, mutated under snapshot guards. The single
/// writer lock linearizes all publishes, which subsumes the per-record
/// ordering requirement.
pub struct AgentStore {
    state: RwLock<StoreState>,
}

impl AgentStore {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::in_memory()),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            state: RwLock::new(StoreState::open(path)?),
        })
    }

    /// Insert or update an agent version. `on_commit` runs after a
    /// successful commit while the writer lock is still held, so callers
    /// can hand the new state to the indexer in commit order.
    pub async fn upsert_version(
        &self,
        input: UpsertVersion,
        on_commit: impl FnOnce(&AgentRecord, &AgentVersion),
    ) -> Result<UpsertOutcome, StoreError> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;

        let tenant = input.tenant.clone();
        if !guard.store_mut().cache().tenants.contains_key(&tenant) {
            guard.store_mut().put_tenant(Tenant {
                id: tenant.clone(),
                name: tenant.clone(),
                created_at: now,
            })?;
        }

        let pub_id = publisher_id(&tenant, &input.publisher_name);
        if !guard.store_mut().cache().publishers.contains_key(&pub_id) {
            guard.store_mut().put_publisher(Publisher {
                id: pub_id.clone(),
                tenant: tenant.clone(),
                display_name: input.publisher_name.clone(),
                created_at: now,
            })?;
        }

        let agent_id = agent_record_id(&tenant, &input.publisher_name, &input.valid.card.name);
        let existing = guard.store_mut().cache().records.get(&agent_id).cloned();

        if let Some(record) = &existing {
            // A federated record is only replaced by subsequent sync runs
            // of its own peer.
            if record.federated_from != input.federated_from {
                return Err(StoreError::FederatedImmutable);
            }
        }

        let content = input.valid.content_hash.clone();
        let dedupe_key = (agent_id.clone(), content.clone());
        if let Some(existing_version_id) = guard
            .store_mut()
            .cache()
            .version_by_content
            .get(&dedupe_key)
            .cloned()
        {
            // Identical bytes: idempotent no-op, no updated_at bump.
            let mut record = existing.ok_or(StoreError::RecordNotFound)?;
            let version = guard
                .store_mut()
                .cache()
                .versions
                .get(&existing_version_id)
                .cloned()
                .ok_or(StoreError::RecordNotFound)?;

            if record.hidden {
                // A peer re-advertised a previously retracted agent.
                record.hidden = false;
                record.updated_at = now;
                guard.store_mut().put_record(record.clone())?;
                guard.commit()?;
                on_commit(&record, &version);
            } else {
                guard.rollback()?;
            }
            return Ok(UpsertOutcome {
                record,
                version,
                created: false,
            });
        }

        let mut record = match existing {
            Some(record) => record,
            None => {
                if let Some(limit) = input.max_agents_per_publisher {
                    let count = guard
                        .store_mut()
                        .cache()
                        .records_by_publisher
                        .get(&pub_id)
                        .map(|set| set.len())
                        .unwrap_or(0);
                    if count >= limit as usize {
                        return Err(StoreError::QuotaExceeded { limit });
                    }
                }
                AgentRecord {
                    id: agent_id.clone(),
                    tenant: tenant.clone(),
                    publisher_id: pub_id.clone(),
                    name: input.valid.card.name.clone(),
                    latest_version_id: Hash::zero(),
                    public: input.public,
                    federated_from: input.federated_from.clone(),
                    hidden: false,
                    created_at: now,
                    updated_at: now,
                }
            }
        };

        let version = AgentVersion {
            id: version_id(&agent_id, &content),
            agent_id: agent_id.clone(),
            version: input.valid.card.version.clone(),
            canonical: String::from_utf8(input.valid.canonical.clone())
                .map_err(|_| StoreError::Serialize)?,
            card: input.valid.card.clone(),
            content_hash: content,
            source: input.source,
            source_url: input.source_url,
            created_at: now,
        };

        record.latest_version_id = version.id.clone();
        record.public = input.public;
        record.hidden = false;
        record.updated_at = now;

        guard.store_mut().put_version(version.clone())?;
        guard.store_mut().put_record(record.clone())?;
        guard.commit()?;
        on_commit(&record, &version);

        // `created` reports whether a new version row was inserted; the
        // dedupe path above is the only way to get `false`.
        Ok(UpsertOutcome {
            record,
            version,
            created: true,
        })
    }

    pub async fn grant_entitlement(
        &self,
        tenant: &str,
        agent_id: &Hash,
        kind: SubjectKind,
        subject: &str,
    ) -> Result<Entitlement, StoreError> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;

        let record = guard
            .store_mut()
            .cache()
            .records
            .get(agent_id)
            .cloned()
            .ok_or(StoreError::RecordNotFound)?;
        if record.tenant != tenant {
            return Err(StoreError::RecordNotFound);
        }

        let entitlement = Entitlement {
            id: entitlement_id(tenant, kind, subject, agent_id),
            tenant: tenant.to_string(),
            subject_kind: kind,
            subject: subject.to_string(),
            agent_id: agent_id.clone(),
            granted_at: now,
            revoked_at: None,
        };
        guard.store_mut().put_entitlement(entitlement.clone())?;
        guard.commit()?;
        Ok(entitlement)
    }

    pub async fn revoke_entitlement(
        &self,
        tenant: &str,
        agent_id: &Hash,
        kind: SubjectKind,
        subject: &str,
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;

        let id = entitlement_id(tenant, kind, subject, agent_id);
        let mut entitlement = guard
            .store_mut()
            .cache()
            .entitlements
            .get(&id)
            .cloned()
            .filter(|e| e.is_active())
            .ok_or(StoreError::EntitlementNotFound)?;
        entitlement.revoked_at = Some(now);
        guard.store_mut().put_entitlement(entitlement)?;
        guard.commit()?;
        Ok(())
    }

    pub async fn create_peer(
        &self,
        name: &str,
        base_url: &str,
        auth_token: Option<String>,
        sync_interval_s: u64,
    ) -> Result<PeerRegistry, StoreError> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;

        if guard.store_mut().cache().peer_by_name.contains_key(name) {
            return Err(StoreError::PeerAlreadyExists);
        }
        let peer = PeerRegistry {
            id: peer_id(name),
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            sync_interval_s,
            last_sync_at: None,
            last_cursor: None,
            status: PeerStatus::Active,
            last_error: None,
            created_at: now,
        };
        guard.store_mut().put_peer(peer.clone())?;
        guard.commit()?;
        Ok(peer)
    }

    pub async fn update_peer(
        &self,
        id: &Hash,
        update: impl FnOnce(&mut PeerRegistry),
    ) -> Result<PeerRegistry, StoreError> {
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;
        let mut peer = guard
            .store_mut()
            .cache()
            .peers
            .get(id)
            .cloned()
            .ok_or(StoreError::PeerNotFound)?;
        update(&mut peer);
        peer.base_url = peer.base_url.trim_end_matches('/').to_string();
        guard.store_mut().put_peer(peer.clone())?;
        guard.commit()?;
        Ok(peer)
    }

    /// Delete a peer; its federated records are hidden and returned so the
    /// caller can drop them from the search index.
    pub async fn remove_peer(&self, id: &Hash) -> Result<Vec<Hash>, StoreError> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;

        if !guard.store_mut().cache().peers.contains_key(id) {
            return Err(StoreError::PeerNotFound);
        }
        let record_ids: Vec<Hash> = guard
            .store_mut()
            .cache()
            .records_by_peer
            .get(id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let federated: Vec<AgentRecord> = record_ids
            .iter()
            .filter_map(|rid| guard.store_mut().cache().records.get(rid).cloned())
            .collect();

        let mut hidden = Vec::with_capacity(federated.len());
        for mut record in federated {
            if !record.hidden {
                record.hidden = true;
                record.updated_at = now;
                hidden.push(record.id.clone());
                guard.store_mut().put_record(record)?;
            }
        }
        guard.store_mut().delete_peer(id)?;
        guard.commit()?;
        Ok(hidden)
    }

    /// Hide a federated record after a peer stopped advertising it.
    pub async fn hide_record(&self, agent_id: &Hash) -> Result<AgentRecord, StoreError> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;
        let mut record = guard
            .store_mut()
            .cache()
            .records
            .get(agent_id)
            .cloned()
            .ok_or(StoreError::RecordNotFound)?;
        if !record.hidden {
            record.hidden = true;
            record.updated_at = now;
            guard.store_mut().put_record(record.clone())?;
            guard.commit()?;
        } else {
            guard.rollback()?;
        }
        Ok(record)
    }

    pub async fn record_sync_run(&self, run: SyncRun) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;
        guard.store_mut().push_sync_run(run, SYNC_RUN_HISTORY)?;
        guard.commit()?;
        Ok(())
    }

    pub async fn push_repair(&self, entry: RepairEntry) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;
        guard.store_mut().put_repair(entry)?;
        guard.commit()?;
        Ok(())
    }

    pub async fn remove_repair(&self, agent_id: &Hash) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut guard = SnapshotGuard::new(&mut state)?;
        guard.store_mut().delete_repair(agent_id)?;
        guard.commit()?;
        Ok(())
    }

    pub async fn repair_entries(&self) -> Vec<RepairEntry> {
        let state = self.state.read().await;
        state.cache().repair.values().cloned().collect()
    }

    pub async fn get_record(&self, id: &Hash) -> Option<AgentRecord> {
        let state = self.state.read().await;
        state.cache().records.get(id).cloned()
    }

    pub async fn get_version(&self, id: &Hash) -> Option<AgentVersion> {
        let state = self.state.read().await;
        state.cache().versions.get(id).cloned()
    }

    pub async fn latest_version(&self, agent_id: &Hash) -> Option<AgentVersion> {
        let state = self.state.read().await;
        let cache = state.cache();
        let record = cache.records.get(agent_id)?;
        cache.versions.get(&record.latest_version_id).cloned()
    }

    pub async fn versions_of(&self, agent_id: &Hash) -> Vec<AgentVersion> {
        let state = self.state.read().await;
        let cache = state.cache();
        cache
            .versions_by_agent
            .get(agent_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| cache.versions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_by_name(
        &self,
        tenant: &str,
        publisher_name: &str,
        name: &str,
    ) -> Option<AgentRecord> {
        let id = agent_record_id(tenant, publisher_name, name);
        self.get_record(&id).await
    }

    pub async fn publisher(&self, id: &Hash) -> Option<Publisher> {
        let state = self.state.read().await;
        state.cache().publishers.get(id).cloned()
    }

    /// All visible public records across tenants, newest-updated first.
    pub async fn list_public(&self) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        let mut records: Vec<AgentRecord> = state
            .cache()
            .records
            .values()
            .filter(|r| r.public && !r.hidden)
            .cloned()
            .collect();
        sort_records(&mut records);
        records
    }

    /// All visible records of a tenant, newest-updated first.
    pub async fn list_tenant(&self, tenant: &str) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        let mut records: Vec<AgentRecord> = state
            .cache()
            .records
            .values()
            .filter(|r| r.tenant == tenant && !r.hidden)
            .cloned()
            .collect();
        sort_records(&mut records);
        records
    }

    pub async fn is_entitled(&self, agent_id: &Hash, principal: &Principal) -> bool {
        let state = self.state.read().await;
        let cache = state.cache();
        let Some(ids) = cache.entitlements_by_agent.get(agent_id) else {
            return false;
        };
        ids.iter()
            .filter_map(|id| cache.entitlements.get(id))
            .any(|e| e.tenant == principal.tenant && e.matches(principal))
    }

    /// Agent ids the principal holds an active entitlement for, resolved
    /// across principal, consumer and role subjects at query time.
    pub async fn entitled_agent_ids(&self, principal: &Principal) -> std::collections::HashSet<Hash> {
        let state = self.state.read().await;
        state
            .cache()
            .entitlements
            .values()
            .filter(|e| e.tenant == principal.tenant && e.matches(principal))
            .map(|e| e.agent_id.clone())
            .collect()
    }

    pub async fn entitlements_for_agent(&self, agent_id: &Hash) -> Vec<Entitlement> {
        let state = self.state.read().await;
        let cache = state.cache();
        cache
            .entitlements_by_agent
            .get(agent_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| cache.entitlements.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Visible federated records of a peer.
    pub async fn federated_records(&self, peer: &Hash) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        let cache = state.cache();
        cache
            .records_by_peer
            .get(peer)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| cache.records.get(id))
                    .filter(|r| !r.hidden)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn peers(&self) -> Vec<PeerRegistry> {
        let state = self.state.read().await;
        let mut peers: Vec<PeerRegistry> = state.cache().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub async fn get_peer(&self, id: &Hash) -> Option<PeerRegistry> {
        let state = self.state.read().await;
        state.cache().peers.get(id).cloned()
    }

    pub async fn runs_for_peer(&self, peer: &Hash) -> Vec<SyncRun> {
        let state = self.state.read().await;
        let cache = state.cache();
        let mut runs: Vec<SyncRun> = cache
            .runs_by_peer
            .get(peer)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| cache.sync_runs.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    /// Full (record, latest version) projection, used for index backfill.
    pub async fn all_heads(&self) -> Vec<(AgentRecord, AgentVersion)> {
        let state = self.state.read().await;
        let cache = state.cache();
        cache
            .records
            .values()
            .filter(|r| !r.hidden)
            .filter_map(|r| {
                cache
                    .versions
                    .get(&r.latest_version_id)
                    .map(|v| (r.clone(), v.clone()))
            })
            .collect()
    }
}

/// Newest-updated first, ties broken by id descending.
pub fn sort_records(records: &mut [AgentRecord]) {
    records.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[cfg(test)]
mod tests;
