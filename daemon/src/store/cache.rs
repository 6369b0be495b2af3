use std::collections::{HashMap, HashSet};

use areg_common::crypto::Hash;

use super::{
    AgentRecord, AgentVersion, Entitlement, PeerRegistry, Publisher, RepairEntry, SyncRun, Tenant,
};

/// In-memory projection of every table plus the secondary indexes the
/// services query. Rebuilt from the backend at startup; cloned wholesale
/// when a snapshot begins.
#[derive(Debug, Clone, Default)]
pub struct StoreCache {
    pub tenants: HashMap<String, Tenant>,
    pub publishers: HashMap<Hash, Publisher>,
    pub publisher_by_name: HashMap<(String, String), Hash>,
    pub records: HashMap<Hash, AgentRecord>,
    pub records_by_publisher: HashMap<Hash, HashSet<Hash>>,
    pub records_by_peer: HashMap<Hash, HashSet<Hash>>,
    pub versions: HashMap<Hash, AgentVersion>,
    pub versions_by_agent: HashMap<Hash, Vec<Hash>>,
    pub version_by_content: HashMap<(Hash, Hash), Hash>,
    pub entitlements: HashMap<Hash, Entitlement>,
    pub entitlements_by_agent: HashMap<Hash, HashSet<Hash>>,
    pub peers: HashMap<Hash, PeerRegistry>,
    pub peer_by_name: HashMap<String, Hash>,
    pub sync_runs: HashMap<Hash, SyncRun>,
    pub runs_by_peer: HashMap<Hash, Vec<Hash>>,
    pub repair: HashMap<Hash, RepairEntry>,
}

impl StoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clone_mut(&self) -> Self {
        self.clone()
    }

    pub fn put_tenant(&mut self, tenant: Tenant) {
        self.tenants.insert(tenant.id.clone(), tenant);
    }

    pub fn put_publisher(&mut self, publisher: Publisher) {
        self.publisher_by_name.insert(
            (publisher.tenant.clone(), publisher.display_name.clone()),
            publisher.id.clone(),
        );
        self.publishers.insert(publisher.id.clone(), publisher);
    }

    pub fn put_record(&mut self, record: AgentRecord) {
        self.records_by_publisher
            .entry(record.publisher_id.clone())
            .or_default()
            .insert(record.id.clone());
        if let Some(peer) = &record.federated_from {
            self.records_by_peer
                .entry(peer.clone())
                .or_default()
                .insert(record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
    }

    pub fn put_version(&mut self, version: AgentVersion) {
        let by_agent = self.versions_by_agent.entry(version.agent_id.clone()).or_default();
        if !by_agent.contains(&version.id) {
            by_agent.push(version.id.clone());
        }
        self.version_by_content.insert(
            (version.agent_id.clone(), version.content_hash.clone()),
            version.id.clone(),
        );
        self.versions.insert(version.id.clone(), version);
    }

    pub fn put_entitlement(&mut self, entitlement: Entitlement) {
        self.entitlements_by_agent
            .entry(entitlement.agent_id.clone())
            .or_default()
            .insert(entitlement.id.clone());
        self.entitlements
            .insert(entitlement.id.clone(), entitlement);
    }

    pub fn put_peer(&mut self, peer: PeerRegistry) {
        self.peer_by_name.insert(peer.name.clone(), peer.id.clone());
        self.peers.insert(peer.id.clone(), peer);
    }

    pub fn remove_peer(&mut self, id: &Hash) -> Option<PeerRegistry> {
        let peer = self.peers.remove(id)?;
        self.peer_by_name.remove(&peer.name);
        Some(peer)
    }

    /// Append a sync run, trimming the per-peer history to `keep` entries.
    /// Returns the ids of runs dropped from the history.
    pub fn push_sync_run(&mut self, run: SyncRun, keep: usize) -> Vec<Hash> {
        let by_peer = self.runs_by_peer.entry(run.peer_id.clone()).or_default();
        by_peer.retain(|id| id != &run.id);
        by_peer.push(run.id.clone());
        let mut dropped = Vec::new();
        while by_peer.len() > keep {
            let old = by_peer.remove(0);
            self.sync_runs.remove(&old);
            dropped.push(old);
        }
        self.sync_runs.insert(run.id.clone(), run);
        dropped
    }

    pub fn put_repair(&mut self, entry: RepairEntry) {
        self.repair.insert(entry.agent_id.clone(), entry);
    }

    pub fn remove_repair(&mut self, agent_id: &Hash) -> Option<RepairEntry> {
        self.repair.remove(agent_id)
    }
}
