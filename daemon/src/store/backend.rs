use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use areg_common::crypto::Hash;

use super::snapshot::StoreSnapshot;
use super::{
    AgentRecord, AgentVersion, Entitlement, PeerRegistry, Publisher, RepairEntry, StoreCache,
    StoreError, SyncRun, Tenant,
};

const TENANT_PREFIX: &[u8] = b"tenant:";
const PUBLISHER_PREFIX: &[u8] = b"publisher:";
const RECORD_PREFIX: &[u8] = b"record:";
const VERSION_PREFIX: &[u8] = b"version:";
const ENTITLEMENT_PREFIX: &[u8] = b"entitlement:";
const PEER_PREFIX: &[u8] = b"peer:";
const RUN_PREFIX: &[u8] = b"syncrun:";
const REPAIR_PREFIX: &[u8] = b"repair:";

/// Store backend: the live cache plus the optional sled database. All
/// mutations require an active snapshot; the snapshot's dirty sets drive
/// the batched disk write on commit.
pub struct StoreState {
    db: Option<sled::Db>,
    cache: StoreCache,
    snapshot: Option<StoreSnapshot>,
    #[cfg(test)]
    fail_commit: bool,
}

impl StoreState {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Storage(e.to_string()))?;
        let cache = Self::load_cache(&db)?;
        Ok(Self {
            db: Some(db),
            cache,
            snapshot: None,
            #[cfg(test)]
            fail_commit: false,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            db: None,
            cache: StoreCache::new(),
            snapshot: None,
            #[cfg(test)]
            fail_commit: false,
        }
    }

    pub fn cache(&self) -> &StoreCache {
        self.snapshot
            .as_ref()
            .map(|snapshot| &snapshot.cache)
            .unwrap_or(&self.cache)
    }

    fn cache_mut(&mut self) -> &mut StoreCache {
        self.snapshot
            .as_mut()
            .map(|snapshot| &mut snapshot.cache)
            .unwrap_or(&mut self.cache)
    }

    fn snapshot_mut(&mut self) -> Result<&mut StoreSnapshot, StoreError> {
        self.snapshot.as_mut().ok_or(StoreError::SnapshotNotActive)
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn start_snapshot(&mut self) -> Result<(), StoreError> {
        if self.snapshot.is_some() {
            return Err(StoreError::SnapshotAlreadyActive);
        }
        self.snapshot = Some(StoreSnapshot::new(self.cache.clone_mut()));
        Ok(())
    }

    pub fn end_snapshot(&mut self, apply: bool) -> Result<(), StoreError> {
        if self.snapshot.is_none() {
            return Err(StoreError::SnapshotNotActive);
        }

        if apply {
            self.apply_snapshot_to_disk()?;
            if let Some(snapshot) = self.snapshot.take() {
                self.cache = snapshot.cache;
            }
        } else {
            self.snapshot.take();
        }

        Ok(())
    }

    pub fn put_tenant(&mut self, tenant: Tenant) -> Result<(), StoreError> {
        self.snapshot_mut()?.dirty_tenants.insert(tenant.id.clone());
        self.cache_mut().put_tenant(tenant);
        Ok(())
    }

    pub fn put_publisher(&mut self, publisher: Publisher) -> Result<(), StoreError> {
        self.snapshot_mut()?
            .dirty_publishers
            .insert(publisher.id.clone());
        self.cache_mut().put_publisher(publisher);
        Ok(())
    }

    pub fn put_record(&mut self, record: AgentRecord) -> Result<(), StoreError> {
        self.snapshot_mut()?.dirty_records.insert(record.id.clone());
        self.cache_mut().put_record(record);
        Ok(())
    }

    pub fn put_version(&mut self, version: AgentVersion) -> Result<(), StoreError> {
        self.snapshot_mut()?.dirty_versions.insert(version.id.clone());
        self.cache_mut().put_version(version);
        Ok(())
    }

    pub fn put_entitlement(&mut self, entitlement: Entitlement) -> Result<(), StoreError> {
        self.snapshot_mut()?
            .dirty_entitlements
            .insert(entitlement.id.clone());
        self.cache_mut().put_entitlement(entitlement);
        Ok(())
    }

    pub fn put_peer(&mut self, peer: PeerRegistry) -> Result<(), StoreError> {
        let snapshot = self.snapshot_mut()?;
        snapshot.deleted_peers.remove(&peer.id);
        snapshot.dirty_peers.insert(peer.id.clone());
        self.cache_mut().put_peer(peer);
        Ok(())
    }

    pub fn delete_peer(&mut self, id: &Hash) -> Result<(), StoreError> {
        let snapshot = self.snapshot_mut()?;
        snapshot.dirty_peers.remove(id);
        snapshot.deleted_peers.insert(id.clone());
        self.cache_mut().remove_peer(id);
        Ok(())
    }

    pub fn push_sync_run(&mut self, run: SyncRun, keep: usize) -> Result<(), StoreError> {
        let run_id = run.id.clone();
        // Mutate the cache first so the dropped history ids are known.
        let dropped = {
            let snapshot = self.snapshot.as_mut().ok_or(StoreError::SnapshotNotActive)?;
            snapshot.cache.push_sync_run(run, keep)
        };
        let snapshot = self.snapshot_mut()?;
        snapshot.dirty_runs.insert(run_id);
        for old in dropped {
            snapshot.dirty_runs.remove(&old);
            snapshot.deleted_runs.insert(old);
        }
        Ok(())
    }

    pub fn put_repair(&mut self, entry: RepairEntry) -> Result<(), StoreError> {
        let snapshot = self.snapshot_mut()?;
        snapshot.deleted_repair.remove(&entry.agent_id);
        snapshot.dirty_repair.insert(entry.agent_id.clone());
        self.cache_mut().put_repair(entry);
        Ok(())
    }

    pub fn delete_repair(&mut self, agent_id: &Hash) -> Result<(), StoreError> {
        let snapshot = self.snapshot_mut()?;
        snapshot.dirty_repair.remove(agent_id);
        snapshot.deleted_repair.insert(agent_id.clone());
        self.cache_mut().remove_repair(agent_id);
        Ok(())
    }

    fn apply_snapshot_to_disk(&mut self) -> Result<(), StoreError> {
        #[cfg(test)]
        if self.fail_commit {
            return Err(StoreError::Storage("forced commit failure".to_string()));
        }

        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or(StoreError::SnapshotNotActive)?;
        if !snapshot.has_pending_writes() {
            return Ok(());
        }

        let batch = build_batch(snapshot)?;
        db.apply_batch(batch)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        db.flush().map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    fn load_cache(db: &sled::Db) -> Result<StoreCache, StoreError> {
        let mut cache = StoreCache::new();
        let mut runs: Vec<SyncRun> = Vec::new();

        for item in db.iter() {
            let (key, value) = item.map_err(|e| StoreError::Storage(e.to_string()))?;
            if key.starts_with(TENANT_PREFIX) {
                cache.put_tenant(from_json::<Tenant>(&value)?);
            } else if key.starts_with(PUBLISHER_PREFIX) {
                cache.put_publisher(from_json::<Publisher>(&value)?);
            } else if key.starts_with(RECORD_PREFIX) {
                cache.put_record(from_json::<AgentRecord>(&value)?);
            } else if key.starts_with(VERSION_PREFIX) {
                cache.put_version(from_json::<AgentVersion>(&value)?);
            } else if key.starts_with(ENTITLEMENT_PREFIX) {
                cache.put_entitlement(from_json::<Entitlement>(&value)?);
            } else if key.starts_with(PEER_PREFIX) {
                cache.put_peer(from_json::<PeerRegistry>(&value)?);
            } else if key.starts_with(RUN_PREFIX) {
                runs.push(from_json::<SyncRun>(&value)?);
            } else if key.starts_with(REPAIR_PREFIX) {
                cache.put_repair(from_json::<RepairEntry>(&value)?);
            }
        }

        // Replay runs in start order so the per-peer history stays sorted
        runs.sort_by_key(|run| run.started_at);
        for run in runs {
            cache.push_sync_run(run, usize::MAX);
        }

        Ok(cache)
    }

    #[cfg(test)]
    pub fn set_fail_commit(&mut self, fail: bool) {
        self.fail_commit = fail;
    }
}

fn build_batch(snapshot: &StoreSnapshot) -> Result<sled::Batch, StoreError> {
    let mut batch = sled::Batch::default();
    let cache = &snapshot.cache;

    for id in &snapshot.dirty_tenants {
        if let Some(tenant) = cache.tenants.get(id) {
            batch.insert(string_key(TENANT_PREFIX, id), to_json(tenant)?);
        }
    }
    for id in &snapshot.dirty_publishers {
        if let Some(publisher) = cache.publishers.get(id) {
            batch.insert(hash_key(PUBLISHER_PREFIX, id), to_json(publisher)?);
        }
    }
    for id in &snapshot.dirty_records {
        if let Some(record) = cache.records.get(id) {
            batch.insert(hash_key(RECORD_PREFIX, id), to_json(record)?);
        }
    }
    for id in &snapshot.dirty_versions {
        if let Some(version) = cache.versions.get(id) {
            batch.insert(hash_key(VERSION_PREFIX, id), to_json(version)?);
        }
    }
    for id in &snapshot.dirty_entitlements {
        if let Some(entitlement) = cache.entitlements.get(id) {
            batch.insert(hash_key(ENTITLEMENT_PREFIX, id), to_json(entitlement)?);
        }
    }
    for id in &snapshot.dirty_peers {
        if let Some(peer) = cache.peers.get(id) {
            batch.insert(hash_key(PEER_PREFIX, id), to_json(peer)?);
        }
    }
    for id in &snapshot.deleted_peers {
        batch.remove(hash_key(PEER_PREFIX, id));
    }
    for id in &snapshot.dirty_runs {
        if let Some(run) = cache.sync_runs.get(id) {
            batch.insert(hash_key(RUN_PREFIX, id), to_json(run)?);
        }
    }
    for id in &snapshot.deleted_runs {
        batch.remove(hash_key(RUN_PREFIX, id));
    }
    for id in &snapshot.dirty_repair {
        if let Some(entry) = cache.repair.get(id) {
            batch.insert(hash_key(REPAIR_PREFIX, id), to_json(entry)?);
        }
    }
    for id in &snapshot.deleted_repair {
        batch.remove(hash_key(REPAIR_PREFIX, id));
    }

    Ok(batch)
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|_| StoreError::Serialize)
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|_| StoreError::Serialize)
}

fn hash_key(prefix: &[u8], id: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 32);
    key.extend_from_slice(prefix);
    key.extend_from_slice(id.as_bytes());
    key
}

fn string_key(prefix: &[u8], id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + id.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(id.as_bytes());
    key
}
