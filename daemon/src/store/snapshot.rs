use std::collections::HashSet;

use areg_common::crypto::Hash;

use super::{StoreCache, StoreError, StoreState};

/// Buffered view of a write transaction: mutations land in the cloned
/// cache and the dirty sets, and only reach the backend on commit.
#[derive(Debug)]
pub struct StoreSnapshot {
    pub cache: StoreCache,
    pub dirty_tenants: HashSet<String>,
    pub dirty_publishers: HashSet<Hash>,
    pub dirty_records: HashSet<Hash>,
    pub dirty_versions: HashSet<Hash>,
    pub dirty_entitlements: HashSet<Hash>,
    pub dirty_peers: HashSet<Hash>,
    pub deleted_peers: HashSet<Hash>,
    pub dirty_runs: HashSet<Hash>,
    pub deleted_runs: HashSet<Hash>,
    pub dirty_repair: HashSet<Hash>,
    pub deleted_repair: HashSet<Hash>,
}

impl StoreSnapshot {
    pub fn new(cache: StoreCache) -> Self {
        Self {
            cache,
            dirty_tenants: HashSet::new(),
            dirty_publishers: HashSet::new(),
            dirty_records: HashSet::new(),
            dirty_versions: HashSet::new(),
            dirty_entitlements: HashSet::new(),
            dirty_peers: HashSet::new(),
            deleted_peers: HashSet::new(),
            dirty_runs: HashSet::new(),
            deleted_runs: HashSet::new(),
            dirty_repair: HashSet::new(),
            deleted_repair: HashSet::new(),
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.dirty_tenants.is_empty()
            || !self.dirty_publishers.is_empty()
            || !self.dirty_records.is_empty()
            || !self.dirty_versions.is_empty()
            || !self.dirty_entitlements.is_empty()
            || !self.dirty_peers.is_empty()
            || !self.deleted_peers.is_empty()
            || !self.dirty_runs.is_empty()
            || !self.deleted_runs.is_empty()
            || !self.dirty_repair.is_empty()
            || !self.deleted_repair.is_empty()
    }
}

pub struct SnapshotGuard<'a> {
    store: &'a mut StoreState,
    committed: bool,
}

impl<'a> SnapshotGuard<'a> {
    pub fn new(store: &'a mut StoreState) -> Result<Self, StoreError> {
        store.start_snapshot()?;
        Ok(Self {
            store,
            committed: false,
        })
    }

    pub fn store_mut(&mut self) -> &mut StoreState {
        self.store
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        // On failure the snapshot stays active so the caller may retry;
        // Drop cleans up if it never succeeds.
        self.store.end_snapshot(true)?;
        self.committed = true;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), StoreError> {
        if self.committed {
            return Ok(());
        }
        self.store.end_snapshot(false)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        if !self.committed && self.store.has_snapshot() {
            let _ = self.store.end_snapshot(false);
        }
    }
}
