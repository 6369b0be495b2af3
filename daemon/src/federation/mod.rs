use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use url::Url;

use areg_common::api::{CreatePeerRequest, PeerStatus, PeerSummary, UpdatePeerRequest};
use areg_common::crypto::Hash;
use areg_common::error::ApiError;
use areg_common::time::now_millis;

use crate::cache::ResponseCache;
use crate::config::{Config, DEFAULT_SYNC_INTERVAL_SECS};
use crate::fetcher::HttpFetcher;
use crate::index::IndexWriter;
use crate::publish::{map_store_error, PublishService};
use crate::store::{AgentStore, PeerRegistry, RepairEntry};

mod scheduler;
mod sync;

use sync::run_sync;

struct PeerHandle {
    trigger: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Shared dependencies of the sync machinery.
pub(crate) struct SyncDeps {
    pub store: Arc<AgentStore>,
    pub publish: Arc<PublishService>,
    pub writer: Arc<IndexWriter>,
    pub cache: Arc<ResponseCache>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub config: Arc<Config>,
    /// Global cap on concurrent peer syncs.
    pub semaphore: Arc<Semaphore>,
}

/// Tracks peer registries and owns their sync schedules: one ticker per
/// active peer with jitter, manual triggers collapsed to one queued run,
/// and a global semaphore bounding parallel syncs.
pub struct FederationManager {
    deps: Arc<SyncDeps>,
    peers: Mutex<HashMap<Hash, PeerHandle>>,
    enabled: bool,
}

impl FederationManager {
    pub fn new(
        store: Arc<AgentStore>,
        publish: Arc<PublishService>,
        writer: Arc<IndexWriter>,
        cache: Arc<ResponseCache>,
        fetcher: Arc<dyn HttpFetcher>,
        config: Arc<Config>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.peer_sync_max_parallel.max(1)));
        let enabled = config.enable_federation;
        Self {
            deps: Arc::new(SyncDeps {
                store,
                publish,
                writer,
                cache,
                fetcher,
                config,
                semaphore,
            }),
            peers: Mutex::new(HashMap::new()),
            enabled,
        }
    }

    /// Spawn schedulers for every active peer already in the store.
    pub async fn start(&self) {
        if !self.enabled {
            info!("federation is disabled");
            return;
        }
        let peers = self.deps.store.peers().await;
        for peer in peers {
            if peer.status != PeerStatus::Disabled {
                self.spawn_peer(&peer).await;
            }
        }
    }

    pub async fn stop(&self) {
        let mut peers = self.peers.lock().await;
        for (_, handle) in peers.drain() {
            handle.task.abort();
        }
    }

    async fn spawn_peer(&self, peer: &PeerRegistry) {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&peer.id) {
            return;
        }
        // Capacity 1: one manual trigger may queue behind a running sync,
        // further triggers collapse into it.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let task = tokio::spawn(scheduler::peer_loop(
            Arc::clone(&self.deps),
            peer.id.clone(),
            trigger_rx,
        ));
        peers.insert(
            peer.id.clone(),
            PeerHandle {
                trigger: trigger_tx,
                task,
            },
        );
    }

    async fn despawn_peer(&self, id: &Hash) {
        let mut peers = self.peers.lock().await;
        if let Some(handle) = peers.remove(id) {
            handle.task.abort();
        }
    }

    pub async fn create_peer(&self, request: CreatePeerRequest) -> Result<PeerSummary, ApiError> {
        let url = Url::parse(&request.base_url)
            .ok()
            .filter(|u| u.scheme() == "http" || u.scheme() == "https")
            .ok_or_else(|| {
                ApiError::BadRequest("baseUrl must be an absolute http(s) URL".to_string())
            })?;
        if request.name.trim().is_empty() {
            return Err(ApiError::BadRequest("peer name must not be empty".to_string()));
        }

        let peer = self
            .deps
            .store
            .create_peer(
                request.name.trim(),
                url.as_str(),
                request.auth_token,
                request.sync_interval_s.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
            )
            .await
            .map_err(|e| match e {
                crate::store::StoreError::PeerAlreadyExists => {
                    ApiError::BadRequest("a peer with this name already exists".to_string())
                }
                other => map_store_error(other),
            })?;

        if self.enabled {
            self.spawn_peer(&peer).await;
        }
        info!("peer {} registered ({})", peer.name, peer.base_url);
        Ok(to_summary(&peer))
    }

    pub async fn update_peer(
        &self,
        id: &Hash,
        request: UpdatePeerRequest,
    ) -> Result<PeerSummary, ApiError> {
        if let Some(base_url) = &request.base_url {
            Url::parse(base_url)
                .ok()
                .filter(|u| u.scheme() == "http" || u.scheme() == "https")
                .ok_or_else(|| {
                    ApiError::BadRequest("baseUrl must be an absolute http(s) URL".to_string())
                })?;
        }

        let peer = self
            .deps
            .store
            .update_peer(id, |peer| {
                if let Some(base_url) = request.base_url {
                    peer.base_url = base_url;
                }
                if let Some(token) = request.auth_token {
                    peer.auth_token = Some(token);
                }
                if let Some(interval) = request.sync_interval_s {
                    peer.sync_interval_s = interval;
                }
                if let Some(status) = request.status {
                    peer.status = status;
                    if status == PeerStatus::Active {
                        peer.last_error = None;
                    }
                }
            })
            .await
            .map_err(map_store_error)?;

        match peer.status {
            PeerStatus::Disabled => self.despawn_peer(id).await,
            _ => {
                if self.enabled {
                    self.spawn_peer(&peer).await;
                }
            }
        }
        Ok(to_summary(&peer))
    }

    /// Delete a peer and drop its federated entries from discovery.
    pub async fn delete_peer(&self, id: &Hash) -> Result<(), ApiError> {
        self.despawn_peer(id).await;
        let hidden = self
            .deps
            .store
            .remove_peer(id)
            .await
            .map_err(map_store_error)?;
        for agent_id in &hidden {
            delete_from_index(&self.deps, agent_id).await;
        }
        self.deps
            .cache
            .invalidate_tenant(&self.deps.config.admin_tenant);
        info!("peer {} removed, {} federated agents hidden", id, hidden.len());
        Ok(())
    }

    /// Queue an immediate sync. Returns once the run is queued, not once
    /// it finishes; concurrent triggers collapse.
    pub async fn trigger_sync(&self, id: &Hash) -> Result<(), ApiError> {
        let peer = self.deps.store.get_peer(id).await.ok_or(ApiError::NotFound)?;
        if peer.status == PeerStatus::Disabled {
            return Err(ApiError::BadRequest("peer is disabled".to_string()));
        }
        if !self.enabled {
            return Err(ApiError::BadRequest(
                "federation is disabled on this instance".to_string(),
            ));
        }
        // Make sure a scheduler exists (the peer may have entered error
        // state and been reset by an update).
        self.spawn_peer(&peer).await;

        let peers = self.peers.lock().await;
        if let Some(handle) = peers.get(id) {
            // A full channel means a run is already queued; that run will
            // observe the latest peer state, so collapsing is safe.
            let _ = handle.trigger.try_send(());
        }
        Ok(())
    }

    /// Run one sync pass inline, bounded by the global sync semaphore.
    /// The scheduler uses the same path; this one is for admin tooling
    /// and tests that need the run's outcome.
    pub async fn sync_now(&self, id: &Hash) -> Result<Option<crate::store::SyncRun>, ApiError> {
        let _permit = self
            .deps
            .semaphore
            .acquire()
            .await
            .map_err(|_| ApiError::Internal("sync semaphore closed".to_string()))?;
        Ok(run_sync(&self.deps, id).await)
    }

    pub async fn list_peers(&self) -> Vec<PeerSummary> {
        self.deps
            .store
            .peers()
            .await
            .iter()
            .map(to_summary)
            .collect()
    }

    pub async fn get_peer(&self, id: &Hash) -> Result<PeerSummary, ApiError> {
        self.deps
            .store
            .get_peer(id)
            .await
            .map(|peer| to_summary(&peer))
            .ok_or(ApiError::NotFound)
    }
}

/// Route an index delete through the writer to keep per-key ordering; if
/// the queue is saturated the delete lands in the repair log instead.
pub(crate) async fn delete_from_index(deps: &SyncDeps, agent_id: &Hash) {
    match deps
        .writer
        .reserve(agent_id, Duration::from_secs(1))
        .await
    {
        Ok(slot) => slot.send(crate::index::IndexJob::Delete(agent_id.clone())),
        Err(e) => {
            warn!("index delete for {} deferred to repair log: {}", agent_id, e);
            let entry = RepairEntry {
                agent_id: agent_id.clone(),
                deleted: true,
                attempts: 0,
                last_error: e.to_string(),
                queued_at: now_millis(),
            };
            if let Err(e) = deps.store.push_repair(entry).await {
                warn!("failed to queue repair delete: {}", e);
            }
        }
    }
}

fn to_summary(peer: &PeerRegistry) -> PeerSummary {
    PeerSummary {
        id: peer.id.clone(),
        name: peer.name.clone(),
        base_url: peer.base_url.clone(),
        sync_interval_s: peer.sync_interval_s,
        status: peer.status,
        last_sync_at: peer.last_sync_at,
        last_error: peer.last_error.clone(),
    }
}
