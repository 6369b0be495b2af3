use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use metrics::gauge;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use areg_common::crypto::Hash;
use areg_common::time::now_millis;

use crate::config::{
    Config, INDEX_QUEUE_DEPTH_PER_SHARD, INDEX_REPAIR_INTERVAL, INDEX_RETRY_ATTEMPTS,
    INDEX_RETRY_BASE, INDEX_RETRY_CAP,
};
use crate::store::{AgentStore, RepairEntry};

use super::{AgentView, DocumentIndex, IndexError, IndexJob, SearchIndex};

const REPAIR_BACKLOG_GAUGE: &str = "index_repair_backlog";

/// Reserved queue capacity for exactly one job. Publish acquires a slot
/// before committing its store transaction; sending through the slot can
/// no longer block, so a saturated queue is detected while rollback is
/// still possible.
pub struct IndexSlot {
    permit: mpsc::OwnedPermit<IndexJob>,
}

impl IndexSlot {
    pub fn send(self, job: IndexJob) {
        self.permit.send(job);
    }
}

/// Sharded write front of the search index. Jobs for one agent always land
/// on the same shard, preserving per-key FIFO ordering.
pub struct IndexWriter {
    shards: Vec<mpsc::Sender<IndexJob>>,
}

impl IndexWriter {
    fn shard_for(&self, agent_id: &Hash) -> usize {
        let bytes = agent_id.as_bytes();
        let mut value = [0u8; 8];
        value.copy_from_slice(&bytes[..8]);
        (u64::from_le_bytes(value) % self.shards.len() as u64) as usize
    }

    /// Reserve capacity for one job, blocking up to `wait`. Saturation
    /// beyond the timeout surfaces as `Saturated`, which publish maps to
    /// `Overloaded`.
    pub async fn reserve(&self, agent_id: &Hash, wait: Duration) -> Result<IndexSlot, IndexError> {
        let sender = self.shards[self.shard_for(agent_id)].clone();
        match timeout(wait, sender.reserve_owned()).await {
            Ok(Ok(permit)) => Ok(IndexSlot { permit }),
            Ok(Err(_)) => Err(IndexError::Closed),
            Err(_) => Err(IndexError::Saturated),
        }
    }
}

/// The search indexer: bounded shard queues, a worker per shard applying
/// jobs with retry and backoff, and the repair reconciler that drains
/// post-commit failures.
pub struct IndexService {
    pub index: Arc<SearchIndex>,
    pub writer: Arc<IndexWriter>,
    handles: Vec<JoinHandle<()>>,
}

impl IndexService {
    /// Build the index service: backfill the projection from the store,
    /// then start the shard workers and the repair reconciler.
    pub async fn start(store: Arc<AgentStore>, _config: &Config) -> Self {
        let index = Arc::new(SearchIndex::new());

        // Backfill before accepting writes so discovery never observes an
        // empty index after a restart.
        for (record, version) in store.all_heads().await {
            let publisher = store
                .publisher(&record.publisher_id)
                .await
                .map(|p| p.display_name)
                .unwrap_or_default();
            let view = AgentView::build(&record, &version, &publisher);
            if let Err(e) = index.apply(&IndexJob::Upsert(Box::new(view))) {
                warn!("index backfill failed for {}: {}", record.id, e);
            }
        }

        let workers = num_cpus::get().clamp(2, 8);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers + 1);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(INDEX_QUEUE_DEPTH_PER_SHARD);
            shards.push(tx);
            handles.push(tokio::spawn(worker_loop(
                rx,
                Arc::clone(&index),
                Arc::clone(&store),
            )));
        }

        handles.push(tokio::spawn(reconciler_loop(
            Arc::clone(&store),
            Arc::clone(&index),
        )));

        Self {
            index,
            writer: Arc::new(IndexWriter { shards }),
            handles,
        }
    }

    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for IndexService {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<IndexJob>,
    index: Arc<SearchIndex>,
    store: Arc<AgentStore>,
) {
    while let Some(job) = rx.recv().await {
        apply_with_retry(&*index, &store, job).await;
    }
}

/// Apply one job with exponential backoff; exhaustion lands the job in the
/// durable repair log for the reconciler.
async fn apply_with_retry(index: &dyn DocumentIndex, store: &AgentStore, job: IndexJob) {
    let mut delay = INDEX_RETRY_BASE;
    let mut last_error = String::new();
    for attempt in 1..=INDEX_RETRY_ATTEMPTS {
        match index.apply(&job) {
            Ok(()) => return,
            Err(e) => {
                last_error = e.to_string();
                if attempt < INDEX_RETRY_ATTEMPTS {
                    sleep(delay).await;
                    delay = (delay * 2).min(INDEX_RETRY_CAP);
                }
            }
        }
    }

    warn!(
        "index apply for {} failed permanently, queued for repair: {}",
        job.agent_id(),
        last_error
    );
    let entry = RepairEntry {
        agent_id: job.agent_id().clone(),
        deleted: matches!(job, IndexJob::Delete(_)),
        attempts: INDEX_RETRY_ATTEMPTS,
        last_error,
        queued_at: now_millis(),
    };
    if let Err(e) = store.push_repair(entry).await {
        warn!("failed to persist repair entry: {}", e);
    }
    gauge!(REPAIR_BACKLOG_GAUGE).set(store.repair_entries().await.len() as f64);
}

/// Retry repair-log entries until they apply. The job is rebuilt from the
/// current store state, so a stale entry converges on the latest version.
async fn reconciler_loop(store: Arc<AgentStore>, index: Arc<SearchIndex>) {
    loop {
        sleep(INDEX_REPAIR_INTERVAL).await;
        let entries = store.repair_entries().await;
        if entries.is_empty() {
            gauge!(REPAIR_BACKLOG_GAUGE).set(0.0);
            continue;
        }
        if log::log_enabled!(log::Level::Debug) {
            debug!("index reconciler retrying {} entries", entries.len());
        }

        for entry in entries {
            let job = match store.get_record(&entry.agent_id).await {
                Some(record) if !record.hidden => {
                    let Some(version) = store.get_version(&record.latest_version_id).await else {
                        continue;
                    };
                    let publisher = store
                        .publisher(&record.publisher_id)
                        .await
                        .map(|p| p.display_name)
                        .unwrap_or_default();
                    IndexJob::Upsert(Box::new(AgentView::build(&record, &version, &publisher)))
                }
                _ => IndexJob::Delete(entry.agent_id.clone()),
            };

            if index.apply(&job).is_ok() {
                if let Err(e) = store.remove_repair(&entry.agent_id).await {
                    warn!("failed to clear repair entry: {}", e);
                }
            }
        }
        gauge!(REPAIR_BACKLOG_GAUGE).set(store.repair_entries().await.len() as f64);
    }
}
