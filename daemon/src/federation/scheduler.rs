use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;

use areg_common::api::PeerStatus;
use areg_common::crypto::Hash;

use crate::config::SYNC_JITTER_RATIO;

use super::sync::run_sync;
use super::SyncDeps;

/// Per-peer scheduler: wake on the jittered interval or a manual trigger,
/// take a global sync permit, run one pass. The loop ends when the peer
/// is deleted or disabled; enabling re-spawns it.
pub(crate) async fn peer_loop(
    deps: Arc<SyncDeps>,
    peer_id: Hash,
    mut trigger: mpsc::Receiver<()>,
) {
    loop {
        let Some(peer) = deps.store.get_peer(&peer_id).await else {
            break;
        };
        if peer.status == PeerStatus::Disabled {
            break;
        }

        let interval = jittered(peer.sync_interval_s);
        tokio::select! {
            _ = sleep(interval) => {}
            received = trigger.recv() => {
                if received.is_none() {
                    break;
                }
                debug!("manual sync trigger for peer {}", peer.name);
            }
        }

        // Re-check state after the wait; the admin may have disabled or
        // deleted the peer in the meantime.
        let Some(peer) = deps.store.get_peer(&peer_id).await else {
            break;
        };
        if peer.status == PeerStatus::Disabled {
            break;
        }

        let Ok(_permit) = deps.semaphore.acquire().await else {
            break;
        };
        run_sync(&deps, &peer_id).await;
    }
}

/// Interval with ±10% jitter so peers sharing an interval spread out.
fn jittered(interval_s: u64) -> Duration {
    let base = interval_s.max(1) as f64;
    let factor = 1.0 + rand::thread_rng().gen_range(-SYNC_JITTER_RATIO..SYNC_JITTER_RATIO);
    Duration::from_secs_f64(base * factor)
}
