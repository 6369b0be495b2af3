use std::collections::HashMap;

use log::{info, warn};
use metrics::counter;
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use areg_common::api::{PeerStatus, SyncOutcome, WellKnownIndex};
use areg_common::crypto::{hash_parts, Hash};
use areg_common::time::now_millis;

use crate::config::SYNC_MAX_INDEX_PAGES;
use crate::fetcher::FetchLimits;
use crate::store::{PeerRegistry, SyncRun};

use super::{delete_from_index, SyncDeps};

#[derive(Debug, Error)]
enum SyncError {
    #[error("failed to fetch peer index: {0}")]
    IndexFetch(String),
    #[error("peer index is malformed: {0}")]
    IndexParse(String),
}

struct RemoteEntry {
    name: String,
    content_hash: Hash,
    card_url: String,
}

/// One pull-sync pass against a peer: read its advertised index, diff
/// against the local federated set, apply the delta, record a Sync Run.
pub(crate) async fn run_sync(deps: &SyncDeps, peer_id: &Hash) -> Option<SyncRun> {
    let peer = deps.store.get_peer(peer_id).await?;
    if peer.status == PeerStatus::Disabled {
        return None;
    }

    let started_at = now_millis();
    info!("sync of peer {} starting", peer.name);

    let mut run = SyncRun {
        id: new_run_id(peer_id),
        peer_id: peer_id.clone(),
        started_at,
        finished_at: None,
        outcome: SyncOutcome::Ok,
        added: 0,
        updated: 0,
        removed: 0,
        error: None,
    };

    let mut applied: Vec<Hash> = Vec::new();
    match sync_inner(deps, &peer, &mut run, &mut applied).await {
        Ok(()) => {}
        Err(e) => {
            run.outcome = SyncOutcome::Error;
            run.error = Some(e.to_string());
        }
    }

    // A peer disabled mid-run keeps nothing but the run row.
    if let Some(current) = deps.store.get_peer(peer_id).await {
        if current.status == PeerStatus::Disabled && run.outcome != SyncOutcome::Error {
            discard_run_results(deps, &applied).await;
            run.outcome = SyncOutcome::Cancelled;
        }
    }

    run.finished_at = Some(now_millis());
    let outcome = run.outcome;
    let error = run.error.clone();

    if let Err(e) = deps.store.record_sync_run(run.clone()).await {
        warn!("failed to persist sync run for {}: {}", peer.name, e);
    }
    let finished = run.finished_at;
    let update_result = deps
        .store
        .update_peer(peer_id, |p| {
            if p.status != PeerStatus::Disabled {
                p.last_sync_at = finished;
                match outcome {
                    SyncOutcome::Error => {
                        p.status = PeerStatus::Error;
                        p.last_error = error.clone();
                    }
                    _ => {
                        p.status = PeerStatus::Active;
                        p.last_error = None;
                    }
                }
            }
        })
        .await;
    if let Err(e) = update_result {
        warn!("failed to update peer {} after sync: {}", peer.name, e);
    }

    counter!("federation_sync_total", "outcome" => outcome_label(outcome)).increment(1);
    info!(
        "sync of peer {} finished: {:?} (+{} ~{} -{})",
        peer.name, outcome, run.added, run.updated, run.removed
    );
    Some(run)
}

async fn sync_inner(
    deps: &SyncDeps,
    peer: &PeerRegistry,
    run: &mut SyncRun,
    applied: &mut Vec<Hash>,
) -> Result<(), SyncError> {
    let remote = fetch_remote_index(deps, peer).await?;

    // Local federated set for this peer, keyed like the remote entries.
    let mut local: HashMap<String, (Hash, Hash)> = HashMap::new();
    for record in deps.store.federated_records(&peer.id).await {
        if let Some(version) = deps.store.get_version(&record.latest_version_id).await {
            local.insert(record.name.clone(), (record.id.clone(), version.content_hash));
        }
    }

    let mut item_errors: Vec<String> = Vec::new();
    let mut cancelled = false;

    for entry in remote.values() {
        if peer_disabled(deps, &peer.id).await {
            cancelled = true;
            break;
        }
        let known = local.get(&entry.name);
        if let Some((_, local_hash)) = known {
            if *local_hash == entry.content_hash {
                continue;
            }
        }

        match apply_remote_entry(deps, peer, entry).await {
            Ok(record_id) => {
                applied.push(record_id);
                if known.is_some() {
                    run.updated += 1;
                } else {
                    run.added += 1;
                }
            }
            Err(e) => {
                warn!(
                    "sync of peer {}: card '{}' rejected: {}",
                    peer.name, entry.name, e
                );
                item_errors.push(format!("{}: {e}", entry.name));
            }
        }
    }

    // Retractions: everything local the peer no longer advertises.
    if !cancelled {
        for (name, (record_id, _)) in &local {
            if remote.contains_key(name) {
                continue;
            }
            if peer_disabled(deps, &peer.id).await {
                break;
            }
            match deps.store.hide_record(record_id).await {
                Ok(_) => {
                    delete_from_index(deps, record_id).await;
                    run.removed += 1;
                }
                Err(e) => item_errors.push(format!("{name}: {e}")),
            }
        }
    }

    if run.removed > 0 {
        deps.cache.invalidate_tenant(&deps.config.admin_tenant);
    }

    if !item_errors.is_empty() {
        run.outcome = SyncOutcome::Partial;
        run.error = Some(item_errors.join("; "));
    }
    Ok(())
}

/// Page through the peer's well-known index until exhausted or the page
/// budget runs out.
async fn fetch_remote_index(
    deps: &SyncDeps,
    peer: &PeerRegistry,
) -> Result<HashMap<String, RemoteEntry>, SyncError> {
    let limits = FetchLimits::peer_sync();
    let mut entries = HashMap::new();
    let mut cursor: Option<String> = None;

    for _ in 0..SYNC_MAX_INDEX_PAGES {
        let mut url = Url::parse(&format!(
            "{}/.well-known/agents/index.json",
            peer.base_url
        ))
        .map_err(|e| SyncError::IndexFetch(e.to_string()))?;
        if let Some(cursor) = &cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }

        let raw = deps
            .fetcher
            .fetch_json(&url, peer.auth_token.as_deref(), &limits)
            .await
            .map_err(|e| SyncError::IndexFetch(e.to_string()))?;
        let page: WellKnownIndex =
            serde_json::from_value(raw).map_err(|e| SyncError::IndexParse(e.to_string()))?;

        for entry in page.agents {
            entries.insert(
                entry.name.clone(),
                RemoteEntry {
                    name: entry.name,
                    content_hash: entry.content_hash,
                    card_url: entry.card_url,
                },
            );
        }

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(entries),
        }
    }
    Ok(entries)
}

async fn apply_remote_entry(
    deps: &SyncDeps,
    peer: &PeerRegistry,
    entry: &RemoteEntry,
) -> Result<Hash, String> {
    let url = Url::parse(&entry.card_url).map_err(|e| e.to_string())?;
    let raw: Value = deps
        .fetcher
        .fetch_json(&url, peer.auth_token.as_deref(), &FetchLimits::peer_sync())
        .await
        .map_err(|e| e.to_string())?;

    // The advertised name is the diff key; a card that disagrees would
    // corrupt the federated set.
    let card_name = raw.get("name").and_then(Value::as_str).unwrap_or_default();
    if card_name != entry.name {
        return Err(format!(
            "index advertises '{}' but card is named '{card_name}'",
            entry.name
        ));
    }

    deps.publish
        .apply_federated(peer, &raw)
        .await
        .map(|outcome| outcome.record.id)
        .map_err(|e| e.to_string())
}

/// Discard what this run applied: hide the records it touched and drop
/// them from the index. Only the Sync Run row survives.
async fn discard_run_results(deps: &SyncDeps, applied: &[Hash]) {
    for record_id in applied {
        if deps.store.hide_record(record_id).await.is_ok() {
            delete_from_index(deps, record_id).await;
        }
    }
    deps.cache.invalidate_tenant(&deps.config.admin_tenant);
}

async fn peer_disabled(deps: &SyncDeps, peer_id: &Hash) -> bool {
    deps.store
        .get_peer(peer_id)
        .await
        .map(|p| p.status == PeerStatus::Disabled)
        .unwrap_or(true)
}

fn new_run_id(peer_id: &Hash) -> Hash {
    let mut nonce = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut nonce);
    hash_parts(&[
        b"syncrun",
        peer_id.as_bytes(),
        &now_millis().to_le_bytes(),
        &nonce,
    ])
}

fn outcome_label(outcome: SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Ok => "ok",
        SyncOutcome::Partial => "partial",
        SyncOutcome::Error => "error",
        SyncOutcome::Cancelled => "cancelled",
    }
}
