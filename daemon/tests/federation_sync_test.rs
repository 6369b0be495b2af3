// Federation pull-sync: diff against the peer's advertised index, apply
// the delta, retract what disappeared.

mod common;

use serde_json::{json, Value};

use areg_common::api::{CreatePeerRequest, PeerStatus, SyncOutcome, UpdatePeerRequest};
use areg_common::card::{canonical_bytes, content_hash};
use areg_common::crypto::hash;

use common::{registry, sample_card, settle, TestRegistry};

const PEER_BASE: &str = "http://peer-p.test";

fn index_entry(name: &str, card: &Value) -> Value {
    let digest = content_hash(&canonical_bytes(card));
    json!({
        "id": hash(name.as_bytes()),
        "publisher": "pub-1",
        "name": name,
        "contentHash": digest,
        "cardUrl": format!("{PEER_BASE}/agents/{name}/card"),
        "updatedAt": 1_700_000_000_000u64,
    })
}

/// Publish the peer's advertised state into the fake fetcher.
fn advertise(reg: &TestRegistry, cards: &[(&str, &Value)]) {
    let entries: Vec<Value> = cards
        .iter()
        .map(|(name, card)| index_entry(name, card))
        .collect();
    reg.fetcher.put(
        &format!("{PEER_BASE}/.well-known/agents/index.json"),
        json!({
            "registry": {"name": "P", "version": "0.1.0", "baseUrl": PEER_BASE},
            "agents": entries,
        }),
    );
    for (name, card) in cards {
        reg.fetcher
            .put(&format!("{PEER_BASE}/agents/{name}/card"), (*card).clone());
    }
}

async fn create_peer(reg: &TestRegistry) -> areg_common::crypto::Hash {
    let peer = reg
        .federation
        .create_peer(CreatePeerRequest {
            name: "P".to_string(),
            base_url: PEER_BASE.to_string(),
            auth_token: Some("peer-token".to_string()),
            sync_interval_s: Some(3600),
        })
        .await
        .expect("create peer");
    peer.id
}

#[tokio::test]
async fn sync_mirrors_the_advertised_set() {
    let reg = registry().await;
    let card_a = sample_card("agent-a", "1.0.0");
    let card_b = sample_card("agent-b", "1.0.0");
    advertise(&reg, &[("agent-a", &card_a), ("agent-b", &card_b)]);

    let peer_id = create_peer(&reg).await;
    let run = reg
        .federation
        .sync_now(&peer_id)
        .await
        .expect("sync")
        .expect("run recorded");

    assert_eq!(run.outcome, SyncOutcome::Ok);
    assert_eq!(run.added, 2);
    assert_eq!(run.removed, 0);

    let federated = reg.store.federated_records(&peer_id).await;
    assert_eq!(federated.len(), 2);
    for record in &federated {
        assert!(record.public);
        assert_eq!(record.federated_from.as_ref(), Some(&peer_id));
        let publisher = reg
            .store
            .publisher(&record.publisher_id)
            .await
            .expect("publisher");
        assert_eq!(publisher.display_name, "peer:P");
    }

    // Federated agents surface in public discovery
    settle().await;
    let page: areg_common::api::AgentPage = serde_json::from_value(
        reg.discovery
            .list_public(Default::default())
            .await
            .expect("list"),
    )
    .expect("page");
    assert_eq!(page.items.len(), 2);
}

#[tokio::test]
async fn retraction_shrinks_the_federated_set() {
    let reg = registry().await;
    let card_a = sample_card("agent-a", "1.0.0");
    let card_b = sample_card("agent-b", "1.0.0");
    advertise(&reg, &[("agent-a", &card_a), ("agent-b", &card_b)]);

    let peer_id = create_peer(&reg).await;
    reg.federation.sync_now(&peer_id).await.expect("first sync");

    // The peer stops advertising agent-b
    advertise(&reg, &[("agent-a", &card_a)]);
    let run = reg
        .federation
        .sync_now(&peer_id)
        .await
        .expect("second sync")
        .expect("run");

    assert_eq!(run.outcome, SyncOutcome::Ok);
    assert_eq!(run.removed, 1);
    let federated = reg.store.federated_records(&peer_id).await;
    assert_eq!(federated.len(), 1);
    assert_eq!(federated[0].name, "agent-a");

    // The retracted record is gone from discovery
    let hidden = reg
        .store
        .get_by_name("system", "peer:P", "agent-b")
        .await
        .expect("record still stored");
    assert!(hidden.hidden);
    assert!(matches!(
        reg.discovery
            .get_agent(&hidden.id.to_string(), None)
            .await,
        Err(areg_common::error::ApiError::NotFound)
    ));

    // Re-advertising brings it back without a new version
    advertise(&reg, &[("agent-a", &card_a), ("agent-b", &card_b)]);
    let run = reg
        .federation
        .sync_now(&peer_id)
        .await
        .expect("third sync")
        .expect("run");
    assert_eq!(run.added, 1);
    assert_eq!(reg.store.federated_records(&peer_id).await.len(), 2);
    assert_eq!(reg.store.versions_of(&hidden.id).await.len(), 1);
}

#[tokio::test]
async fn changed_hash_updates_in_place() {
    let reg = registry().await;
    let card_v1 = sample_card("agent-a", "1.0.0");
    advertise(&reg, &[("agent-a", &card_v1)]);

    let peer_id = create_peer(&reg).await;
    reg.federation.sync_now(&peer_id).await.expect("first sync");

    let card_v2 = sample_card("agent-a", "1.1.0");
    advertise(&reg, &[("agent-a", &card_v2)]);
    let run = reg
        .federation
        .sync_now(&peer_id)
        .await
        .expect("second sync")
        .expect("run");

    assert_eq!(run.added, 0);
    assert_eq!(run.updated, 1);
    let federated = reg.store.federated_records(&peer_id).await;
    assert_eq!(federated.len(), 1);
    let latest = reg
        .store
        .latest_version(&federated[0].id)
        .await
        .expect("latest");
    assert_eq!(latest.version, "1.1.0");
}

#[tokio::test]
async fn invalid_remote_card_yields_partial_outcome() {
    let reg = registry().await;
    let good = sample_card("agent-a", "1.0.0");
    let bad = json!({"name": "agent-b", "version": "not-semver"});
    advertise(&reg, &[("agent-a", &good), ("agent-b", &bad)]);

    let peer_id = create_peer(&reg).await;
    let run = reg
        .federation
        .sync_now(&peer_id)
        .await
        .expect("sync")
        .expect("run");

    assert_eq!(run.outcome, SyncOutcome::Partial);
    assert_eq!(run.added, 1);
    assert!(run.error.as_deref().unwrap_or("").contains("agent-b"));
    assert_eq!(reg.store.federated_records(&peer_id).await.len(), 1);
}

#[tokio::test]
async fn unreachable_peer_index_is_an_error_run() {
    let reg = registry().await;
    // Nothing registered in the fake fetcher: the index fetch 404s
    let peer_id = create_peer(&reg).await;
    let run = reg
        .federation
        .sync_now(&peer_id)
        .await
        .expect("sync")
        .expect("run");

    assert_eq!(run.outcome, SyncOutcome::Error);
    let peer = reg.federation.get_peer(&peer_id).await.expect("peer");
    assert_eq!(peer.status, PeerStatus::Error);
    assert!(peer.last_error.is_some());

    // An admin reset brings it back to active
    let peer = reg
        .federation
        .update_peer(
            &peer_id,
            UpdatePeerRequest {
                status: Some(PeerStatus::Active),
                ..Default::default()
            },
        )
        .await
        .expect("reset");
    assert_eq!(peer.status, PeerStatus::Active);
    assert!(peer.last_error.is_none());
}

#[tokio::test]
async fn deleting_a_peer_hides_its_agents() {
    let reg = registry().await;
    let card_a = sample_card("agent-a", "1.0.0");
    advertise(&reg, &[("agent-a", &card_a)]);

    let peer_id = create_peer(&reg).await;
    reg.federation.sync_now(&peer_id).await.expect("sync");
    assert_eq!(reg.store.federated_records(&peer_id).await.len(), 1);

    reg.federation.delete_peer(&peer_id).await.expect("delete");
    assert!(reg.federation.get_peer(&peer_id).await.is_err());
    assert!(reg.store.federated_records(&peer_id).await.is_empty());

    settle().await;
    let page: areg_common::api::AgentPage = serde_json::from_value(
        reg.discovery
            .list_public(Default::default())
            .await
            .expect("list"),
    )
    .expect("page");
    assert!(page.items.is_empty());
}
