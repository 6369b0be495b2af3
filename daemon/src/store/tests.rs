use serde_json::json;
use tempdir::TempDir;

use areg_common::api::SubjectKind;
use areg_common::card::{validate_card, CardSource, ValidCard};
use areg_common::principal::{Principal, PrincipalKind, Role};

use super::*;

fn valid_card(name: &str, version: &str) -> ValidCard {
    let raw = json!({
        "name": name,
        "description": "test agent",
        "url": "https://agents.test/a",
        "version": version,
        "capabilities": {},
        "securitySchemes": [],
        "skills": [{"id": "s1", "tags": ["test"]}],
        "interface": {
            "preferredTransport": "http",
            "defaultInputModes": ["text/plain"],
            "defaultOutputModes": ["text/plain"]
        }
    });
    validate_card(&raw).expect("card is valid")
}

fn upsert(name: &str, version: &str) -> UpsertVersion {
    UpsertVersion {
        tenant: "tenant-a".to_string(),
        publisher_name: "acme".to_string(),
        valid: valid_card(name, version),
        public: true,
        source: CardSource::ByValue,
        source_url: None,
        federated_from: None,
        max_agents_per_publisher: None,
    }
}

fn principal(id: &str, tenant: &str, roles: &[Role]) -> Principal {
    Principal {
        id: id.to_string(),
        tenant: tenant.to_string(),
        kind: PrincipalKind::User,
        roles: roles.iter().copied().collect(),
        scopes: Default::default(),
        consumer: None,
        organization: None,
    }
}

#[tokio::test]
async fn upsert_creates_then_dedupes() {
    let store = AgentStore::in_memory();
    let first = store
        .upsert_version(upsert("agent-x", "1.0.0"), |_, _| {})
        .await
        .expect("first publish");
    assert!(first.created);

    let second = store
        .upsert_version(upsert("agent-x", "1.0.0"), |_, _| {})
        .await
        .expect("identical publish");
    assert!(!second.created);
    assert_eq!(first.version.id, second.version.id);
    // No updated_at bump on identical bytes
    assert_eq!(first.record.updated_at, second.record.updated_at);
    assert_eq!(store.versions_of(&first.record.id).await.len(), 1);
}

#[tokio::test]
async fn upsert_new_version_bumps_head() {
    let store = AgentStore::in_memory();
    let v1 = store
        .upsert_version(upsert("agent-x", "1.0.0"), |_, _| {})
        .await
        .expect("v1");

    let mut input = upsert("agent-x", "1.1.0");
    input.valid = valid_card("agent-x", "1.1.0");
    let v2 = store.upsert_version(input, |_, _| {}).await.expect("v2");

    assert!(v2.created, "new bytes insert a new version");
    assert_ne!(v1.version.id, v2.version.id);
    let latest = store.latest_version(&v1.record.id).await.expect("latest");
    assert_eq!(latest.version, "1.1.0");
    assert_eq!(store.versions_of(&v1.record.id).await.len(), 2);
}

#[tokio::test]
async fn publisher_quota_is_enforced() {
    let store = AgentStore::in_memory();
    let mut first = upsert("agent-1", "1.0.0");
    first.max_agents_per_publisher = Some(1);
    store.upsert_version(first, |_, _| {}).await.expect("first");

    let mut second = upsert("agent-2", "1.0.0");
    second.valid = valid_card("agent-2", "1.0.0");
    second.max_agents_per_publisher = Some(1);
    let err = store
        .upsert_version(second, |_, _| {})
        .await
        .expect_err("quota");
    assert!(matches!(err, StoreError::QuotaExceeded { limit: 1 }));
}

#[tokio::test]
async fn federated_record_rejects_local_publish() {
    let store = AgentStore::in_memory();
    let peer = peer_id("peer-p");
    let mut federated = upsert("agent-f", "1.0.0");
    federated.publisher_name = "peer:peer-p".to_string();
    federated.source = CardSource::Federated;
    federated.federated_from = Some(peer.clone());
    store
        .upsert_version(federated, |_, _| {})
        .await
        .expect("federated upsert");

    let mut local = upsert("agent-f", "1.0.0");
    local.publisher_name = "peer:peer-p".to_string();
    let err = store
        .upsert_version(local, |_, _| {})
        .await
        .expect_err("local write to federated record");
    assert!(matches!(err, StoreError::FederatedImmutable));
}

#[tokio::test]
async fn grant_revoke_grant_reactivates() {
    let store = AgentStore::in_memory();
    let outcome = store
        .upsert_version(upsert("agent-x", "1.0.0"), |_, _| {})
        .await
        .expect("publish");
    let agent_id = outcome.record.id;

    let reader = principal("user-1", "tenant-a", &[Role::User]);
    assert!(!store.is_entitled(&agent_id, &reader).await);

    let granted = store
        .grant_entitlement("tenant-a", &agent_id, SubjectKind::Principal, "user-1")
        .await
        .expect("grant");
    assert!(store.is_entitled(&agent_id, &reader).await);

    store
        .revoke_entitlement("tenant-a", &agent_id, SubjectKind::Principal, "user-1")
        .await
        .expect("revoke");
    assert!(!store.is_entitled(&agent_id, &reader).await);

    let regranted = store
        .grant_entitlement("tenant-a", &agent_id, SubjectKind::Principal, "user-1")
        .await
        .expect("second grant");
    assert!(store.is_entitled(&agent_id, &reader).await);
    assert!(regranted.granted_at >= granted.granted_at);
    assert!(regranted.is_active());
}

#[tokio::test]
async fn role_entitlement_matches_any_holder() {
    let store = AgentStore::in_memory();
    let outcome = store
        .upsert_version(upsert("agent-x", "1.0.0"), |_, _| {})
        .await
        .expect("publish");
    store
        .grant_entitlement("tenant-a", &outcome.record.id, SubjectKind::Role, "User")
        .await
        .expect("grant role");

    let same_tenant = principal("anyone", "tenant-a", &[Role::User]);
    let other_tenant = principal("anyone", "tenant-b", &[Role::User]);
    assert!(store.is_entitled(&outcome.record.id, &same_tenant).await);
    assert!(!store.is_entitled(&outcome.record.id, &other_tenant).await);
}

#[test]
fn snapshot_rollback_discards_changes() {
    let mut state = StoreState::in_memory();
    {
        let mut guard = SnapshotGuard::new(&mut state).expect("guard");
        guard
            .store_mut()
            .put_tenant(Tenant {
                id: "t".to_string(),
                name: "t".to_string(),
                created_at: 0,
            })
            .expect("put");
        guard.rollback().expect("rollback");
    }
    assert!(state.cache().tenants.is_empty());
}

#[test]
fn snapshot_commit_retry_after_failure() {
    let mut state = StoreState::in_memory();
    let mut guard = SnapshotGuard::new(&mut state).expect("guard");
    guard
        .store_mut()
        .put_tenant(Tenant {
            id: "t".to_string(),
            name: "t".to_string(),
            created_at: 0,
        })
        .expect("put");

    guard.store_mut().set_fail_commit(true);
    assert!(guard.commit().is_err());
    assert!(guard.store_mut().has_snapshot());

    guard.store_mut().set_fail_commit(false);
    guard.commit().expect("retry commit");
    drop(guard);

    assert!(state.cache().tenants.contains_key("t"));
}

#[tokio::test]
async fn sled_backend_survives_reopen() {
    let dir = TempDir::new("areg_store_test").expect("tempdir");
    let path = dir.path().join("db");

    let agent_id = {
        let store = AgentStore::open(&path).expect("open");
        let outcome = store
            .upsert_version(upsert("agent-x", "1.0.0"), |_, _| {})
            .await
            .expect("publish");
        store
            .grant_entitlement(
                "tenant-a",
                &outcome.record.id,
                SubjectKind::Consumer,
                "team-1",
            )
            .await
            .expect("grant");
        outcome.record.id
    };

    let reopened = AgentStore::open(&path).expect("reopen");
    let record = reopened.get_record(&agent_id).await.expect("record");
    assert_eq!(record.name, "agent-x");
    let latest = reopened.latest_version(&agent_id).await.expect("version");
    assert_eq!(latest.version, "1.0.0");
    assert_eq!(reopened.entitlements_for_agent(&agent_id).await.len(), 1);
}
