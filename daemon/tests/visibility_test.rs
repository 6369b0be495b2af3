// Tenant isolation and entitlement-gated visibility (cross-tenant privacy).

mod common;

use areg_common::api::{PublishRequest, SearchRequest, SubjectKind};
use areg_common::error::ApiError;
use areg_common::principal::Role;

use common::{catalog_manager, principal, registry, sample_card, settle};

fn private_publish(card_name: &str) -> PublishRequest {
    PublishRequest {
        card: Some(sample_card(card_name, "1.0.0")),
        card_url: None,
        public: false,
        publisher: None,
    }
}

#[tokio::test]
async fn private_agents_are_invisible_across_and_within_tenants() {
    let reg = registry().await;
    let publisher = catalog_manager("tenant-a");
    let response = reg
        .publish
        .publish(&publisher, private_publish("secret-agent"))
        .await
        .expect("publish");
    let id = response.agent_id.to_string();

    // Another tenant: not found, never forbidden
    let outsider = principal("user-b", "tenant-b", &[Role::User]);
    let err = reg
        .discovery
        .get_agent(&id, Some(&outsider))
        .await
        .expect_err("cross-tenant");
    assert!(matches!(err, ApiError::NotFound));

    // Same tenant without an entitlement: also not found
    let insider = principal("user-a", "tenant-a", &[Role::User]);
    let err = reg
        .discovery
        .get_agent(&id, Some(&insider))
        .await
        .expect_err("not entitled");
    assert!(matches!(err, ApiError::NotFound));

    // Anonymous: not found
    let err = reg.discovery.get_agent(&id, None).await.expect_err("anon");
    assert!(matches!(err, ApiError::NotFound));

    // Grant to the insider: now visible, card included
    reg.store
        .grant_entitlement(
            "tenant-a",
            &response.agent_id,
            SubjectKind::Principal,
            "user-a",
        )
        .await
        .expect("grant");
    reg.cache.invalidate_tenant("tenant-a");

    let detail = reg
        .discovery
        .get_agent(&id, Some(&insider))
        .await
        .expect("entitled read");
    assert_eq!(detail.summary.name, "secret-agent");

    // The outsider still sees nothing
    let err = reg
        .discovery
        .get_agent(&id, Some(&outsider))
        .await
        .expect_err("still hidden");
    assert!(matches!(err, ApiError::NotFound));
}

#[tokio::test]
async fn entitled_list_is_the_union_of_public_and_granted() {
    let reg = registry().await;
    let publisher = catalog_manager("tenant-a");

    let public = reg
        .publish
        .publish(
            &publisher,
            PublishRequest {
                card: Some(sample_card("open-agent", "1.0.0")),
                card_url: None,
                public: true,
                publisher: None,
            },
        )
        .await
        .expect("public publish");
    let private = reg
        .publish
        .publish(&publisher, private_publish("closed-agent"))
        .await
        .expect("private publish");

    let reader = principal("user-a", "tenant-a", &[Role::User]);

    let page: areg_common::api::AgentPage = serde_json::from_value(
        reg.discovery
            .list_entitled(&reader, Default::default())
            .await
            .expect("list"),
    )
    .expect("page");
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, public.agent_id);

    reg.store
        .grant_entitlement(
            "tenant-a",
            &private.agent_id,
            SubjectKind::Consumer,
            "team-search",
        )
        .await
        .expect("grant");
    reg.cache.invalidate_tenant("tenant-a");

    let mut reader = reader;
    reader.consumer = Some("team-search".to_string());
    let page: areg_common::api::AgentPage = serde_json::from_value(
        reg.discovery
            .list_entitled(&reader, Default::default())
            .await
            .expect("list"),
    )
    .expect("page");
    assert_eq!(page.items.len(), 2);
}

#[tokio::test]
async fn search_respects_visibility() {
    let reg = registry().await;
    let publisher = catalog_manager("tenant-a");
    reg.publish
        .publish(&publisher, private_publish("stealth-agent"))
        .await
        .expect("publish");
    settle().await;

    let outsider = principal("user-b", "tenant-b", &[Role::User]);
    let results = reg
        .discovery
        .search(
            Some(&outsider),
            SearchRequest {
                q: Some("stealth".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("search");
    assert!(results.items.is_empty());
    assert_eq!(results.total, Some(0));

    // The publisher's own tenant sees it once entitled
    reg.store
        .grant_entitlement(
            "tenant-a",
            &reg.store
                .get_by_name("tenant-a", "Acme", "stealth-agent")
                .await
                .expect("record")
                .id,
            SubjectKind::Role,
            "User",
        )
        .await
        .expect("grant");

    let insider = principal("user-a", "tenant-a", &[Role::User]);
    let results = reg
        .discovery
        .search(
            Some(&insider),
            SearchRequest {
                q: Some("stealth".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("search");
    assert_eq!(results.items.len(), 1);
}

#[tokio::test]
async fn provider_mismatch_is_forbidden_without_administrator() {
    let reg = registry().await;
    let mut publisher = catalog_manager("tenant-a");
    publisher.organization = Some("Globex".to_string());

    // sample_card declares provider.organization = "Acme"
    let err = reg
        .publish
        .publish(
            &publisher,
            PublishRequest {
                card: Some(sample_card("agent", "1.0.0")),
                card_url: None,
                public: false,
                publisher: None,
            },
        )
        .await
        .expect_err("provider mismatch");
    assert!(matches!(err, ApiError::Forbidden(_)));

    // An Administrator may publish the same card anyway
    let mut admin = principal("root", "tenant-a", &[Role::Administrator]);
    admin.organization = Some("Globex".to_string());
    reg.publish
        .publish(
            &admin,
            PublishRequest {
                card: Some(sample_card("agent", "1.0.0")),
                card_url: None,
                public: false,
                publisher: None,
            },
        )
        .await
        .expect("admin publish");
}

#[tokio::test]
async fn publisher_override_requires_administrator() {
    let reg = registry().await;
    let publisher = catalog_manager("tenant-a");
    let err = reg
        .publish
        .publish(
            &publisher,
            PublishRequest {
                card: Some(sample_card("agent", "1.0.0")),
                card_url: None,
                public: false,
                publisher: Some("someone-else".to_string()),
            },
        )
        .await
        .expect_err("override without admin");
    assert!(matches!(err, ApiError::Forbidden(_)));
}

#[tokio::test]
async fn plain_users_cannot_publish() {
    let reg = registry().await;
    let user = principal("user-a", "tenant-a", &[Role::User]);
    let err = reg
        .publish
        .publish(
            &user,
            PublishRequest {
                card: Some(sample_card("agent", "1.0.0")),
                card_url: None,
                public: true,
                publisher: None,
            },
        )
        .await
        .expect_err("user publish");
    assert!(matches!(err, ApiError::Forbidden(_)));
}
