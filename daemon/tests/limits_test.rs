// Pagination boundaries, quotas and cursor behavior.

mod common;

use areg_common::api::{AgentPage, PageQuery, PublishRequest, WellKnownIndex};
use areg_common::config::MAX_CARD_BYTES;
use areg_common::error::ApiError;
use serde_json::json;

use common::{catalog_manager, registry, registry_with, sample_card};

async fn publish_many(reg: &common::TestRegistry, count: usize) {
    let publisher = catalog_manager("tenant-a");
    for i in 0..count {
        reg.publish
            .publish(
                &publisher,
                PublishRequest {
                    card: Some(sample_card(&format!("agent-{i:02}"), "1.0.0")),
                    card_url: None,
                    public: true,
                    publisher: None,
                },
            )
            .await
            .expect("publish");
    }
}

#[tokio::test]
async fn top_zero_yields_an_empty_page() {
    let reg = registry().await;
    publish_many(&reg, 3).await;

    let page: AgentPage = serde_json::from_value(
        reg.discovery
            .list_public(PageQuery {
                top: Some(0),
                skip: None,
            })
            .await
            .expect("list"),
    )
    .expect("page");
    assert!(page.items.is_empty());
    assert_eq!(page.total, Some(3));
    // The cursor is well-formed: resuming from it returns everything
    assert_eq!(page.next_skip, Some(0));
}

#[tokio::test]
async fn oversized_top_is_clamped() {
    let reg = registry().await;
    publish_many(&reg, 3).await;

    let page: AgentPage = serde_json::from_value(
        reg.discovery
            .list_public(PageQuery {
                top: Some(101),
                skip: None,
            })
            .await
            .expect("list"),
    )
    .expect("page");
    assert_eq!(page.items.len(), 3);
    assert_eq!(page.next_skip, None);
}

#[tokio::test]
async fn skip_walks_pages_in_order() {
    let reg = registry().await;
    publish_many(&reg, 5).await;

    let first: AgentPage = serde_json::from_value(
        reg.discovery
            .list_public(PageQuery {
                top: Some(2),
                skip: None,
            })
            .await
            .expect("list"),
    )
    .expect("page");
    assert_eq!(first.items.len(), 2);
    assert_eq!(first.next_skip, Some(2));

    let second: AgentPage = serde_json::from_value(
        reg.discovery
            .list_public(PageQuery {
                top: Some(2),
                skip: Some(2),
            })
            .await
            .expect("list"),
    )
    .expect("page");
    assert_eq!(second.items.len(), 2);
    // No overlap between pages
    assert!(first
        .items
        .iter()
        .all(|a| second.items.iter().all(|b| a.id != b.id)));
}

#[tokio::test]
async fn well_known_cursor_pages_through_everything() {
    let reg = registry().await;
    publish_many(&reg, 5).await;

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page: WellKnownIndex = serde_json::from_value(
            reg.discovery
                .well_known_index(cursor.as_deref(), Some(2))
                .await
                .expect("index"),
        )
        .expect("shape");
        seen.extend(page.agents.iter().map(|e| e.id.clone()));
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen.len(), 5);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 5, "no duplicates across pages");
}

#[tokio::test]
async fn garbage_cursor_is_invalid_cursor() {
    let reg = registry().await;
    let err = reg
        .discovery
        .well_known_index(Some("!!!"), None)
        .await
        .expect_err("bad cursor");
    assert!(matches!(err, ApiError::InvalidCursor));
}

#[tokio::test]
async fn publisher_quota_applies_to_new_records_only() {
    let mut config = areg_daemon::config::Config::in_memory();
    config.max_agents_per_client = 2;
    let reg = registry_with(config).await;
    publish_many(&reg, 2).await;

    let publisher = catalog_manager("tenant-a");
    let err = reg
        .publish
        .publish(
            &publisher,
            PublishRequest {
                card: Some(sample_card("agent-03", "1.0.0")),
                card_url: None,
                public: true,
                publisher: None,
            },
        )
        .await
        .expect_err("quota");
    assert!(matches!(err, ApiError::Forbidden(_)));

    // A new version of an existing record is not a new agent
    reg.publish
        .publish(
            &publisher,
            PublishRequest {
                card: Some(sample_card("agent-00", "1.1.0")),
                card_url: None,
                public: true,
                publisher: None,
            },
        )
        .await
        .expect("version bump within quota");
}

#[tokio::test]
async fn card_at_the_size_limit_is_rejected_above_it() {
    let reg = registry().await;
    let publisher = catalog_manager("tenant-a");

    let mut card = sample_card("big-agent", "1.0.0");
    card["padding"] = json!("x".repeat(MAX_CARD_BYTES));
    let err = reg
        .publish
        .publish(
            &publisher,
            PublishRequest {
                card: Some(card),
                card_url: None,
                public: false,
                publisher: None,
            },
        )
        .await
        .expect_err("oversized card");
    assert!(matches!(err, ApiError::InvalidCard(_)));
}

#[tokio::test]
async fn publish_requires_exactly_one_input_shape() {
    let reg = registry().await;
    let publisher = catalog_manager("tenant-a");

    let err = reg
        .publish
        .publish(
            &publisher,
            PublishRequest {
                card: None,
                card_url: None,
                public: false,
                publisher: None,
            },
        )
        .await
        .expect_err("no card");
    assert!(matches!(err, ApiError::BadRequest(_)));

    let err = reg
        .publish
        .publish(
            &publisher,
            PublishRequest {
                card: Some(sample_card("a", "1.0.0")),
                card_url: Some("https://x.test/card.json".to_string()),
                public: false,
                publisher: None,
            },
        )
        .await
        .expect_err("both shapes");
    assert!(matches!(err, ApiError::BadRequest(_)));
}
