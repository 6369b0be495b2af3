// Shared harness for the integration tests: a full in-memory registry
// stack with a fake outbound HTTP client, so publishes, discovery and
// federation run end-to-end without network or disk.

// Not every test binary exercises every helper
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use areg_common::principal::{Principal, PrincipalKind, Role};
use areg_daemon::cache::ResponseCache;
use areg_daemon::config::Config;
use areg_daemon::discovery::DiscoveryService;
use areg_daemon::federation::FederationManager;
use areg_daemon::fetcher::{FetchError, FetchLimits, HttpFetcher};
use areg_daemon::index::IndexService;
use areg_daemon::publish::PublishService;
use areg_daemon::store::AgentStore;
use url::Url;

/// Outbound HTTP stub: URL string -> canned JSON response.
#[derive(Default)]
pub struct FakeFetcher {
    responses: Mutex<HashMap<String, Value>>,
}

impl FakeFetcher {
    pub fn put(&self, url: &str, body: Value) {
        self.responses
            .lock()
            .expect("fetcher lock")
            .insert(url.to_string(), body);
    }
}

#[async_trait]
impl HttpFetcher for FakeFetcher {
    async fn fetch_json(
        &self,
        url: &Url,
        _bearer: Option<&str>,
        _limits: &FetchLimits,
    ) -> Result<Value, FetchError> {
        self.responses
            .lock()
            .expect("fetcher lock")
            .get(url.as_str())
            .cloned()
            .ok_or(FetchError::Status(404))
    }
}

pub struct TestRegistry {
    pub store: Arc<AgentStore>,
    pub cache: Arc<ResponseCache>,
    pub publish: Arc<PublishService>,
    pub discovery: Arc<DiscoveryService>,
    pub federation: Arc<FederationManager>,
    pub fetcher: Arc<FakeFetcher>,
    pub config: Arc<Config>,
    // Holds the worker tasks alive for the duration of the test
    #[allow(dead_code)]
    pub index: IndexService,
}

pub async fn registry() -> TestRegistry {
    registry_with(Config::in_memory()).await
}

pub async fn registry_with(config: Config) -> TestRegistry {
    let config = Arc::new(config);
    let store = Arc::new(AgentStore::in_memory());
    let index = IndexService::start(Arc::clone(&store), &config).await;
    let cache = Arc::new(ResponseCache::new());
    let fetcher = Arc::new(FakeFetcher::default());

    let publish = Arc::new(PublishService::new(
        Arc::clone(&store),
        Arc::clone(&index.writer),
        Arc::clone(&cache),
        fetcher.clone() as Arc<dyn HttpFetcher>,
        Arc::clone(&config),
    ));
    let discovery = Arc::new(DiscoveryService::new(
        Arc::clone(&store),
        Arc::clone(&index.index),
        Arc::clone(&cache),
        Arc::clone(&config),
    ));
    let federation = Arc::new(FederationManager::new(
        Arc::clone(&store),
        Arc::clone(&publish),
        Arc::clone(&index.writer),
        Arc::clone(&cache),
        fetcher.clone() as Arc<dyn HttpFetcher>,
        Arc::clone(&config),
    ));

    TestRegistry {
        store,
        cache,
        publish,
        discovery,
        federation,
        fetcher,
        config,
        index,
    }
}

/// Give the async index workers a moment to drain their queues; well
/// under the 2 s staleness budget.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn principal(id: &str, tenant: &str, roles: &[Role]) -> Principal {
    Principal {
        id: id.to_string(),
        tenant: tenant.to_string(),
        kind: PrincipalKind::User,
        roles: roles.iter().copied().collect(),
        scopes: Default::default(),
        consumer: None,
        organization: Some("Acme".to_string()),
    }
}

pub fn catalog_manager(tenant: &str) -> Principal {
    principal("cm-1", tenant, &[Role::CatalogManager])
}

pub fn sample_card(name: &str, version: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} finds and ranks recipes"),
        "url": "https://agents.example.com/recipe",
        "version": version,
        "capabilities": { "streaming": true },
        "securitySchemes": [
            {
                "type": "oauth2",
                "flow": "client_credentials",
                "tokenUrl": "https://auth.example.com/oauth/token"
            }
        ],
        "skills": [
            {
                "id": "search",
                "name": "Search",
                "tags": ["recipes", "search"]
            }
        ],
        "interface": {
            "preferredTransport": "jsonrpc",
            "defaultInputModes": ["text/plain"],
            "defaultOutputModes": ["application/json"]
        },
        "provider": {
            "organization": "Acme",
            "url": "https://acme.example.com"
        }
    })
}
