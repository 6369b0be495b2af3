use clap::Parser;

use std::time::Duration;

// Bind to loopback by default: the publish and peer-admin endpoints are
// privileged and should not be exposed without explicit opt-in.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

// Card fetcher limits (C2)
pub const FETCH_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const FETCH_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const FETCH_MAX_BYTES: usize = 256 * 1024;
pub const FETCH_MAX_REDIRECTS: usize = 3;

// Search indexer (C5)
pub const INDEX_RETRY_BASE: Duration = Duration::from_millis(200);
pub const INDEX_RETRY_CAP: Duration = Duration::from_secs(5);
pub const INDEX_RETRY_ATTEMPTS: u32 = 5;
pub const INDEX_REPAIR_INTERVAL: Duration = Duration::from_secs(60);
pub const INDEX_QUEUE_DEPTH_PER_SHARD: usize = 256;

// Federation (C10)
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 3600;
pub const SYNC_JITTER_RATIO: f64 = 0.10;
pub const SYNC_MAX_INDEX_PAGES: usize = 1000;

// Rate limiter bucket cap, prevents memory exhaustion from key churn
pub const RATE_LIMITER_MAX_KEYS: usize = 10_000;

// JWKS cache lifetime for the token verifier
pub const JWKS_TTL_SECS: u64 = 600;

// Response cache entry cap
pub const CACHE_MAX_ENTRIES: usize = 10_000;

// Budget reserved from the request deadline for response serialization
pub const DEADLINE_GUARD: Duration = Duration::from_millis(250);

/// Daemon configuration; every knob can come from the environment so the
/// container deployment needs no flags.
#[derive(Clone, Debug, Parser)]
#[command(name = "areg_daemon", about = "AREG agent registry daemon", version)]
pub struct Config {
    #[arg(long, env = "REGISTRY_BIND_ADDRESS", default_value = DEFAULT_BIND_ADDRESS)]
    pub bind_address: String,

    /// Self-advertised URL used in the well-known card and index entries.
    #[arg(long, env = "REGISTRY_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Registry display name, advertised in the well-known card.
    #[arg(long, env = "REGISTRY_NAME", default_value = "areg")]
    pub registry_name: String,

    /// Directory for the embedded store; omit for a purely in-memory
    /// registry (useful for tests and demos).
    #[arg(long, env = "REGISTRY_DB_PATH")]
    pub db_path: Option<String>,

    /// Quota of agent records per publisher.
    #[arg(long, env = "MAX_AGENTS_PER_CLIENT", default_value_t = 1000)]
    pub max_agents_per_client: u32,

    #[arg(long, env = "ENABLE_FEDERATION", default_value_t = true)]
    pub enable_federation: bool,

    #[arg(long, env = "INDEX_STALENESS_BUDGET_MS", default_value_t = 2000)]
    pub index_staleness_budget_ms: u64,

    #[arg(long, env = "INDEX_ENQUEUE_TIMEOUT_MS", default_value_t = 500)]
    pub index_enqueue_timeout_ms: u64,

    #[arg(long, env = "RATE_LIMIT_PUBLIC_READ", default_value_t = 100)]
    pub rate_limit_public_read: u32,

    #[arg(long, env = "RATE_LIMIT_AUTH_READ", default_value_t = 1000)]
    pub rate_limit_auth_read: u32,

    #[arg(long, env = "RATE_LIMIT_WRITE", default_value_t = 60)]
    pub rate_limit_write: u32,

    #[arg(long, env = "RATE_LIMIT_SYNC_ADMIN", default_value_t = 10)]
    pub rate_limit_sync_admin: u32,

    #[arg(long, env = "PEER_SYNC_MAX_PARALLEL", default_value_t = 4)]
    pub peer_sync_max_parallel: usize,

    #[arg(long, env = "CACHE_TTL_LIST_S", default_value_t = 30)]
    pub cache_ttl_list_s: u64,

    #[arg(long, env = "CACHE_TTL_CARD_S", default_value_t = 120)]
    pub cache_ttl_card_s: u64,

    #[arg(long, env = "CACHE_TTL_WELL_KNOWN_S", default_value_t = 60)]
    pub cache_ttl_well_known_s: u64,

    /// Search responses are high-cardinality and not cached unless this is
    /// set above zero.
    #[arg(long, env = "CACHE_TTL_SEARCH_S", default_value_t = 0)]
    pub cache_ttl_search_s: u64,

    /// JWKS endpoint of the token issuer. When unset, HS256 mode or admin
    /// API keys must be configured.
    #[arg(long, env = "REGISTRY_JWKS_URL")]
    pub jwks_url: Option<String>,

    #[arg(long, env = "REGISTRY_OAUTH_ISSUER")]
    pub oauth_issuer: Option<String>,

    #[arg(long, env = "REGISTRY_OAUTH_AUDIENCE")]
    pub oauth_audience: Option<String>,

    /// Shared-secret verification mode for development and tests.
    #[arg(long, env = "REGISTRY_HS256_SECRET")]
    pub hs256_secret: Option<String>,

    /// Comma-separated static keys granting Administrator on the admin
    /// tenant; intended for operational tooling.
    #[arg(long, env = "REGISTRY_ADMIN_API_KEYS")]
    pub admin_api_keys: Option<String>,

    #[arg(long, env = "REGISTRY_ADMIN_TENANT", default_value = "system")]
    pub admin_tenant: String,

    #[arg(long, env = "REGISTRY_PROMETHEUS", default_value_t = false)]
    pub prometheus_enable: bool,

    #[arg(long, env = "REGISTRY_PROMETHEUS_ROUTE", default_value = "/metrics")]
    pub prometheus_route: String,

    /// Overall per-request budget; exceeding it maps to 504.
    #[arg(long, env = "REGISTRY_REQUEST_BUDGET_MS", default_value_t = 10_000)]
    pub request_budget_ms: u64,

    #[arg(long, env = "REGISTRY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn index_enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.index_enqueue_timeout_ms)
    }

    pub fn index_staleness_budget(&self) -> Duration {
        Duration::from_millis(self.index_staleness_budget_ms)
    }

    pub fn request_budget(&self) -> Duration {
        let budget = Duration::from_millis(self.request_budget_ms);
        budget.saturating_sub(DEADLINE_GUARD)
    }

    pub fn cache_ttl_list(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_list_s)
    }

    pub fn cache_ttl_card(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_card_s)
    }

    pub fn cache_ttl_well_known(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_well_known_s)
    }

    pub fn admin_api_keys(&self) -> Vec<String> {
        self.admin_api_keys
            .as_deref()
            .map(|keys| {
                keys.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Configuration for a purely in-memory instance, used by tests.
    pub fn in_memory() -> Self {
        Self::parse_from(["areg_daemon"])
    }
}
