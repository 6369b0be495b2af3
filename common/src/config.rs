// Shared protocol constants. Limits here bound what the registry accepts
// from the outside world; operational tuning lives in the daemon config.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Well-known discovery endpoints
pub const ENDPOINT_WELL_KNOWN_INDEX: &str = "/.well-known/agents/index.json";
pub const ENDPOINT_WELL_KNOWN_CARD: &str = "/.well-known/agent.json";

// Headers
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_RETRY_AFTER: &str = "retry-after";
pub const HEADER_REQUEST_ID: &str = "x-request-id";

// Agent card limits
// A canonical card larger than this is rejected as invalid
pub const MAX_CARD_BYTES: usize = 256 * 1024;
pub const MAX_SKILLS: usize = 64;
pub const MAX_SECURITY_SCHEMES: usize = 8;
pub const MAX_TAGS_PER_SKILL: usize = 32;
pub const MAX_NAME_LENGTH: usize = 256;
pub const MAX_DESCRIPTION_LENGTH: usize = 4096;
pub const MAX_URL_LENGTH: usize = 2048;

// Pagination
pub const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 20;

// Search input limits, prevents unbounded filter fan-out
pub const MAX_FILTER_TAGS: usize = 32;
pub const MAX_FILTER_SECURITY: usize = 8;
pub const MAX_QUERY_LENGTH: usize = 512;
