use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::CACHE_MAX_ENTRIES;

/// Cache key layout: `cache:{endpoint}:{tenant|*}:{principal|*}:{params}`.
/// Invalidation works on the tenant segment prefix, so everything up to the
/// principal stays ordered.
pub fn cache_key(endpoint: &str, tenant: Option<&str>, principal: Option<&str>, params: &str) -> String {
    let params_hash = hex::encode(&Sha256::digest(params.as_bytes())[..16]);
    format!(
        "cache:{}:{}:{}:{}",
        endpoint,
        tenant.unwrap_or("*"),
        principal.unwrap_or("*"),
        params_hash
    )
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// Best-effort TTL cache for read-heavy responses. Writers invalidate by
/// prefix; the TTL is the backstop when an invalidation is lost.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: String, value: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        // Keep the map bounded; dropping expired entries first, then
        // arbitrary ones if a burst of distinct keys blows the cap.
        if self.entries.len() >= CACHE_MAX_ENTRIES {
            let now = Instant::now();
            self.entries.retain(|_, entry| entry.expires_at > now);
            if self.entries.len() >= CACHE_MAX_ENTRIES {
                self.entries.clear();
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries.retain(|key, _| !key.starts_with(prefix));
    }

    /// Drop all cached responses scoped to a tenant, plus every global
    /// (`*`-tenant) view: public lists, cards and the well-known surface
    /// may all expose the tenant's public agents.
    pub fn invalidate_tenant(&self, tenant: &str) {
        self.entries.retain(|key, _| {
            match key.split(':').nth(2) {
                Some(t) => t != "*" && t != tenant,
                None => false,
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_respects_ttl() {
        let cache = ResponseCache::new();
        cache.put(
            cache_key("list_public", None, None, "top=20"),
            json!({"items": []}),
            Duration::from_secs(30),
        );
        assert!(cache.get(&cache_key("list_public", None, None, "top=20")).is_some());
        assert!(cache.get(&cache_key("list_public", None, None, "top=10")).is_none());

        cache.put("cache:x:*:*:y".to_string(), json!(1), Duration::ZERO);
        assert!(cache.get("cache:x:*:*:y").is_none());
    }

    #[test]
    fn tenant_invalidation_clears_tenant_and_well_known() {
        let cache = ResponseCache::new();
        let tenant_key = cache_key("list_entitled", Some("tenant-a"), Some("u1"), "");
        let other_key = cache_key("list_entitled", Some("tenant-b"), Some("u2"), "");
        let well_known = cache_key("well_known_index", None, None, "cursor=");
        cache.put(tenant_key.clone(), json!(1), Duration::from_secs(60));
        cache.put(other_key.clone(), json!(2), Duration::from_secs(60));
        cache.put(well_known.clone(), json!(3), Duration::from_secs(60));

        cache.invalidate_tenant("tenant-a");
        assert!(cache.get(&tenant_key).is_none());
        assert!(cache.get(&well_known).is_none());
        assert!(cache.get(&other_key).is_some());
    }
}
