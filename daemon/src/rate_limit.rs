use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use areg_common::error::ApiError;

use crate::config::{Config, RATE_LIMITER_MAX_KEYS};

/// Endpoint classes throttled independently per principal (or client ip
/// for unauthenticated calls).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    PublicRead,
    AuthRead,
    Write,
    SyncAdmin,
}

impl EndpointClass {
    fn as_str(&self) -> &'static str {
        match self {
            Self::PublicRead => "public-read",
            Self::AuthRead => "auth-read",
            Self::Write => "write",
            Self::SyncAdmin => "sync-admin",
        }
    }
}

/// Sliding-window limiter: one timestamp bucket per (caller, class).
/// Limits are per instance; cluster-exact accounting is out of scope.
pub struct RateLimiter {
    window: Duration,
    limits: HashMap<EndpointClass, u32>,
    entries: Mutex<HashMap<(String, EndpointClass), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &Config) -> Self {
        let mut limits = HashMap::new();
        limits.insert(EndpointClass::PublicRead, config.rate_limit_public_read);
        limits.insert(EndpointClass::AuthRead, config.rate_limit_auth_read);
        limits.insert(EndpointClass::Write, config.rate_limit_write);
        limits.insert(EndpointClass::SyncAdmin, config.rate_limit_sync_admin);
        Self {
            window: Duration::from_secs(60),
            limits,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record one call and fail with `RateLimited` when the caller is over
    /// its per-minute budget. The retry hint is the time until the oldest
    /// call in the window expires, so consecutive rejections report
    /// non-increasing values.
    pub async fn check(&self, key: &str, class: EndpointClass) -> Result<(), ApiError> {
        let limit = self.limits.get(&class).copied().unwrap_or(0);
        if limit == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        // Evict idle buckets once the map grows large
        if entries.len() > RATE_LIMITER_MAX_KEYS / 2 {
            let window = self.window;
            entries.retain(|_, bucket| {
                bucket
                    .back()
                    .map(|last| now.duration_since(*last) <= window)
                    .unwrap_or(false)
            });
        }
        // Still at capacity: reject new callers rather than growing
        if entries.len() >= RATE_LIMITER_MAX_KEYS
            && !entries.contains_key(&(key.to_string(), class))
        {
            return Err(ApiError::RateLimited {
                retry_after_secs: self.window.as_secs(),
            });
        }

        let bucket = entries.entry((key.to_string(), class)).or_default();
        while let Some(front) = bucket.front() {
            if now.duration_since(*front) > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= limit as usize {
            let retry_after = bucket
                .front()
                .map(|front| {
                    self.window
                        .saturating_sub(now.duration_since(*front))
                        .as_secs()
                        .max(1)
                })
                .unwrap_or(1);
            if log::log_enabled!(log::Level::Debug) {
                log::debug!(
                    "rate limit hit for {} on {} ({}/min)",
                    key,
                    class.as_str(),
                    limit
                );
            }
            return Err(ApiError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        bucket.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(write_limit: u32) -> RateLimiter {
        let mut config = Config::in_memory();
        config.rate_limit_write = write_limit;
        RateLimiter::new(&config)
    }

    #[tokio::test]
    async fn blocks_after_budget_is_spent() {
        let limiter = limiter(2);
        limiter.check("p1", EndpointClass::Write).await.expect("1");
        limiter.check("p1", EndpointClass::Write).await.expect("2");
        let err = limiter
            .check("p1", EndpointClass::Write)
            .await
            .expect_err("third call exceeds the budget");
        match err {
            ApiError::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn keys_and_classes_are_independent() {
        let limiter = limiter(1);
        limiter.check("p1", EndpointClass::Write).await.expect("p1");
        limiter.check("p2", EndpointClass::Write).await.expect("p2");
        limiter
            .check("p1", EndpointClass::AuthRead)
            .await
            .expect("different class");
        assert!(limiter.check("p1", EndpointClass::Write).await.is_err());
    }

    #[tokio::test]
    async fn retry_after_is_non_increasing() {
        let limiter = limiter(1);
        limiter.check("p1", EndpointClass::Write).await.expect("1");
        let first = match limiter.check("p1", EndpointClass::Write).await {
            Err(ApiError::RateLimited { retry_after_secs }) => retry_after_secs,
            other => panic!("expected rate limit, got {other:?}"),
        };
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let second = match limiter.check("p1", EndpointClass::Write).await {
            Err(ApiError::RateLimited { retry_after_secs }) => retry_after_secs,
            other => panic!("expected rate limit, got {other:?}"),
        };
        assert!(second <= first);
    }
}
