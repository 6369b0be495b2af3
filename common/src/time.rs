//! Wall-clock timestamps. The registry stamps records, orders list pages,
//! expires cache entries and slides rate-limit windows with these values;
//! none of that needs more than millisecond resolution or cross-process
//! monotonicity, so plain system time is enough.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Resolution of record
/// `created_at`/`updated_at` fields and of the pagination cursors built
/// from them.
pub type UnixMillis = u64;

/// Seconds since the Unix epoch. Used where coarser granularity reads
/// better: token expiry, sync intervals, retry-after hints.
pub type UnixSeconds = u64;

fn since_epoch() -> Duration {
    // A clock before 1970 yields zero rather than a panic; every consumer
    // treats 0 as "unknown, very old".
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

pub fn now_millis() -> UnixMillis {
    since_epoch().as_millis() as UnixMillis
}

pub fn now_seconds() -> UnixSeconds {
    since_epoch().as_secs()
}
