//! Fixed-window request counting on top of the shared cache.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::{ttl_from_secs, SharedCache};
use crate::error::Result;

/// Limit and window of a [`RateLimiter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length, whole seconds
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(10),
        }
    }
}

impl RateLimitConfig {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Outcome of one [`RateLimiter::traffic`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Seconds until the window resets
    pub reset: u64,
    /// Whether this request exceeded the limit
    pub is_limited: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Window {
    created: u64,
    expired: u64,
    count: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Counts requests per key in fixed windows shared by every worker.
///
/// ```rust,no_run
/// use shared_cache_core::{RateLimitConfig, RateLimiter, SharedCache};
/// use std::time::Duration;
///
/// # fn check(cache: SharedCache) -> shared_cache_core::Result<()> {
/// let limiter = RateLimiter::new(cache, RateLimitConfig::new(100, Duration::from_secs(60)));
/// if let Some(status) = limiter.traffic("api:client-42")? {
///     if status.is_limited {
///         // reject
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    cache: SharedCache,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cache: SharedCache, config: RateLimitConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Records one request against `limit_key`.
    ///
    /// `None` if the key's lock could not be taken within the fuse.
    pub fn traffic(&self, limit_key: &str) -> Result<Option<RateLimitStatus>> {
        self.cache.ensure_backend()?;
        let store = self.cache.store();
        let limit = self.config.limit;
        let window_secs = self.config.window.as_secs().max(1);

        self.cache.executor().run_exclusive(
            limit_key,
            "traffic",
            json!([limit_key, limit, window_secs]),
            true,
            || {
                let now = now_secs();
                let current = match store.fetch(limit_key) {
                    Some(raw) => Some(serde_json::from_str::<Window>(&raw)?),
                    None => None,
                };

                let (window, reset) = match current {
                    Some(mut window) if window.expired >= now => {
                        window.count += 1;
                        let reset = window.expired - now;
                        (window, reset)
                    }
                    _ => (
                        Window {
                            created: now,
                            expired: now + window_secs,
                            count: 1,
                        },
                        window_secs,
                    ),
                };

                store.store(
                    limit_key,
                    &serde_json::to_string(&window)?,
                    ttl_from_secs(window_secs),
                );

                let status = RateLimitStatus {
                    limit,
                    remaining: limit.saturating_sub(window.count),
                    reset,
                    is_limited: window.count > limit,
                };
                if status.is_limited {
                    tracing::debug!(limit_key, count = window.count, limit, "rate limited");
                }
                Ok(status)
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{cache_on, test_config};
    use crate::store::tests::create_test_store;
    use std::thread;

    #[test]
    fn test_limits_within_window() {
        let (cache, _) = cache_on(&create_test_store(), 1, test_config());
        let limiter = RateLimiter::new(cache, RateLimitConfig::new(3, Duration::from_secs(10)));

        let first = limiter.traffic("client").unwrap().unwrap();
        assert_eq!(first.remaining, 2);
        assert_eq!(first.reset, 10);
        assert!(!first.is_limited);

        limiter.traffic("client").unwrap();
        let third = limiter.traffic("client").unwrap().unwrap();
        assert_eq!(third.remaining, 0);
        assert!(!third.is_limited);

        let fourth = limiter.traffic("client").unwrap().unwrap();
        assert!(fourth.is_limited);
        assert_eq!(fourth.limit, 3);

        // Separate keys have separate windows
        assert!(!limiter.traffic("other").unwrap().unwrap().is_limited);
    }

    #[test]
    fn test_window_resets() {
        let (cache, _) = cache_on(&create_test_store(), 1, test_config());
        let limiter = RateLimiter::new(cache, RateLimitConfig::new(1, Duration::from_secs(1)));

        limiter.traffic("k").unwrap();
        assert!(limiter.traffic("k").unwrap().unwrap().is_limited);

        thread::sleep(Duration::from_millis(2100));
        let fresh = limiter.traffic("k").unwrap().unwrap();
        assert!(!fresh.is_limited);
        assert_eq!(fresh.remaining, 0);
    }

    #[test]
    fn test_shared_between_workers() {
        let store = create_test_store();
        let config = RateLimitConfig::new(20, Duration::from_secs(30));

        let handles: Vec<_> = (0..4)
            .map(|pid| {
                let (cache, _) = cache_on(&store, pid, test_config());
                let limiter = RateLimiter::new(cache, config.clone());
                thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.traffic("shared").unwrap().unwrap().is_limited)
                        .count()
                })
            })
            .collect();

        let limited: usize = handles
            .into_iter()
            .map(|h| h.join().expect("Thread panicked"))
            .sum();
        assert_eq!(limited, 20);
    }
}
