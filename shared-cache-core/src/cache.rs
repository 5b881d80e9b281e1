use dashmap::DashMap;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::lock::{Executor, LockRecord};
use crate::number::Number;
use crate::pattern::KeyPattern;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::store::{KeyInfo, SharedStore, StoreInfo};

/// Write condition of [`SharedCache::set`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    /// Only set the key if it does not exist
    Nx,
    /// Only set the key if it already exists
    Xx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    /// Relative TTL in seconds, 0 = never
    Ex(u64),
    /// Absolute expiry
    ExAt(SystemTime),
}

/// Options of [`SharedCache::set`], mirroring Redis `SET`.
///
/// ```rust
/// use shared_cache_core::SetOptions;
/// use std::time::{Duration, SystemTime};
///
/// let plain = SetOptions::new();
/// let lease = SetOptions::new().nx().ex(30);
/// let until = SetOptions::new().xx().exat(SystemTime::now() + Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    condition: Option<Condition>,
    expiry: Option<Expiry>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only set the key if it does not exist; waits (up to the fuse) until it can
    pub fn nx(mut self) -> Self {
        self.condition = Some(Condition::Nx);
        self
    }

    /// Only set the key if it already exists; waits (up to the fuse) until it can
    pub fn xx(mut self) -> Self {
        self.condition = Some(Condition::Xx);
        self
    }

    /// Expire after `seconds` (0 = never)
    pub fn ex(mut self, seconds: u64) -> Self {
        self.expiry = Some(Expiry::Ex(seconds));
        self
    }

    /// Expire at an absolute time. A time in the past stores an already
    /// expired entry.
    pub fn exat(mut self, at: SystemTime) -> Self {
        self.expiry = Some(Expiry::ExAt(at));
        self
    }

    pub(crate) fn ttl(&self) -> Option<Duration> {
        match self.expiry {
            None | Some(Expiry::Ex(0)) => None,
            Some(Expiry::Ex(seconds)) => Some(Duration::from_secs(seconds)),
            Some(Expiry::ExAt(at)) => Some(
                at.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            ),
        }
    }
}

/// TTL in whole seconds, 0 = never
pub(crate) fn ttl_from_secs(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

pub(crate) struct CacheInner {
    pub(crate) store: Arc<dyn SharedStore>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) config: CacheConfig,
    pub(crate) executor: Executor,
    /// Listeners created by this process, keyed by (channel, worker).
    /// `None` reserves the slot while a listener is being created.
    pub(crate) listeners: DashMap<(String, String), Option<TaskHandle>>,
}

/// Redis-like cache over a [`SharedStore`].
///
/// One `SharedCache` is built per process (or per simulated worker) around
/// the store every worker shares and the process's own [`Scheduler`].
/// Cloning is cheap; clones share the listener registry.
///
/// Multi-step updates (counters, hashes, channels) run inside the
/// [`Executor`]'s per-key critical sections. Writing hash or channel keys
/// directly through the store bypasses those sections and is not supported.
///
/// # Example
///
/// ```rust,no_run
/// use shared_cache_core::{CacheConfig, MemoryStore, SetOptions, SharedCache, TokioScheduler};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), shared_cache_core::CacheError> {
///     let cache = SharedCache::new(
///         Arc::new(MemoryStore::new()),
///         Arc::new(TokioScheduler::new()),
///         CacheConfig::default(),
///     );
///
///     cache.set("user:1", "alice", SetOptions::new().ex(60))?;
///     assert_eq!(cache.get("user:1")?, Some("alice".to_string()));
///
///     cache.incr("hits", 1, 0)?;
///     cache.hset("session:1", "token", "abc", 30)?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct SharedCache {
    pub(crate) inner: Arc<CacheInner>,
}

impl SharedCache {
    pub fn new(
        store: Arc<dyn SharedStore>,
        scheduler: Arc<dyn Scheduler>,
        config: CacheConfig,
    ) -> Self {
        let executor = Executor::new(
            store.clone(),
            config.lock_prefix.clone(),
            config.fuse,
            config.backoff_initial,
            config.backoff_max,
        );
        Self {
            inner: Arc::new(CacheInner {
                store,
                scheduler,
                config,
                executor,
                listeners: DashMap::new(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<CacheInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<CacheInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The executor guarding this cache's critical sections
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    /// Fails with `BackendUnavailable` unless the store is usable
    pub(crate) fn ensure_backend(&self) -> Result<()> {
        if self.inner.store.enabled() {
            Ok(())
        } else {
            Err(CacheError::BackendUnavailable(
                "shared store is not enabled".to_string(),
            ))
        }
    }

    /// Runs `section` under the lock for `key`.
    ///
    /// `None` when the lock could not be taken (immediately when
    /// `blocking` is false, after the fuse otherwise). The section is not
    /// transactional; see [`Executor`].
    pub fn atomic<T>(
        &self,
        key: &str,
        blocking: bool,
        section: impl FnOnce() -> Result<T>,
    ) -> Result<Option<T>> {
        self.ensure_backend()?;
        self.inner
            .executor
            .run_exclusive(key, "atomic", json!([key]), blocking, section)
    }

    /// Stores a value.
    ///
    /// Without a condition the write is unconditional and returns `true`.
    /// `NX` and `XX` keep retrying until the condition holds and return
    /// `false` if the fuse elapses first.
    pub fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool> {
        self.ensure_backend()?;
        let store = &self.inner.store;
        let ttl = options.ttl();

        match options.condition {
            Some(Condition::Nx) => {
                let stored = self
                    .inner
                    .executor
                    .retry_until(|| Ok(store.try_create(key, value, ttl)))?;
                tracing::debug!(key, stored, "SET NX");
                Ok(stored)
            }
            Some(Condition::Xx) => {
                let stored = self.inner.executor.retry_until(|| {
                    let written = self.inner.executor.run_exclusive(
                        key,
                        "set",
                        json!([key, "XX"]),
                        false,
                        || {
                            if store.key_info(key).is_some() {
                                store.store(key, value, ttl);
                                Ok(true)
                            } else {
                                Ok(false)
                            }
                        },
                    )?;
                    Ok(written.unwrap_or(false))
                })?;
                tracing::debug!(key, stored, "SET XX");
                Ok(stored)
            }
            None => {
                store.store(key, value, ttl);
                Ok(true)
            }
        }
    }

    /// Retrieves a value; `None` if absent or expired
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_backend()?;
        Ok(self.inner.store.fetch(key))
    }

    /// Retrieves a value or returns `default`
    pub fn get_or(&self, key: &str, default: impl Into<String>) -> Result<String> {
        Ok(self.get(key)?.unwrap_or_else(|| default.into()))
    }

    /// Deletes keys, returning those that could not be removed
    pub fn del(&self, keys: &[&str]) -> Result<Vec<String>> {
        self.ensure_backend()?;
        Ok(self.inner.store.delete(keys))
    }

    /// Returns the subset of `keys` that exist
    pub fn exists(&self, keys: &[&str]) -> Result<Vec<String>> {
        self.ensure_backend()?;
        Ok(keys
            .iter()
            .filter(|key| self.inner.store.key_info(key).is_some())
            .map(|key| key.to_string())
            .collect())
    }

    /// Lists live keys, optionally filtered
    pub fn keys(&self, pattern: Option<&KeyPattern>) -> Result<Vec<String>> {
        self.ensure_backend()?;
        let regex = pattern.map(KeyPattern::compile).transpose()?;
        Ok(self
            .inner
            .store
            .iterate(regex.as_ref(), self.inner.config.search_chunk_size)
            .map(|(key, _)| key)
            .collect())
    }

    /// Streams matching entries to `handler`, `chunk_size` values at a time.
    /// Order follows the store's iteration order.
    pub fn search(
        &self,
        pattern: &KeyPattern,
        mut handler: impl FnMut(&str, &str),
        chunk_size: usize,
    ) -> Result<()> {
        self.ensure_backend()?;
        let regex = pattern.compile()?;
        for (key, value) in self.inner.store.iterate(Some(&regex), chunk_size) {
            handler(&key, &value);
        }
        Ok(())
    }

    /// Adds `delta` to a numeric value (absent = 0) and stores it with the
    /// given TTL (0 = never). `None` if the current value is not numeric or
    /// the lock could not be taken within the fuse.
    pub fn incr(&self, key: &str, delta: impl Into<Number>, ttl_seconds: u64) -> Result<Option<Number>> {
        self.add(key, delta.into(), ttl_seconds, "incr")
    }

    /// Subtracts `delta`; see [`incr`](Self::incr)
    pub fn decr(&self, key: &str, delta: impl Into<Number>, ttl_seconds: u64) -> Result<Option<Number>> {
        let delta: Number = delta.into();
        self.add(key, -delta, ttl_seconds, "decr")
    }

    fn add(&self, key: &str, delta: Number, ttl_seconds: u64, method: &str) -> Result<Option<Number>> {
        self.ensure_backend()?;
        let store = &self.inner.store;

        let result = self.inner.executor.run_exclusive(
            key,
            method,
            json!([key, delta, ttl_seconds]),
            true,
            || {
                let current = match store.fetch(key) {
                    None => Number::default(),
                    Some(text) => match Number::parse(&text) {
                        Some(n) => n,
                        None => return Ok(None),
                    },
                };
                let next = current + delta;
                store.store(key, &next.to_string(), ttl_from_secs(ttl_seconds));
                Ok(Some(next))
            },
        )?;

        Ok(result.flatten())
    }

    /// Lock records currently held anywhere in the process group
    pub fn lock_info(&self) -> Result<Vec<(String, LockRecord)>> {
        self.ensure_backend()?;
        self.inner.executor.lock_info()
    }

    /// Remaining TTL and size of a key
    pub fn key_info(&self, key: &str) -> Result<Option<KeyInfo>> {
        self.ensure_backend()?;
        Ok(self.inner.store.key_info(key))
    }

    /// Store-wide statistics
    pub fn info(&self) -> Result<StoreInfo> {
        self.ensure_backend()?;
        Ok(self.inner.store.info())
    }

    /// Deletes every entry of the shared store, including other workers'
    /// data, hashes, channels and held locks.
    pub fn clear(&self) -> Result<bool> {
        self.ensure_backend()?;
        tracing::warn!("CLEAR: wiping the entire shared store");
        Ok(self.inner.store.clear())
    }
}
