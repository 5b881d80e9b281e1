//! Mutual exclusion synthesized from the store's create-if-absent primitive.
//!
//! A critical section for a logical key is entered by creating the lock
//! record `lock_prefix + key`. Because creation is atomic and fails when the
//! record exists, at most one worker in the whole process group holds it.
//! The record is deleted as soon as the section returns.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::Result;
use crate::pattern::KeyPattern;
use crate::store::SharedStore;

/// Produces the delays between lock attempts of a blocking acquire.
pub trait Backoff: Send {
    /// Called once before the first retry of an acquire
    fn reset(&mut self);

    /// Delay before the next attempt
    fn next_delay(&mut self) -> Duration;
}

/// Constant poll interval
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    interval: Duration,
}

impl FixedBackoff {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Backoff for FixedBackoff {
    fn reset(&mut self) {}

    fn next_delay(&mut self) -> Duration {
        self.interval
    }
}

/// Doubling delay with up to 50% jitter, capped at `max`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn reset(&mut self) {
        self.current = self.initial;
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let jitter_us = base.as_micros() as u64 / 2;
        let jitter = if jitter_us > 0 {
            Duration::from_micros(rand::rng().random_range(0..=jitter_us))
        } else {
            Duration::ZERO
        };
        self.current = (self.current * 2).min(self.max);
        (base + jitter).min(self.max)
    }
}

/// Builds a fresh backoff for each blocking acquire
pub type BackoffFactory = Arc<dyn Fn() -> Box<dyn Backoff> + Send + Sync>;

/// Observability payload stored in a lock record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Unix time (seconds, fractional) at which the lock was taken
    pub timestamp: f64,
    /// Operation holding the lock
    pub method: String,
    /// Operation parameters
    pub params: Value,
}

impl LockRecord {
    pub fn new(method: &str, params: Value) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            timestamp,
            method: method.to_string(),
            params,
        }
    }
}

/// Deletes the lock record when dropped, so the lock is released even when
/// the critical section panics.
struct LockGuard<'a> {
    store: &'a dyn SharedStore,
    key: &'a str,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.store.delete(&[self.key]);
        debug!(lock = %self.key, "lock released");
    }
}

/// Runs closures under a per-key, process-group-wide lock.
///
/// # Guarantees
///
/// Only that at most one section body runs at a time for a given logical
/// key. The body is not transactional: if it fails or panics half-way, what
/// it already wrote stays written. The lock record itself is always removed.
///
/// # Reentrancy
///
/// Locks are not reentrant. Calling `run_exclusive` for a key from inside a
/// section already holding that key returns `None` (non-blocking) or waits
/// for the whole fuse and then force-releases the outer lock (blocking).
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn SharedStore>,
    prefix: String,
    fuse: Duration,
    backoff: BackoffFactory,
}

impl Executor {
    /// Creates an executor using exponential backoff between `initial` and `max`
    pub fn new(
        store: Arc<dyn SharedStore>,
        prefix: impl Into<String>,
        fuse: Duration,
        initial: Duration,
        max: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            fuse,
            backoff: Arc::new(move || {
                Box::new(ExponentialBackoff::new(initial, max)) as Box<dyn Backoff>
            }),
        }
    }

    /// Replaces the retry policy of blocking acquires
    pub fn with_backoff(mut self, factory: BackoffFactory) -> Self {
        self.backoff = factory;
        self
    }

    /// Key of the lock record guarding `key`
    pub fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Runs `section` while holding the lock for `key`.
    ///
    /// Returns `Ok(Some(_))` with the section's result when it ran and
    /// `Ok(None)` when the lock could not be taken: immediately in
    /// non-blocking mode, or once the fuse elapsed in blocking mode. On a
    /// fuse timeout the lock record is force-deleted so a crashed holder
    /// cannot poison the key forever.
    pub fn run_exclusive<T>(
        &self,
        key: &str,
        method: &str,
        params: Value,
        blocking: bool,
        section: impl FnOnce() -> Result<T>,
    ) -> Result<Option<T>> {
        let lock_key = self.lock_key(key);
        let record = serde_json::to_string(&LockRecord::new(method, params))?;

        if !self.store.try_create(&lock_key, &record, None) {
            if !blocking {
                debug!(lock = %lock_key, method, "lock held, not waiting");
                return Ok(None);
            }
            if !self.wait_acquire(&lock_key, &record) {
                warn!(
                    lock = %lock_key,
                    method,
                    fuse_ms = self.fuse.as_millis() as u64,
                    "fuse expired, forcing lock release"
                );
                self.store.delete(&[lock_key.as_str()]);
                return Ok(None);
            }
        }

        debug!(lock = %lock_key, method, "lock acquired");
        let _guard = LockGuard {
            store: self.store.as_ref(),
            key: &lock_key,
        };
        section().map(Some)
    }

    /// Retries lock creation until it succeeds or the fuse elapses
    fn wait_acquire(&self, lock_key: &str, record: &str) -> bool {
        let deadline = Instant::now() + self.fuse;
        let mut backoff = (self.backoff)();
        backoff.reset();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let delay = backoff.next_delay().min(deadline - now);
            std::thread::sleep(delay);

            if self.store.try_create(lock_key, record, None) {
                return true;
            }
        }
    }

    /// Retries `attempt` under the executor's backoff until it returns `true`
    /// or the fuse elapses. Used by the blocking `NX`/`XX` writes.
    pub(crate) fn retry_until(&self, mut attempt: impl FnMut() -> Result<bool>) -> Result<bool> {
        if attempt()? {
            return Ok(true);
        }
        let deadline = Instant::now() + self.fuse;
        let mut backoff = (self.backoff)();
        backoff.reset();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(backoff.next_delay().min(deadline - now));
            if attempt()? {
                return Ok(true);
            }
        }
    }

    /// Lists lock records currently held, keyed by lock record key
    pub fn lock_info(&self) -> Result<Vec<(String, LockRecord)>> {
        let pattern = KeyPattern::prefix(&self.prefix).compile()?;
        let mut locks = Vec::new();
        for (key, value) in self.store.iterate(Some(&pattern), 100) {
            locks.push((key, serde_json::from_str(&value)?));
        }
        Ok(locks)
    }
}
