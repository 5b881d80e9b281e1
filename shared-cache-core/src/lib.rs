//! # Shared Cache Core
//!
//! Redis-like caching for a group of workers that share one key/value store
//! but no locks. The only primitive asked of the store is an atomic
//! create-if-absent; everything else is built on top of it.
//!
//! ## Features
//!
//! - Per-key critical sections across workers, bounded by a fuse timeout
//! - `SET` with `NX`/`XX`/`EX`/`EXAT`, counters, pattern scans
//! - Hashes with an independent TTL per field
//! - Channels: per-worker mailboxes drained by timer or signal driven listeners
//! - A fixed-window rate limiter
//! - An in-memory [`MemoryStore`] (`DashMap`) with background expiry cleanup
//!
//! ## Example
//!
//! ```rust,no_run
//! use shared_cache_core::{CacheConfig, MemoryStore, SetOptions, SharedCache, TokioScheduler};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> shared_cache_core::Result<()> {
//!     let store = MemoryStore::new();
//!     let config = CacheConfig::default().with_fuse(Duration::from_secs(5));
//!     let cache = SharedCache::new(Arc::new(store), Arc::new(TokioScheduler::new()), config);
//!
//!     // Only the first worker gets the lease
//!     if cache.set("leader", "worker-1", SetOptions::new().nx().ex(30))? {
//!         println!("elected");
//!     }
//!
//!     // Critical section shared with every other worker on the store
//!     cache.atomic("report", true, || {
//!         let total = cache.incr("reports", 1, 0)?;
//!         println!("report #{:?}", total);
//!         Ok(())
//!     })?;
//!
//!     // Deliver messages to this worker
//!     cache.create_listener("jobs", "worker-1", |channel, worker, message| {
//!         println!("{worker} got {message} on {channel}");
//!     })?;
//!     cache.publish("jobs", "resize:42", true, None)?;
//!
//!     cache.shutdown()?;
//!     Ok(())
//! }
//! ```

mod cache;
mod channel;
mod config;
mod entry;
mod error;
mod hash;
mod lock;
mod number;
mod pattern;
mod rate_limiter;
mod scheduler;
mod store;

pub use cache::{SetOptions, SharedCache};
pub use channel::{ListenerCallback, Mailbox, SIGNAL_REGISTRY_KEY};
pub use config::{
    CacheConfig, DeliveryMode, StoreConfig, DEFAULT_BUCKET, DEFAULT_CHANNEL_PREFIX,
    DEFAULT_LOCK_PREFIX,
};
pub use entry::Entry;
pub use error::{CacheError, Result};
pub use hash::HashField;
pub use lock::{Backoff, BackoffFactory, Executor, ExponentialBackoff, FixedBackoff, LockRecord};
pub use number::Number;
pub use pattern::{wildcard_to_regex, KeyPattern};
pub use rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use scheduler::{ManualScheduler, Scheduler, SignalBus, Task, TaskHandle, TokioScheduler};
pub use store::{KeyInfo, MemoryStore, SharedStore, StoreInfo};
