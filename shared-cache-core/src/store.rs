use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::StoreConfig;
use crate::entry::Entry;

/// Metadata about a single stored key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Remaining time to live, `None` when the key never expires
    pub ttl: Option<Duration>,
    /// Size of key plus value in bytes
    pub size_bytes: usize,
}

/// Store-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreInfo {
    /// Number of entries, including expired ones not yet cleaned up
    pub entries: usize,
    /// Total size of keys and values in bytes
    pub size_bytes: usize,
}

/// The store every worker of a process group shares.
///
/// The only atomic primitive the cache relies on is [`try_create`]: every
/// lock, blocking wait and read-modify-write sequence is built on it.
///
/// A `ttl` of `None` never expires; `Some(Duration::ZERO)` writes an entry
/// that is already expired.
///
/// [`try_create`]: SharedStore::try_create
pub trait SharedStore: Send + Sync {
    /// Whether the store is initialised and usable
    fn enabled(&self) -> bool {
        true
    }

    /// Stores `value` only if `key` is absent (or expired). Returns `false`
    /// when a live entry already exists. Must be atomic.
    fn try_create(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool;

    /// Stores `value` unconditionally
    fn store(&self, key: &str, value: &str, ttl: Option<Duration>);

    /// Fetches a live value
    fn fetch(&self, key: &str) -> Option<String>;

    /// Deletes keys, returning the ones that could not be removed
    fn delete(&self, keys: &[&str]) -> Vec<String>;

    /// Iterates live entries whose key matches `pattern` (all entries when
    /// `None`), fetching values `chunk_size` at a time. Order is unspecified.
    fn iterate<'a>(
        &'a self,
        pattern: Option<&Regex>,
        chunk_size: usize,
    ) -> Box<dyn Iterator<Item = (String, String)> + 'a>;

    /// Removes every entry
    fn clear(&self) -> bool;

    /// Metadata about one live key
    fn key_info(&self, key: &str) -> Option<KeyInfo>;

    /// Store-wide statistics
    fn info(&self) -> StoreInfo;
}

/// Internal shared state for the store
struct StoreInner {
    data: DashMap<String, Entry>,
    /// Sender to signal shutdown to the cleanup task
    shutdown_tx: watch::Sender<bool>,
    /// Current total size of stored data in bytes (keys + values)
    current_size: AtomicUsize,
    enabled: AtomicBool,
}

/// In-memory [`SharedStore`] backed by `DashMap`.
///
/// Cloning is cheap and every clone sees the same data, so one store can be
/// handed to any number of worker threads or tasks.
///
/// Expired entries are hidden on read and removed lazily; a background task
/// also sweeps them periodically and stops when the last clone is dropped.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Creates a new store with default configuration
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context. The store requires
    /// a runtime to spawn its background cleanup task.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a new store with custom configuration
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    pub fn with_config(config: StoreConfig) -> Self {
        if tokio::runtime::Handle::try_current().is_err() {
            panic!(
                "shared_cache_core::MemoryStore requires a Tokio runtime. \
                 Create it from within a #[tokio::main] or #[tokio::test] context, \
                 or from code running on a Tokio runtime."
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(StoreInner {
            data: DashMap::new(),
            shutdown_tx,
            current_size: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
        });

        let cleanup_inner = Arc::downgrade(&inner);
        tokio::spawn(Self::cleanup_task(
            cleanup_inner,
            config.cleanup_interval,
            shutdown_rx,
        ));

        Self { inner }
    }

    /// Background task that periodically cleans up expired entries
    async fn cleanup_task(
        inner: std::sync::Weak<StoreInner>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    let removed = Self::cleanup_internal(&inner);
                    if removed > 0 {
                        tracing::debug!(removed, "expired entries swept");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn entry_size(key: &str, value: &str) -> usize {
        key.len() + value.len()
    }

    fn cleanup_internal(inner: &StoreInner) -> usize {
        let mut removed_count = 0;
        let mut removed_bytes = 0usize;

        inner.data.retain(|key, entry| {
            if entry.is_expired() {
                removed_bytes += Self::entry_size(key, entry.value());
                removed_count += 1;
                false
            } else {
                true
            }
        });

        if removed_bytes > 0 {
            release_bytes(&inner.current_size, removed_bytes);
        }

        removed_count
    }

    fn track_replace(&self, key: &str, new_value: &str, old: Option<&Entry>) {
        let new_size = Self::entry_size(key, new_value);
        let old_size = old.map(|e| Self::entry_size(key, e.value())).unwrap_or(0);
        if new_size > old_size {
            self.inner
                .current_size
                .fetch_add(new_size - old_size, Ordering::Relaxed);
        } else if old_size > new_size {
            release_bytes(&self.inner.current_size, old_size - new_size);
        }
    }

    /// Removes an expired entry, re-checking expiry under the shard lock so a
    /// concurrent writer's fresh value is never dropped.
    fn evict_if_expired(&self, key: &str) {
        if let Some((k, removed)) = self.inner.data.remove_if(key, |_, v| v.is_expired()) {
            release_bytes(&self.inner.current_size, Self::entry_size(&k, removed.value()));
        }
    }

    /// Manually triggers cleanup of all expired entries
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        Self::cleanup_internal(&self.inner)
    }

    /// Returns the number of entries in the store (including expired ones)
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Returns `true` if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Enables or disables the store. A disabled store makes every cache
    /// operation fail with `BackendUnavailable`.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Gracefully shuts down the background cleanup task
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl SharedStore for MemoryStore {
    fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    fn try_create(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        // The entry API holds the shard write lock for the whole check-and-insert
        match self.inner.data.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return false;
                }
                let old = occupied.insert(Entry::new(Arc::from(value), ttl));
                self.track_replace(key, value, Some(&old));
                true
            }
            MapEntry::Vacant(vacant) => {
                let _guard = vacant.insert(Entry::new(Arc::from(value), ttl));
                self.track_replace(key, value, None);
                true
            }
        }
    }

    fn store(&self, key: &str, value: &str, ttl: Option<Duration>) {
        // Sizes are accounted while the shard lock is held, so a concurrent
        // delete never subtracts bytes that were not added yet
        match self.inner.data.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let old = occupied.insert(Entry::new(Arc::from(value), ttl));
                self.track_replace(key, value, Some(&old));
            }
            MapEntry::Vacant(vacant) => {
                let _guard = vacant.insert(Entry::new(Arc::from(value), ttl));
                self.track_replace(key, value, None);
            }
        }
    }

    fn fetch(&self, key: &str) -> Option<String> {
        let entry = self.inner.data.get(key)?;

        if entry.value().is_expired() {
            // Drop the read reference before removing
            drop(entry);
            self.evict_if_expired(key);
            return None;
        }

        Some(entry.value().value().to_string())
    }

    fn delete(&self, keys: &[&str]) -> Vec<String> {
        let mut failed = Vec::new();
        for key in keys {
            match self.inner.data.remove(*key) {
                Some((k, entry)) => {
                    release_bytes(&self.inner.current_size, Self::entry_size(&k, entry.value()));
                    if entry.is_expired() {
                        failed.push(k);
                    }
                }
                None => failed.push(key.to_string()),
            }
        }
        failed
    }

    fn iterate<'a>(
        &'a self,
        pattern: Option<&Regex>,
        chunk_size: usize,
    ) -> Box<dyn Iterator<Item = (String, String)> + 'a> {
        // Only keys are snapshotted up front; values are fetched one chunk at a
        // time so handlers may call back into the store without holding a shard
        // lock.
        let keys: Vec<String> = self
            .inner
            .data
            .iter()
            .filter(|entry| pattern.map_or(true, |re| re.is_match(entry.key())))
            .filter(|entry| !entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        Box::new(ChunkedScan {
            store: self,
            keys: keys.into_iter(),
            chunk_size: chunk_size.max(1),
            buffer: VecDeque::new(),
        })
    }

    fn clear(&self) -> bool {
        self.inner.data.clear();
        self.inner.current_size.store(0, Ordering::Relaxed);
        true
    }

    fn key_info(&self, key: &str) -> Option<KeyInfo> {
        let entry = self.inner.data.get(key)?;
        if entry.value().is_expired() {
            return None;
        }
        Some(KeyInfo {
            ttl: entry.value().remaining(),
            size_bytes: Self::entry_size(key, entry.value().value()),
        })
    }

    fn info(&self) -> StoreInfo {
        StoreInfo {
            entries: self.inner.data.len(),
            size_bytes: self.inner.current_size.load(Ordering::Relaxed),
        }
    }
}

/// Iterator returned by [`MemoryStore::iterate`]
struct ChunkedScan<'a> {
    store: &'a MemoryStore,
    keys: std::vec::IntoIter<String>,
    chunk_size: usize,
    buffer: VecDeque<(String, String)>,
}

impl ChunkedScan<'_> {
    fn refill(&mut self) -> bool {
        while self.buffer.is_empty() {
            let chunk: Vec<String> = self.keys.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                return false;
            }
            for key in chunk {
                // Keys deleted or expired since the snapshot are skipped
                if let Some(value) = self.store.fetch(&key) {
                    self.buffer.push_back((key, value));
                }
            }
        }
        true
    }
}

impl Iterator for ChunkedScan<'_> {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.refill() {
            return None;
        }
        self.buffer.pop_front()
    }
}

/// Subtracts `bytes` from the size counter, stopping at zero
fn release_bytes(size: &AtomicUsize, bytes: usize) {
    let _ = size.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(bytes))
    });
}
