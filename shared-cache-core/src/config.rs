use std::time::Duration;

/// Default lock record prefix
pub const DEFAULT_LOCK_PREFIX: &str = "#lock#";

/// Default channel blob prefix
pub const DEFAULT_CHANNEL_PREFIX: &str = "#Channel#";

/// Mailbox that buffers messages published before any listener exists
pub const DEFAULT_BUCKET: &str = "--default--";

/// How channel listeners are woken up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Each listener polls its mailbox on a recurring timer
    #[default]
    Timer,
    /// Publishers signal every registered process; listeners drain on wake-up
    Signal,
}

/// Configuration for the [`MemoryStore`](crate::MemoryStore) background cleanup task
///
/// # Example
///
/// ```rust
/// use shared_cache_core::StoreConfig;
/// use std::time::Duration;
///
/// let config = StoreConfig::default()
///     .with_cleanup_interval(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Interval between cleanup runs (default: 60 seconds)
    pub cleanup_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cleanup interval
    ///
    /// This determines how often the background task removes expired entries.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Configuration for a [`SharedCache`](crate::SharedCache)
///
/// # Example
///
/// ```rust
/// use shared_cache_core::{CacheConfig, DeliveryMode};
/// use std::time::Duration;
///
/// let config = CacheConfig::default()
///     .with_fuse(Duration::from_secs(5))
///     .with_delivery_mode(DeliveryMode::Signal);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Longest a blocking operation may wait for a lock (default: 60 seconds)
    pub fuse: Duration,
    /// Prefix of lock record keys
    pub lock_prefix: String,
    /// Prefix of channel blob keys
    pub channel_prefix: String,
    /// Name of the mailbox buffering messages published before any listener
    pub default_bucket: String,
    /// Poll interval of timer-driven channel listeners (default: 1 ms)
    pub listener_interval: Duration,
    /// Listener wake-up strategy
    pub delivery_mode: DeliveryMode,
    /// First delay between lock attempts
    pub backoff_initial: Duration,
    /// Upper bound of the delay between lock attempts
    pub backoff_max: Duration,
    /// Number of entries fetched per chunk by `search`
    pub search_chunk_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fuse: Duration::from_secs(60),
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            default_bucket: DEFAULT_BUCKET.to_string(),
            listener_interval: Duration::from_millis(1),
            delivery_mode: DeliveryMode::Timer,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(50),
            search_chunk_size: 100,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fuse of blocking operations
    pub fn with_fuse(mut self, fuse: Duration) -> Self {
        self.fuse = fuse;
        self
    }

    /// Sets the lock record prefix
    pub fn with_lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lock_prefix = prefix.into();
        self
    }

    /// Sets the channel blob prefix
    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Sets the name of the default mailbox
    pub fn with_default_bucket(mut self, name: impl Into<String>) -> Self {
        self.default_bucket = name.into();
        self
    }

    /// Sets the poll interval of timer-driven listeners
    pub fn with_listener_interval(mut self, interval: Duration) -> Self {
        self.listener_interval = interval;
        self
    }

    /// Sets the listener delivery mode
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Sets the bounds of the exponential lock backoff
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max.max(initial);
        self
    }

    /// Sets the chunk size used by `search`
    pub fn with_search_chunk_size(mut self, size: usize) -> Self {
        self.search_chunk_size = size.max(1);
        self
    }

    /// Create a configuration from environment variables.
    ///
    /// Reads (all optional, invalid values fall back to defaults):
    /// - `SHARED_CACHE_FUSE_SECS`
    /// - `SHARED_CACHE_LOCK_PREFIX`
    /// - `SHARED_CACHE_CHANNEL_PREFIX`
    /// - `SHARED_CACHE_LISTENER_INTERVAL_MS`
    /// - `SHARED_CACHE_SIGNAL` (`1`/`true` selects signal delivery)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("SHARED_CACHE_FUSE_SECS") {
            config.fuse = Duration::from_secs(secs);
        }
        if let Ok(prefix) = std::env::var("SHARED_CACHE_LOCK_PREFIX") {
            config.lock_prefix = prefix;
        }
        if let Ok(prefix) = std::env::var("SHARED_CACHE_CHANNEL_PREFIX") {
            config.channel_prefix = prefix;
        }
        if let Some(ms) = env_parse::<u64>("SHARED_CACHE_LISTENER_INTERVAL_MS") {
            config.listener_interval = Duration::from_millis(ms);
        }
        if let Ok(flag) = std::env::var("SHARED_CACHE_SIGNAL") {
            if matches!(flag.as_str(), "1" | "true" | "TRUE" | "yes") {
                config.delivery_mode = DeliveryMode::Signal;
            }
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
