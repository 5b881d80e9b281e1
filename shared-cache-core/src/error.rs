//! Error types for the shared cache.

use thiserror::Error;

/// Hard errors raised by cache operations.
///
/// Contention, fuse timeouts and counter type mismatches are not errors: those
/// are reported through `None`/`false` results so callers can branch on them.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The shared store is not initialised or has been disabled
    #[error("Shared store unavailable: {0}")]
    BackendUnavailable(String),

    /// A listener for this (channel, worker) pair already exists in this process
    #[error("Channel {channel} already has a listener for worker {worker}")]
    ListenerExists {
        /// Channel key as passed by the caller
        channel: String,
        /// Worker the listener was requested for
        worker: String,
    },

    /// A stored blob could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A key pattern failed to compile
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl CacheError {
    /// Returns `true` if the backing store is unavailable.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, CacheError::BackendUnavailable(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;
