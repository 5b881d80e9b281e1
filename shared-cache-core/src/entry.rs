use std::sync::Arc;
use std::time::{Duration, Instant};

/// A stored value with its optional expiration time
#[derive(Debug, Clone)]
pub struct Entry {
    value: Arc<str>,
    expires_at: Option<Instant>,
}

impl Entry {
    /// Creates a new entry. `ttl` of `None` never expires.
    pub fn new(value: Arc<str>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        }
    }

    /// Returns the stored value as a string slice
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Time left before expiry; `None` for entries without a TTL
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Checks if this entry has expired
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let entry = Entry::new(Arc::from("v"), None);
        assert!(!entry.is_expired());
        assert!(entry.remaining().is_none());
    }

    #[test]
    fn test_zero_ttl_is_already_expired() {
        let entry = Entry::new(Arc::from("v"), Some(Duration::ZERO));
        assert!(entry.is_expired());
        assert_eq!(entry.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_entry_with_ttl() {
        let entry = Entry::new(Arc::from("test_value"), Some(Duration::from_secs(60)));

        assert_eq!(entry.value(), "test_value");
        assert!(!entry.is_expired());
        assert!(entry.remaining().unwrap() > Duration::from_secs(59));
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let entry = Entry::new(Arc::from("v"), Some(Duration::MAX));
        assert!(!entry.is_expired());
    }
}
