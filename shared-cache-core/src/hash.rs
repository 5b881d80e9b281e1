//! Hash operations: a JSON map of fields with per-field TTL stored under one key.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::SharedCache;
use crate::error::Result;
use crate::number::Number;
use crate::pattern::KeyPattern;

/// A single field of a hash blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashField {
    pub value: String,
    /// Seconds, 0 = never expires
    pub ttl: u64,
    /// Unix milliseconds of the last write
    pub created_at: u64,
}

impl HashField {
    fn new(value: String, ttl: u64, now: u64) -> Self {
        Self {
            value,
            ttl,
            created_at: now,
        }
    }

    /// Whether the field has outlived its TTL at `now` (unix ms)
    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl > 0 && self.created_at.saturating_add(self.ttl.saturating_mul(1000)) < now
    }
}

type HashBlob = BTreeMap<String, HashField>;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl SharedCache {
    fn load_hash(&self, key: &str) -> Result<HashBlob> {
        match self.inner.store.fetch(key) {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(HashBlob::new()),
        }
    }

    /// Persists the blob, or deletes the key once no field remains
    fn save_hash(&self, key: &str, hash: &HashBlob) -> Result<()> {
        if hash.is_empty() {
            self.inner.store.delete(&[key]);
        } else {
            self.inner
                .store
                .store(key, &serde_json::to_string(hash)?, None);
        }
        Ok(())
    }

    /// Runs a blocking section over the hash at `key`. `None` on fuse timeout.
    fn with_hash<T>(
        &self,
        key: &str,
        method: &str,
        params: serde_json::Value,
        update: impl FnOnce(&mut HashBlob) -> Result<(T, bool)>,
    ) -> Result<Option<T>> {
        self.ensure_backend()?;
        self.inner
            .executor
            .run_exclusive(key, method, params, true, || {
                let mut hash = self.load_hash(key)?;
                let (result, dirty) = update(&mut hash)?;
                if dirty {
                    self.save_hash(key, &hash)?;
                }
                Ok(result)
            })
    }

    /// Sets a field with a TTL in seconds (0 = never). `false` on fuse timeout.
    pub fn hset(&self, key: &str, field: &str, value: &str, ttl_seconds: u64) -> Result<bool> {
        let written = self.with_hash(key, "hset", json!([key, field, ttl_seconds]), |hash| {
            hash.insert(
                field.to_string(),
                HashField::new(value.to_string(), ttl_seconds, now_millis()),
            );
            Ok(((), true))
        })?;
        Ok(written.is_some())
    }

    /// Reads a field; expired fields are invisible but not evicted
    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.ensure_backend()?;
        let now = now_millis();
        Ok(self
            .load_hash(key)?
            .remove(field)
            .filter(|f| !f.is_expired(now))
            .map(|f| f.value))
    }

    /// Every visible field and its value
    pub fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        self.ensure_backend()?;
        let now = now_millis();
        Ok(self
            .load_hash(key)?
            .into_iter()
            .filter(|(_, f)| !f.is_expired(now))
            .map(|(name, f)| (name, f.value))
            .collect())
    }

    /// Removes fields regardless of expiry; the key goes away with its last field
    pub fn hdel(&self, key: &str, fields: &[&str]) -> Result<bool> {
        let removed = self.with_hash(key, "hdel", json!([key, fields]), |hash| {
            let before = hash.len();
            for field in fields {
                hash.remove(*field);
            }
            Ok(((), hash.len() != before))
        })?;
        Ok(removed.is_some())
    }

    /// Returns the subset of `fields` present and not expired
    pub fn hexists(&self, key: &str, fields: &[&str]) -> Result<Vec<String>> {
        self.ensure_backend()?;
        let now = now_millis();
        let hash = self.load_hash(key)?;
        Ok(fields
            .iter()
            .filter(|name| hash.get(**name).is_some_and(|f| !f.is_expired(now)))
            .map(|name| name.to_string())
            .collect())
    }

    /// Visible field names, optionally filtered by `pattern`
    pub fn hkeys(&self, key: &str, pattern: Option<&KeyPattern>) -> Result<Vec<String>> {
        self.ensure_backend()?;
        let regex = pattern.map(KeyPattern::compile).transpose()?;
        let now = now_millis();
        Ok(self
            .load_hash(key)?
            .into_iter()
            .filter(|(name, f)| {
                !f.is_expired(now) && regex.as_ref().map_or(true, |re| re.is_match(name))
            })
            .map(|(name, _)| name)
            .collect())
    }

    /// Adds `delta` to a numeric field.
    ///
    /// An expired field restarts from 0. A `ttl_seconds` of 0 keeps the
    /// field alive for as long as it has existed since its last write.
    /// `None` if the field is not numeric or the fuse elapsed.
    pub fn hincr(
        &self,
        key: &str,
        field: &str,
        delta: impl Into<Number>,
        ttl_seconds: u64,
    ) -> Result<Option<Number>> {
        self.hash_add(key, field, delta.into(), ttl_seconds, "hincr")
    }

    /// Subtracts `delta` from a numeric field; see [`hincr`](Self::hincr)
    pub fn hdecr(
        &self,
        key: &str,
        field: &str,
        delta: impl Into<Number>,
        ttl_seconds: u64,
    ) -> Result<Option<Number>> {
        let delta: Number = delta.into();
        self.hash_add(key, field, -delta, ttl_seconds, "hdecr")
    }

    fn hash_add(
        &self,
        key: &str,
        field: &str,
        delta: Number,
        ttl_seconds: u64,
        method: &str,
    ) -> Result<Option<Number>> {
        let params = json!([key, field, delta, ttl_seconds]);
        let result = self.with_hash(key, method, params, |hash| {
            let now = now_millis();
            let previous = hash.get(field);

            let current = match previous {
                None => Number::default(),
                Some(f) if f.is_expired(now) => match Number::parse(&f.value) {
                    Some(_) => Number::default(),
                    None => return Ok((None, false)),
                },
                Some(f) => match Number::parse(&f.value) {
                    Some(n) => n,
                    None => return Ok((None, false)),
                },
            };

            let ttl = if ttl_seconds > 0 {
                ttl_seconds
            } else {
                previous
                    .map(|f| now.saturating_sub(f.created_at) / 1000)
                    .unwrap_or(0)
            };

            let next = current + delta;
            hash.insert(
                field.to_string(),
                HashField::new(next.to_string(), ttl, now),
            );
            Ok((Some(next), true))
        })?;

        Ok(result.flatten())
    }

    /// Drops expired fields and returns how many were removed.
    /// `None` on fuse timeout.
    pub fn hrecycle(&self, key: &str) -> Result<Option<usize>> {
        self.with_hash(key, "hrecycle", json!([key]), |hash| {
            let now = now_millis();
            let before = hash.len();
            hash.retain(|_, f| !f.is_expired(now));
            let removed = before - hash.len();
            if removed > 0 {
                tracing::debug!(key, removed, "recycled expired hash fields");
            }
            Ok((removed, removed > 0))
        })
    }
}
