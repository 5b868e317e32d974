//! Storage backends for cached results.
//!
//! Every wrapper stores its results through a [`CacheBackend`]. This module
//! ships with:
//! - [`memory::InMemoryBackend`]: a fast, process-local cache backed by [`moka`].
//! - [`dummy::DummyBackend`]: never hits and discards writes; turns caching off
//!   for a wrapper without removing it.
//! - `redis::RedisBackend` *(optional)*: a persistent, shared cache when the
//!   `redis-backend` crate feature is enabled.
//!
//! Each key has two views. The *active* view answers while
//! `now < active_until`; the *expired* view keeps answering until
//! `stale_until` so that a stale result can be served while it is refreshed.
//! Backends also own the per-key refresh lock, because acquiring it must be
//! atomic with respect to every process sharing the storage.

pub mod dummy;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::error::CacheError;
use crate::lock::LockToken;

/// A cached result with its two expiry horizons.
///
/// Entries are only ever replaced as a whole; nothing mutates one in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Bytes,
    pub created_at: SystemTime,
    pub active_until: SystemTime,
    pub stale_until: SystemTime,
}

impl CacheEntry {
    /// Builds an entry created at `now`.
    ///
    /// Zero-length windows are widened to one millisecond so that
    /// `stale_until > active_until > created_at` always holds.
    pub fn new(
        key: impl Into<String>,
        payload: Bytes,
        now: SystemTime,
        timeout: Duration,
        grace: Duration,
    ) -> Self {
        let min = Duration::from_millis(1);
        let active_until = now + timeout.max(min);
        Self {
            key: key.into(),
            payload,
            created_at: now,
            active_until,
            stale_until: active_until + grace.max(min),
        }
    }

    /// Whether the entry is inside its active window at `now`.
    pub fn is_active(&self, now: SystemTime) -> bool {
        now < self.active_until
    }

    /// Whether the entry can still be served, fresh or stale, at `now`.
    pub fn is_servable(&self, now: SystemTime) -> bool {
        now < self.stale_until
    }

    /// Time the entry spends in the active window.
    pub fn timeout(&self) -> Duration {
        self.active_until
            .duration_since(self.created_at)
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Returns the entry only while it is active at `now`.
    async fn get_active(&self, key: &str, now: SystemTime)
        -> Result<Option<CacheEntry>, CacheError>;

    /// Returns the entry while it is servable at `now`, active or not.
    async fn get_expired(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<CacheEntry>, CacheError>;

    /// Creates or replaces the entry under `entry.key`.
    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Drops the active view of `key`, keeping the stale copy servable.
    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;

    /// Removes every trace of `key`.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Atomically takes the refresh lock on `key` unless a live one exists.
    ///
    /// `Ok(None)` means another caller holds the lock; that is contention,
    /// not an error.
    async fn try_acquire(
        &self,
        key: &str,
        now: SystemTime,
        lease: Duration,
    ) -> Result<Option<LockToken>, CacheError>;

    /// Releases the lock on `key` if `token` still holds it.
    async fn release(&self, key: &str, token: &LockToken) -> Result<(), CacheError>;

    /// Every stored record, newest first.
    async fn entries(&self) -> Result<Vec<CacheEntry>, CacheError>;
}

pub(crate) fn newest_first(entries: &mut [CacheEntry]) {
    entries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.key.cmp(&b.key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn entry_windows_are_ordered() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let entry = CacheEntry::new(
            "key",
            Bytes::from_static(b"a"),
            now,
            Duration::from_secs(300),
            Duration::from_secs(60),
        );

        assert_eq!(entry.active_until, now + Duration::from_secs(300));
        assert_eq!(entry.stale_until, now + Duration::from_secs(360));
        assert!(entry.is_active(now + Duration::from_secs(299)));
        assert!(!entry.is_active(now + Duration::from_secs(300)));
        assert!(entry.is_servable(now + Duration::from_secs(300)));
        assert!(!entry.is_servable(now + Duration::from_secs(360)));
        assert_eq!(entry.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn zero_windows_are_widened() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let entry = CacheEntry::new("key", Bytes::new(), now, Duration::ZERO, Duration::ZERO);
        assert!(entry.stale_until > entry.active_until);
        assert!(entry.active_until > entry.created_at);
    }
}
