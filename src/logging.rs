//! Structured logging for cache operations.
//!
//! Every decision the coordinator makes (hit, stale hit, miss, store,
//! refresh dispatch and outcome) is described by a [`CacheEvent`] and emitted
//! as a single JSON document on the `update_cache::events` tracing target.
//! Failures are logged at WARN, everything else at DEBUG.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};

#[cfg(feature = "metrics")]
use metrics::counter;

/// Configuration for cache event logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit cache events at all.
    pub enabled: bool,

    /// Hash cache keys with SHA-256 before logging them.
    pub hash_keys: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hash_keys: false,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_hash_keys(mut self, hash: bool) -> Self {
        self.hash_keys = hash;
        self
    }
}

/// Types of cache events that can be logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEventType {
    /// Active entry served
    Hit,
    /// Expired entry served while a refresh is pending
    StaleHit,
    /// Nothing servable, computed in the caller's context
    Miss,
    /// Entry written
    Store,
    /// Entry could not be written
    StoreFailed,
    /// Backend read failed, treated as a miss
    ReadFailed,
    /// Refresh job handed to the dispatcher
    RefreshDispatched,
    /// Another refresh already holds the lock
    RefreshInFlight,
    /// Refresh job finished and replaced the entry
    RefreshSucceeded,
    /// Refresh job failed, stale entry kept
    RefreshFailed,
    /// Refresh job could not be submitted
    DispatchFailed,
    /// Lock could not be acquired or released because of a backend error
    LockFailed,
    /// Result deliberately not cached
    Bypass,
    /// Active view dropped
    Invalidate,
    /// Entry removed entirely
    Delete,
}

impl CacheEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::StaleHit => "stale_hit",
            Self::Miss => "miss",
            Self::Store => "store",
            Self::StoreFailed => "store_failed",
            Self::ReadFailed => "read_failed",
            Self::RefreshDispatched => "refresh_dispatched",
            Self::RefreshInFlight => "refresh_in_flight",
            Self::RefreshSucceeded => "refresh_succeeded",
            Self::RefreshFailed => "refresh_failed",
            Self::DispatchFailed => "dispatch_failed",
            Self::LockFailed => "lock_failed",
            Self::Bypass => "bypass",
            Self::Invalidate => "invalidate",
            Self::Delete => "delete",
        }
    }

    /// Whether the event reports something going wrong.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::StoreFailed
                | Self::ReadFailed
                | Self::RefreshFailed
                | Self::DispatchFailed
                | Self::LockFailed
        )
    }
}

/// A single structured cache event.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub timestamp: SystemTime,
    pub event_type: CacheEventType,
    pub key: String,
    pub latency_us: Option<u64>,
    pub size_bytes: Option<usize>,
    pub ttl_seconds: Option<u64>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl CacheEvent {
    pub fn new(event_type: CacheEventType, key: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type,
            key: key.into(),
            latency_us: None,
            size_bytes: None,
            ttl_seconds: None,
            error: None,
            metadata: json!({}),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_us = Some(latency.as_micros() as u64);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size_bytes = Some(size);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_seconds = Some(ttl.as_secs());
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Renders the event as the JSON document that gets logged.
    pub fn to_json(&self, config: &LoggingConfig) -> serde_json::Value {
        let key = if config.hash_keys {
            hash_key(&self.key)
        } else {
            self.key.clone()
        };

        json!({
            "timestamp": chrono::DateTime::<chrono::Utc>::from(self.timestamp)
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "event": self.event_type.as_str(),
            "key": key,
            "latency_us": self.latency_us,
            "size_bytes": self.size_bytes,
            "ttl_seconds": self.ttl_seconds,
            "error": self.error,
            "metadata": self.metadata,
        })
    }

    /// Logs this event using the provided configuration.
    pub fn log(&self, config: &LoggingConfig) {
        #[cfg(feature = "metrics")]
        counter!("update_cache.events", "event" => self.event_type.as_str()).increment(1);

        if !config.enabled {
            return;
        }

        let data = self.to_json(config);

        #[cfg(feature = "tracing")]
        {
            if self.event_type.is_failure() {
                tracing::warn!(target: "update_cache::events", event = %data);
            } else {
                tracing::debug!(target: "update_cache::events", event = %data);
            }
        }

        #[cfg(not(feature = "tracing"))]
        let _ = data;
    }
}

/// Hashes a cache key using SHA-256 for privacy.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
