//! Administrative operations over every registered backend.
//!
//! This is the surface an operator tool builds on: list what is cached,
//! inspect one key, force a refresh with [`CacheAdmin::invalidate`] (the stale
//! copy keeps being served until the refresh lands) or remove entries
//! outright with [`CacheAdmin::delete`].

use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::{CacheBackend, CacheEntry};
use crate::clock::{self, Clock};
use crate::error::CacheError;
use crate::logging::{CacheEvent, CacheEventType, LoggingConfig};
use crate::registry::BackendRegistry;

/// Whether a listed entry is still inside its active window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Active,
    Stale,
}

/// One row of the admin listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub backend: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub active_until: DateTime<Utc>,
    pub stale_until: DateTime<Utc>,
    pub size_bytes: usize,
    pub state: EntryState,
}

impl EntrySummary {
    fn new(backend: &str, entry: CacheEntry, state: EntryState) -> Self {
        Self {
            backend: backend.to_owned(),
            size_bytes: entry.payload.len(),
            created_at: entry.created_at.into(),
            active_until: entry.active_until.into(),
            stale_until: entry.stale_until.into(),
            key: entry.key,
            state,
        }
    }
}

/// Inspects and manages cached entries across a [`BackendRegistry`].
#[derive(Clone)]
pub struct CacheAdmin {
    registry: BackendRegistry,
    clock: Arc<dyn Clock>,
    logging: LoggingConfig,
}

impl CacheAdmin {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            clock: clock::system(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Every servable entry in every backend, newest first.
    pub async fn list(&self) -> Result<Vec<EntrySummary>, CacheError> {
        let now = self.clock.now();
        let mut summaries = Vec::new();

        for (name, backend) in self.registry.iter() {
            for entry in backend.entries().await? {
                if !entry.is_servable(now) {
                    continue;
                }
                let state = state_of(backend.as_ref(), &entry.key, now).await?;
                summaries.push(EntrySummary::new(name, entry, state));
            }
        }

        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.backend.cmp(&b.backend))
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(summaries)
    }

    /// The entry stored under `key`, in the first backend that has one.
    pub async fn get(&self, key: &str) -> Result<Option<EntrySummary>, CacheError> {
        let now = self.clock.now();
        for (name, backend) in self.registry.iter() {
            if let Some(entry) = backend.get_expired(key, now).await? {
                let state = state_of(backend.as_ref(), key, now).await?;
                return Ok(Some(EntrySummary::new(name, entry, state)));
            }
        }
        Ok(None)
    }

    /// Expires the active view of `keys` everywhere, keeping stale copies.
    ///
    /// Returns how many stored entries were affected.
    pub async fn invalidate<I, K>(&self, keys: I) -> Result<usize, CacheError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let now = self.clock.now();
        let mut affected = 0;
        for key in keys {
            let key = key.as_ref();
            for (_, backend) in self.registry.iter() {
                if backend.get_expired(key, now).await?.is_some() {
                    backend.invalidate(key).await?;
                    affected += 1;
                }
            }
            CacheEvent::new(CacheEventType::Invalidate, key).log(&self.logging);
        }
        Ok(affected)
    }

    /// Removes `keys` from every backend, stale copies included.
    ///
    /// Returns how many stored entries were removed.
    pub async fn delete<I, K>(&self, keys: I) -> Result<usize, CacheError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let now = self.clock.now();
        let mut removed = 0;
        for key in keys {
            let key = key.as_ref();
            for (_, backend) in self.registry.iter() {
                if backend.get_expired(key, now).await?.is_some() {
                    removed += 1;
                }
                backend.delete(key).await?;
            }
            CacheEvent::new(CacheEventType::Delete, key).log(&self.logging);
        }
        Ok(removed)
    }
}

async fn state_of(
    backend: &dyn CacheBackend,
    key: &str,
    now: SystemTime,
) -> Result<EntryState, CacheError> {
    Ok(match backend.get_active(key, now).await? {
        Some(_) => EntryState::Active,
        None => EntryState::Stale,
    })
}
