use async_trait::async_trait;
use std::time::{Duration, SystemTime};

use super::{CacheBackend, CacheEntry};
use crate::error::CacheError;
use crate::lock::LockToken;

/// A backend that never hits and discards every write.
///
/// Selecting it disables caching for a wrapper while leaving the wrapper in
/// place: every call computes its result.
#[derive(Clone, Copy, Debug, Default)]
pub struct DummyBackend;

impl DummyBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheBackend for DummyBackend {
    async fn get_active(
        &self,
        _key: &str,
        _now: SystemTime,
    ) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn get_expired(
        &self,
        _key: &str,
        _now: SystemTime,
    ) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _entry: CacheEntry) -> Result<(), CacheError> {
        Ok(())
    }

    async fn invalidate(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn try_acquire(
        &self,
        _key: &str,
        _now: SystemTime,
        _lease: Duration,
    ) -> Result<Option<LockToken>, CacheError> {
        Ok(Some(LockToken::new()))
    }

    async fn release(&self, _key: &str, _token: &LockToken) -> Result<(), CacheError> {
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn writes_are_discarded() {
        let backend = DummyBackend::new();
        let now = SystemTime::now();
        let entry = CacheEntry::new(
            "key",
            Bytes::from_static(b"value"),
            now,
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        backend.set(entry).await.unwrap();
        assert!(backend.get_active("key", now).await.unwrap().is_none());
        assert!(backend.get_expired("key", now).await.unwrap().is_none());
        assert!(backend.entries().await.unwrap().is_empty());
    }
}
