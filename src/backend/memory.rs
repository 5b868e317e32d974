use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::Op;
use std::future::ready;
use std::time::{Duration, SystemTime};

use super::{newest_first, CacheBackend, CacheEntry};
use crate::error::CacheError;
use crate::lock::{LeaseTable, LockToken};

/// An in-memory [`CacheBackend`] implementation backed by [`moka`].
///
/// The backend is cheap to clone and shares a single underlying cache and
/// lease table. Expiry is decided against the caller's clock, not moka's, so
/// entries past their stale window are dropped lazily on read.
///
/// Every write goes through moka's per-key compute, so an invalidation or a
/// lazy removal never overwrites an entry stored concurrently.
#[derive(Clone)]
pub struct InMemoryBackend {
    cache: Cache<String, StoredEntry>,
    leases: LeaseTable,
}

#[derive(Clone)]
struct StoredEntry {
    entry: CacheEntry,
    invalidated: bool,
}

impl InMemoryBackend {
    /// Creates a new in-memory cache with the provided `max_capacity`.
    ///
    /// The capacity is expressed in number of cached entries, not bytes.
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_capacity).build();
        Self {
            cache,
            leases: LeaseTable::new(),
        }
    }

    /// The lease table guarding refreshes for this backend.
    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get_active(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .servable(key, now)
            .await
            .filter(|stored| !stored.invalidated && stored.entry.is_active(now))
            .map(|stored| stored.entry))
    }

    async fn get_expired(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.servable(key, now).await.map(|stored| stored.entry))
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let stored = StoredEntry {
            entry,
            invalidated: false,
        };
        self.cache
            .entry(stored.entry.key.clone())
            .and_compute_with(|_| ready(Op::Put(stored)))
            .await;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.cache
            .entry(key.to_owned())
            .and_compute_with(|current| {
                ready(match current {
                    Some(current) => {
                        let mut stored = current.into_value();
                        stored.invalidated = true;
                        Op::Put(stored)
                    }
                    None => Op::Nop,
                })
            })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn try_acquire(
        &self,
        key: &str,
        now: SystemTime,
        lease: Duration,
    ) -> Result<Option<LockToken>, CacheError> {
        Ok(self.leases.try_acquire(key, now, lease))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<(), CacheError> {
        self.leases.release(key, token);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries: Vec<CacheEntry> =
            self.cache.iter().map(|(_, stored)| stored.entry).collect();
        newest_first(&mut entries);
        Ok(entries)
    }
}

impl InMemoryBackend {
    async fn servable(&self, key: &str, now: SystemTime) -> Option<StoredEntry> {
        let stored = self.cache.get(key).await?;
        if stored.entry.is_servable(now) {
            return Some(stored);
        }

        // Only drop what is still unservable; a fresh write may have landed.
        self.cache
            .entry(key.to_owned())
            .and_compute_with(|current| {
                ready(match current {
                    Some(current) if !current.value().entry.is_servable(now) => Op::Remove,
                    _ => Op::Nop,
                })
            })
            .await;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::UNIX_EPOCH;

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn entry(key: &str, body: &'static [u8], now: SystemTime) -> CacheEntry {
        CacheEntry::new(
            key,
            Bytes::from_static(body),
            now,
            Duration::from_secs(300),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn active_and_expired_views_follow_the_windows() {
        let backend = InMemoryBackend::new(16);
        backend.set(entry("key", b"alpha", t(0))).await.unwrap();

        let active = backend.get_active("key", t(1)).await.unwrap();
        assert_eq!(active.expect("active").payload, Bytes::from_static(b"alpha"));

        assert!(backend.get_active("key", t(300)).await.unwrap().is_none());
        let stale = backend.get_expired("key", t(300)).await.unwrap();
        assert_eq!(stale.expect("stale").payload, Bytes::from_static(b"alpha"));

        assert!(backend.get_expired("key", t(360)).await.unwrap().is_none());
        assert!(
            backend.get_expired("key", t(1)).await.unwrap().is_none(),
            "entry removed after stale window"
        );
    }

    #[tokio::test]
    async fn both_views_agree_on_the_payload() {
        let backend = InMemoryBackend::new(16);
        backend.set(entry("key", b"alpha", t(0))).await.unwrap();

        let active = backend.get_active("key", t(10)).await.unwrap().unwrap();
        let expired = backend.get_expired("key", t(10)).await.unwrap().unwrap();
        assert_eq!(active, expired);
    }

    #[tokio::test]
    async fn invalidate_keeps_stale_copy() {
        let backend = InMemoryBackend::new(16);
        backend.set(entry("key", b"alpha", t(0))).await.unwrap();

        backend.invalidate("key").await.unwrap();
        assert!(backend.get_active("key", t(1)).await.unwrap().is_none());
        assert!(backend.get_expired("key", t(1)).await.unwrap().is_some());

        backend.set(entry("key", b"beta", t(2))).await.unwrap();
        assert!(backend.get_active("key", t(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_both_views() {
        let backend = InMemoryBackend::new(16);
        backend.set(entry("key", b"alpha", t(0))).await.unwrap();

        backend.delete("key").await.unwrap();
        assert!(backend.get_active("key", t(1)).await.unwrap().is_none());
        assert!(backend.get_expired("key", t(1)).await.unwrap().is_none());
        assert!(backend.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entries_are_listed_newest_first() {
        let backend = InMemoryBackend::new(16);
        backend.set(entry("first", b"1", t(0))).await.unwrap();
        backend.set(entry("second", b"2", t(5))).await.unwrap();
        backend.set(entry("third", b"3", t(10))).await.unwrap();

        let keys: Vec<String> = backend
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let backend = InMemoryBackend::new(16);
        let lease = Duration::from_secs(30);

        let token = backend.try_acquire("key", t(0), lease).await.unwrap();
        let token = token.expect("first acquire wins");
        assert!(backend.try_acquire("key", t(1), lease).await.unwrap().is_none());

        backend.release("key", &token).await.unwrap();
        assert!(backend.try_acquire("key", t(2), lease).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invalidate_never_reinstates_an_older_entry() {
        let backend = InMemoryBackend::new(16);

        for round in 0..200u64 {
            backend.set(entry("key", b"alpha", t(round))).await.unwrap();

            let writer = {
                let backend = backend.clone();
                tokio::spawn(async move { backend.set(entry("key", b"beta", t(round))).await })
            };
            let invalidator = {
                let backend = backend.clone();
                tokio::spawn(async move { backend.invalidate("key").await })
            };
            writer.await.unwrap().unwrap();
            invalidator.await.unwrap().unwrap();

            let stored = backend.get_expired("key", t(round)).await.unwrap();
            assert_eq!(stored.expect("kept").payload, Bytes::from_static(b"beta"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lazy_removal_keeps_a_concurrent_write() {
        let backend = InMemoryBackend::new(16);

        for round in 0..200u64 {
            let later = t(1_000 + round);
            backend.set(entry("key", b"old", t(0))).await.unwrap();

            let writer = {
                let backend = backend.clone();
                tokio::spawn(async move { backend.set(entry("key", b"new", later)).await })
            };
            let reader = {
                let backend = backend.clone();
                tokio::spawn(async move { backend.get_expired("key", later).await })
            };
            writer.await.unwrap().unwrap();
            reader.await.unwrap().unwrap();

            let stored = backend.get_expired("key", later).await.unwrap();
            assert_eq!(stored.expect("new entry kept").payload, Bytes::from_static(b"new"));
        }
    }
}
