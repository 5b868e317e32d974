//! Single-flight refresh locks.
//!
//! A refresh for a key may only run while its holder owns a live lease on
//! that key. Leases expire on their own so that a worker that died mid-refresh
//! cannot block the key forever, and a release only succeeds for the token
//! that acquired the lease, so a late release never clobbers a newer holder.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Opaque proof of lock ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A held lease on a key.
#[derive(Debug, Clone)]
pub struct LockMarker {
    pub holder: LockToken,
    pub acquired_at: SystemTime,
    pub lease_until: SystemTime,
}

impl LockMarker {
    pub fn is_live(&self, now: SystemTime) -> bool {
        now < self.lease_until
    }
}

/// In-process lease table with compare-and-swap acquisition.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct LeaseTable {
    leases: Arc<DashMap<String, LockMarker>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease on `key` unless a live one exists.
    pub fn try_acquire(&self, key: &str, now: SystemTime, lease: Duration) -> Option<LockToken> {
        let marker = LockMarker {
            holder: LockToken::new(),
            acquired_at: now,
            lease_until: now + lease,
        };
        let token = marker.holder.clone();

        match self.leases.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    return None;
                }
                entry.insert(marker);
            }
            Entry::Vacant(entry) => {
                entry.insert(marker);
            }
        }
        Some(token)
    }

    /// Drops the lease on `key` if `token` still holds it.
    pub fn release(&self, key: &str, token: &LockToken) -> bool {
        self.leases
            .remove_if(key, |_, marker| &marker.holder == token)
            .is_some()
    }

    /// Current marker for `key`, live or abandoned.
    pub fn marker(&self, key: &str) -> Option<LockMarker> {
        self.leases.get(key).map(|marker| marker.value().clone())
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn second_acquire_fails_while_lease_is_live() {
        let table = LeaseTable::new();
        let lease = Duration::from_secs(10);

        let token = table.try_acquire("key", t(100), lease);
        assert!(token.is_some());
        assert!(table.try_acquire("key", t(105), lease).is_none());
        assert!(table.try_acquire("other", t(105), lease).is_some());
    }

    #[test]
    fn abandoned_lease_can_be_taken_over() {
        let table = LeaseTable::new();
        let lease = Duration::from_secs(10);

        let first = table.try_acquire("key", t(100), lease).expect("first lease");
        let second = table
            .try_acquire("key", t(110), lease)
            .expect("expired lease is re-acquirable");
        assert_ne!(first, second);

        let marker = table.marker("key").expect("marker present");
        assert_eq!(marker.holder, second);
        assert_eq!(marker.acquired_at, t(110));
        assert_eq!(marker.lease_until, t(120));
    }

    #[test]
    fn stale_release_does_not_clobber_new_holder() {
        let table = LeaseTable::new();
        let lease = Duration::from_secs(10);

        let first = table.try_acquire("key", t(100), lease).unwrap();
        let second = table.try_acquire("key", t(200), lease).unwrap();

        assert!(!table.release("key", &first));
        assert!(table.try_acquire("key", t(201), lease).is_none());

        assert!(table.release("key", &second));
        assert!(table.is_empty());
        assert!(table.try_acquire("key", t(201), lease).is_some());
    }

    #[test]
    fn concurrent_acquire_has_a_single_winner() {
        let table = LeaseTable::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    table
                        .try_acquire("key", t(100), Duration::from_secs(30))
                        .is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
