use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;

use super::{CacheBackend, CacheEntry};
use crate::clock::to_millis;
use crate::codec::BincodeCodec;
use crate::error::CacheError;
use crate::lock::LockToken;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Persistent [`CacheBackend`] on Redis.
///
/// Each entry is written twice: `<ns>:active:<key>` expires with the active
/// window and `<ns>:entry:<key>` with the stale window, so invalidating only
/// needs to drop the first. A sorted set `<ns>:index` scored by creation time
/// backs the newest-first listing, and `<ns>:lock:<key>` holds refresh leases.
#[derive(Clone)]
pub struct RedisBackend {
    connection: Arc<Mutex<ConnectionManager>>,
    namespace: String,
    codec: BincodeCodec,
}

impl RedisBackend {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
            namespace: "update_cache".to_owned(),
            codec: BincodeCodec,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn active_key(&self, key: &str) -> String {
        format!("{}:active:{}", self.namespace, key)
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:entry:{}", self.namespace, key)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.namespace, key)
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.namespace)
    }

    async fn read(&self, redis_key: String) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.connection.lock().await;
        let data: Option<Vec<u8>> = conn.get(redis_key).await?;
        data.map(|bytes| self.codec.decode(&bytes)).transpose()
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get_active(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .read(self.active_key(key))
            .await?
            .filter(|entry| entry.is_active(now)))
    }

    async fn get_expired(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .read(self.entry_key(key))
            .await?
            .filter(|entry| entry.is_servable(now)))
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let bytes = self.codec.encode(&entry)?;
        let active_ms = window_millis(entry.created_at, entry.active_until);
        let stale_ms = window_millis(entry.created_at, entry.stale_until);

        let mut conn = self.connection.lock().await;
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.active_key(&entry.key))
            .arg(bytes.as_ref())
            .arg("PX")
            .arg(active_ms)
            .ignore()
            .cmd("SET")
            .arg(self.entry_key(&entry.key))
            .arg(bytes.as_ref())
            .arg("PX")
            .arg(stale_ms)
            .ignore()
            .cmd("ZADD")
            .arg(self.index_key())
            .arg(to_millis(entry.created_at))
            .arg(&entry.key)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.lock().await;
        let _: () = conn.del(self.active_key(key)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.lock().await;
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.active_key(key))
            .arg(self.entry_key(key))
            .ignore()
            .cmd("ZREM")
            .arg(self.index_key())
            .arg(key)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn try_acquire(
        &self,
        key: &str,
        _now: SystemTime,
        lease: Duration,
    ) -> Result<Option<LockToken>, CacheError> {
        let token = LockToken::new();
        let lease_ms = lease.as_millis().clamp(1, u64::MAX as u128) as u64;

        let mut conn = self.connection.lock().await;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.map(|_| token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<(), CacheError> {
        let mut conn = self.connection.lock().await;
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.lock_key(key))
            .arg(token.as_str())
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let keys: Vec<String> = {
            let mut conn = self.connection.lock().await;
            conn.zrevrange(self.index_key(), 0, -1).await?
        };

        let mut entries = Vec::with_capacity(keys.len());
        let mut gone = Vec::new();
        for key in keys {
            match self.read(self.entry_key(&key)).await? {
                Some(entry) => entries.push(entry),
                None => gone.push(key),
            }
        }

        if !gone.is_empty() {
            let mut conn = self.connection.lock().await;
            let _: () = conn.zrem(self.index_key(), gone).await?;
        }
        Ok(entries)
    }
}

fn window_millis(from: SystemTime, until: SystemTime) -> u64 {
    until
        .duration_since(from)
        .unwrap_or_default()
        .as_millis()
        .clamp(1, u64::MAX as u128) as u64
}
