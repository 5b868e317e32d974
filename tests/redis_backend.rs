#![cfg(feature = "redis-backend")]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use redis::Client;
use update_cache::prelude::*;

async fn backend() -> Option<RedisBackend> {
    let redis_url = match std::env::var("REDIS_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping redis integration test: set REDIS_URL");
            return None;
        }
    };

    let client = Client::open(redis_url).ok()?;
    let manager = client.get_connection_manager().await.ok()?;
    let namespace = format!("update_cache_test:{}", uuid::Uuid::new_v4());
    Some(RedisBackend::new(manager).with_namespace(namespace))
}

fn entry(key: &str, created_at: SystemTime) -> CacheEntry {
    CacheEntry::new(
        key,
        Bytes::from_static(b"payload"),
        created_at,
        Duration::from_secs(60),
        Duration::from_secs(60),
    )
}

#[tokio::test]
async fn invalidate_and_delete_drive_both_views() {
    let Some(backend) = backend().await else {
        return;
    };
    let now = SystemTime::now();

    backend.set(entry("report", now)).await.unwrap();
    assert!(backend.get_active("report", now).await.unwrap().is_some());
    assert!(backend.get_expired("report", now).await.unwrap().is_some());

    backend.invalidate("report").await.unwrap();
    assert!(backend.get_active("report", now).await.unwrap().is_none());
    let stale = backend.get_expired("report", now).await.unwrap().unwrap();
    assert_eq!(stale.payload, Bytes::from_static(b"payload"));

    backend.delete("report").await.unwrap();
    assert!(backend.get_expired("report", now).await.unwrap().is_none());
    assert!(backend.entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn entries_are_listed_newest_first() {
    let Some(backend) = backend().await else {
        return;
    };
    let now = SystemTime::now();

    backend.set(entry("older", now - Duration::from_secs(5))).await.unwrap();
    backend.set(entry("newer", now)).await.unwrap();

    let keys: Vec<String> = backend
        .entries()
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.key)
        .collect();
    assert_eq!(keys, ["newer", "older"]);
}

#[tokio::test]
async fn lease_is_exclusive_until_released() {
    let Some(backend) = backend().await else {
        return;
    };
    let now = SystemTime::now();
    let lease = Duration::from_secs(30);

    let token = backend
        .try_acquire("report", now, lease)
        .await
        .unwrap()
        .expect("first caller wins");
    assert!(backend.try_acquire("report", now, lease).await.unwrap().is_none());

    backend.release("report", &LockToken::new()).await.unwrap();
    assert!(backend.try_acquire("report", now, lease).await.unwrap().is_none());

    backend.release("report", &token).await.unwrap();
    assert!(backend.try_acquire("report", now, lease).await.unwrap().is_some());
}

#[tokio::test]
async fn function_cache_round_trip() {
    let Some(backend) = backend().await else {
        return;
    };

    let cache = FunctionCache::builder("tests::redis_double", |n: u64| async move {
        Ok::<_, std::convert::Infallible>(n * 2)
    })
    .backend(Arc::new(backend.clone()))
    .build()
    .unwrap();

    assert_eq!(cache.call(21).await.unwrap(), 42);
    let key = cache.key_for(&21).unwrap();
    assert!(backend
        .get_active(&key, SystemTime::now())
        .await
        .unwrap()
        .is_some());
}

async fn queue(poll_timeout: Duration) -> Option<RedisQueue> {
    let redis_url = std::env::var("REDIS_URL").ok()?;
    let client = Client::open(redis_url).ok()?;
    let name = format!("update_cache_test:queue:{}", uuid::Uuid::new_v4());
    let queue = RedisQueue::connect(&client, name).await.ok()?;
    Some(queue.with_poll_timeout(poll_timeout))
}

fn queued(key: &str) -> QueuedJob {
    QueuedJob {
        key: key.to_owned(),
        token: LockToken::new(),
        target: JobTarget::new("tests::handler", serde_json::json!({ "id": 7 })),
    }
}

#[tokio::test]
async fn redis_queue_carries_jobs() {
    let Some(queue) = queue(Duration::from_secs(1)).await else {
        return;
    };

    let job = queued("report");
    queue.push(job.clone()).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 1);

    let popped = queue.pop().await.unwrap().expect("job available");
    assert_eq!(popped, job);
    assert!(queue.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn push_does_not_wait_behind_a_blocked_pop() {
    let Some(queue) = queue(Duration::from_secs(5)).await else {
        return;
    };

    let mut worker = queue.clone();
    let popping = tokio::spawn(async move { worker.next().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    queue.push(queued("report")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let popped = tokio::time::timeout(Duration::from_secs(5), popping)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(popped.expect("job delivered").key, "report");
}
