//! Out-of-process refresh through a work queue.
//!
//! [`QueueDispatcher`] pushes the serialized [`QueuedJob`] onto a
//! [`JobQueue`]. A [`Worker`] pulls jobs from a [`JobSource`], looks the
//! target up in its [`JobRegistry`] and hands the job to the registered
//! [`RefreshHandler`], which recomputes, stores and releases the lock.
//!
//! Targets are resolved through an explicit registry: a job naming a callable
//! the worker does not know is logged and dropped, and its lock lapses when
//! the lease runs out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

use super::{Dispatcher, QueuedJob, RefreshJob};
use crate::error::CacheError;
use crate::logging::{CacheEvent, CacheEventType, LoggingConfig};

/// Destination for serialized refresh jobs.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn push(&self, job: QueuedJob) -> Result<(), CacheError>;
}

/// Where a [`Worker`] pulls jobs from. `None` means the source is exhausted.
#[async_trait]
pub trait JobSource: Send + 'static {
    async fn next(&mut self) -> Option<QueuedJob>;
}

/// [`Dispatcher`] that sends jobs to a [`JobQueue`].
#[derive(Clone, Debug)]
pub struct QueueDispatcher<Q> {
    queue: Q,
}

impl<Q: JobQueue> QueueDispatcher<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }
}

#[async_trait]
impl<Q: JobQueue> Dispatcher for QueueDispatcher<Q> {
    async fn enqueue(&self, job: RefreshJob) -> Result<(), CacheError> {
        let key = job.key().to_owned();
        let queued = job.into_queued().ok_or_else(|| {
            CacheError::Dispatch(format!("no registered target to refresh `{key}`"))
        })?;
        self.queue.push(queued).await
    }

    fn queues_jobs(&self) -> bool {
        true
    }
}

/// In-process bounded queue.
///
/// A full or closed channel is reported as a dispatch failure rather than
/// waited on.
#[derive(Clone, Debug)]
pub struct ChannelQueue {
    sender: mpsc::Sender<QueuedJob>,
}

/// Receiving half of a [`ChannelQueue`].
#[derive(Debug)]
pub struct JobReceiver {
    receiver: mpsc::Receiver<QueuedJob>,
}

impl ChannelQueue {
    pub fn bounded(capacity: usize) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, JobReceiver { receiver })
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn push(&self, job: QueuedJob) -> Result<(), CacheError> {
        self.sender.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(job) => {
                CacheError::Dispatch(format!("queue full, dropped refresh of `{}`", job.key))
            }
            mpsc::error::TrySendError::Closed(job) => {
                CacheError::Dispatch(format!("queue closed, dropped refresh of `{}`", job.key))
            }
        })
    }
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<QueuedJob> {
        self.receiver.recv().await
    }

    pub fn close(&mut self) {
        self.receiver.close();
    }
}

#[async_trait]
impl JobSource for JobReceiver {
    async fn next(&mut self) -> Option<QueuedJob> {
        self.recv().await
    }
}

#[cfg(feature = "redis-backend")]
pub use self::redis_queue::RedisQueue;

#[cfg(feature = "redis-backend")]
mod redis_queue {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::{AsyncCommands, Client};
    use tokio::sync::Mutex;

    use super::{JobQueue, JobSource, QueuedJob};
    use crate::error::CacheError;

    /// Redis list used as a shared work queue.
    ///
    /// Producers `LPUSH` JSON-encoded jobs, workers `BRPOP` them, so jobs are
    /// consumed in the order they were pushed.
    ///
    /// `BRPOP` holds its connection for up to the poll timeout, so pops run on
    /// a consumer connection of their own. Pushes and `len` use the producer
    /// connection and never wait behind a worker's poll.
    #[derive(Clone)]
    pub struct RedisQueue {
        producer: Arc<Mutex<ConnectionManager>>,
        consumer: Arc<Mutex<ConnectionManager>>,
        name: String,
        poll_timeout: Duration,
    }

    impl RedisQueue {
        /// `producer` and `consumer` must be distinct connections.
        pub fn new(
            producer: ConnectionManager,
            consumer: ConnectionManager,
            name: impl Into<String>,
        ) -> Self {
            Self {
                producer: Arc::new(Mutex::new(producer)),
                consumer: Arc::new(Mutex::new(consumer)),
                name: name.into(),
                poll_timeout: Duration::from_secs(1),
            }
        }

        /// Opens both connections from `client`.
        pub async fn connect(client: &Client, name: impl Into<String>) -> Result<Self, CacheError> {
            let producer = client.get_connection_manager().await?;
            let consumer = client.get_connection_manager().await?;
            Ok(Self::new(producer, consumer, name))
        }

        pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
            self.poll_timeout = timeout;
            self
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        /// Pops the oldest job, waiting up to the poll timeout.
        pub async fn pop(&self) -> Result<Option<QueuedJob>, CacheError> {
            let mut conn = self.consumer.lock().await;
            let reply: Option<(String, String)> = conn
                .brpop(&self.name, self.poll_timeout.as_secs_f64())
                .await?;
            reply
                .map(|(_, raw)| {
                    serde_json::from_str(&raw).map_err(|err| CacheError::Codec(err.to_string()))
                })
                .transpose()
        }

        pub async fn len(&self) -> Result<usize, CacheError> {
            let mut conn = self.producer.lock().await;
            Ok(conn.llen(&self.name).await?)
        }
    }

    #[async_trait]
    impl JobQueue for RedisQueue {
        async fn push(&self, job: QueuedJob) -> Result<(), CacheError> {
            let raw =
                serde_json::to_string(&job).map_err(|err| CacheError::Codec(err.to_string()))?;
            let mut conn = self.producer.lock().await;
            let _: () = conn.lpush(&self.name, raw).await?;
            Ok(())
        }
    }

    #[async_trait]
    impl JobSource for RedisQueue {
        async fn next(&mut self) -> Option<QueuedJob> {
            loop {
                match self.pop().await {
                    Ok(Some(job)) => return Some(job),
                    Ok(None) => continue,
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(queue = %self.name, error = %_err, "failed to pop refresh job");
                        tokio::time::sleep(self.poll_timeout).await;
                    }
                }
            }
        }
    }
}

/// Re-runs a named callable for a dequeued job.
///
/// Implementations recompute the value, store it and release the job's lock,
/// whether or not the recomputation succeeds.
#[async_trait]
pub trait RefreshHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn refresh(&self, job: QueuedJob) -> Result<(), CacheError>;
}

/// Callables a worker is allowed to invoke, by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn RefreshHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under its own name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn RefreshHandler>) -> &mut Self {
        self.handlers.insert(handler.name().to_owned(), handler);
        self
    }

    pub fn with(mut self, handler: Arc<dyn RefreshHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RefreshHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Consumes refresh jobs and runs them with bounded concurrency.
#[derive(Clone)]
pub struct Worker {
    registry: Arc<JobRegistry>,
    max_concurrent: usize,
    logging: LoggingConfig,
}

impl Worker {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            max_concurrent: 4,
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Runs a single job through its registered handler.
    pub async fn process(&self, job: QueuedJob) -> Result<(), CacheError> {
        let Some(handler) = self.registry.get(&job.target.name) else {
            CacheEvent::new(CacheEventType::DispatchFailed, job.key.clone())
                .with_error(format!("unknown refresh target `{}`", job.target.name))
                .log(&self.logging);
            return Err(CacheError::Dispatch(format!(
                "unknown refresh target `{}`",
                job.target.name
            )));
        };
        handler.refresh(job).await
    }

    /// Pulls jobs from `source` until it is exhausted or `shutdown` fires,
    /// then waits for the jobs already started.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, name = "refresh_worker"))]
    pub async fn run<Src>(self, mut source: Src, mut shutdown: oneshot::Receiver<()>)
    where
        Src: JobSource,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        #[cfg(feature = "tracing")]
        tracing::debug!(max_concurrent = self.max_concurrent, "refresh worker started");

        loop {
            let job = tokio::select! {
                _ = &mut shutdown => break,
                job = source.next() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(_err) = worker.process(job).await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %_err, "refresh job not completed");
                }
            });
        }

        let _ = semaphore.acquire_many(self.max_concurrent as u32).await;

        #[cfg(feature = "tracing")]
        tracing::debug!("refresh worker stopped");
    }

    /// Starts [`Worker::run`] on the runtime.
    pub fn spawn<Src>(self, source: Src) -> WorkerHandle
    where
        Src: JobSource,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(source, shutdown_rx));
        WorkerHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("registry", &self.registry)
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}

/// Handle to a spawned [`Worker`].
pub struct WorkerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stops pulling jobs and waits for the in-flight ones.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JobTarget;
    use crate::lock::LockToken;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RefreshHandler for Counting {
        fn name(&self) -> &str {
            "tests::counting"
        }

        async fn refresh(&self, _job: QueuedJob) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(target: &str) -> QueuedJob {
        QueuedJob {
            key: "key".into(),
            token: LockToken::new(),
            target: JobTarget::new(target, json!(null)),
        }
    }

    fn refresh_job(target: Option<JobTarget>) -> RefreshJob {
        RefreshJob::new("key".into(), LockToken::new(), target, Box::pin(async {}))
    }

    #[tokio::test]
    async fn dispatcher_requires_a_target() {
        let (queue, _rx) = ChannelQueue::bounded(4);
        let dispatcher = QueueDispatcher::new(queue);

        let err = dispatcher.enqueue(refresh_job(None)).await.unwrap_err();
        assert!(matches!(err, CacheError::Dispatch(_)));
    }

    #[tokio::test]
    async fn full_or_closed_channel_is_a_dispatch_failure() {
        let (queue, mut rx) = ChannelQueue::bounded(1);
        let dispatcher = QueueDispatcher::new(queue);
        let target = || Some(JobTarget::new("tests::counting", json!(null)));

        dispatcher.enqueue(refresh_job(target())).await.unwrap();
        let full = dispatcher.enqueue(refresh_job(target())).await;
        assert!(matches!(full, Err(CacheError::Dispatch(_))));

        rx.close();
        let _ = rx.recv().await;
        let closed = dispatcher.enqueue(refresh_job(target())).await;
        assert!(matches!(closed, Err(CacheError::Dispatch(_))));
    }

    #[tokio::test]
    async fn unknown_targets_are_rejected() {
        let worker = Worker::new(JobRegistry::new());
        let err = worker.process(job("tests::missing")).await.unwrap_err();
        assert!(matches!(err, CacheError::Dispatch(_)));
    }

    #[tokio::test]
    async fn worker_drains_channel_until_closed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new().with(Arc::new(Counting {
            calls: Arc::clone(&calls),
        }));
        let (queue, rx) = ChannelQueue::bounded(8);

        for _ in 0..3 {
            queue.push(job("tests::counting")).await.unwrap();
        }
        queue.push(job("tests::missing")).await.unwrap();
        drop(queue);

        let (_tx, shutdown) = oneshot::channel();
        Worker::new(registry).run(rx, shutdown).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn spawned_worker_shuts_down() {
        let (_queue, rx) = ChannelQueue::bounded(8);
        let handle = Worker::new(JobRegistry::new()).spawn(rx);
        handle.shutdown().await;
    }
}
