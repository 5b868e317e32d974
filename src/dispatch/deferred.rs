//! Run refresh jobs once the triggering unit of work completes.
//!
//! Jobs enqueued inside [`scope`] are collected in a task-local list rather
//! than started, so a refresh never competes with the request that spotted
//! the stale entry. The caller decides what happens to them afterwards:
//! [`DeferredJobs::run`] awaits them in order, [`DeferredJobs::spawn`] hands
//! them to the runtime. [`DeferredLayer`] does the latter for every request a
//! tower service handles, after the response has been produced.
//!
//! Outside any scope the dispatcher spawns the job on the current tokio
//! runtime straight away. With no runtime to spawn on, `enqueue` fails with
//! [`CacheError::Dispatch`] and the caller releases the lock it was holding.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tower::{Layer, Service};

use super::{Dispatcher, RefreshJob};
use crate::error::CacheError;

type Pending = Arc<Mutex<Vec<BoxFuture<'static, ()>>>>;

tokio::task_local! {
    static DEFERRED: Pending;
}

/// The default [`Dispatcher`]: in-process, after the current unit of work.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeferredDispatcher;

impl DeferredDispatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dispatcher for DeferredDispatcher {
    async fn enqueue(&self, job: RefreshJob) -> Result<(), CacheError> {
        match DEFERRED.try_with(Arc::clone) {
            Ok(pending) => pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(job.into_task()),
            Err(_) => {
                let handle = Handle::try_current().map_err(|err| {
                    CacheError::Dispatch(format!("cannot spawn refresh of `{}`: {err}", job.key()))
                })?;
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %job.key(), "no deferred scope active, spawning refresh");
                handle.spawn(job.into_task());
            }
        }
        Ok(())
    }
}

/// Jobs collected by a [`scope`], not yet started.
#[must_use = "deferred jobs do nothing unless run or spawned"]
pub struct DeferredJobs {
    jobs: Vec<BoxFuture<'static, ()>>,
}

impl DeferredJobs {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Runs every job to completion, in the order they were enqueued.
    pub async fn run(self) {
        for job in self.jobs {
            job.await;
        }
    }

    /// Hands every job to the tokio runtime.
    pub fn spawn(self) {
        for job in self.jobs {
            tokio::spawn(job);
        }
    }
}

impl std::fmt::Debug for DeferredJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredJobs")
            .field("len", &self.jobs.len())
            .finish()
    }
}

/// Drives `fut` with a fresh deferred list and returns what it collected.
///
/// Scopes nest: jobs belong to the innermost scope they were enqueued in.
pub async fn scope<F>(fut: F) -> (F::Output, DeferredJobs)
where
    F: Future,
{
    let pending: Pending = Arc::default();
    let output = DEFERRED.scope(Arc::clone(&pending), fut).await;
    let jobs = std::mem::take(&mut *pending.lock().unwrap_or_else(PoisonError::into_inner));
    (output, DeferredJobs { jobs })
}

/// Drives `fut`, then runs the refreshes it deferred before returning.
pub async fn run<F>(fut: F) -> F::Output
where
    F: Future,
{
    let (output, jobs) = scope(fut).await;
    jobs.run().await;
    output
}

/// Tower layer that defers refreshes until each response has been produced.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeferredLayer;

impl DeferredLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for DeferredLayer {
    type Service = DeferredService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeferredService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct DeferredService<S> {
    inner: S,
}

impl<S, R> Service<R> for DeferredService<S>
where
    S: Service<R>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        let fut = self.inner.call(req);
        Box::pin(async move {
            let (result, jobs) = scope(fut).await;
            if !jobs.is_empty() {
                #[cfg(feature = "tracing")]
                tracing::debug!(jobs = jobs.len(), "starting deferred refreshes");
                jobs.spawn();
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockToken;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::{service_fn, ServiceExt};

    fn counting_job(counter: &Arc<AtomicUsize>) -> RefreshJob {
        let counter = Arc::clone(counter);
        RefreshJob::new(
            "key".into(),
            LockToken::new(),
            None,
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn jobs_wait_for_the_scope_to_finish() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = DeferredDispatcher::new();

        let (seen_inside, jobs) = scope(async {
            dispatcher.enqueue(counting_job(&counter)).await.unwrap();
            dispatcher.enqueue(counting_job(&counter)).await.unwrap();
            counter.load(Ordering::SeqCst)
        })
        .await;

        assert_eq!(seen_inside, 0);
        assert_eq!(jobs.len(), 2);
        jobs.run().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn nested_scopes_keep_their_own_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = DeferredDispatcher::new();

        let (inner, outer) = scope(async {
            dispatcher.enqueue(counting_job(&counter)).await.unwrap();
            let ((), inner) = scope(async {
                dispatcher.enqueue(counting_job(&counter)).await.unwrap();
                dispatcher.enqueue(counting_job(&counter)).await.unwrap();
            })
            .await;
            inner
        })
        .await;

        assert_eq!(inner.len(), 2);
        assert_eq!(outer.len(), 1);
    }

    #[tokio::test]
    async fn outside_a_scope_jobs_are_spawned() {
        let counter = Arc::new(AtomicUsize::new(0));
        DeferredDispatcher::new()
            .enqueue(counting_job(&counter))
            .await
            .unwrap();

        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("spawned job never ran");
    }

    #[test]
    fn without_a_runtime_enqueue_reports_a_dispatch_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = DeferredDispatcher::new();
        let mut enqueue = std::pin::pin!(dispatcher.enqueue(counting_job(&counter)));
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());

        let result = loop {
            if let Poll::Ready(result) = enqueue.as_mut().poll(&mut cx) {
                break result;
            }
        };
        assert!(matches!(result, Err(CacheError::Dispatch(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn layer_runs_jobs_after_the_response() {
        let counter = Arc::new(AtomicUsize::new(0));
        let job_counter = Arc::clone(&counter);
        let service = DeferredLayer::new().layer(service_fn(move |_req: ()| {
            let counter = Arc::clone(&job_counter);
            async move {
                DeferredDispatcher::new()
                    .enqueue(counting_job(&counter))
                    .await
                    .unwrap();
                Ok::<_, std::convert::Infallible>(counter.load(Ordering::SeqCst))
            }
        }));

        let seen = service.oneshot(()).await.unwrap();
        assert_eq!(seen, 0);

        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deferred job never ran");
    }
}
