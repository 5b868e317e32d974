//! Refresh job dispatch.
//!
//! When the coordinator wins the refresh lock for a stale key it packages the
//! recomputation into a [`RefreshJob`] and hands it to a [`Dispatcher`]:
//!
//! - [`deferred::DeferredDispatcher`] runs the job in-process once the
//!   triggering unit of work has finished. This is the default.
//! - [`queue::QueueDispatcher`] submits the job's serialized form to an
//!   external work queue, where a [`queue::Worker`] re-invokes the registered
//!   callable out of process.
//!
//! Whatever the dispatcher, the job (or the worker running it) releases the
//! refresh lock on every exit path.

pub mod deferred;
pub mod queue;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CacheError;
use crate::lock::LockToken;

pub use deferred::{DeferredDispatcher, DeferredJobs, DeferredLayer};
#[cfg(feature = "redis-backend")]
pub use queue::RedisQueue;
pub use queue::{
    ChannelQueue, JobQueue, JobReceiver, JobRegistry, JobSource, QueueDispatcher,
    RefreshHandler, Worker, WorkerHandle,
};

/// Reference to a registered callable plus the input to re-invoke it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTarget {
    pub name: String,
    pub payload: serde_json::Value,
}

impl JobTarget {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Serialized form of a refresh job, as it travels through a work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub key: String,
    pub token: LockToken,
    pub target: JobTarget,
}

/// A pending recomputation for one key.
///
/// Carries both the in-process task (recompute, store, release) and, when the
/// wrapper is registered for out-of-process execution, the [`JobTarget`] that
/// lets a worker redo the same work from scratch.
pub struct RefreshJob {
    key: String,
    token: LockToken,
    target: Option<JobTarget>,
    task: BoxFuture<'static, ()>,
}

impl RefreshJob {
    pub fn new(
        key: String,
        token: LockToken,
        target: Option<JobTarget>,
        task: BoxFuture<'static, ()>,
    ) -> Self {
        Self {
            key,
            token,
            target,
            task,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn target(&self) -> Option<&JobTarget> {
        self.target.as_ref()
    }

    /// The in-process task.
    pub fn into_task(self) -> BoxFuture<'static, ()> {
        self.task
    }

    /// The queueable form, dropping the in-process task.
    pub fn into_queued(self) -> Option<QueuedJob> {
        let Self {
            key, token, target, ..
        } = self;
        target.map(|target| QueuedJob { key, token, target })
    }
}

impl fmt::Debug for RefreshJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshJob")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Submits refresh jobs for execution.
///
/// `enqueue` must return promptly: it either schedules the job or reports
/// that it could not, it never runs the recomputation inline.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn enqueue(&self, job: RefreshJob) -> Result<(), CacheError>;

    /// Whether jobs leave the process and therefore need a [`JobTarget`].
    ///
    /// Wrappers skip building targets when this is `false`.
    fn queues_jobs(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn into_queued_requires_a_target() {
        let anonymous = RefreshJob::new(
            "key".into(),
            LockToken::new(),
            None,
            Box::pin(async {}),
        );
        assert!(anonymous.into_queued().is_none());

        let token = LockToken::new();
        let named = RefreshJob::new(
            "key".into(),
            token.clone(),
            Some(JobTarget::new("app::strings", json!([1]))),
            Box::pin(async {}),
        );
        let queued = named.into_queued().expect("queued job");
        assert_eq!(queued.key, "key");
        assert_eq!(queued.token, token);
        assert_eq!(queued.target.name, "app::strings");
        assert_eq!(queued.target.payload, json!([1]));
    }
}
