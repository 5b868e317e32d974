//! Stale-while-revalidate decision logic.
//!
//! Every wrapped invocation is classified against one snapshot of the clock:
//!
//! | state            | condition                                | outcome                         |
//! |------------------|------------------------------------------|---------------------------------|
//! | fresh            | active entry exists                      | serve it                        |
//! | stale, unlocked  | expired entry exists, lock acquired      | serve it, dispatch one refresh  |
//! | stale, locked    | expired entry exists, lock held elsewhere| serve it                        |
//! | cold             | nothing servable                         | compute inline, store, return   |
//!
//! Cache faults never reach the caller. A failed read counts as a miss, a
//! failed write is logged, and a refresh that cannot be dispatched releases
//! its lock so the next stale reader can try again.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{CacheBackend, CacheEntry};
use crate::clock::{self, Clock};
use crate::codec::BincodeCodec;
use crate::error::CacheError;
use crate::dispatch::{DeferredDispatcher, Dispatcher, JobTarget, RefreshJob};
use crate::lock::LockToken;
use crate::logging::{CacheEvent, CacheEventType};
use crate::settings::CacheSettings;

/// A freshly computed value and what to do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum Computed<T> {
    /// Store under the key being resolved.
    Cache(T),
    /// Store under a different key, e.g. once the response revealed its
    /// `Vary` headers.
    CacheAs(String, T),
    /// Return to the caller without storing.
    Bypass(T),
}

impl<T> Computed<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Cache(value) | Self::CacheAs(_, value) | Self::Bypass(value) => value,
        }
    }
}

/// What the backend holds for a key at a given instant.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Fresh(T),
    Stale(T),
    Cold,
}

/// Drives reads, refresh scheduling and writes for one wrapper.
///
/// Cheap to clone; clones share the backend, dispatcher and clock.
#[derive(Clone)]
pub struct RefreshCoordinator {
    backend: Arc<dyn CacheBackend>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    codec: BincodeCodec,
}

impl RefreshCoordinator {
    /// A coordinator with default settings, deferred dispatch and the
    /// system clock.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            dispatcher: Arc::new(DeferredDispatcher::new()),
            clock: clock::system(),
            settings: CacheSettings::default(),
            codec: BincodeCodec,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Whether refresh jobs are sent out of process, see
    /// [`Dispatcher::queues_jobs`].
    pub fn queues_jobs(&self) -> bool {
        self.dispatcher.queues_jobs()
    }

    /// Returns the value for `key`, computing or refreshing it as needed.
    ///
    /// `compute` runs inline only when nothing servable exists; its error is
    /// then the caller's error. On a stale hit it is moved into the refresh
    /// job instead, and `target` lets a queue worker redo it elsewhere.
    pub async fn resolve<T, E, F, Fut>(
        &self,
        key: &str,
        target: Option<JobTarget>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Computed<T>, E>> + Send + 'static,
    {
        let started = Instant::now();
        let now = self.clock.now();

        match self.lookup::<T>(key, now).await {
            Lookup::Fresh(value) => {
                self.event(CacheEventType::Hit, key)
                    .with_latency(started.elapsed())
                    .log(self.settings.logging());
                Ok(value)
            }
            Lookup::Stale(value) => {
                self.event(CacheEventType::StaleHit, key)
                    .with_latency(started.elapsed())
                    .log(self.settings.logging());
                self.schedule_refresh(key, now, target, compute).await;
                Ok(value)
            }
            Lookup::Cold => {
                self.event(CacheEventType::Miss, key)
                    .log(self.settings.logging());
                let computed = compute().await?;
                Ok(self.persist(key, computed).await)
            }
        }
    }

    /// Classifies `key` at `now`. Read and decode failures count as cold.
    pub async fn lookup<T>(&self, key: &str, now: SystemTime) -> Lookup<T>
    where
        T: DeserializeOwned,
    {
        match self.backend.get_active(key, now).await {
            Ok(Some(entry)) => {
                if let Some(value) = self.decode(&entry) {
                    return Lookup::Fresh(value);
                }
            }
            Ok(None) => {}
            Err(err) => self.read_failed(key, err),
        }

        match self.backend.get_expired(key, now).await {
            Ok(Some(entry)) => match self.decode(&entry) {
                Some(value) => Lookup::Stale(value),
                None => Lookup::Cold,
            },
            Ok(None) => Lookup::Cold,
            Err(err) => {
                self.read_failed(key, err);
                Lookup::Cold
            }
        }
    }

    /// Reads whatever is still servable for `key`, fresh or stale.
    pub async fn peek<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        match self.backend.get_expired(key, self.clock.now()).await {
            Ok(entry) => entry.and_then(|entry| self.decode(&entry)),
            Err(err) => {
                self.read_failed(key, err);
                None
            }
        }
    }

    /// Writes `value` under `key` with fresh windows. Failures are logged and
    /// reported as `false`.
    pub async fn store<T>(&self, key: &str, value: &T) -> bool
    where
        T: Serialize,
    {
        let payload = self.codec.encode(value);
        self.write(key, payload).await
    }

    /// Recomputes `key` under the lock held by `token`, stores the result on
    /// success and releases the lock whatever happens.
    ///
    /// Returns whether the recomputation succeeded. Panics inside `compute`
    /// are caught and count as failures.
    pub async fn run_refresh<T, E, F, Fut>(&self, key: &str, token: &LockToken, compute: F) -> bool
    where
        T: Serialize,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed<T>, E>>,
    {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(async move { compute().await })
            .catch_unwind()
            .await;

        let refreshed = match outcome {
            Ok(Ok(computed)) => {
                self.persist(key, computed).await;
                self.event(CacheEventType::RefreshSucceeded, key)
                    .with_latency(started.elapsed())
                    .log(self.settings.logging());
                true
            }
            Ok(Err(err)) => {
                self.event(CacheEventType::RefreshFailed, key)
                    .with_error(err)
                    .log(self.settings.logging());
                false
            }
            Err(_) => {
                self.event(CacheEventType::RefreshFailed, key)
                    .with_error("refresh panicked")
                    .log(self.settings.logging());
                false
            }
        };

        self.release(key, token).await;
        refreshed
    }

    /// Releases the refresh lock on `key`, logging a failure.
    pub async fn release(&self, key: &str, token: &LockToken) {
        if let Err(err) = self.backend.release(key, token).await {
            self.event(CacheEventType::LockFailed, key)
                .with_error(err)
                .log(self.settings.logging());
        }
    }

    async fn schedule_refresh<T, E, F, Fut>(
        &self,
        key: &str,
        now: SystemTime,
        target: Option<JobTarget>,
        compute: F,
    ) where
        T: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Computed<T>, E>> + Send + 'static,
    {
        let token = match self
            .backend
            .try_acquire(key, now, self.settings.lease())
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.event(CacheEventType::RefreshInFlight, key)
                    .log(self.settings.logging());
                return;
            }
            Err(err) => {
                self.event(CacheEventType::LockFailed, key)
                    .with_error(err)
                    .log(self.settings.logging());
                return;
            }
        };

        let coordinator = self.clone();
        let job_key = key.to_owned();
        let job_token = token.clone();
        let task = Box::pin(async move {
            coordinator.run_refresh(&job_key, &job_token, compute).await;
        });
        let job = RefreshJob::new(key.to_owned(), token.clone(), target, task);

        match self.dispatcher.enqueue(job).await {
            Ok(()) => self
                .event(CacheEventType::RefreshDispatched, key)
                .log(self.settings.logging()),
            Err(err) => {
                self.event(CacheEventType::DispatchFailed, key)
                    .with_error(err)
                    .log(self.settings.logging());
                self.release(key, &token).await;
            }
        }
    }

    async fn persist<T>(&self, key: &str, computed: Computed<T>) -> T
    where
        T: Serialize,
    {
        match computed {
            Computed::Cache(value) => {
                let payload = self.codec.encode(&value);
                self.write(key, payload).await;
                value
            }
            Computed::CacheAs(target_key, value) => {
                let payload = self.codec.encode(&value);
                self.write(&target_key, payload).await;
                value
            }
            Computed::Bypass(value) => {
                self.event(CacheEventType::Bypass, key)
                    .log(self.settings.logging());
                value
            }
        }
    }

    async fn write(&self, key: &str, payload: Result<bytes::Bytes, CacheError>) -> bool {
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                self.event(CacheEventType::StoreFailed, key)
                    .with_error(err)
                    .log(self.settings.logging());
                return false;
            }
        };

        let size = payload.len();
        let entry = CacheEntry::new(
            key,
            payload,
            self.clock.now(),
            self.settings.timeout(),
            self.settings.grace(),
        );
        match self.backend.set(entry).await {
            Ok(()) => {
                self.event(CacheEventType::Store, key)
                    .with_size(size)
                    .with_ttl(self.settings.timeout())
                    .log(self.settings.logging());
                true
            }
            Err(err) => {
                self.event(CacheEventType::StoreFailed, key)
                    .with_error(err)
                    .log(self.settings.logging());
                false
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, entry: &CacheEntry) -> Option<T> {
        match self.codec.decode(&entry.payload) {
            Ok(value) => Some(value),
            Err(err) => {
                self.read_failed(&entry.key, err);
                None
            }
        }
    }

    fn read_failed(&self, key: &str, err: impl ToString) {
        self.event(CacheEventType::ReadFailed, key)
            .with_error(err)
            .log(self.settings.logging());
    }

    fn event(&self, event_type: CacheEventType, key: &str) -> CacheEvent {
        let mut event = CacheEvent::new(event_type, key);
        event.timestamp = self.clock.now();
        event
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
