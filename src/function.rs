//! Stale-while-revalidate caching for async functions.
//!
//! ```
//! use update_cache::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let lengths = FunctionCache::builder("app::lengths", |word: String| async move {
//!     Ok::<_, std::io::Error>(word.len())
//! })
//! .build()?;
//!
//! assert_eq!(lengths.call("cache".to_owned()).await?, 5);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::memory::InMemoryBackend;
use crate::backend::CacheBackend;
use crate::clock::Clock;
use crate::coordinator::{Computed, RefreshCoordinator};
use crate::dispatch::{Dispatcher, JobTarget, QueuedJob, RefreshHandler};
use crate::error::CacheError;
use crate::key::KeyBuilder;
use crate::logging::{CacheEvent, CacheEventType, LoggingConfig};
use crate::registry::{BackendRegistry, DEFAULT_CAPACITY};
use crate::settings::CacheSettings;

type CachedFn<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// An async function wrapped with a cache.
///
/// The cache key is the function's identity plus its serialized arguments,
/// so the identity must be unique per function and stable across processes
/// that share a backend. Cloning is cheap.
pub struct FunctionCache<A, T, E> {
    inner: Arc<Inner<A, T, E>>,
}

struct Inner<A, T, E> {
    identity: String,
    func: CachedFn<A, T, E>,
    coordinator: RefreshCoordinator,
}

impl<A, T, E> Clone for FunctionCache<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, E> FunctionCache<A, T, E>
where
    A: Serialize + Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    pub fn builder<F, Fut>(identity: impl Into<String>, func: F) -> FunctionCacheBuilder<A, T, E>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let func: CachedFn<A, T, E> =
            Arc::new(move |args| -> BoxFuture<'static, Result<T, E>> { Box::pin(func(args)) });
        FunctionCacheBuilder::new(identity.into(), func)
    }

    /// Returns the cached result for `args`, computing it on a cold miss.
    ///
    /// Arguments that cannot be turned into a key skip the cache and call
    /// the function directly.
    pub async fn call(&self, args: A) -> Result<T, E> {
        let identity = self.inner.identity.as_str();
        let keyed = serde_json::to_value(&args)
            .map_err(|err| CacheError::Codec(err.to_string()))
            .and_then(|payload| Ok((KeyBuilder::function_value(identity, &payload)?, payload)));
        let (key, payload) = match keyed {
            Ok(keyed) => keyed,
            Err(err) => {
                CacheEvent::new(CacheEventType::Bypass, identity)
                    .with_error(err)
                    .log(self.logging());
                return (self.inner.func)(args).await;
            }
        };

        let target = self
            .inner
            .coordinator
            .queues_jobs()
            .then(|| JobTarget::new(identity, payload));
        let func = Arc::clone(&self.inner.func);
        self.inner
            .coordinator
            .resolve(&key, target, move || async move {
                func(args).await.map(Computed::Cache)
            })
            .await
    }

    /// Cache key used for `args`.
    pub fn key_for(&self, args: &A) -> Result<String, CacheError> {
        KeyBuilder::function(&self.inner.identity, args)
    }

    /// Drops the active view for `args`; the next call refreshes in the
    /// background while serving the old result.
    pub async fn invalidate(&self, args: &A) -> Result<(), CacheError> {
        let key = self.key_for(args)?;
        self.inner.coordinator.backend().invalidate(&key).await
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    fn logging(&self) -> &LoggingConfig {
        self.inner.coordinator.settings().logging()
    }
}

#[async_trait]
impl<A, T, E> RefreshHandler for FunctionCache<A, T, E>
where
    A: Serialize + DeserializeOwned + Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn name(&self) -> &str {
        &self.inner.identity
    }

    async fn refresh(&self, job: QueuedJob) -> Result<(), CacheError> {
        let coordinator = &self.inner.coordinator;
        let args: A = match serde_json::from_value(job.target.payload) {
            Ok(args) => args,
            Err(err) => {
                coordinator.release(&job.key, &job.token).await;
                return Err(CacheError::Codec(err.to_string()));
            }
        };

        let func = Arc::clone(&self.inner.func);
        coordinator
            .run_refresh(&job.key, &job.token, move || async move {
                func(args).await.map(Computed::Cache)
            })
            .await;
        Ok(())
    }
}

impl<A, T, E> fmt::Debug for FunctionCache<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCache")
            .field("identity", &self.inner.identity)
            .field("coordinator", &self.inner.coordinator)
            .finish()
    }
}

/// Builder for [`FunctionCache`].
pub struct FunctionCacheBuilder<A, T, E> {
    identity: String,
    func: CachedFn<A, T, E>,
    settings: CacheSettings,
    backend: Option<Arc<dyn CacheBackend>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl<A, T, E> FunctionCacheBuilder<A, T, E>
where
    A: Serialize + Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn new(identity: String, func: CachedFn<A, T, E>) -> Self {
        Self {
            identity,
            func,
            settings: CacheSettings::default(),
            backend: None,
            dispatcher: None,
            clock: None,
        }
    }

    /// Replaces all timing settings at once.
    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings = self.settings.with_timeout(timeout);
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.settings = self.settings.with_grace(grace);
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.settings = self.settings.with_lease(lease);
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.settings = self.settings.with_logging(logging);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Uses the backend registered under `name`.
    pub fn backend_named(self, registry: &BackendRegistry, name: &str) -> Result<Self, CacheError> {
        let backend = registry.get(name)?;
        Ok(self.backend(backend))
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<FunctionCache<A, T, E>, CacheError> {
        self.settings.validate()?;

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(InMemoryBackend::new(DEFAULT_CAPACITY)));
        let mut coordinator = RefreshCoordinator::new(backend).with_settings(self.settings);
        if let Some(dispatcher) = self.dispatcher {
            coordinator = coordinator.with_dispatcher(dispatcher);
        }
        if let Some(clock) = self.clock {
            coordinator = coordinator.with_clock(clock);
        }

        Ok(FunctionCache {
            inner: Arc::new(Inner {
                identity: self.identity,
                func: self.func,
                coordinator,
            }),
        })
    }
}
