use std::error::Error as StdError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, Request, Response};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use tower::{Layer, Service, ServiceExt};

use crate::backend::CacheBackend;
use crate::clock::Clock;
use crate::coordinator::{Computed, RefreshCoordinator};
use crate::dispatch::{Dispatcher, JobTarget, QueuedJob, RefreshHandler};
use crate::error::CacheError;
use crate::key::{parse_vary, KeyBuilder};
use crate::logging::{CacheEvent, CacheEventType, LoggingConfig};
use crate::policy::ResponsePolicy;
use crate::registry::BackendRegistry;
use crate::response::{CachedResponse, RequestSnapshot};
use crate::settings::CacheSettings;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Stale-while-revalidate caching layer for HTTP services.
///
/// Cacheable requests (GET and HEAD unless the [`ResponsePolicy`] says
/// otherwise) are answered from the backend while fresh, answered from the
/// stale copy while a single refresh runs, and computed inline only when
/// nothing servable exists. Responses are always replayed as
/// `Response<Full<Bytes>>`, streaming bodies included.
///
/// Stale hits hand their refresh to the configured dispatcher. With the
/// default deferred dispatcher, wrap the service in
/// [`DeferredLayer`](crate::dispatch::DeferredLayer) so the refresh starts
/// once the response has been produced.
///
/// Cloning a `CacheLayer` is cheap and shares the backend.
#[derive(Clone)]
pub struct CacheLayer {
    coordinator: RefreshCoordinator,
    policy: ResponsePolicy,
    name: Option<String>,
}

/// Builder for configuring [`CacheLayer`] instances.
pub struct CacheLayerBuilder {
    backend: Arc<dyn CacheBackend>,
    settings: CacheSettings,
    policy: ResponsePolicy,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    clock: Option<Arc<dyn Clock>>,
    name: Option<String>,
}

impl CacheLayerBuilder {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            settings: CacheSettings::default(),
            policy: ResponsePolicy::default(),
            dispatcher: None,
            clock: None,
            name: None,
        }
    }

    /// Replaces the timing settings with a pre-built value.
    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets how long a stored response stays fresh.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings = self.settings.with_timeout(timeout);
        self
    }

    /// Sets how long an expired response may still be served while it is
    /// refreshed.
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

    /// Replaces the response policy with a pre-built value.
    pub fn policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn method_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Method) -> bool + Send + Sync + 'static,
    {
        self.policy = self.policy.with_method_predicate(predicate);
        self
    }

    pub fn respect_request_cache_control(mut self, enabled: bool) -> Self {
        self.policy = self.policy.with_respect_request_cache_control(enabled);
        self
    }

    pub fn max_body_size(mut self, size: Option<usize>) -> Self {
        self.policy = self.policy.with_max_body_size(size);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Registers the layer for out-of-process refresh under `name`.
    ///
    /// Refresh jobs then carry a [`RequestSnapshot`] that a worker replays
    /// through the [`ResponseRefresher`] registered under the same name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<CacheLayer, CacheError> {
        self.settings.validate()?;

        let mut coordinator =
            RefreshCoordinator::new(self.backend).with_settings(self.settings);
        if let Some(dispatcher) = self.dispatcher {
            coordinator = coordinator.with_dispatcher(dispatcher);
        }
        if let Some(clock) = self.clock {
            coordinator = coordinator.with_clock(clock);
        }

        Ok(CacheLayer {
            coordinator,
            policy: self.policy,
            name: self.name,
        })
    }
}

impl CacheLayer {
    /// Builds a cache layer with default settings and policy.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            coordinator: RefreshCoordinator::new(backend),
            policy: ResponsePolicy::default(),
            name: None,
        }
    }

    /// Returns a builder for fine-grained control over the cache.
    pub fn builder(backend: Arc<dyn CacheBackend>) -> CacheLayerBuilder {
        CacheLayerBuilder::new(backend)
    }

    /// Returns a builder over the backend registered under `name`.
    pub fn builder_named(
        registry: &BackendRegistry,
        name: &str,
    ) -> Result<CacheLayerBuilder, CacheError> {
        Ok(CacheLayerBuilder::new(registry.get(name)?))
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn policy(&self) -> &ResponsePolicy {
        &self.policy
    }

    /// Worker-side handler replaying queued refreshes through `inner`.
    ///
    /// Returns `None` unless the layer was [`named`](CacheLayerBuilder::named).
    pub fn refresher<S, ReqBody>(&self, inner: S) -> Option<ResponseRefresher<S, ReqBody>> {
        let name = self.name.clone()?;
        Some(ResponseRefresher {
            name,
            inner,
            coordinator: self.coordinator.clone(),
            policy: self.policy.clone(),
            _body: PhantomData,
        })
    }
}

impl fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("coordinator", &self.coordinator)
            .field("policy", &self.policy)
            .field("name", &self.name)
            .finish()
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            coordinator: self.coordinator.clone(),
            policy: self.policy.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CacheService<S> {
    inner: S,
    coordinator: RefreshCoordinator,
    policy: ResponsePolicy,
    name: Option<String>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CacheService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
    ReqBody: Send + 'static,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError> + Send,
{
    type Response = Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let cacheable = self.policy.should_cache_method(req.method())
            && !self.policy.request_bypasses(req.headers());

        let inner = self.inner.clone();
        let coordinator = self.coordinator.clone();
        let policy = self.policy.clone();
        let name = self.name.clone();

        Box::pin(async move {
            #[cfg(feature = "tracing")]
            tracing::debug!(method = %req.method(), uri = %req.uri(), cacheable, "cache_call");

            let base = KeyBuilder::request(req.method(), req.uri());
            if !cacheable {
                CacheEvent::new(CacheEventType::Bypass, base)
                    .log(coordinator.settings().logging());
                let response = inner.oneshot(req).await.map_err(Into::into)?;
                let (parts, body) = response.into_parts();
                let bytes = body.collect().await.map_err(Into::into)?.to_bytes();
                return Ok(Response::from_parts(parts, Full::from(bytes)));
            }

            let known_vary: Vec<String> = coordinator
                .peek(&KeyBuilder::vary_record(&base))
                .await
                .unwrap_or_default();
            let key = KeyBuilder::varied(&base, &known_vary, req.headers());
            let target = name.filter(|_| coordinator.queues_jobs()).and_then(|name| {
                let snapshot = RequestSnapshot::from_request_with_headers(&req, &known_vary);
                serde_json::to_value(snapshot)
                    .ok()
                    .map(|payload| JobTarget::new(name, payload))
            });

            let revalidation = Revalidation {
                coordinator: coordinator.clone(),
                policy,
                base,
                known_vary,
            };
            let cached = coordinator
                .resolve(&key, target, move || revalidation.fetch(inner, req))
                .await?;
            Ok(cached.into_response())
        })
    }
}

/// Everything needed to compute and classify one response.
struct Revalidation {
    coordinator: RefreshCoordinator,
    policy: ResponsePolicy,
    base: String,
    known_vary: Vec<String>,
}

impl Revalidation {
    /// Calls `inner`, drains the body and decides whether and where the
    /// response may be stored.
    async fn fetch<S, ReqBody, ResBody>(
        self,
        inner: S,
        req: Request<ReqBody>,
    ) -> Result<Computed<CachedResponse>, BoxError>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send,
        S::Future: Send,
        S::Error: Into<BoxError>,
        ResBody: Body<Data = Bytes>,
        ResBody::Error: Into<BoxError>,
    {
        let request_headers: HeaderMap = req.headers().clone();
        let response = inner.oneshot(req).await.map_err(Into::into)?;
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.map_err(Into::into)?.to_bytes();
        let cached = CachedResponse::from_parts(&parts, bytes);

        if !self.policy.is_cacheable_status(parts.status)
            || self.policy.response_forbids_storage(&parts.headers)
            || !self.policy.fits(cached.body.len())
        {
            return Ok(Computed::Bypass(cached));
        }

        let Some(vary) = parse_vary(&parts.headers) else {
            return Ok(Computed::Bypass(cached));
        };
        if vary != self.known_vary {
            self.coordinator
                .store(&KeyBuilder::vary_record(&self.base), &vary)
                .await;
        }

        let key = KeyBuilder::varied(&self.base, &vary, &request_headers);
        Ok(Computed::CacheAs(key, cached))
    }
}

/// Replays queued response refreshes through a service.
///
/// Built with [`CacheLayer::refresher`] and registered in a
/// [`JobRegistry`](crate::dispatch::JobRegistry) on the worker side.
pub struct ResponseRefresher<S, ReqBody> {
    name: String,
    inner: S,
    coordinator: RefreshCoordinator,
    policy: ResponsePolicy,
    _body: PhantomData<fn() -> ReqBody>,
}

#[async_trait]
impl<S, ReqBody, ResBody> RefreshHandler for ResponseRefresher<S, ReqBody>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
    ReqBody: Default + Send + 'static,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self, job: QueuedJob) -> Result<(), CacheError> {
        let request = serde_json::from_value::<RequestSnapshot>(job.target.payload)
            .map_err(|err| CacheError::Codec(err.to_string()))
            .and_then(|snapshot| {
                snapshot.try_into_request::<ReqBody>().ok_or_else(|| {
                    CacheError::Codec(format!("cannot rebuild request {}", snapshot.uri))
                })
            });
        let req = match request {
            Ok(req) => req,
            Err(err) => {
                self.coordinator.release(&job.key, &job.token).await;
                return Err(err);
            }
        };

        let base = KeyBuilder::request(req.method(), req.uri());
        let known_vary: Vec<String> = self
            .coordinator
            .peek(&KeyBuilder::vary_record(&base))
            .await
            .unwrap_or_default();
        let revalidation = Revalidation {
            coordinator: self.coordinator.clone(),
            policy: self.policy.clone(),
            base,
            known_vary,
        };
        let inner = self.inner.clone();
        self.coordinator
            .run_refresh(&job.key, &job.token, move || revalidation.fetch(inner, req))
            .await;
        Ok(())
    }
}

impl<S, ReqBody> fmt::Debug for ResponseRefresher<S, ReqBody> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRefresher")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use std::convert::Infallible;
    use tower::service_fn;

    #[test]
    fn cache_service_implements_clone() {
        // Compile-time check that CacheService implements Clone
        fn assert_clone<T: Clone>(_: &T) {}

        let layer = CacheLayer::new(Arc::new(InMemoryBackend::new(100)));
        let service = layer.layer(service_fn(|_req: Request<()>| async {
            Ok::<_, Infallible>(Response::new(Full::<Bytes>::from("ok")))
        }));

        assert_clone(&service);
    }

    #[test]
    fn builder_validates_settings() {
        let built = CacheLayer::builder(Arc::new(InMemoryBackend::new(100)))
            .grace(Duration::ZERO)
            .build();
        assert!(matches!(built, Err(CacheError::Settings(_))));
    }

    #[test]
    fn refresher_requires_a_name() {
        let inner = service_fn(|_req: Request<()>| async {
            Ok::<_, Infallible>(Response::new(Full::from("ok")))
        });

        let anonymous = CacheLayer::new(Arc::new(InMemoryBackend::new(100)));
        assert!(anonymous.refresher::<_, ()>(inner.clone()).is_none());

        let named = CacheLayer::builder(Arc::new(InMemoryBackend::new(100)))
            .named("site::pages")
            .build()
            .unwrap();
        let refresher = named.refresher::<_, ()>(inner).expect("named layer");
        assert_eq!(refresher.name(), "site::pages");
    }
}
