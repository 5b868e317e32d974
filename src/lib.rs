//! Update Cache
//! ============
//!
//! `update-cache` serves cached results past their freshness window while a
//! single background job recomputes them, so callers only ever wait on a
//! true cold miss. It wraps two kinds of work:
//!
//! - async functions, through [`FunctionCache`];
//! - Tower HTTP services, through [`CacheLayer`].
//!
//! Storage is pluggable ([`backend`]): an in-memory backend, a no-op backend
//! that turns caching off, and Redis behind the `redis-backend` feature.
//! Refreshes run in-process after the current request
//! ([`dispatch::deferred`]) or on a work queue drained by a
//! [`dispatch::Worker`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tower::{Service, ServiceBuilder, ServiceExt};
//! use update_cache::prelude::*;
//!
//! # async fn run() -> Result<(), BoxError> {
//! let layer = CacheLayer::builder(Arc::new(InMemoryBackend::new(1_000)))
//!     .timeout(Duration::from_secs(30))
//!     .grace(Duration::from_secs(600))
//!     .build()?;
//!
//! let mut svc = ServiceBuilder::new()
//!     .layer(DeferredLayer::new())
//!     .layer(layer)
//!     .service(tower::service_fn(|_req: http::Request<()>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(http_body_util::Full::from("ok")))
//!     }));
//!
//! let response = svc
//!     .ready()
//!     .await?
//!     .call(http::Request::new(()))
//!     .await?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod backend;
pub mod clock;
pub mod codec;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod function;
pub mod key;
pub mod layer;
pub mod lock;
pub mod logging;
pub mod policy;
pub mod prelude;
pub mod registry;
pub mod response;
pub mod settings;

pub use admin::CacheAdmin;
pub use coordinator::RefreshCoordinator;
pub use error::CacheError;
pub use function::FunctionCache;
pub use layer::{CacheLayer, CacheLayerBuilder};
pub use logging::{CacheEvent, CacheEventType, LoggingConfig};
pub use registry::BackendRegistry;
pub use settings::CacheSettings;
