//! Re-exports for consumers who prefer a single import.
//!
//! ```no_run
//! use update_cache::prelude::*;
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # fn build() -> Result<(), CacheError> {
//! let layer = CacheLayer::builder(Arc::new(InMemoryBackend::new(128)))
//!     .timeout(Duration::from_secs(30))
//!     .build()?;
//! # drop(layer);
//! # Ok(())
//! # }
//! ```

pub use crate::admin::{CacheAdmin, EntryState, EntrySummary};
pub use crate::backend::dummy::DummyBackend;
pub use crate::backend::memory::InMemoryBackend;
#[cfg(feature = "redis-backend")]
pub use crate::backend::redis::RedisBackend;
pub use crate::backend::{CacheBackend, CacheEntry};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::coordinator::{Computed, Lookup, RefreshCoordinator};
#[cfg(feature = "redis-backend")]
pub use crate::dispatch::RedisQueue;
pub use crate::dispatch::{
    deferred, ChannelQueue, DeferredDispatcher, DeferredJobs, DeferredLayer, Dispatcher, JobQueue,
    JobReceiver, JobRegistry, JobSource, JobTarget, QueueDispatcher, QueuedJob, RefreshHandler,
    RefreshJob, Worker, WorkerHandle,
};
pub use crate::error::CacheError;
pub use crate::function::{FunctionCache, FunctionCacheBuilder};
pub use crate::key::KeyBuilder;
pub use crate::layer::{BoxError, CacheLayer, CacheLayerBuilder, CacheService, ResponseRefresher};
pub use crate::lock::LockToken;
pub use crate::logging::{CacheEvent, CacheEventType, LoggingConfig};
pub use crate::policy::ResponsePolicy;
pub use crate::registry::BackendRegistry;
pub use crate::response::{CachedResponse, RequestSnapshot};
pub use crate::settings::CacheSettings;
