use thiserror::Error;

/// Errors raised by the caching machinery itself.
///
/// None of these ever reach the caller of a cached function or service: reads
/// fail open to a recompute, writes are logged and dropped, and a refresh that
/// cannot be dispatched simply releases its lock.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("unknown cache backend `{0}`")]
    UnknownBackend(String),

    #[error("invalid cache settings: {0}")]
    Settings(String),

    #[cfg(feature = "redis-backend")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}
