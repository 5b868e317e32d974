use http::header::{CACHE_CONTROL, PRAGMA};
use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use std::sync::Arc;

/// Type alias for the method predicate function
type MethodPredicateFn = Arc<dyn Fn(&Method) -> bool + Send + Sync>;

/// Eligibility rules applied by the response cache.
///
/// Only idempotent reads are looked up, and only 2xx responses without a
/// `private`, `no-store` or `no-cache` directive are stored. Policies are
/// cheap to clone and immutable; the `with_*` helpers return new copies.
#[derive(Clone)]
pub struct ResponsePolicy {
    method_predicate: Option<MethodPredicateFn>,
    respect_request_cache_control: bool,
    max_body_size: Option<usize>,
}

impl fmt::Debug for ResponsePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponsePolicy")
            .field("custom_method_predicate", &self.method_predicate.is_some())
            .field(
                "respect_request_cache_control",
                &self.respect_request_cache_control,
            )
            .field("max_body_size", &self.max_body_size)
            .finish()
    }
}

impl ResponsePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Determines whether the request method is cacheable.
    pub fn should_cache_method(&self, method: &Method) -> bool {
        if let Some(predicate) = &self.method_predicate {
            predicate(method)
        } else {
            matches!(method, &Method::GET | &Method::HEAD)
        }
    }

    /// Only success-class responses are ever stored or served from storage.
    pub fn is_cacheable_status(&self, status: StatusCode) -> bool {
        status.is_success()
    }

    /// Whether the request asked to skip the cache entirely.
    pub fn request_bypasses(&self, headers: &HeaderMap) -> bool {
        self.respect_request_cache_control && cache_control_disallows(headers)
    }

    /// Whether the response forbids shared storage.
    pub fn response_forbids_storage(&self, headers: &HeaderMap) -> bool {
        cache_control_disallows(headers)
    }

    /// Whether a body of `len` bytes may be stored.
    pub fn fits(&self, len: usize) -> bool {
        self.max_body_size.map_or(true, |max| len <= max)
    }

    pub fn respect_request_cache_control(&self) -> bool {
        self.respect_request_cache_control
    }

    pub fn max_body_size(&self) -> Option<usize> {
        self.max_body_size
    }

    pub fn with_method_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Method) -> bool + Send + Sync + 'static,
    {
        self.method_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_respect_request_cache_control(mut self, enabled: bool) -> Self {
        self.respect_request_cache_control = enabled;
        self
    }

    pub fn with_max_body_size(mut self, size: Option<usize>) -> Self {
        self.max_body_size = size;
        self
    }
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            method_predicate: None,
            respect_request_cache_control: true,
            max_body_size: None,
        }
    }
}

/// Detects `no-store`, `no-cache` or `private` in `Cache-Control`, or a
/// `Pragma: no-cache`.
pub fn cache_control_disallows(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .any(|token| {
            let directive = token.split('=').next().unwrap_or_default().trim();
            matches!(directive, "no-store" | "no-cache" | "private")
        })
        || headers
            .get(PRAGMA)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase().contains("no-cache"))
            .unwrap_or(false)
}
