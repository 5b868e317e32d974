use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::backend::dummy::DummyBackend;
use crate::backend::memory::InMemoryBackend;
use crate::backend::CacheBackend;
use crate::error::CacheError;

/// Name of the in-memory backend every default registry carries.
pub const DEFAULT_BACKEND: &str = "default";

/// Name of the no-op backend every default registry carries.
pub const DUMMY_BACKEND: &str = "dummy";

/// Entry capacity of the default in-memory backend.
pub const DEFAULT_CAPACITY: u64 = 10_000;

/// Named cache backends, resolved when a wrapper is configured.
///
/// Cloning shares the backends themselves, so two wrappers configured from
/// the same registry and name read and write the same storage.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn CacheBackend>>,
}

impl BackendRegistry {
    /// A registry with no backends at all.
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Adds or replaces the backend stored under `name`.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn CacheBackend>) -> &mut Self {
        self.backends.insert(name.into(), backend);
        self
    }

    pub fn with(mut self, name: impl Into<String>, backend: Arc<dyn CacheBackend>) -> Self {
        self.register(name, backend);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CacheBackend>, CacheError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownBackend(name.to_owned()))
    }

    /// Every registered backend, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn CacheBackend>)> {
        let mut backends: Vec<_> = self
            .backends
            .iter()
            .map(|(name, backend)| (name.as_str(), backend))
            .collect();
        backends.sort_by(|a, b| a.0.cmp(b.0));
        backends.into_iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::empty()
            .with(
                DEFAULT_BACKEND,
                Arc::new(InMemoryBackend::new(DEFAULT_CAPACITY)),
            )
            .with(DUMMY_BACKEND, Arc::new(DummyBackend::new()))
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_memory_and_dummy() {
        let registry = BackendRegistry::default();
        assert!(registry.get(DEFAULT_BACKEND).is_ok());
        assert!(registry.get(DUMMY_BACKEND).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_names_are_errors() {
        let registry = BackendRegistry::empty();
        match registry.get("remote") {
            Err(CacheError::UnknownBackend(name)) => assert_eq!(name, "remote"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("empty registry resolved a backend"),
        }
    }

    #[test]
    fn clones_share_backends() {
        let registry = BackendRegistry::default();
        let clone = registry.clone();
        let a = registry.get(DEFAULT_BACKEND).unwrap();
        let b = clone.get(DEFAULT_BACKEND).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn iteration_is_sorted_by_name() {
        let registry = BackendRegistry::default()
            .with("alpha", Arc::new(DummyBackend::new()));
        let names: Vec<&str> = registry.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["alpha", "default", "dummy"]);
    }
}
