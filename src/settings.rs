use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CacheError;
use crate::logging::LoggingConfig;

/// Seconds a result stays active unless overridden.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Seconds an expired result stays servable as a fallback.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

/// Seconds a refresh lock is held before it counts as abandoned.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(360);

/// Timing configuration shared by the function and response wrappers.
///
/// Windows have whole-second granularity. The `with_*` builders round any
/// sub-second remainder up, so `500ms` becomes one second and `1500ms` two.
///
/// Settings deserialize from any serde source with every field optional, so
/// an application can keep them next to the rest of its configuration:
///
/// ```
/// use update_cache::settings::CacheSettings;
///
/// let settings: CacheSettings = serde_json::from_str(r#"{ "timeout_secs": 60 }"#).unwrap();
/// assert_eq!(settings.timeout().as_secs(), 60);
/// assert_eq!(settings.grace().as_secs(), 86_400);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub timeout_secs: u64,
    pub grace_secs: u64,
    pub lease_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            grace_secs: DEFAULT_GRACE.as_secs(),
            lease_secs: DEFAULT_LEASE.as_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CacheSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time until a result moves from active to stale.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Time a stale result remains servable after the active window.
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// Time a refresh lock lives before another caller may take it over.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = whole_secs(timeout);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace_secs = whole_secs(grace);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_secs = whole_secs(lease);
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Rejects settings that would break `stale_until > active_until > created_at`.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.timeout_secs == 0 {
            return Err(CacheError::Settings("timeout must be at least one second".into()));
        }
        if self.grace_secs == 0 {
            return Err(CacheError::Settings("grace must be at least one second".into()));
        }
        if self.lease_secs == 0 {
            return Err(CacheError::Settings("lease must be at least one second".into()));
        }
        Ok(())
    }
}

fn whole_secs(duration: Duration) -> u64 {
    let rounded = u64::from(duration.subsec_nanos() > 0);
    duration.as_secs().saturating_add(rounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = CacheSettings::default();
        assert_eq!(settings.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(settings.grace(), DEFAULT_GRACE);
        assert_eq!(settings.lease(), DEFAULT_LEASE);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_windows_are_rejected() {
        let zero_timeout = CacheSettings::new().with_timeout(Duration::ZERO);
        assert!(matches!(zero_timeout.validate(), Err(CacheError::Settings(_))));

        let zero_grace = CacheSettings::new().with_grace(Duration::ZERO);
        assert!(zero_grace.validate().is_err());

        let zero_lease = CacheSettings::new().with_lease(Duration::ZERO);
        assert!(zero_lease.validate().is_err());
    }

    #[test]
    fn sub_second_windows_round_up() {
        let settings = CacheSettings::new()
            .with_timeout(Duration::from_millis(500))
            .with_grace(Duration::from_millis(1500))
            .with_lease(Duration::from_secs(2));
        assert_eq!(settings.timeout(), Duration::from_secs(1));
        assert_eq!(settings.grace(), Duration::from_secs(2));
        assert_eq!(settings.lease(), Duration::from_secs(2));
        assert!(settings.validate().is_ok());

        let huge = CacheSettings::new().with_timeout(Duration::MAX);
        assert_eq!(huge.timeout_secs, u64::MAX);
    }

    #[test]
    fn deserializes_partial_documents() {
        let settings: CacheSettings =
            serde_json::from_str(r#"{ "grace_secs": 30, "logging": { "hash_keys": true } }"#)
                .expect("valid settings");
        assert_eq!(settings.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(settings.grace(), Duration::from_secs(30));
        assert!(settings.logging().enabled);
        assert!(settings.logging().hash_keys);
    }
}
