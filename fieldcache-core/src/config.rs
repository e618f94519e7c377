//! Configuration types

use crate::error::{ConfigError, FieldCacheError, FieldCacheResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default freshness for responses that carry no cache metadata.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Default upper bound on a single API fetch.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// What a failed refresh hands back alongside its error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePayload {
    /// The error only.
    Empty,
    /// The error plus whatever was cached when the request started.
    #[default]
    CachedSnapshot,
}

/// Cache behavior knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Freshness assigned to fields fetched without cache metadata.
    pub default_ttl: Duration,
    /// Upper bound on a single fetch; `None` waits indefinitely.
    pub fetch_timeout: Option<Duration>,
    /// Data attached to failure events.
    pub failure_payload: FailurePayload,
    /// Send the stored entity tag when refreshing fields that are all stale.
    pub revalidate_with_validator: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            fetch_timeout: Some(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)),
            failure_payload: FailurePayload::default(),
            revalidate_with_validator: true,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `FIELDCACHE_DEFAULT_TTL_SECS`: Freshness of untagged responses (default: 300)
    /// - `FIELDCACHE_FETCH_TIMEOUT_SECS`: Fetch timeout, `0` disables it (default: 30)
    /// - `FIELDCACHE_FAILURE_PAYLOAD`: `empty` or `cached` (default: cached)
    /// - `FIELDCACHE_REVALIDATE`: Whether to send entity tags (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key/value source using the same variable
    /// names and fallbacks as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default_ttl = Duration::from_secs(
            lookup("FIELDCACHE_DEFAULT_TTL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_TTL_SECS),
        );

        let fetch_timeout = lookup("FIELDCACHE_FETCH_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
        let fetch_timeout = (fetch_timeout > 0).then(|| Duration::from_secs(fetch_timeout));

        let failure_payload = match lookup("FIELDCACHE_FAILURE_PAYLOAD")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Some("empty") => FailurePayload::Empty,
            _ => FailurePayload::CachedSnapshot,
        };

        let revalidate_with_validator = lookup("FIELDCACHE_REVALIDATE")
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            default_ttl,
            fetch_timeout,
            failure_payload,
            revalidate_with_validator,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_failure_payload(mut self, payload: FailurePayload) -> Self {
        self.failure_payload = payload;
        self
    }

    pub fn with_revalidation(mut self, enabled: bool) -> Self {
        self.revalidate_with_validator = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - default_ttl is positive
    /// - fetch_timeout, when set, is positive
    pub fn validate(&self) -> FieldCacheResult<()> {
        if self.default_ttl.is_zero() {
            return Err(FieldCacheError::Config(ConfigError::InvalidValue {
                field: "default_ttl".to_string(),
                value: format!("{:?}", self.default_ttl),
                reason: "default_ttl must be positive".to_string(),
            }));
        }

        if let Some(timeout) = self.fetch_timeout {
            if timeout.is_zero() {
                return Err(FieldCacheError::Config(ConfigError::InvalidValue {
                    field: "fetch_timeout".to_string(),
                    value: format!("{:?}", timeout),
                    reason: "fetch_timeout must be positive; use None to disable".to_string(),
                }));
            }
        }

        Ok(())
    }
}
