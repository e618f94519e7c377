//! Error types for fieldcache operations

use std::time::Duration;
use thiserror::Error;

/// Network fetch failures.
///
/// Cloneable so one outcome can be handed to every caller waiting on the
/// same in-flight fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network failure fetching {identity}: {reason}")]
    NetworkFailure { identity: String, reason: String },

    #[error("Fetch for {identity} timed out after {after:?}")]
    Timeout { identity: String, after: Duration },

    #[error("Fetch for {identity} ended without a result")]
    Abandoned { identity: String },
}

impl FetchError {
    /// Shorthand for the most common failure reported by API clients.
    pub fn network(identity: impl ToString, reason: impl Into<String>) -> Self {
        Self::NetworkFailure {
            identity: identity.to_string(),
            reason: reason.into(),
        }
    }

    /// The identity string the failed fetch targeted.
    pub fn identity(&self) -> &str {
        match self {
            Self::NetworkFailure { identity, .. }
            | Self::Timeout { identity, .. }
            | Self::Abandoned { identity } => identity,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all fieldcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldCacheError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for fieldcache operations.
pub type FieldCacheResult<T> = Result<T, FieldCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display_network() {
        let err = FetchError::network("video/x1", "connection reset");
        let msg = format!("{}", err);
        assert!(msg.contains("video/x1"));
        assert!(msg.contains("connection reset"));
        assert_eq!(err.identity(), "video/x1");
    }

    #[test]
    fn test_fetch_error_display_timeout() {
        let err = FetchError::Timeout {
            identity: "user/u2".to_string(),
            after: Duration::from_secs(5),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("5s"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "default_ttl".to_string(),
            value: "0s".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("default_ttl"));
        assert!(msg.contains("0s"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_master_error_from_variants() {
        let fetch = FieldCacheError::from(FetchError::Abandoned {
            identity: "video/x1".to_string(),
        });
        assert!(matches!(fetch, FieldCacheError::Fetch(_)));

        let config = FieldCacheError::from(ConfigError::InvalidValue {
            field: "f".to_string(),
            value: "v".to_string(),
            reason: "r".to_string(),
        });
        assert!(matches!(config, FieldCacheError::Config(_)));
    }
}
