use std::time::Duration;

use thiserror::Error;

use crate::tier::Tier;

/// Result alias used across the cache crates.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error taxonomy for cache operations.
///
/// Only `Configuration` is meant to escape to the hosting application at
/// startup. Backend conditions (`BackendUnavailable`, `Timeout`,
/// `CircuitOpen`) are absorbed by the tier fallback logic and show up to
/// callers as misses or soft-failed writes.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{tier} tier unavailable: {reason}")]
    BackendUnavailable { tier: Tier, reason: String },

    #[error("{tier} tier call timed out after {after:?}")]
    Timeout { tier: Tier, after: Duration },

    #[error("circuit open for {tier} tier")]
    CircuitOpen { tier: Tier },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid payload for {key}: {reason}")]
    InvalidPayload { key: String, reason: String },

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Create a new BackendUnavailable error
    pub fn unavailable(tier: Tier, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            tier,
            reason: reason.into(),
        }
    }

    /// Create a new InvalidPayload error
    pub fn invalid_payload(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// True for conditions caused by a backend rather than by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::Timeout { .. } | Self::CircuitOpen { .. }
        )
    }

    /// True when the error was produced by a call that ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CacheError::unavailable(Tier::Fast, "refused").is_transient());
        assert!(
            CacheError::Timeout {
                tier: Tier::Durable,
                after: Duration::from_millis(500)
            }
            .is_transient()
        );
        assert!(CacheError::CircuitOpen { tier: Tier::Fast }.is_transient());
        assert!(!CacheError::InvalidKey("x".into()).is_transient());
        assert!(!CacheError::configuration("bad").is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = CacheError::unavailable(Tier::Durable, "connection refused");
        assert_eq!(err.to_string(), "durable tier unavailable: connection refused");

        let err = CacheError::invalid_payload("market:overview", "missing field");
        assert_eq!(
            err.to_string(),
            "invalid payload for market:overview: missing field"
        );
    }
}
