//! Error taxonomy of the collection engine.
//!
//! [`ProviderError`] classifies a single outbound call. [`FetchError`] is what
//! the fetch client reports once retries and backend failover are exhausted.
//! Persistence and orchestration code uses `anyhow` on top of these.

use std::time::Duration;

use thiserror::Error;

use crate::fetch::Capability;

/// Outcome of one failed provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Connection or protocol failure. `accepted` is false when the request
    /// never reached the provider (DNS, connect, TLS).
    #[error("transport error: {message}")]
    Transport { message: String, accepted: bool },

    /// The call exceeded the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// HTTP 429.
    #[error("throttled by provider (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("pool not found")]
    NotFound,

    #[error("{service} does not provide {capability}")]
    Unsupported {
        service: &'static str,
        capability: Capability,
    },
}

impl ProviderError {
    /// Transport failures, timeouts, throttling and 5xx are retried on the
    /// same backend. Everything else moves straight to the next backend.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport { .. }
            | ProviderError::Timeout
            | ProviderError::Throttled { .. } => true,
            ProviderError::Http { status, .. } => *status >= 500,
            ProviderError::Decode(_)
            | ProviderError::NotFound
            | ProviderError::Unsupported { .. } => false,
        }
    }

    /// Whether the request was accepted by the provider and therefore counts
    /// against its quota window.
    pub fn was_accepted(&self) -> bool {
        match self {
            ProviderError::Transport { accepted, .. } => *accepted,
            ProviderError::Timeout | ProviderError::Unsupported { .. } => false,
            _ => true,
        }
    }

    /// Whether this failure says something about backend health. A missing
    /// pool or an unsupported capability does not open the circuit.
    pub fn counts_against_backend(&self) -> bool {
        !matches!(
            self,
            ProviderError::NotFound | ProviderError::Unsupported { .. }
        )
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ProviderError::Http {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::http(status.as_u16(), e.to_string())
        } else {
            ProviderError::Transport {
                message: e.to_string(),
                accepted: !(e.is_connect() || e.is_builder()),
            }
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Decode(e.to_string())
    }
}

/// Failure surfaced by the fetch client for one pool and capability.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Retries on a backend were exhausted on transport-level failures.
    #[error("{service}: {source}")]
    Transport {
        service: String,
        #[source]
        source: ProviderError,
    },

    /// The provider kept throttling after every retry.
    #[error("{service}: quota exceeded")]
    QuotaExceeded {
        service: String,
        retry_after: Option<Duration>,
    },

    /// No backend in the chain produced data. The pool is skipped this tick.
    #[error("data unavailable for {pool} ({capability}): {reasons}")]
    DataUnavailable {
        pool: String,
        capability: Capability,
        reasons: String,
    },
}

impl FetchError {
    /// Classify the last error seen on a backend.
    pub fn from_provider(service: &str, error: ProviderError) -> Self {
        match error {
            ProviderError::Throttled { retry_after } => FetchError::QuotaExceeded {
                service: service.to_string(),
                retry_after,
            },
            source => FetchError::Transport {
                service: service.to_string(),
                source,
            },
        }
    }
}

/// Data-quality condition recorded in `pool_analytics.last_error`.
/// Neither variant is a fault: metrics stay null or stale but never corrupt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataQualityIssue {
    #[error("insufficient samples: {available} log returns, need at least {required}")]
    InsufficientSamples { available: usize, required: usize },

    #[error("pool metadata unavailable, market fields carried over: {0}")]
    MetadataUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Throttled { retry_after: None }.is_retryable());
        assert!(ProviderError::http(503, "unavailable").is_retryable());
        assert!(!ProviderError::http(400, "bad request").is_retryable());
        assert!(!ProviderError::NotFound.is_retryable());
        assert!(!ProviderError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn test_unaccepted_calls_are_not_charged() {
        let refused = ProviderError::Transport {
            message: "connection refused".into(),
            accepted: false,
        };
        assert!(!refused.was_accepted());
        assert!(!ProviderError::Timeout.was_accepted());
        assert!(ProviderError::http(500, "boom").was_accepted());
        assert!(ProviderError::Throttled { retry_after: None }.was_accepted());
    }

    #[test]
    fn test_throttling_maps_to_quota_exceeded() {
        let err = FetchError::from_provider(
            "geckoterminal",
            ProviderError::Throttled {
                retry_after: Some(Duration::from_secs(30)),
            },
        );
        assert!(matches!(err, FetchError::QuotaExceeded { retry_after: Some(d), .. } if d.as_secs() == 30));

        let err = FetchError::from_provider("geckoterminal", ProviderError::Timeout);
        assert_eq!(err.to_string(), "geckoterminal: request timed out");
    }
}
