//! Error handling for the heatlink crate
//!
//! Fetch failures carry a typed [`ErrorKind`] so the stats collector, the
//! cache protection policy and the adaptive scheduler can react to the class
//! of failure instead of parsing messages. The unified [`Error`] wraps the
//! fetch taxonomy together with registry/config/IO failures for callers that
//! cross module boundaries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-visible classification of a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No adapter registered under the canonical id.
    UnknownSource,
    /// A waiter exceeded its deadline while a leader fetch was in flight.
    InFlightTimeout,
    /// No usable proxy and direct fallback disallowed.
    ProxyUnavailable,
    /// DNS/TCP/TLS/connect/read error or non-2xx HTTP status.
    Network,
    /// The adapter could not parse the response.
    Parse,
    /// The adapter failed in an unexpected way.
    AdapterInternal,
    /// HTTP 429 or an adapter-reported equivalent.
    RateLimited,
    /// The context was canceled externally.
    Canceled,
    /// The effective fetch deadline elapsed.
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownSource => "unknown_source",
            Self::InFlightTimeout => "in_flight_timeout",
            Self::ProxyUnavailable => "proxy_unavailable",
            Self::Network => "network",
            Self::Parse => "parse",
            Self::AdapterInternal => "adapter_internal",
            Self::RateLimited => "rate_limited",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
        }
    }

    /// Whether the failure class is expected to clear on its own.
    ///
    /// Recoverable failures are absorbed by the adaptive schedule's backoff;
    /// unrecoverable ones usually need an operator (bad config, gone source).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::RateLimited
                | Self::Timeout
                | Self::InFlightTimeout
                | Self::ProxyUnavailable
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failed fetch attempt.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("timed out waiting for the in-flight fetch")]
    InFlightTimeout,

    #[error("no usable proxy and direct fallback disallowed")]
    ProxyUnavailable,

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("adapter error: {0}")]
    AdapterInternal(String),

    #[error("rate limited")]
    RateLimited,

    #[error("canceled")]
    Canceled,

    #[error("fetch deadline elapsed")]
    Timeout,
}

impl FetchError {
    /// Typed kind for stats and protection decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownSource(_) => ErrorKind::UnknownSource,
            Self::InFlightTimeout => ErrorKind::InFlightTimeout,
            Self::ProxyUnavailable => ErrorKind::ProxyUnavailable,
            Self::Network(_) => ErrorKind::Network,
            Self::Parse(_) => ErrorKind::Parse,
            Self::AdapterInternal(_) => ErrorKind::AdapterInternal,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Canceled => ErrorKind::Canceled,
            Self::Timeout => ErrorKind::Timeout,
        }
    }

    /// Map a non-2xx HTTP status to the taxonomy.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status.as_u16() == 429 {
            Self::RateLimited
        } else {
            Self::Network(format!("HTTP status {}", status.as_u16()))
        }
    }

    /// Rebuild a fetch error from a recorded (kind, message) pair.
    ///
    /// Used by single-flight followers, which receive the leader's outcome as
    /// data rather than as an error value.
    pub fn from_kind(kind: ErrorKind, message: &str) -> Self {
        match kind {
            ErrorKind::UnknownSource => Self::UnknownSource(message.to_string()),
            ErrorKind::InFlightTimeout => Self::InFlightTimeout,
            ErrorKind::ProxyUnavailable => Self::ProxyUnavailable,
            ErrorKind::Network => Self::Network(message.to_string()),
            ErrorKind::Parse => Self::Parse(message.to_string()),
            ErrorKind::AdapterInternal => Self::AdapterInternal(message.to_string()),
            ErrorKind::RateLimited => Self::RateLimited,
            ErrorKind::Canceled => Self::Canceled,
            ErrorKind::Timeout => Self::Timeout,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<quick_xml::DeError> for FetchError {
    fn from(err: quick_xml::DeError) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Unified error type for the heatlink crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("descriptor error: {0}")]
    Descriptor(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }
}

/// Result type alias using the unified Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(FetchError::RateLimited.kind(), ErrorKind::RateLimited);
        assert_eq!(
            FetchError::Network("reset".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            FetchError::UnknownSource("x".into()).kind(),
            ErrorKind::UnknownSource
        );
    }

    #[test]
    fn test_from_status() {
        let err = FetchError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        let err = FetchError::from_status(reqwest::StatusCode::BAD_GATEWAY);
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn test_recoverability() {
        assert!(ErrorKind::Network.is_recoverable());
        assert!(ErrorKind::RateLimited.is_recoverable());
        assert!(!ErrorKind::UnknownSource.is_recoverable());
        assert!(!ErrorKind::Parse.is_recoverable());
    }

    #[test]
    fn test_from_kind_roundtrip() {
        let original = FetchError::Parse("bad json".into());
        let rebuilt = FetchError::from_kind(original.kind(), "bad json");
        assert_eq!(rebuilt.kind(), ErrorKind::Parse);
        assert_eq!(rebuilt.to_string(), original.to_string());
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::InFlightTimeout).unwrap();
        assert_eq!(json, "\"in_flight_timeout\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::InFlightTimeout);
    }
}
