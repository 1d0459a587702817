//! # Normalized Error Types
//!
//! Every failure that crosses the engine is reduced to an [`ErrorRecord`]
//! tagged with an [`ErrorKind`]. Records are produced exclusively by the
//! classifier; downstream code matches on the tag.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A type alias for Result with the error type defaulting to [`ErrorRecord`]
pub type Result<T, E = ErrorRecord> = std::result::Result<T, E>;

/// Categorizes normalized failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused/reset, DNS failure, connect or read timeout
    ServiceUnavailable,
    /// Upstream throttled the request (HTTP 429 or provider throttling code)
    RateLimited,
    /// Missing or invalid credentials
    Unauthorized,
    /// Credentials valid but not allowed
    Forbidden,
    /// Malformed or rejected request (400/422, content filter, validation)
    InvalidRequest,
    /// Model deployment or resource does not exist
    NotFound,
    /// Upstream server error (5xx)
    UpstreamError,
    /// Synthesized locally when a circuit breaker rejects the call
    CircuitBreakerOpen,
    /// The overall deadline of the call expired
    Timeout,
    /// The inbound request was cancelled
    Cancelled,
    /// Programming error inside the process
    Internal,
    /// Unrecognized failure
    Unknown,
}

impl ErrorKind {
    /// Whether failures of this kind are worth another attempt
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ServiceUnavailable | ErrorKind::RateLimited | ErrorKind::UpstreamError
        )
    }

    /// Whether the dependency could not answer at all, so another source
    /// may answer instead. Client errors are the caller's to fix.
    pub fn is_availability(self) -> bool {
        matches!(
            self,
            ErrorKind::ServiceUnavailable
                | ErrorKind::RateLimited
                | ErrorKind::UpstreamError
                | ErrorKind::CircuitBreakerOpen
                | ErrorKind::Timeout
        )
    }

    /// Suggested HTTP status for the caller-facing response
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::RateLimited => 429,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::UpstreamError => 502,
            ErrorKind::CircuitBreakerOpen => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Cancelled => 499,
            ErrorKind::Internal => 500,
            ErrorKind::Unknown => 500,
        }
    }

    /// The `type` tag used in caller-facing error bodies
    pub fn wire_type(self) -> &'static str {
        match self {
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::RateLimited => "rate_limit_exceeded",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::CircuitBreakerOpen => "circuit_breaker",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "request_cancelled",
            ErrorKind::Internal => "internal_error",
            ErrorKind::Unknown => "unknown_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_type())
    }
}

/// A classified failure.
///
/// Cloning is cheap: the originating error is kept as rendered text rather
/// than as a boxed source, so records can be handed to the breaker, the
/// fallback path and the caller without ownership gymnastics.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ErrorRecord {
    /// Unique identifier for this failure instance
    pub id: Uuid,
    /// Normalized category
    pub kind: ErrorKind,
    /// Whether another attempt may succeed
    pub retryable: bool,
    /// Suggested HTTP status for the caller
    pub http_status: u16,
    /// Human readable description (not yet sanitized)
    pub message: String,
    /// Correlation ID of the request that failed
    pub correlation_id: String,
    /// Upstream hint for how long to wait before retrying
    #[serde(default, with = "duration_ms_opt")]
    pub retry_after: Option<Duration>,
    /// When an open circuit will admit the next probe
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Provider-specific error code (`content_filter`, `ThrottlingException`, ...)
    pub provider_code: Option<String>,
    /// Rendered form of the raw failure, only exposed with debug errors on
    pub originating_error: Option<String>,
    /// When the failure was classified
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Creates a record using the kind's default retryability and status
    pub fn new<S: Into<String>, C: Into<String>>(kind: ErrorKind, message: S, correlation_id: C) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            retryable: kind.is_retryable(),
            http_status: kind.http_status(),
            message: message.into(),
            correlation_id: correlation_id.into(),
            retry_after: None,
            next_attempt_at: None,
            provider_code: None,
            originating_error: None,
            timestamp: Utc::now(),
        }
    }

    /// Sets the upstream retry hint
    pub fn retry_after(mut self, delay: Option<Duration>) -> Self {
        self.retry_after = delay;
        self
    }

    /// Sets when an open circuit admits its next probe
    pub fn next_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    /// Sets the provider specific code
    pub fn provider_code<S: Into<String>>(mut self, code: S) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    /// Keeps a rendering of the raw failure for debug output
    pub fn originating<S: Into<String>>(mut self, raw: S) -> Self {
        self.originating_error = Some(raw.into());
        self
    }

    /// Overrides the suggested HTTP status
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = status;
        self
    }

    /// Operational failures are expected runtime conditions (network, quota,
    /// upstream outages). Anything else points at a defect in this process.
    pub fn is_operational(&self) -> bool {
        !matches!(self.kind, ErrorKind::Internal | ErrorKind::Unknown)
    }

    /// Whether this failure says something about the health of the dependency.
    /// Cancellation is the caller walking away and never counts.
    pub fn counts_against_breaker(&self) -> bool {
        self.kind != ErrorKind::Cancelled
    }
}

/// Serde helper storing optional durations as integer milliseconds
pub(crate) mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Serde helper storing durations as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
