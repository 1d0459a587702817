//! # Error Sanitization
//!
//! Turns an [`ErrorRecord`] into the body returned to callers. Messages are
//! scrubbed of credentials and personal data, and provider payloads only
//! appear when debug errors are switched on.

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, ErrorRecord};

const REDACTED: &str = "[REDACTED]";

// Applied in order. Bearer runs before the bare JWT rule so the scheme survives.
static REDACTIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        // key=value and key: value credentials
        (
            Regex::new(r#"(?i)\b(api[_-]?key|access[_-]?token|token|secret|password|credential)s?(["']?\s*[=:]\s*["']?)[^"'\s,;}]+"#)
                .expect("credential pattern is valid"),
            "${1}${2}[REDACTED]",
        ),
        // OAuth 2.0 bearer tokens
        (
            Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/\-]+=*").expect("bearer pattern is valid"),
            "Bearer [REDACTED]",
        ),
        // JWTs
        (
            Regex::new(r"eyJ[A-Za-z0-9_\-]+\.eyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+")
                .expect("jwt pattern is valid"),
            REDACTED,
        ),
        // OpenAI style secret keys
        (
            Regex::new(r"\bsk-[A-Za-z0-9_\-]{16,}").expect("secret key pattern is valid"),
            REDACTED,
        ),
        // Email addresses
        (
            Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email pattern is valid"),
            REDACTED,
        ),
    ]
});

/// Removes credentials and personal data from free text
pub fn sanitize_message(message: &str) -> String {
    REDACTIONS
        .iter()
        .fold(message.to_string(), |text, (pattern, replacement)| {
            pattern.replace_all(&text, *replacement).into_owned()
        })
}

/// Caller-safe description of a failure kind
pub fn user_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::ServiceUnavailable => "The AI service is temporarily unavailable. Please try again shortly.",
        ErrorKind::RateLimited => "Too many requests. Please wait before trying again.",
        ErrorKind::Unauthorized => "The upstream service rejected our credentials.",
        ErrorKind::Forbidden => "This request is not permitted.",
        ErrorKind::InvalidRequest => "The request could not be processed. Please check your input.",
        ErrorKind::NotFound => "The requested model or resource does not exist.",
        ErrorKind::UpstreamError => "The AI service returned an error. Please try again.",
        ErrorKind::CircuitBreakerOpen => {
            "The AI service is experiencing problems. Requests are paused until it recovers."
        }
        ErrorKind::Timeout => "The request took too long to complete.",
        ErrorKind::Cancelled => "The request was cancelled.",
        ErrorKind::Internal | ErrorKind::Unknown => "An unexpected error occurred. Please try again later.",
    }
}

/// Extra detail exposed only with debug errors enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugDetail {
    pub error_id: String,
    pub message: String,
    pub provider_code: Option<String>,
    pub originating_error: Option<String>,
}

/// Error shape handed to the HTTP error middleware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub correlation_id: String,
    /// Seconds the caller should wait before retrying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// RFC 3339 time when an open circuit admits the next probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugDetail>,
}

impl ErrorBody {
    /// Builds the caller-facing body for a classified failure
    pub fn from_record(record: &ErrorRecord, debug: bool) -> Self {
        let retry_after = record
            .retry_after
            .map(|delay| (delay.as_millis() as u64 + 999) / 1000)
            .or_else(|| record.next_attempt_at.map(|at| seconds_until(at, record.timestamp)));

        Self {
            error_type: record.kind.wire_type().to_string(),
            message: user_message(record.kind).to_string(),
            correlation_id: record.correlation_id.clone(),
            retry_after,
            next_attempt_time: record
                .next_attempt_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            debug: debug.then(|| DebugDetail {
                error_id: record.id.to_string(),
                message: sanitize_message(&record.message),
                provider_code: record.provider_code.clone(),
                originating_error: record.originating_error.as_deref().map(sanitize_message),
            }),
        }
    }

    /// HTTP status the middleware should respond with
    pub fn http_status(&self) -> u16 {
        match self.error_type.as_str() {
            "service_unavailable" | "circuit_breaker" => 503,
            "rate_limit_exceeded" => 429,
            "unauthorized" => 401,
            "forbidden" => 403,
            "invalid_request" => 400,
            "not_found" => 404,
            "request_cancelled" => 499,
            "upstream_error" => 502,
            "timeout" => 504,
            _ => 500,
        }
    }
}

impl From<&ErrorRecord> for ErrorBody {
    fn from(record: &ErrorRecord) -> Self {
        ErrorBody::from_record(record, false)
    }
}

fn seconds_until(at: DateTime<Utc>, from: DateTime<Utc>) -> u64 {
    let millis = (at - from).num_milliseconds().max(0) as u64;
    (millis + 999) / 1000
}
