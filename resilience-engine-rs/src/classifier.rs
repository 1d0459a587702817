//! # Error Classifier
//!
//! Maps raw failures (transport errors, HTTP responses, provider error
//! payloads) to a normalized [`ErrorRecord`]. Classification is a pure
//! function of its inputs: nothing here touches shared state, and malformed
//! provider bodies degrade to status-only classification instead of failing.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;

use crate::types::{ErrorKind, ErrorRecord};

/// Upstream provider that produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Azure,
    Bedrock,
    Generic,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Azure => write!(f, "azure"),
            Provider::Bedrock => write!(f, "bedrock"),
            Provider::Generic => write!(f, "generic"),
        }
    }
}

/// Why a connection-level failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCause {
    Refused,
    Reset,
    Dns,
    Timeout,
    Other,
}

impl fmt::Display for ConnectionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionCause::Refused => write!(f, "connection refused"),
            ConnectionCause::Reset => write!(f, "connection reset"),
            ConnectionCause::Dns => write!(f, "dns lookup failed"),
            ConnectionCause::Timeout => write!(f, "connection timed out"),
            ConnectionCause::Other => write!(f, "connection failed"),
        }
    }
}

/// Headers that influence classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureHeaders {
    /// `Retry-After`, seconds or HTTP date
    pub retry_after: Option<String>,
    /// Azure `retry-after-ms`
    pub retry_after_ms: Option<String>,
    /// Bedrock `x-amzn-ErrorType`
    pub amzn_error_type: Option<String>,
}

impl FailureHeaders {
    /// Extracts the relevant headers from a response header map
    pub fn from_header_map(headers: &reqwest::header::HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Self {
            retry_after: get("retry-after"),
            retry_after_ms: get("retry-after-ms"),
            amzn_error_type: get("x-amzn-errortype"),
        }
    }
}

/// A non-success HTTP response from an upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFailure {
    pub status: u16,
    pub body: Option<String>,
    pub headers: FailureHeaders,
    pub provider: Provider,
}

impl HttpFailure {
    pub fn new(status: u16, provider: Provider) -> Self {
        Self {
            status,
            body: None,
            headers: FailureHeaders::default(),
            provider,
        }
    }

    pub fn body<S: Into<String>>(mut self, body: S) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn headers(mut self, headers: FailureHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn retry_after<S: Into<String>>(mut self, value: S) -> Self {
        self.headers.retry_after = Some(value.into());
        self
    }
}

/// A raw failure as observed by the transport or the engine itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The connection could not be established or was dropped
    Connection {
        cause: ConnectionCause,
        message: String,
    },
    /// The upstream answered with a non-success status
    Http(HttpFailure),
    /// A provider error payload surfaced outside an HTTP response (SDK error)
    Provider {
        provider: Provider,
        code: String,
        message: String,
        status: Option<u16>,
    },
    /// The overall deadline of the call expired
    DeadlineExceeded { elapsed: Duration },
    /// The inbound request was cancelled
    Cancelled,
    /// A defect inside this process
    Internal(String),
    /// Anything else, only known as text
    Unstructured(String),
}

impl Failure {
    pub fn connection<S: Into<String>>(cause: ConnectionCause, message: S) -> Self {
        Failure::Connection {
            cause,
            message: message.into(),
        }
    }

    pub fn http(status: u16) -> Self {
        Failure::Http(HttpFailure::new(status, Provider::Generic))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Connection { cause, message } => write!(f, "{}: {}", cause, message),
            Failure::Http(http) => match &http.body {
                Some(body) => write!(f, "{} HTTP {}: {}", http.provider, http.status, truncate(body, 200)),
                None => write!(f, "{} HTTP {}", http.provider, http.status),
            },
            Failure::Provider {
                provider,
                code,
                message,
                ..
            } => write!(f, "{} error {}: {}", provider, code, message),
            Failure::DeadlineExceeded { elapsed } => {
                write!(f, "deadline exceeded after {}ms", elapsed.as_millis())
            }
            Failure::Cancelled => write!(f, "request cancelled"),
            Failure::Internal(message) => write!(f, "internal error: {}", message),
            Failure::Unstructured(message) => f.write_str(message),
        }
    }
}

impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        Failure::from(&err)
    }
}

impl From<&reqwest::Error> for Failure {
    fn from(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Failure::http(status.as_u16());
        }

        let rendered = render_error_chain(err);
        if err.is_timeout() {
            return Failure::connection(ConnectionCause::Timeout, rendered);
        }
        if err.is_connect() || err.is_request() || err.is_body() {
            return Failure::connection(cause_from_text(&rendered), rendered);
        }
        if err.is_builder() {
            return Failure::Internal(rendered);
        }
        Failure::Unstructured(rendered)
    }
}

/// Inputs to classification besides the failure itself
#[derive(Debug, Clone)]
pub struct ClassifyContext<'a> {
    pub correlation_id: &'a str,
    pub operation: &'a str,
    /// Reference time for resolving HTTP-date `Retry-After` values
    pub now: DateTime<Utc>,
}

impl<'a> ClassifyContext<'a> {
    pub fn new(correlation_id: &'a str, operation: &'a str) -> Self {
        Self {
            correlation_id,
            operation,
            now: Utc::now(),
        }
    }
}

/// Classifies a raw failure. Never panics.
pub fn classify(failure: &Failure, ctx: &ClassifyContext<'_>) -> ErrorRecord {
    let record = match failure {
        Failure::Connection { cause, message } => ErrorRecord::new(
            ErrorKind::ServiceUnavailable,
            format!("{}: {}", cause, message),
            ctx.correlation_id,
        ),
        Failure::Http(http) => classify_http(http, ctx),
        Failure::Provider {
            provider,
            code,
            message,
            status,
        } => {
            let kind = provider_code_kind(*provider, code)
                .or_else(|| status.map(status_kind))
                .unwrap_or(ErrorKind::Unknown);
            ErrorRecord::new(kind, message.clone(), ctx.correlation_id).provider_code(code.clone())
        }
        Failure::DeadlineExceeded { elapsed } => ErrorRecord::new(
            ErrorKind::Timeout,
            format!("{} did not complete within {}ms", ctx.operation, elapsed.as_millis()),
            ctx.correlation_id,
        ),
        Failure::Cancelled => ErrorRecord::new(
            ErrorKind::Cancelled,
            format!("{} was cancelled", ctx.operation),
            ctx.correlation_id,
        ),
        Failure::Internal(_) => ErrorRecord::new(
            ErrorKind::Internal,
            "internal error while calling upstream",
            ctx.correlation_id,
        ),
        Failure::Unstructured(text) => match errno_cause(text) {
            Some(cause) => ErrorRecord::new(
                ErrorKind::ServiceUnavailable,
                format!("{}: {}", cause, text),
                ctx.correlation_id,
            ),
            None => ErrorRecord::new(ErrorKind::Unknown, text.clone(), ctx.correlation_id),
        },
    };

    record.originating(failure.to_string())
}

fn classify_http(http: &HttpFailure, ctx: &ClassifyContext<'_>) -> ErrorRecord {
    let payload = http
        .body
        .as_deref()
        .and_then(|body| serde_json::from_str::<Value>(body).ok());

    let (code, body_message) = match http.provider {
        Provider::Bedrock => bedrock_error(payload.as_ref(), &http.headers),
        Provider::Azure | Provider::Generic => azure_error(payload.as_ref()),
    };

    let kind = code
        .as_deref()
        .and_then(|code| provider_code_kind(http.provider, code))
        .unwrap_or_else(|| status_kind(http.status));

    let message = body_message.unwrap_or_else(|| {
        let reason = StatusCode::from_u16(http.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("error");
        format!("upstream returned {} {}", http.status, reason)
    });

    let mut record = ErrorRecord::new(kind, message, ctx.correlation_id)
        .retry_after(parse_retry_after(&http.headers, ctx.now));
    if let Some(code) = code {
        record = record.provider_code(code);
    }
    record
}

/// Status-only classification
pub fn status_kind(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        408 => ErrorKind::ServiceUnavailable,
        429 => ErrorKind::RateLimited,
        503 => ErrorKind::ServiceUnavailable,
        400..=499 => ErrorKind::InvalidRequest,
        500..=599 => ErrorKind::UpstreamError,
        _ => ErrorKind::Unknown,
    }
}

/// Maps recognized provider error codes. Unrecognized codes return `None` so
/// the HTTP status decides.
fn provider_code_kind(provider: Provider, code: &str) -> Option<ErrorKind> {
    match provider {
        Provider::Bedrock => match bedrock_exception_name(code) {
            "ThrottlingException" | "TooManyRequestsException" => Some(ErrorKind::RateLimited),
            "ServiceUnavailableException" | "ModelNotReadyException" | "ModelTimeoutException" => {
                Some(ErrorKind::ServiceUnavailable)
            }
            "ValidationException" | "ModelErrorException" => Some(ErrorKind::InvalidRequest),
            "AccessDeniedException" => Some(ErrorKind::Forbidden),
            "UnrecognizedClientException" => Some(ErrorKind::Unauthorized),
            "ResourceNotFoundException" => Some(ErrorKind::NotFound),
            "InternalServerException" => Some(ErrorKind::UpstreamError),
            _ => None,
        },
        Provider::Azure | Provider::Generic => match code {
            "429" | "rate_limit_exceeded" | "RateLimitReached" => Some(ErrorKind::RateLimited),
            "content_filter" | "context_length_exceeded" | "invalid_request_error" => {
                Some(ErrorKind::InvalidRequest)
            }
            "401" | "invalid_api_key" | "Unauthorized" => Some(ErrorKind::Unauthorized),
            "403" | "PermissionDenied" => Some(ErrorKind::Forbidden),
            "404" | "DeploymentNotFound" => Some(ErrorKind::NotFound),
            "server_error" | "InternalServerError" => Some(ErrorKind::UpstreamError),
            _ => None,
        },
    }
}

/// `{"error": {"code": ..., "message": ...}}`, with a flat `message` fallback
fn azure_error(payload: Option<&Value>) -> (Option<String>, Option<String>) {
    let Some(payload) = payload else {
        return (None, None);
    };

    match payload.get("error") {
        Some(Value::Object(error)) => {
            let code = error.get("code").and_then(value_as_code);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string);
            (code, message)
        }
        Some(Value::String(message)) => (None, Some(message.clone())),
        _ => (
            None,
            payload
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        ),
    }
}

/// Exception name from `__type` or `x-amzn-ErrorType`, message from
/// `message` or `Message`
fn bedrock_error(
    payload: Option<&Value>,
    headers: &FailureHeaders,
) -> (Option<String>, Option<String>) {
    let from_body = payload
        .and_then(|p| p.get("__type"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let code = from_body
        .or_else(|| headers.amzn_error_type.clone())
        .map(|raw| bedrock_exception_name(&raw).to_string());

    let message = payload
        .and_then(|p| p.get("message").or_else(|| p.get("Message")))
        .and_then(Value::as_str)
        .map(str::to_string);

    (code, message)
}

/// `com.amazon.bedrock#ThrottlingException` and
/// `ThrottlingException:http://internal.amazon.com/...` both name
/// `ThrottlingException`
fn bedrock_exception_name(raw: &str) -> &str {
    let name = raw.rsplit('#').next().unwrap_or(raw);
    name.split(':').next().unwrap_or(name).trim()
}

fn value_as_code(value: &Value) -> Option<String> {
    match value {
        Value::String(code) => Some(code.clone()),
        Value::Number(code) => Some(code.to_string()),
        _ => None,
    }
}

/// Resolves the upstream retry hint. `retry-after-ms` wins over
/// `Retry-After`; dates in the past resolve to zero.
pub fn parse_retry_after(headers: &FailureHeaders, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(ms) = headers
        .retry_after_ms
        .as_deref()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
    {
        return Some(Duration::from_millis(ms as u64));
    }

    let raw = headers.retry_after.as_deref()?.trim();
    if let Ok(seconds) = raw.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(Duration::from_millis((seconds * 1000.0) as u64));
        }
        return None;
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn cause_from_text(text: &str) -> ConnectionCause {
    errno_cause(text).unwrap_or(ConnectionCause::Other)
}

/// Recognizes socket failures that only surface as text
fn errno_cause(text: &str) -> Option<ConnectionCause> {
    let lower = text.to_ascii_lowercase();
    if lower.contains("econnrefused") || lower.contains("connection refused") {
        Some(ConnectionCause::Refused)
    } else if lower.contains("econnreset")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
    {
        Some(ConnectionCause::Reset)
    } else if lower.contains("enotfound")
        || lower.contains("dns error")
        || lower.contains("failed to lookup address")
    {
        Some(ConnectionCause::Dns)
    } else if lower.contains("etimedout") || lower.contains("timed out") {
        Some(ConnectionCause::Timeout)
    } else {
        None
    }
}

fn render_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ClassifyContext<'static> {
        ClassifyContext::new("corr-test", "responses.create")
    }

    #[test]
    fn test_connection_failures_are_retryable() {
        for cause in [
            ConnectionCause::Refused,
            ConnectionCause::Reset,
            ConnectionCause::Dns,
            ConnectionCause::Timeout,
        ] {
            let record = classify(&Failure::connection(cause, "socket"), &ctx());
            assert_eq!(record.kind, ErrorKind::ServiceUnavailable);
            assert!(record.retryable);
            assert_eq!(record.http_status, 503);
            assert_eq!(record.correlation_id, "corr-test");
        }
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (400, ErrorKind::InvalidRequest, false),
            (401, ErrorKind::Unauthorized, false),
            (403, ErrorKind::Forbidden, false),
            (404, ErrorKind::NotFound, false),
            (408, ErrorKind::ServiceUnavailable, true),
            (409, ErrorKind::InvalidRequest, false),
            (422, ErrorKind::InvalidRequest, false),
            (429, ErrorKind::RateLimited, true),
            (500, ErrorKind::UpstreamError, true),
            (502, ErrorKind::UpstreamError, true),
            (503, ErrorKind::ServiceUnavailable, true),
        ];

        for (status, kind, retryable) in cases {
            let record = classify(&Failure::http(status), &ctx());
            assert_eq!(record.kind, kind, "status {}", status);
            assert_eq!(record.retryable, retryable, "status {}", status);
        }
    }

    #[test]
    fn test_rate_limit_carries_retry_after_seconds() {
        let failure = Failure::Http(HttpFailure::new(429, Provider::Azure).retry_after("7"));
        let record = classify(&failure, &ctx());

        assert_eq!(record.kind, ErrorKind::RateLimited);
        assert_eq!(record.http_status, 429);
        assert_eq!(record.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_retry_after_ms_wins() {
        let headers = FailureHeaders {
            retry_after: Some("10".into()),
            retry_after_ms: Some("1500".into()),
            amzn_error_type: None,
        };
        assert_eq!(
            parse_retry_after(&headers, Utc::now()),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let headers = FailureHeaders {
            retry_after: Some("Wed, 21 Oct 2015 07:28:30 GMT".into()),
            ..Default::default()
        };
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(30)));

        let past = FailureHeaders {
            retry_after: Some("Wed, 21 Oct 2015 07:27:00 GMT".into()),
            ..Default::default()
        };
        assert_eq!(parse_retry_after(&past, now), Some(Duration::ZERO));
    }

    #[test]
    fn test_garbage_retry_after_is_ignored() {
        let headers = FailureHeaders {
            retry_after: Some("soon-ish".into()),
            ..Default::default()
        };
        assert_eq!(parse_retry_after(&headers, Utc::now()), None);
    }

    #[test]
    fn test_azure_content_filter_beats_status() {
        let body = r#"{"error":{"code":"content_filter","message":"The response was filtered"}}"#;
        let failure = Failure::Http(HttpFailure::new(500, Provider::Azure).body(body));
        let record = classify(&failure, &ctx());

        assert_eq!(record.kind, ErrorKind::InvalidRequest);
        assert!(!record.retryable);
        assert_eq!(record.provider_code.as_deref(), Some("content_filter"));
        assert_eq!(record.message, "The response was filtered");
    }

    #[test]
    fn test_azure_numeric_rate_limit_code() {
        let body = r#"{"error":{"code":"429","message":"Requests exceeded the token rate limit"}}"#;
        let failure = Failure::Http(HttpFailure::new(400, Provider::Azure).body(body));
        assert_eq!(classify(&failure, &ctx()).kind, ErrorKind::RateLimited);
    }

    #[test]
    fn test_bedrock_exception_from_body_and_header() {
        let body = r#"{"__type":"com.amazon.bedrock#ThrottlingException","message":"Too many tokens"}"#;
        let failure = Failure::Http(HttpFailure::new(400, Provider::Bedrock).body(body));
        let record = classify(&failure, &ctx());
        assert_eq!(record.kind, ErrorKind::RateLimited);
        assert_eq!(record.provider_code.as_deref(), Some("ThrottlingException"));

        let headers = FailureHeaders {
            amzn_error_type: Some("ModelNotReadyException:http://internal.amazon.com/".into()),
            ..Default::default()
        };
        let failure = Failure::Http(HttpFailure::new(429, Provider::Bedrock).headers(headers));
        assert_eq!(classify(&failure, &ctx()).kind, ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn test_bedrock_exception_table() {
        let cases = [
            ("ServiceUnavailableException", ErrorKind::ServiceUnavailable),
            ("ModelTimeoutException", ErrorKind::ServiceUnavailable),
            ("ValidationException", ErrorKind::InvalidRequest),
            ("AccessDeniedException", ErrorKind::Forbidden),
            ("ResourceNotFoundException", ErrorKind::NotFound),
            ("InternalServerException", ErrorKind::UpstreamError),
        ];
        for (code, kind) in cases {
            let failure = Failure::Provider {
                provider: Provider::Bedrock,
                code: code.to_string(),
                message: "boom".into(),
                status: None,
            };
            assert_eq!(classify(&failure, &ctx()).kind, kind, "{}", code);
        }
    }

    #[test]
    fn test_unparseable_body_falls_back_to_status() {
        let failure = Failure::Http(HttpFailure::new(502, Provider::Azure).body("<html>bad gateway</html>"));
        let record = classify(&failure, &ctx());
        assert_eq!(record.kind, ErrorKind::UpstreamError);
        assert_eq!(record.message, "upstream returned 502 Bad Gateway");
    }

    #[test]
    fn test_unknown_provider_code_uses_status() {
        let failure = Failure::Provider {
            provider: Provider::Azure,
            code: "something_new".into(),
            message: "?".into(),
            status: Some(503),
        };
        assert_eq!(classify(&failure, &ctx()).kind, ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn test_terminal_kinds() {
        let timeout = classify(
            &Failure::DeadlineExceeded {
                elapsed: Duration::from_millis(1200),
            },
            &ctx(),
        );
        assert_eq!(timeout.kind, ErrorKind::Timeout);
        assert_eq!(timeout.http_status, 504);
        assert!(!timeout.retryable);

        let cancelled = classify(&Failure::Cancelled, &ctx());
        assert_eq!(cancelled.http_status, 499);
        assert!(!cancelled.retryable);

        let internal = classify(&Failure::Internal("index out of bounds".into()), &ctx());
        assert_eq!(internal.kind, ErrorKind::Internal);
        assert!(!internal.is_operational());
        assert_eq!(internal.http_status, 500);
    }

    #[test]
    fn test_unstructured_text() {
        let reset = classify(&Failure::Unstructured("read ECONNRESET".into()), &ctx());
        assert_eq!(reset.kind, ErrorKind::ServiceUnavailable);

        let unknown = classify(&Failure::Unstructured("weird".into()), &ctx());
        assert_eq!(unknown.kind, ErrorKind::Unknown);
        assert!(!unknown.retryable);
        assert_eq!(unknown.http_status, 500);
    }

    #[test]
    fn test_originating_error_is_kept() {
        let record = classify(&Failure::connection(ConnectionCause::Reset, "peer closed"), &ctx());
        assert_eq!(
            record.originating_error.as_deref(),
            Some("connection reset: peer closed")
        );
    }
}
