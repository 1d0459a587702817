//! # Call Context
//!
//! Per-request context threaded through the gate, the retry loop and the
//! fallback path: correlation ID, operation name, optional deadline and a
//! cancellation token tied to the inbound request.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::logging::new_correlation_id;

/// Cancellation of the inbound request. Cloning shares the signal.
pub use tokio_util::sync::CancellationToken;

/// Context for one logical outbound call
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The operation being performed (for metrics and logs)
    pub operation: String,
    /// Correlation ID of the inbound request
    pub correlation_id: String,
    /// Absolute deadline for the whole call, retries included
    pub deadline: Option<Instant>,
    /// Cancellation of the inbound request
    pub cancellation: CancellationToken,
    /// Key used to look up cached fallback responses
    pub cache_key: Option<String>,
}

impl CallContext {
    /// Creates a context with a fresh correlation ID
    pub fn new<S: Into<String>>(operation: S) -> Self {
        Self {
            operation: operation.into(),
            correlation_id: new_correlation_id(),
            deadline: None,
            cancellation: CancellationToken::new(),
            cache_key: None,
        }
    }

    pub fn correlation_id<S: Into<String>>(mut self, id: S) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Bounds the whole call to `timeout` from now
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cache_key<S: Into<String>>(mut self, key: S) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation {} [correlation_id: {}]", self.operation, self.correlation_id)
    }
}

/// Labels attached to log lines and metrics for one call
#[derive(Debug, Clone, Serialize)]
pub struct CallLabels<'a> {
    pub operation: &'a str,
    pub correlation_id: &'a str,
}

impl<'a> From<&'a CallContext> for CallLabels<'a> {
    fn from(ctx: &'a CallContext) -> Self {
        Self {
            operation: &ctx.operation,
            correlation_id: &ctx.correlation_id,
        }
    }
}
