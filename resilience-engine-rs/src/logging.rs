//! # Structured Logging
//!
//! Subscriber setup plus correlation ID tracking. The correlation ID of the
//! inbound request is scoped to the task that serves it, so every log line
//! emitted while handling the call can carry it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::types::{ErrorKind, ErrorRecord};

tokio::task_local! {
    static CORRELATION_ID: String;
}

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Keeps the non-blocking file writer flushing for the life of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name, also used as the log file prefix
    pub service_name: String,
    /// Whether to also write logs to a daily rolling file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to include file and line information
    pub include_source_code: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "resilience-engine".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
            include_source_code: false,
        }
    }
}

impl TryFrom<config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = LoggingConfig::default();

        if let Ok(level) = cfg.get::<String>("logging.level") {
            base.level = level;
        }
        if let Ok(service_name) = cfg.get::<String>("logging.service_name") {
            base.service_name = service_name;
        }
        if let Ok(file_output) = cfg.get::<bool>("logging.file_output") {
            base.file_output = file_output;
        }
        if let Ok(log_dir) = cfg.get::<String>("logging.log_dir") {
            base.log_dir = Some(log_dir);
        }
        if let Ok(json_format) = cfg.get::<bool>("logging.json_format") {
            base.json_format = json_format;
        }
        if let Ok(include_source_code) = cfg.get::<bool>("logging.include_source_code") {
            base.include_source_code = include_source_code;
        }

        Ok(base)
    }
}

/// Initializes the structured logging system. Calling it again is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<(), ConfigError> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let text_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        ConfigError::Initialization(format!("failed to set global subscriber: {}", e))
    })?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Generates a fresh correlation ID
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Retrieves the correlation ID scoped to the current task, if any
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// The scoped correlation ID, or a fresh one when the task has none
pub fn correlation_id_or_new() -> String {
    current_correlation_id().unwrap_or_else(new_correlation_id)
}

/// Runs `fut` with `correlation_id` visible to [`current_correlation_id`]
pub async fn with_correlation_id<F, S>(correlation_id: S, fut: F) -> F::Output
where
    F: Future,
    S: Into<String>,
{
    CORRELATION_ID.scope(correlation_id.into(), fut).await
}

/// Logs a classified failure at a level matching how surprising it is
pub fn log_error_record(operation: &str, error: &ErrorRecord) {
    use tracing::{debug, error, warn};

    match error.kind {
        ErrorKind::Internal | ErrorKind::Unknown => {
            error!(
                error_id = %error.id,
                error_kind = %error.kind,
                correlation_id = %error.correlation_id,
                operation = %operation,
                message = %error.message,
                originating = ?error.originating_error,
                "Non-operational failure"
            );
        }
        ErrorKind::Cancelled | ErrorKind::CircuitBreakerOpen => {
            debug!(
                error_id = %error.id,
                error_kind = %error.kind,
                correlation_id = %error.correlation_id,
                operation = %operation,
                "Call not completed"
            );
        }
        _ => {
            warn!(
                error_id = %error.id,
                error_kind = %error.kind,
                correlation_id = %error.correlation_id,
                operation = %operation,
                status = error.http_status,
                retryable = error.retryable,
                provider_code = ?error.provider_code,
                message = %error.message,
                "Upstream call failed"
            );
        }
    }
}
