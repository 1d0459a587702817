//! # Resilience Engine
//!
//! Keeps calls to upstream AI model providers (Azure OpenAI, AWS Bedrock)
//! serving traffic through transient failures, rate limits and outages.
//!
//! ## Features
//!
//! - Error classification into a normalized, tagged [`ErrorRecord`]
//! - Retries with exponential backoff, jitter, deadlines and cancellation
//! - Named circuit breakers with single-probe half-open recovery
//! - Fallback chain: secondary provider, cached and static responses
//! - Global service level with per-level feature gates
//! - Sanitized, correlation-tagged error bodies for callers
//! - Structured logging with correlation IDs and Prometheus metrics
//!

pub mod circuit_breaker;
pub mod classifier;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod degradation;
pub mod engine;
pub mod fallback;
pub mod logging;
pub mod monitoring;
pub mod retry;
pub mod sanitization;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use classifier::{classify, Failure};
pub use client::{ClientConfig, ClientResponse, ResilientClient, UpstreamRequest, UpstreamTransport};
pub use config::{ConfigError, EngineConfig};
pub use context::{CallContext, CancellationToken};
pub use degradation::{GracefulDegradationManager, ServiceLevel};
pub use engine::ResilienceEngine;
pub use fallback::{FallbackHandler, FallbackType};
pub use logging::{current_correlation_id, init_logging, new_correlation_id};
pub use retry::{RetryConfig, RetryStrategy, RetryStrategyRegistry};
pub use sanitization::ErrorBody;
pub use types::{ErrorKind, ErrorRecord, Result};

/// Initializes logging and the metrics recorder from `config`
pub fn init(config: &EngineConfig) -> std::result::Result<(), ConfigError> {
    init_logging(Some(config.logging.clone()))?;
    monitoring::install_metrics_recorder()?;
    Ok(())
}

/// Loads configuration from the environment, initializes logging and
/// metrics, and builds the engine
pub fn init_from_env() -> std::result::Result<ResilienceEngine, ConfigError> {
    let config = EngineConfig::from_env()?;
    init(&config)?;
    ResilienceEngine::new(config)
}
