//! # Engine Configuration
//!
//! Aggregates the configuration of every component. Each section starts from
//! its defaults and is overridden key by key from a [`config::Config`], which
//! [`EngineConfig::from_env`] builds from `.env` and `RESILIENCE__*`
//! environment variables (e.g. `RESILIENCE__RETRY__MAX_ATTEMPTS=5`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::client::{AzureResponsesConfig, ClientConfig};
use crate::degradation::DegradationConfig;
use crate::fallback::FallbackConfig;
use crate::logging::LoggingConfig;
use crate::retry::RetryConfig;

const ENV_PREFIX: &str = "RESILIENCE";
const ENV_SEPARATOR: &str = "__";

/// Errors raised while loading configuration or initializing the engine
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("initialization failed: {0}")]
    Initialization(String),
}

impl ConfigError {
    fn invalid<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration for the whole engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub client: ClientConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub degradation: DegradationConfig,
    pub fallback: FallbackConfig,
    pub logging: LoggingConfig,
    pub azure: AzureResponsesConfig,
}

impl EngineConfig {
    /// Loads `.env` (if present) and `RESILIENCE__*` variables over defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal outside development
        let _ = dotenv::dotenv();

        let source = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        Self::try_from(source)
    }

    /// Rejects values the components cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.client.max_retries == 0 {
            return Err(ConfigError::invalid("client.max_retries", "must be at least 1"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::invalid("retry.backoff_factor", "must be >= 1.0"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::invalid("retry.base_delay_ms", "must not exceed retry.max_delay_ms"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.degradation.open_fraction_threshold) {
            return Err(ConfigError::invalid(
                "degradation.open_fraction_threshold",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.client.circuit_breaker_name.trim().is_empty() {
            return Err(ConfigError::invalid("client.circuit_breaker_name", "must not be empty"));
        }
        Ok(())
    }
}

impl TryFrom<config::Config> for EngineConfig {
    type Error = ConfigError;

    fn try_from(cfg: config::Config) -> Result<Self, Self::Error> {
        let engine = EngineConfig {
            client: ClientConfig::try_from(cfg.clone())?,
            retry: RetryConfig::try_from(cfg.clone())?,
            circuit_breaker: CircuitBreakerConfig::try_from(cfg.clone())?,
            degradation: DegradationConfig::try_from(cfg.clone())?,
            fallback: FallbackConfig::try_from(cfg.clone())?,
            logging: LoggingConfig::try_from(cfg.clone())?,
            azure: AzureResponsesConfig::try_from(cfg)?,
        };
        engine.validate()?;
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn source(pairs: &[(&str, &str)]) -> config::Config {
        pairs
            .iter()
            .fold(config::Config::builder(), |builder, (key, value)| {
                builder.set_override(*key, *value).unwrap()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client.circuit_breaker_name, "azure-responses-api");
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_overrides_are_applied_per_key() {
        let config = EngineConfig::try_from(source(&[
            ("retry.max_attempts", "5"),
            ("circuit_breaker.reset_timeout_ms", "1500"),
            ("client.enable_fallback", "false"),
            ("degradation.recovery_window_ms", "120000"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_millis(1500));
        assert!(!config.client.enable_fallback);
        assert!(config.client.enable_retry);
        assert_eq!(config.degradation.recovery_window, Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = EngineConfig::try_from(source(&[("circuit_breaker.failure_threshold", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "circuit_breaker.failure_threshold"));

        let err = EngineConfig::try_from(source(&[("degradation.open_fraction_threshold", "1.5")])).unwrap_err();
        assert!(err.to_string().contains("open_fraction_threshold"));
    }
}
