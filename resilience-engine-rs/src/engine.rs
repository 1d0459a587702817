//! # Resilience Engine
//!
//! The process-wide wiring object. Built once at startup, it owns the
//! circuit breaker registry, the retry strategy registry, the fallback
//! handler and the degradation manager, hands out [`ResilientClient`]s that
//! share them, and supervises the periodic service level adjustment.

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::client::{AzureResponsesTransport, ResilientClient, UpstreamTransport};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, EngineConfig};
use crate::degradation::{GracefulDegradationManager, SupervisorHandle};
use crate::fallback::{FallbackHandler, SecondaryProvider};
use crate::monitoring::HealthReport;
use crate::retry::RetryStrategyRegistry;

/// Builder for [`ResilienceEngine`]
#[derive(Debug)]
pub struct ResilienceEngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    secondary: Option<Arc<dyn SecondaryProvider>>,
    circuit_overrides: Vec<(String, CircuitBreakerConfig)>,
}

impl ResilienceEngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Provider consulted first on the fallback path
    pub fn secondary_provider(mut self, provider: Arc<dyn SecondaryProvider>) -> Self {
        self.secondary = Some(provider);
        self
    }

    /// Per-dependency breaker settings
    pub fn circuit_override<S: Into<String>>(mut self, name: S, config: CircuitBreakerConfig) -> Self {
        self.circuit_overrides.push((name.into(), config));
        self
    }

    pub fn build(self) -> Result<ResilienceEngine, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let circuit_breakers = self.circuit_overrides.into_iter().fold(
            CircuitBreakerRegistry::new(config.circuit_breaker.clone(), self.clock.clone()),
            |registry, (name, cfg)| registry.with_override(name, cfg),
        );
        let circuit_breakers = Arc::new(circuit_breakers);
        let retry_strategies = Arc::new(RetryStrategyRegistry::new(config.retry.clone()));

        let mut fallback = FallbackHandler::new(config.fallback.clone(), self.clock.clone())
            .debug_errors(config.client.debug_errors);
        if let Some(provider) = self.secondary {
            fallback = fallback.with_secondary(provider);
        }
        let fallback = Arc::new(fallback);

        let degradation = Arc::new(GracefulDegradationManager::new(
            config.degradation.clone(),
            circuit_breakers.clone(),
            fallback.clone(),
            self.clock,
        ));

        info!(
            circuit = %config.client.circuit_breaker_name,
            failure_threshold = config.circuit_breaker.failure_threshold,
            max_attempts = config.client.max_retries,
            "Resilience engine initialized"
        );

        Ok(ResilienceEngine {
            config,
            circuit_breakers,
            retry_strategies,
            fallback,
            degradation,
            supervisor: Mutex::new(None),
        })
    }
}

/// Owns all shared resilience state of the process
#[derive(Debug)]
pub struct ResilienceEngine {
    config: EngineConfig,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    retry_strategies: Arc<RetryStrategyRegistry>,
    fallback: Arc<FallbackHandler>,
    degradation: Arc<GracefulDegradationManager>,
    supervisor: Mutex<Option<SupervisorHandle>>,
}

impl ResilienceEngine {
    pub fn builder(config: EngineConfig) -> ResilienceEngineBuilder {
        ResilienceEngineBuilder {
            config,
            clock: Arc::new(SystemClock),
            secondary: None,
            circuit_overrides: Vec::new(),
        }
    }

    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    /// Engine configured from `.env` and `RESILIENCE__*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(EngineConfig::from_env()?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuit_breakers
    }

    pub fn retry_strategies(&self) -> &Arc<RetryStrategyRegistry> {
        &self.retry_strategies
    }

    pub fn fallback(&self) -> &Arc<FallbackHandler> {
        &self.fallback
    }

    pub fn degradation(&self) -> &Arc<GracefulDegradationManager> {
        &self.degradation
    }

    /// A client for `transport` using the engine's client configuration
    pub fn client(&self, transport: Arc<dyn UpstreamTransport>) -> ResilientClient {
        ResilientClient::new(
            self.config.client.clone(),
            transport,
            self.circuit_breakers.clone(),
            &self.retry_strategies,
            &self.config.retry,
            self.degradation.clone(),
        )
    }

    /// A client for the configured Azure Responses endpoint
    pub fn azure_client(&self) -> Result<ResilientClient, ConfigError> {
        let transport = AzureResponsesTransport::new(&self.config.azure)?;
        Ok(self.client(Arc::new(transport)))
    }

    pub fn health_report(&self) -> HealthReport {
        HealthReport::collect(&self.circuit_breakers, &self.retry_strategies, &self.degradation)
    }

    /// Starts the periodic service level adjustment. Idempotent.
    pub fn start_supervisor(&self) -> Result<(), ConfigError> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| ConfigError::Initialization(format!("no tokio runtime: {}", e)))?;

        let mut supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        if supervisor.as_ref().map_or(true, SupervisorHandle::is_finished) {
            *supervisor = Some(self.degradation.spawn_auto_adjust());
        }
        Ok(())
    }

    /// Stops the supervisor and waits for it to finish
    pub async fn shutdown(&self) {
        let supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
        info!("Resilience engine shut down");
    }

    /// Returns every breaker to Closed, clears retry counters and the
    /// service level
    pub fn reset_all(&self) {
        self.circuit_breakers.reset_all();
        self.retry_strategies.reset_all();
        self.degradation.reset();
        info!("Resilience state reset");
    }
}
