//! # Resilient Client
//!
//! Composes the circuit breaker gate, the retry loop and the degradation
//! manager's fallback path around a single upstream operation. Every call
//! returns a [`ClientResponse`] with metadata describing which protections
//! were involved; no failure escapes as a panic.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info_span, Instrument};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::{Failure, FailureHeaders, HttpFailure, Provider};
use crate::config::ConfigError;
use crate::context::CallContext;
use crate::degradation::{GracefulDegradationManager, ServiceLevel};
use crate::fallback::{FallbackRequest, FallbackType};
use crate::logging::{log_error_record, with_correlation_id};
use crate::retry::{RetryConfig, RetryStrategy, RetryStrategyRegistry};
use crate::sanitization::ErrorBody;
use crate::types::{duration_ms, ErrorKind, ErrorRecord};

/// The outbound call made on every attempt
#[async_trait]
pub trait UpstreamTransport: Send + Sync + fmt::Debug {
    async fn send(&self, request: &UpstreamRequest) -> Result<Value, Failure>;
}

/// An opaque request forwarded upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub operation: String,
    pub correlation_id: String,
    pub payload: Value,
}

/// Configuration for a resilient client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Total attempts per call, including the first
    pub max_retries: u32,
    /// Bound on each attempt
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub circuit_breaker_name: String,
    pub enable_circuit_breaker: bool,
    pub enable_retry: bool,
    pub enable_fallback: bool,
    /// Include sanitized provider detail in error bodies
    pub debug_errors: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
            circuit_breaker_name: "azure-responses-api".to_string(),
            enable_circuit_breaker: true,
            enable_retry: true,
            enable_fallback: true,
            debug_errors: false,
        }
    }
}

impl TryFrom<config::Config> for ClientConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = ClientConfig::default();

        if let Ok(max_retries) = cfg.get::<u32>("client.max_retries") {
            base.max_retries = max_retries;
        }
        if let Ok(ms) = cfg.get::<u64>("client.timeout_ms") {
            base.timeout = Duration::from_millis(ms);
        }
        if let Ok(name) = cfg.get::<String>("client.circuit_breaker_name") {
            base.circuit_breaker_name = name;
        }
        if let Ok(enabled) = cfg.get::<bool>("client.enable_circuit_breaker") {
            base.enable_circuit_breaker = enabled;
        }
        if let Ok(enabled) = cfg.get::<bool>("client.enable_retry") {
            base.enable_retry = enabled;
        }
        if let Ok(enabled) = cfg.get::<bool>("client.enable_fallback") {
            base.enable_fallback = enabled;
        }
        if let Ok(debug_errors) = cfg.get::<bool>("client.debug_errors") {
            base.debug_errors = debug_errors;
        }

        Ok(base)
    }
}

/// What happened on the way to a response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub attempts: u32,
    pub total_duration_ms: u64,
    pub circuit_breaker_used: bool,
    pub retry_used: bool,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_type: Option<FallbackType>,
    pub correlation_id: String,
    pub service_level: ServiceLevel,
}

/// Result of a resilient call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub metadata: ResponseMetadata,
}

/// How the gated primary path ended
struct PrimaryOutcome {
    result: Result<Value, ErrorRecord>,
    attempts: u32,
    circuit_breaker_used: bool,
}

/// One upstream operation wrapped in every protection the config enables
#[derive(Debug, Clone)]
pub struct ResilientClient {
    config: ClientConfig,
    transport: Arc<dyn UpstreamTransport>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: Arc<RetryStrategy>,
    degradation: Arc<GracefulDegradationManager>,
}

impl ResilientClient {
    /// Builds a client. The retry strategy is registered under the circuit
    /// breaker name with the client's attempt budget and timeout.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn UpstreamTransport>,
        breakers: Arc<CircuitBreakerRegistry>,
        retries: &RetryStrategyRegistry,
        retry_defaults: &RetryConfig,
        degradation: Arc<GracefulDegradationManager>,
    ) -> Self {
        let retry_config = RetryConfig {
            max_attempts: config.max_retries.max(1),
            attempt_timeout: Some(config.timeout),
            ..retry_defaults.clone()
        };
        let retry = retries.get_with_config(&config.circuit_breaker_name, Some(retry_config));

        Self {
            config,
            transport,
            breakers,
            retry,
            degradation,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs one call through the gate, the retry loop and, when the
    /// dependency is unavailable, the fallback path. Client errors such as
    /// 400 or 401 come back as errors.
    pub async fn execute(&self, payload: Value, call: CallContext) -> ClientResponse<Value> {
        let span = info_span!(
            "resilient_call",
            operation = %call.operation,
            correlation_id = %call.correlation_id,
            circuit = %self.config.circuit_breaker_name,
        );
        let correlation_id = call.correlation_id.clone();

        with_correlation_id(correlation_id, self.run(payload, call).instrument(span)).await
    }

    async fn run(&self, payload: Value, call: CallContext) -> ClientResponse<Value> {
        let start = Instant::now();
        let mut level = self.degradation.get_current_service_level();

        if self.fallback_only(level) {
            // No primary outcome will re-evaluate the level on this path
            level = self.degradation.observe_outcome(None, &call.correlation_id);
        }
        if self.fallback_only(level) && !self.probe_due() {
            debug!(service_level = %level, "Primary path disabled at this service level");
            return self.degrade(payload, &call, None, 0, false, start).await;
        }

        let primary = self.call_primary(&payload, &call).await;

        match primary.result {
            Ok(data) => {
                if let Some(key) = &call.cache_key {
                    if self.config.enable_fallback {
                        self.degradation.fallback().remember(key.clone(), data.clone());
                    }
                }
                self.degradation.observe_outcome(None, &call.correlation_id);
                self.record(&call, "success", start);

                ClientResponse {
                    success: true,
                    data: Some(data),
                    error: None,
                    metadata: ResponseMetadata {
                        attempts: primary.attempts,
                        total_duration_ms: start.elapsed().as_millis() as u64,
                        circuit_breaker_used: primary.circuit_breaker_used,
                        retry_used: primary.attempts > 1,
                        fallback_used: false,
                        fallback_type: None,
                        correlation_id: call.correlation_id.clone(),
                        service_level: self.degradation.get_current_service_level(),
                    },
                }
            }
            Err(error) => {
                log_error_record(&call.operation, &error);
                self.degradation.observe_outcome(Some(&error), &call.correlation_id);

                if self.config.enable_fallback && error.kind.is_availability() {
                    self.degrade(
                        payload,
                        &call,
                        Some(error),
                        primary.attempts,
                        primary.circuit_breaker_used,
                        start,
                    )
                    .await
                } else {
                    self.record(&call, "failure", start);
                    self.failed(&call, &error, primary.attempts, primary.circuit_breaker_used, None, start)
                }
            }
        }
    }

    fn fallback_only(&self, level: ServiceLevel) -> bool {
        self.config.enable_fallback && self.degradation.feature_gates(level).fallback_only
    }

    /// A breaker due for its recovery probe still lets one call through
    /// when the primary path is otherwise disabled
    fn probe_due(&self) -> bool {
        self.config.enable_circuit_breaker
            && self
                .breakers
                .find(&self.config.circuit_breaker_name)
                .map_or(false, |breaker| breaker.probe_due())
    }

    async fn call_primary(&self, payload: &Value, call: &CallContext) -> PrimaryOutcome {
        let request = UpstreamRequest {
            operation: call.operation.clone(),
            correlation_id: call.correlation_id.clone(),
            payload: payload.clone(),
        };

        if !self.config.enable_circuit_breaker {
            let (result, attempts) = self.call_with_retry(&request, call).await;
            return PrimaryOutcome {
                result,
                attempts,
                circuit_breaker_used: false,
            };
        }

        let breaker = self.breakers.get_circuit_breaker(&self.config.circuit_breaker_name);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                debug!(
                    circuit = %breaker.name(),
                    next_attempt_at = %rejection.next_attempt_at,
                    "Call short-circuited"
                );
                return PrimaryOutcome {
                    result: Err(rejection.into_record(&call.correlation_id)),
                    attempts: 1,
                    circuit_breaker_used: true,
                };
            }
        };

        let (result, attempts) = self.call_with_retry(&request, call).await;
        match &result {
            Ok(_) => permit.record_success(),
            Err(error) => permit.record_failure(error),
        }

        PrimaryOutcome {
            result,
            attempts,
            circuit_breaker_used: true,
        }
    }

    async fn call_with_retry(&self, request: &UpstreamRequest, call: &CallContext) -> (Result<Value, ErrorRecord>, u32) {
        let mut ctx = self.retry.context(call);
        if !self.config.enable_retry {
            ctx.max_attempts = 1;
        }

        let transport = self.transport.as_ref();
        let outcome = self
            .retry
            .execute_with_retry(ctx, move |_attempt| {
                AssertUnwindSafe(transport.send(request))
                    .catch_unwind()
                    .map(|caught| {
                        caught.unwrap_or_else(|_| Err(Failure::Internal("upstream transport panicked".to_string())))
                    })
            })
            .await;

        (outcome.result, outcome.attempts)
    }

    async fn degrade(
        &self,
        payload: Value,
        call: &CallContext,
        primary_error: Option<ErrorRecord>,
        attempts: u32,
        circuit_breaker_used: bool,
        start: Instant,
    ) -> ClientResponse<Value> {
        let mut request = FallbackRequest::new(call.operation.clone(), call.correlation_id.clone(), payload)
            .cancellation(call.cancellation.clone());
        if let Some(key) = &call.cache_key {
            request = request.cache_key(key.clone());
        }
        if let Some(error) = primary_error.clone() {
            request = request.primary_error(error);
        }

        let degraded = self.degradation.execute_graceful_degradation(&request).await;
        let outcome = degraded.outcome;

        if outcome.success {
            self.record(call, "fallback", start);
            return ClientResponse {
                success: true,
                data: outcome.response,
                error: None,
                metadata: ResponseMetadata {
                    attempts,
                    total_duration_ms: start.elapsed().as_millis() as u64,
                    circuit_breaker_used,
                    retry_used: attempts > 1,
                    fallback_used: true,
                    fallback_type: Some(degraded.fallback_type),
                    correlation_id: call.correlation_id.clone(),
                    service_level: degraded.service_level,
                },
            };
        }

        self.record(call, "failure", start);
        let error = outcome.error.or(primary_error).unwrap_or_else(|| {
            ErrorRecord::new(ErrorKind::Internal, "fallback produced no result", call.correlation_id.clone())
        });
        self.failed(call, &error, attempts, circuit_breaker_used, Some(degraded.fallback_type), start)
    }

    fn failed(
        &self,
        call: &CallContext,
        error: &ErrorRecord,
        attempts: u32,
        circuit_breaker_used: bool,
        fallback_type: Option<FallbackType>,
        start: Instant,
    ) -> ClientResponse<Value> {
        ClientResponse {
            success: false,
            data: None,
            error: Some(ErrorBody::from_record(error, self.config.debug_errors)),
            metadata: ResponseMetadata {
                attempts,
                total_duration_ms: start.elapsed().as_millis() as u64,
                circuit_breaker_used,
                retry_used: attempts > 1,
                fallback_used: fallback_type.is_some(),
                fallback_type,
                correlation_id: call.correlation_id.clone(),
                service_level: self.degradation.get_current_service_level(),
            },
        }
    }

    fn record(&self, call: &CallContext, outcome: &'static str, start: Instant) {
        counter!(
            "resilience_client_calls_total",
            1,
            "operation" => call.operation.clone(),
            "outcome" => outcome
        );
        histogram!(
            "resilience_client_duration_ms",
            start.elapsed().as_millis() as f64,
            "operation" => call.operation.clone()
        );
    }
}

/// Connection settings for the Azure OpenAI Responses API
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureResponsesConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
}

impl Default for AzureResponsesConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            api_version: "2025-03-01-preview".to_string(),
        }
    }
}

// Keeps the key out of logs
impl fmt::Debug for AzureResponsesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureResponsesConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl TryFrom<config::Config> for AzureResponsesConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = AzureResponsesConfig::default();

        if let Ok(endpoint) = cfg.get::<String>("azure.endpoint") {
            base.endpoint = endpoint;
        }
        if let Ok(api_key) = cfg.get::<String>("azure.api_key") {
            base.api_key = api_key;
        }
        if let Ok(api_version) = cfg.get::<String>("azure.api_version") {
            base.api_version = api_version;
        }

        Ok(base)
    }
}

/// Posts opaque JSON to the Azure OpenAI Responses endpoint
#[derive(Debug, Clone)]
pub struct AzureResponsesTransport {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl AzureResponsesTransport {
    pub fn new(config: &AzureResponsesConfig) -> Result<Self, ConfigError> {
        if config.endpoint.is_empty() {
            return Err(ConfigError::Invalid {
                key: "azure.endpoint".to_string(),
                reason: "must be set".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("resilience-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Initialization(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            url: format!(
                "{}/openai/responses?api-version={}",
                config.endpoint.trim_end_matches('/'),
                config.api_version
            ),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl UpstreamTransport for AzureResponsesTransport {
    async fn send(&self, request: &UpstreamRequest) -> Result<Value, Failure> {
        let response = self
            .http
            .post(&self.url)
            .header("api-key", &self.api_key)
            .header("x-ms-client-request-id", &request.correlation_id)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request.payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Value>().await?);
        }

        let headers = FailureHeaders::from_header_map(response.headers());
        let body = response.text().await.unwrap_or_default();

        Err(Failure::Http(
            HttpFailure::new(status.as_u16(), Provider::Azure)
                .body(body)
                .headers(headers),
        ))
    }
}
