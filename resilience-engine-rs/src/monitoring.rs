//! Health reporting and metrics export for the resilience engine

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::info;

use crate::circuit_breaker::{CircuitBreakerMetrics, CircuitBreakerRegistry};
use crate::config::ConfigError;
use crate::degradation::{GracefulDegradationManager, ServiceLevel};
use crate::retry::{RetryMetricsSnapshot, RetryStrategyRegistry};

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Overall verdict of a health report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl From<ServiceLevel> for HealthStatus {
    fn from(level: ServiceLevel) -> Self {
        match level {
            ServiceLevel::Full => HealthStatus::Healthy,
            ServiceLevel::Reduced | ServiceLevel::Minimal => HealthStatus::Degraded,
            ServiceLevel::Emergency => HealthStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub entries: usize,
    pub hit_rate: f64,
}

/// Read-only snapshot for the health endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service_level: ServiceLevel,
    pub degraded_since: Option<DateTime<Utc>>,
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
    pub retry_strategies: RetryMetricsSnapshot,
    pub fallback_cache: CacheHealth,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn collect(
        breakers: &CircuitBreakerRegistry,
        retries: &RetryStrategyRegistry,
        degradation: &GracefulDegradationManager,
    ) -> Self {
        let service_level = degradation.get_current_service_level();
        let cache = degradation.fallback().cache();

        Self {
            status: service_level.into(),
            service_level,
            degraded_since: degradation.degraded_since(),
            circuit_breakers: breakers.get_all_metrics(),
            retry_strategies: retries.get_all_metrics(),
            fallback_cache: CacheHealth {
                entries: cache.size(),
                hit_rate: cache.hit_rate(),
            },
            timestamp: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Installs the Prometheus recorder once per process and returns its handle
pub fn install_metrics_recorder() -> Result<PrometheusHandle, ConfigError> {
    PROMETHEUS
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| ConfigError::Initialization(format!("prometheus recorder: {}", e)))?;
            info!("Prometheus metrics recorder installed");
            Ok(handle)
        })
        .cloned()
}

/// Scrape text of the installed recorder, if any
pub fn render_metrics() -> Option<String> {
    PROMETHEUS.get().map(PrometheusHandle::render)
}
