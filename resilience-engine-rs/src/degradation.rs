//! # Graceful Degradation
//!
//! Aggregates circuit breaker health into one process-wide [`ServiceLevel`]
//! and exposes what each level switches off.
//!
//! The level moves one step at a time. It degrades when more than the
//! configured fraction of breakers is open (or when a non-operational error
//! forces it) and recovers only after every breaker stayed closed for a full
//! recovery window.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::fallback::{FallbackHandler, FallbackOutcome, FallbackRequest, FallbackType};
use crate::types::{duration_ms, ErrorRecord};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Global service level, ordered from healthy to most degraded
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevel {
    Full,
    Reduced,
    Minimal,
    Emergency,
}

impl ServiceLevel {
    pub const fn severity(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Reduced => 1,
            Self::Minimal => 2,
            Self::Emergency => 3,
        }
    }

    const fn from_severity(severity: u8) -> Self {
        match severity {
            0 => Self::Full,
            1 => Self::Reduced,
            2 => Self::Minimal,
            _ => Self::Emergency,
        }
    }

    /// One step more degraded. Emergency stays Emergency.
    pub const fn step_down(self) -> Self {
        match self {
            Self::Full => Self::Reduced,
            Self::Reduced => Self::Minimal,
            Self::Minimal | Self::Emergency => Self::Emergency,
        }
    }

    /// One step toward Full. Full stays Full.
    pub const fn step_up(self) -> Self {
        match self {
            Self::Full | Self::Reduced => Self::Full,
            Self::Minimal => Self::Reduced,
            Self::Emergency => Self::Minimal,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Reduced => "reduced",
            Self::Minimal => "minimal",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for ServiceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What callers may do at a given level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGates {
    /// Optional enrichment (tool hints, follow-up suggestions, ...)
    pub optional_enrichment: bool,
    pub streaming: bool,
    /// Requests above the normal context size
    pub large_context: bool,
    /// Cap on context tokens forwarded upstream
    pub max_context_tokens: Option<u32>,
    /// Skip the primary provider and answer from the fallback path
    pub fallback_only: bool,
}

/// Per-level gates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureGateTable {
    pub full: FeatureGates,
    pub reduced: FeatureGates,
    pub minimal: FeatureGates,
    pub emergency: FeatureGates,
}

impl Default for FeatureGateTable {
    fn default() -> Self {
        Self {
            full: FeatureGates {
                optional_enrichment: true,
                streaming: true,
                large_context: true,
                max_context_tokens: None,
                fallback_only: false,
            },
            reduced: FeatureGates {
                optional_enrichment: false,
                streaming: true,
                large_context: true,
                max_context_tokens: Some(16_000),
                fallback_only: false,
            },
            minimal: FeatureGates {
                optional_enrichment: false,
                streaming: false,
                large_context: false,
                max_context_tokens: Some(4_000),
                fallback_only: false,
            },
            emergency: FeatureGates {
                optional_enrichment: false,
                streaming: false,
                large_context: false,
                max_context_tokens: Some(4_000),
                fallback_only: true,
            },
        }
    }
}

impl FeatureGateTable {
    pub fn for_level(&self, level: ServiceLevel) -> &FeatureGates {
        match level {
            ServiceLevel::Full => &self.full,
            ServiceLevel::Reduced => &self.reduced,
            ServiceLevel::Minimal => &self.minimal,
            ServiceLevel::Emergency => &self.emergency,
        }
    }
}

/// Configuration for the degradation manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Degrade when the open fraction of breakers is strictly above this
    pub open_fraction_threshold: f64,
    /// How long every breaker must stay closed before recovering one level
    #[serde(with = "duration_ms")]
    pub recovery_window: Duration,
    /// Tick of the supervised auto-adjust task
    #[serde(with = "duration_ms")]
    pub adjust_interval: Duration,
    /// Minimum spacing of auto-adjusts triggered by observed outcomes
    #[serde(with = "duration_ms")]
    pub min_adjust_interval: Duration,
    pub gates: FeatureGateTable,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            open_fraction_threshold: 0.5,
            recovery_window: Duration::from_secs(60),
            adjust_interval: Duration::from_secs(10),
            min_adjust_interval: Duration::from_secs(1),
            gates: FeatureGateTable::default(),
        }
    }
}

impl TryFrom<config::Config> for DegradationConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = DegradationConfig::default();

        if let Ok(threshold) = cfg.get::<f64>("degradation.open_fraction_threshold") {
            base.open_fraction_threshold = threshold;
        }
        if let Ok(ms) = cfg.get::<u64>("degradation.recovery_window_ms") {
            base.recovery_window = Duration::from_millis(ms);
        }
        if let Ok(ms) = cfg.get::<u64>("degradation.adjust_interval_ms") {
            base.adjust_interval = Duration::from_millis(ms);
        }
        if let Ok(ms) = cfg.get::<u64>("degradation.min_adjust_interval_ms") {
            base.min_adjust_interval = Duration::from_millis(ms);
        }
        if let Ok(gates) = cfg.get::<FeatureGateTable>("degradation.gates") {
            base.gates = gates;
        }

        Ok(base)
    }
}

/// A service level change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelChange {
    pub from: ServiceLevel,
    pub to: ServiceLevel,
    pub reason: String,
    pub correlation_id: String,
    pub at: DateTime<Utc>,
}

/// Fallback result annotated with the level it was served at
#[derive(Debug, Clone)]
pub struct DegradedResponse {
    pub outcome: FallbackOutcome,
    pub fallback_used: bool,
    pub fallback_type: FallbackType,
    pub service_level: ServiceLevel,
}

#[derive(Debug)]
struct LevelState {
    level: ServiceLevel,
    degraded_since: Option<DateTime<Utc>>,
    healthy_since: Option<Instant>,
    last_adjust_at: Option<Instant>,
}

/// Owns the process-wide service level
#[derive(Debug)]
pub struct GracefulDegradationManager {
    config: DegradationConfig,
    registry: Arc<CircuitBreakerRegistry>,
    fallback: Arc<FallbackHandler>,
    clock: Arc<dyn Clock>,
    state: Mutex<LevelState>,
    // Mirror of state.level for lock-free reads
    level: AtomicU8,
    events: broadcast::Sender<LevelChange>,
}

impl GracefulDegradationManager {
    pub fn new(
        config: DegradationConfig,
        registry: Arc<CircuitBreakerRegistry>,
        fallback: Arc<FallbackHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            registry,
            fallback,
            clock,
            state: Mutex::new(LevelState {
                level: ServiceLevel::Full,
                degraded_since: None,
                healthy_since: None,
                last_adjust_at: None,
            }),
            level: AtomicU8::new(ServiceLevel::Full.severity()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LevelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &DegradationConfig {
        &self.config
    }

    pub fn fallback(&self) -> &Arc<FallbackHandler> {
        &self.fallback
    }

    pub fn get_current_service_level(&self) -> ServiceLevel {
        ServiceLevel::from_severity(self.level.load(Ordering::Acquire))
    }

    /// When the current degraded stretch began; `None` at Full
    pub fn degraded_since(&self) -> Option<DateTime<Utc>> {
        self.lock().degraded_since
    }

    pub fn feature_gates(&self, level: ServiceLevel) -> FeatureGates {
        self.config.gates.for_level(level).clone()
    }

    pub fn current_feature_gates(&self) -> FeatureGates {
        self.feature_gates(self.get_current_service_level())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LevelChange> {
        self.events.subscribe()
    }

    /// Re-evaluates the level from breaker health. Moves at most one step.
    pub fn auto_adjust_service_level(&self, correlation_id: &str) -> ServiceLevel {
        // Read breaker health before taking our own lock
        let open_fraction = self.registry.open_fraction();
        let all_closed = self.registry.all_closed();
        let now = self.clock.now();

        let mut change = None;
        let level = {
            let mut state = self.lock();
            state.last_adjust_at = Some(now);

            if open_fraction > self.config.open_fraction_threshold {
                state.healthy_since = None;
                if state.level != ServiceLevel::Emergency {
                    let to = state.level.step_down();
                    change = Some(self.set_level(
                        &mut state,
                        to,
                        format!("{:.0}% of circuits open", open_fraction * 100.0),
                        correlation_id,
                    ));
                }
            } else if all_closed {
                let healthy_since = *state.healthy_since.get_or_insert(now);
                if state.level != ServiceLevel::Full
                    && now.saturating_duration_since(healthy_since) >= self.config.recovery_window
                {
                    let to = state.level.step_up();
                    change = Some(self.set_level(
                        &mut state,
                        to,
                        format!(
                            "all circuits closed for {}s",
                            self.config.recovery_window.as_secs()
                        ),
                        correlation_id,
                    ));
                    state.healthy_since = Some(now);
                }
            } else {
                state.healthy_since = None;
            }

            state.level
        };

        self.publish(change);
        level
    }

    /// Forces a one-step degrade
    pub fn degrade_service_level(&self, reason: &str, correlation_id: &str) -> ServiceLevel {
        let mut change = None;
        let level = {
            let mut state = self.lock();
            state.healthy_since = None;
            if state.level != ServiceLevel::Emergency {
                let to = state.level.step_down();
                change = Some(self.set_level(&mut state, to, reason.to_string(), correlation_id));
            }
            state.level
        };
        self.publish(change);
        level
    }

    /// Returns to Full immediately
    pub fn reset(&self) {
        let change = {
            let mut state = self.lock();
            state.healthy_since = None;
            (state.level != ServiceLevel::Full)
                .then(|| self.set_level(&mut state, ServiceLevel::Full, "manual reset".to_string(), "operator"))
        };
        self.publish(change);
    }

    /// Feeds the outcome of a call into the level. Non-operational failures
    /// degrade immediately; anything else triggers a throttled auto-adjust.
    pub fn observe_outcome(&self, error: Option<&ErrorRecord>, correlation_id: &str) -> ServiceLevel {
        if let Some(err) = error.filter(|err| !err.is_operational()) {
            return self.degrade_service_level(&format!("non-operational error: {}", err.kind), correlation_id);
        }

        let now = self.clock.now();
        let due = self
            .lock()
            .last_adjust_at
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.min_adjust_interval);
        if due {
            self.auto_adjust_service_level(correlation_id)
        } else {
            self.get_current_service_level()
        }
    }

    /// Serves a request from the fallback path
    pub async fn execute_graceful_degradation(&self, request: &FallbackRequest) -> DegradedResponse {
        let service_level = self.get_current_service_level();
        debug!(
            operation = %request.operation,
            correlation_id = %request.correlation_id,
            service_level = %service_level,
            "Serving degraded response"
        );

        let outcome = self.fallback.execute_fallback(request).await;
        DegradedResponse {
            fallback_used: true,
            fallback_type: outcome.fallback_used,
            outcome,
            service_level,
        }
    }

    fn set_level(&self, state: &mut LevelState, to: ServiceLevel, reason: String, correlation_id: &str) -> LevelChange {
        let from = state.level;
        state.level = to;
        if to == ServiceLevel::Full {
            state.degraded_since = None;
        } else if from == ServiceLevel::Full {
            state.degraded_since = Some(self.clock.utc_now());
        }
        self.level.store(to.severity(), Ordering::Release);

        LevelChange {
            from,
            to,
            reason,
            correlation_id: correlation_id.to_string(),
            at: self.clock.utc_now(),
        }
    }

    fn publish(&self, change: Option<LevelChange>) {
        let Some(change) = change else {
            return;
        };

        if change.to > change.from {
            warn!(
                from = %change.from,
                to = %change.to,
                reason = %change.reason,
                correlation_id = %change.correlation_id,
                "Service level degraded"
            );
        } else {
            info!(
                from = %change.from,
                to = %change.to,
                reason = %change.reason,
                correlation_id = %change.correlation_id,
                "Service level recovered"
            );
        }

        counter!("resilience_service_level_changes_total", 1, "to" => change.to.as_str());
        gauge!("resilience_service_level", f64::from(change.to.severity()));

        let _ = self.events.send(change);
    }

    /// Spawns the periodic auto-adjust task on the current runtime
    pub fn spawn_auto_adjust(self: &Arc<Self>) -> SupervisorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let period = self.config.adjust_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "Service level supervisor started");

            loop {
                tokio::select! {
                    // Either a shutdown signal or the handle was dropped
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        manager.auto_adjust_service_level("supervisor");
                    }
                }
            }

            info!("Service level supervisor stopped");
        });

        SupervisorHandle { shutdown_tx, handle }
    }
}

/// Handle to the supervised auto-adjust task
#[derive(Debug)]
pub struct SupervisorHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Signals the task to stop and waits for it
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Service level supervisor ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::fallback::FallbackConfig;
    use crate::types::ErrorKind;

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<CircuitBreakerRegistry>,
        manager: Arc<GracefulDegradationManager>,
    }

    fn fixture(config: DegradationConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(3600),
            },
            clock.clone(),
        ));
        let fallback = Arc::new(FallbackHandler::new(FallbackConfig::default(), clock.clone()));
        let manager = Arc::new(GracefulDegradationManager::new(
            config,
            registry.clone(),
            fallback,
            clock.clone(),
        ));
        Fixture {
            clock,
            registry,
            manager,
        }
    }

    fn trip(registry: &CircuitBreakerRegistry, name: &str) {
        let failure = ErrorRecord::new(ErrorKind::ServiceUnavailable, "down", "corr");
        registry
            .get_circuit_breaker(name)
            .try_acquire()
            .unwrap()
            .record_failure(&failure);
    }

    #[test]
    fn test_steps_are_ordered() {
        assert!(ServiceLevel::Full < ServiceLevel::Emergency);
        assert_eq!(ServiceLevel::Full.step_down(), ServiceLevel::Reduced);
        assert_eq!(ServiceLevel::Emergency.step_down(), ServiceLevel::Emergency);
        assert_eq!(ServiceLevel::Emergency.step_up(), ServiceLevel::Minimal);
        assert_eq!(ServiceLevel::Full.step_up(), ServiceLevel::Full);
    }

    #[test]
    fn test_no_breakers_stays_full() {
        let f = fixture(DegradationConfig::default());
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Full);
        assert!(f.manager.degraded_since().is_none());
    }

    #[test]
    fn test_majority_open_degrades_one_step_at_a_time() {
        let f = fixture(DegradationConfig::default());
        trip(&f.registry, "a");
        trip(&f.registry, "b");
        f.registry.get_circuit_breaker("c");

        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Reduced);
        assert!(f.manager.degraded_since().is_some());
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Minimal);
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Emergency);
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Emergency);
    }

    #[test]
    fn test_exactly_half_open_does_not_degrade() {
        let f = fixture(DegradationConfig::default());
        trip(&f.registry, "a");
        f.registry.get_circuit_breaker("b");

        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Full);
    }

    #[test]
    fn test_recovery_requires_full_window() {
        let f = fixture(DegradationConfig::default());
        f.manager.degrade_service_level("test", "c");
        f.manager.degrade_service_level("test", "c");
        assert_eq!(f.manager.get_current_service_level(), ServiceLevel::Minimal);
        f.registry.get_circuit_breaker("a");

        // Starts the healthy window
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Minimal);
        f.clock.advance(Duration::from_secs(59));
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Minimal);
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Reduced);

        // Window restarts after each step
        f.clock.advance(Duration::from_secs(30));
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Reduced);
        f.clock.advance(Duration::from_secs(30));
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Full);
        assert!(f.manager.degraded_since().is_none());
    }

    #[test]
    fn test_degraded_since_marks_start_of_stretch() {
        let f = fixture(DegradationConfig::default());
        f.manager.degrade_service_level("outage", "c");
        let started = f.manager.degraded_since().unwrap();

        f.clock.advance(Duration::from_secs(5));
        f.manager.degrade_service_level("outage", "c");
        assert_eq!(f.manager.get_current_service_level(), ServiceLevel::Minimal);
        assert_eq!(f.manager.degraded_since(), Some(started));

        f.manager.reset();
        assert!(f.manager.degraded_since().is_none());
    }

    #[test]
    fn test_partial_outage_clears_healthy_window() {
        let f = fixture(DegradationConfig::default());
        f.manager.degrade_service_level("test", "c");
        f.registry.get_circuit_breaker("a");
        f.registry.get_circuit_breaker("b");
        f.registry.get_circuit_breaker("c");

        f.manager.auto_adjust_service_level("c");
        f.clock.advance(Duration::from_secs(50));
        trip(&f.registry, "a");
        f.manager.auto_adjust_service_level("c");
        f.registry.reset("a");

        f.clock.advance(Duration::from_secs(20));
        assert_eq!(f.manager.auto_adjust_service_level("c"), ServiceLevel::Reduced);
    }

    #[test]
    fn test_non_operational_error_forces_degrade() {
        let f = fixture(DegradationConfig::default());
        let bug = ErrorRecord::new(ErrorKind::Internal, "bug", "c");

        assert_eq!(f.manager.observe_outcome(Some(&bug), "c"), ServiceLevel::Reduced);

        // A success does not raise the level
        assert_eq!(f.manager.observe_outcome(None, "c"), ServiceLevel::Reduced);
    }

    #[test]
    fn test_observe_outcome_is_throttled() {
        let f = fixture(DegradationConfig::default());
        trip(&f.registry, "a");

        assert_eq!(f.manager.observe_outcome(None, "c"), ServiceLevel::Reduced);
        assert_eq!(f.manager.observe_outcome(None, "c"), ServiceLevel::Reduced);
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.manager.observe_outcome(None, "c"), ServiceLevel::Minimal);
    }

    #[test]
    fn test_feature_gates_per_level() {
        let f = fixture(DegradationConfig::default());
        let full = f.manager.feature_gates(ServiceLevel::Full);
        assert!(full.optional_enrichment && full.streaming && !full.fallback_only);

        let reduced = f.manager.feature_gates(ServiceLevel::Reduced);
        assert!(!reduced.optional_enrichment);
        assert!(reduced.max_context_tokens.is_some());

        let minimal = f.manager.feature_gates(ServiceLevel::Minimal);
        assert!(!minimal.streaming && !minimal.large_context);

        assert!(f.manager.feature_gates(ServiceLevel::Emergency).fallback_only);
    }

    #[test]
    fn test_reset_and_events() {
        let f = fixture(DegradationConfig::default());
        let mut events = f.manager.subscribe();

        f.manager.degrade_service_level("upstream outage", "corr-x");
        f.manager.reset();

        let first = events.try_recv().unwrap();
        assert_eq!((first.from, first.to), (ServiceLevel::Full, ServiceLevel::Reduced));
        assert_eq!(first.correlation_id, "corr-x");
        let second = events.try_recv().unwrap();
        assert_eq!(second.to, ServiceLevel::Full);
        assert_eq!(f.manager.get_current_service_level(), ServiceLevel::Full);
    }

    #[tokio::test]
    async fn test_graceful_path_reports_fallback() {
        let f = fixture(DegradationConfig::default());
        let request = FallbackRequest::new("op", "corr", serde_json::Value::Null);

        let degraded = f.manager.execute_graceful_degradation(&request).await;
        assert!(degraded.fallback_used);
        assert_eq!(degraded.fallback_type, FallbackType::ErrorFallback);
        assert_eq!(degraded.service_level, ServiceLevel::Full);
    }

    #[tokio::test]
    async fn test_supervisor_adjusts_and_stops() {
        let f = fixture(DegradationConfig {
            adjust_interval: Duration::from_millis(5),
            ..DegradationConfig::default()
        });
        trip(&f.registry, "a");

        let supervisor = f.manager.spawn_auto_adjust();
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown().await;

        assert_eq!(f.manager.get_current_service_level(), ServiceLevel::Emergency);
    }
}
