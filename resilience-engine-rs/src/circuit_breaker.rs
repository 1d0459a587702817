//! # Circuit Breaker
//!
//! Per-dependency Closed/Open/Half-Open state machine deciding whether an
//! outbound call is attempted at all.
//!
//! - **Closed**: calls pass. Consecutive failures are counted and the circuit
//!   opens once they reach the threshold.
//! - **Open**: calls are rejected locally until the reset timeout elapses.
//!   The first call after that moves the circuit to Half-Open as the probe.
//! - **Half-Open**: exactly one probe is in flight. Its verdict closes or
//!   re-opens the circuit; everyone else is rejected meanwhile.
//!
//! State lives behind one mutex per breaker that is never held across an
//! await point. Transitions are published on a broadcast channel.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::types::{duration_ms, ErrorKind, ErrorRecord};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery with a single probe
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time to keep the circuit open before probing
    #[serde(with = "duration_ms")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl TryFrom<config::Config> for CircuitBreakerConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = CircuitBreakerConfig::default();

        if let Ok(threshold) = cfg.get::<u32>("circuit_breaker.failure_threshold") {
            base.failure_threshold = threshold;
        }
        if let Ok(ms) = cfg.get::<u64>("circuit_breaker.reset_timeout_ms") {
            base.reset_timeout = Duration::from_millis(ms);
        }

        Ok(base)
    }
}

/// A state change of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub circuit: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

/// Raised when the circuit rejects a call without attempting it
#[derive(Debug, Clone, Error)]
#[error("circuit '{circuit}' is {state}, next attempt at {next_attempt_at}")]
pub struct CircuitBreakerError {
    pub circuit: String,
    pub state: CircuitState,
    pub next_attempt_at: DateTime<Utc>,
}

impl CircuitBreakerError {
    /// Normalizes the rejection for callers
    pub fn into_record(self, correlation_id: &str) -> ErrorRecord {
        ErrorRecord::new(
            ErrorKind::CircuitBreakerOpen,
            format!("circuit breaker '{}' is {}", self.circuit, self.state),
            correlation_id,
        )
        .next_attempt_at(self.next_attempt_at)
    }
}

/// Point-in-time view of a breaker for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_state_change_at: DateTime<Utc>,
    pub half_open_probe_in_flight: bool,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    last_state_change_at: Instant,
    probe_in_flight: bool,
    // Bumped whenever a new probe is handed out, so a stale permit cannot
    // release or settle someone else's probe
    probe_generation: u64,
    calls: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            next_attempt_at: None,
            last_state_change_at: now,
            probe_in_flight: false,
            probe_generation: 0,
            calls: 0,
            successes: 0,
            failures: 0,
            rejections: 0,
        }
    }
}

/// A single named circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
    events: broadcast::Sender<StateTransition>,
}

impl CircuitBreaker {
    /// Creates a standalone breaker on the system clock
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_parts(name, config, Arc::new(SystemClock), events)
    }

    fn with_parts<S: Into<String>>(
        name: S,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<StateTransition>,
    ) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState::new(now)),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether the next call would be admitted as the recovery probe
    pub fn probe_due(&self) -> bool {
        let now = self.clock.now();
        let inner = self.lock();
        match inner.state {
            CircuitState::Open => inner.next_attempt_at.map_or(true, |at| now >= at),
            CircuitState::HalfOpen => !inner.probe_in_flight,
            CircuitState::Closed => false,
        }
    }

    /// Receives this breaker's state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Asks whether a call may proceed. The returned permit must be settled
    /// with [`CircuitPermit::record_success`] or
    /// [`CircuitPermit::record_failure`]; dropping it unsettled abandons the
    /// call without a verdict.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, CircuitBreakerError> {
        let now = self.clock.now();
        let mut transition = None;

        let result = {
            let mut inner = self.lock();
            let current = inner.state;
            match current {
                CircuitState::Closed => {
                    inner.calls += 1;
                    Ok(CircuitPermit::new(self, None))
                }
                CircuitState::Open => match inner.next_attempt_at {
                    Some(at) if now < at => {
                        inner.rejections += 1;
                        Err((current, at))
                    }
                    _ => {
                        transition = Some(self.transition(&mut inner, CircuitState::HalfOpen, now));
                        inner.calls += 1;
                        Ok(CircuitPermit::new(self, Some(Self::take_probe(&mut inner))))
                    }
                },
                CircuitState::HalfOpen if !inner.probe_in_flight => {
                    inner.calls += 1;
                    Ok(CircuitPermit::new(self, Some(Self::take_probe(&mut inner))))
                }
                CircuitState::HalfOpen => {
                    inner.rejections += 1;
                    Err((current, now))
                }
            }
        };

        self.publish(transition);

        result.map_err(|(state, next_attempt)| {
            counter!("resilience_circuit_rejections_total", 1, "circuit" => self.name.clone());
            debug!(circuit = %self.name, state = %state, "Circuit rejected call");
            CircuitBreakerError {
                circuit: self.name.clone(),
                state,
                next_attempt_at: self.clock.to_utc(next_attempt),
            }
        })
    }

    fn take_probe(inner: &mut BreakerState) -> u64 {
        inner.probe_in_flight = true;
        inner.probe_generation += 1;
        inner.probe_generation
    }

    fn on_success(&self, probe: Option<u64>) {
        let now = self.clock.now();
        let mut transition = None;
        {
            let mut inner = self.lock();
            inner.successes += 1;
            let current = inner.state;
            match current {
                CircuitState::Closed => inner.consecutive_failures = 0,
                CircuitState::HalfOpen if probe == Some(inner.probe_generation) => {
                    inner.consecutive_failures = 0;
                    inner.next_attempt_at = None;
                    inner.probe_in_flight = false;
                    transition = Some(self.transition(&mut inner, CircuitState::Closed, now));
                }
                // A call admitted before the circuit opened does not close it
                _ => {}
            }
        }
        self.publish(transition);
    }

    fn on_failure(&self, probe: Option<u64>) {
        let now = self.clock.now();
        let mut transition = None;
        {
            let mut inner = self.lock();
            inner.failures += 1;
            inner.last_failure_at = Some(now);
            let current = inner.state;
            match current {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.next_attempt_at = Some(now + self.config.reset_timeout);
                        transition = Some(self.transition(&mut inner, CircuitState::Open, now));
                    }
                }
                CircuitState::HalfOpen if probe == Some(inner.probe_generation) => {
                    inner.consecutive_failures += 1;
                    inner.probe_in_flight = false;
                    inner.next_attempt_at = Some(now + self.config.reset_timeout);
                    transition = Some(self.transition(&mut inner, CircuitState::Open, now));
                }
                _ => inner.consecutive_failures += 1,
            }
        }
        self.publish(transition);
    }

    fn on_abandon(&self, probe: Option<u64>) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && probe == Some(inner.probe_generation) {
            inner.probe_in_flight = false;
            debug!(circuit = %self.name, "Probe abandoned, slot released");
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) -> StateTransition {
        let from = inner.state;
        inner.state = to;
        inner.last_state_change_at = now;
        StateTransition {
            circuit: self.name.clone(),
            from,
            to,
            consecutive_failures: inner.consecutive_failures,
            at: self.clock.to_utc(now),
        }
    }

    fn publish(&self, transition: Option<StateTransition>) {
        let Some(transition) = transition else {
            return;
        };

        match transition.to {
            CircuitState::Open => warn!(
                circuit = %self.name,
                from = %transition.from,
                failures = transition.consecutive_failures,
                threshold = self.config.failure_threshold,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit OPENED"
            ),
            CircuitState::HalfOpen => info!(circuit = %self.name, "Circuit HALF-OPEN: probing"),
            CircuitState::Closed => info!(circuit = %self.name, "Circuit CLOSED: service recovered"),
        }

        counter!(
            "resilience_circuit_transitions_total",
            1,
            "circuit" => self.name.clone(),
            "to" => transition.to.to_string()
        );
        gauge!("resilience_circuit_state", transition.to.gauge_value(), "circuit" => self.name.clone());

        // No subscribers is fine
        let _ = self.events.send(transition);
    }

    /// Gates `operation` through the breaker and reports its outcome.
    /// Rejections never run the operation.
    pub async fn execute<T, F, Fut>(
        &self,
        correlation_id: &str,
        operation_name: &str,
        operation: F,
    ) -> CircuitOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ErrorRecord>>,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                debug!(
                    circuit = %self.name,
                    operation = %operation_name,
                    correlation_id = %correlation_id,
                    "Call short-circuited"
                );
                return CircuitOutcome {
                    result: Err(rejection.into_record(correlation_id)),
                    rejected: true,
                };
            }
        };

        let result = operation().await;
        match &result {
            Ok(_) => permit.record_success(),
            Err(err) => permit.record_failure(err),
        }

        CircuitOutcome {
            result,
            rejected: false,
        }
    }

    /// Forces the breaker back to Closed. Lifetime counters are kept.
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.lock();
            let was = inner.state;
            inner.consecutive_failures = 0;
            inner.next_attempt_at = None;
            inner.probe_in_flight = false;
            inner.probe_generation += 1;
            (was != CircuitState::Closed).then(|| self.transition(&mut inner, CircuitState::Closed, now))
        };
        info!(circuit = %self.name, "Circuit manually reset");
        self.publish(transition);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
            last_failure_at: inner.last_failure_at.map(|at| self.clock.to_utc(at)),
            next_attempt_at: inner.next_attempt_at.map(|at| self.clock.to_utc(at)),
            last_state_change_at: self.clock.to_utc(inner.last_state_change_at),
            half_open_probe_in_flight: inner.probe_in_flight,
            calls: inner.calls,
            successes: inner.successes,
            failures: inner.failures,
            rejections: inner.rejections,
        }
    }
}

/// Result of [`CircuitBreaker::execute`]
#[derive(Debug)]
pub struct CircuitOutcome<T> {
    pub result: Result<T, ErrorRecord>,
    /// The call was rejected without being attempted
    pub rejected: bool,
}

/// Admission to call through a breaker
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: Option<u64>,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: Option<u64>) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this permit is the Half-Open probe
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    /// Reports a failed call. Cancellation says nothing about the dependency
    /// and is treated as an abandoned call.
    pub fn record_failure(mut self, error: &ErrorRecord) {
        self.settled = true;
        if error.counts_against_breaker() {
            self.breaker.on_failure(self.probe);
        } else {
            self.breaker.on_abandon(self.probe);
        }
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.probe);
        }
    }
}

/// Lazily creates and caches one breaker per dependency name
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    events: broadcast::Sender<StateTransition>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            default_config,
            overrides: HashMap::new(),
            clock,
            breakers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Per-name configuration applied when that breaker is first created
    pub fn with_override<S: Into<String>>(mut self, name: S, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the breaker for `name` without creating it
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Returns the breaker for `name`, creating it on first use
    pub fn get_circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with_config(name, None)
    }

    /// Returns the breaker for `name`. `config` only applies on creation.
    pub fn get_with_config(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = config
                    .or_else(|| self.overrides.get(name).cloned())
                    .unwrap_or_else(|| self.default_config.clone());
                debug!(circuit = %name, threshold = config.failure_threshold, "Circuit breaker created");
                Arc::new(CircuitBreaker::with_parts(
                    name,
                    config,
                    self.clock.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.lock().values().cloned().collect()
    }

    pub fn get_all_metrics(&self) -> HashMap<String, CircuitBreakerMetrics> {
        self.snapshot()
            .into_iter()
            .map(|breaker| (breaker.name().to_string(), breaker.metrics()))
            .collect()
    }

    /// Resets one breaker. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        let breaker = self.lock().get(name).cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
    }

    /// Fraction of known breakers currently Open. Zero when there are none.
    pub fn open_fraction(&self) -> f64 {
        let breakers = self.snapshot();
        if breakers.is_empty() {
            return 0.0;
        }
        let open = breakers
            .iter()
            .filter(|breaker| breaker.state() == CircuitState::Open)
            .count();
        open as f64 / breakers.len() as f64
    }

    /// Whether every known breaker is Closed (vacuously true when empty)
    pub fn all_closed(&self) -> bool {
        self.snapshot()
            .iter()
            .all(|breaker| breaker.state() == CircuitState::Closed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Receives state transitions of every breaker in this registry
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), Arc::new(SystemClock))
    }
}
