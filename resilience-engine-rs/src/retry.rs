//! # Retry Strategy
//!
//! Executes one logical operation with bounded attempts and exponential
//! backoff with jitter. Failures are classified after every attempt and only
//! retryable kinds consume more of the budget. The loop also honours a
//! per-attempt timeout, the overall deadline of the call and cancellation of
//! the inbound request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::classifier::{classify, ClassifyContext, ConnectionCause, Failure};
use crate::context::{CallContext, CancellationToken};
use crate::types::{duration_ms, duration_ms_opt, ErrorKind, ErrorRecord};

/// Configuration for a retry strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Upper bound for the exponential part of the delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_factor: f64,
    /// Random jitter is drawn from `[0, jitter_ceiling)`
    #[serde(with = "duration_ms")]
    pub jitter_ceiling: Duration,
    /// Bound on a single attempt
    #[serde(with = "duration_ms_opt")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_factor: 2.0,
            jitter_ceiling: Duration::from_millis(1000),
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl TryFrom<config::Config> for RetryConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = RetryConfig::default();

        if let Ok(max_attempts) = cfg.get::<u32>("retry.max_attempts") {
            base.max_attempts = max_attempts;
        }
        if let Ok(ms) = cfg.get::<u64>("retry.base_delay_ms") {
            base.base_delay = Duration::from_millis(ms);
        }
        if let Ok(ms) = cfg.get::<u64>("retry.max_delay_ms") {
            base.max_delay = Duration::from_millis(ms);
        }
        if let Ok(factor) = cfg.get::<f64>("retry.backoff_factor") {
            base.backoff_factor = factor;
        }
        if let Ok(ms) = cfg.get::<u64>("retry.jitter_ceiling_ms") {
            base.jitter_ceiling = Duration::from_millis(ms);
        }
        if let Ok(ms) = cfg.get::<u64>("retry.attempt_timeout_ms") {
            base.attempt_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(base)
    }
}

/// State of one logical call moving through the retry loop. Created fresh
/// per call; only `attempt` changes.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation_name: String,
    pub correlation_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_ceiling: Duration,
    pub attempt_timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    pub cancellation: CancellationToken,
}

impl RetryContext {
    pub fn new<O: Into<String>, C: Into<String>>(
        operation_name: O,
        correlation_id: C,
        config: &RetryConfig,
    ) -> Self {
        Self {
            operation_name: operation_name.into(),
            correlation_id: correlation_id.into(),
            attempt: 0,
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            backoff_factor: config.backoff_factor,
            jitter_ceiling: config.jitter_ceiling,
            attempt_timeout: config.attempt_timeout,
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Builds the retry context for a call
    pub fn for_call(call: &CallContext, config: &RetryConfig) -> Self {
        let mut ctx = Self::new(call.operation.clone(), call.correlation_id.clone(), config);
        ctx.deadline = call.deadline;
        ctx.cancellation = call.cancellation.clone();
        ctx
    }

    /// Exponential part of the delay before attempt `attempt + 1`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw_ms = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped_ms as u64)
    }

    /// Full delay after a failed attempt, jitter included. Rate limits wait
    /// at least as long as the upstream asked, still capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32, error: &ErrorRecord) -> Duration {
        let backoff = self.backoff_delay(attempt);
        let base = match (error.kind, error.retry_after) {
            (ErrorKind::RateLimited, Some(retry_after)) => backoff.max(retry_after).min(self.max_delay),
            _ => backoff,
        };
        base + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let ceiling = self.jitter_ceiling.as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling))
    }

    fn classify(&self, failure: &Failure) -> ErrorRecord {
        classify(
            failure,
            &ClassifyContext::new(&self.correlation_id, &self.operation_name),
        )
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ErrorRecord>,
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Whether more than one attempt was made
    pub fn retry_used(&self) -> bool {
        self.attempts > 1
    }
}

/// Cumulative counters for one operation name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub attempts: u64,
    pub retries: u64,
    pub total_duration_ms: u64,
    pub last_error_kind: Option<ErrorKind>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl OperationMetrics {
    pub fn average_duration_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.calls as f64
        }
    }
}

/// How a single attempt ended
enum AttemptEnd<T> {
    Completed(Result<T, Failure>),
    AttemptTimedOut(Duration),
    DeadlineHit,
    Cancelled,
}

/// A named retry strategy
#[derive(Debug)]
pub struct RetryStrategy {
    name: String,
    config: RetryConfig,
    metrics: Mutex<HashMap<String, OperationMetrics>>,
}

impl RetryStrategy {
    pub fn new<S: Into<String>>(name: S, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry context for a call using this strategy's configuration
    pub fn context(&self, call: &CallContext) -> RetryContext {
        RetryContext::for_call(call, &self.config)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// exhausts the attempt budget, crosses the deadline or is cancelled.
    /// The operation receives the 1-based attempt number.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut ctx: RetryContext,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let start = Instant::now();

        let result = loop {
            ctx.attempt += 1;
            let attempt = ctx.attempt;

            counter!("resilience_retry_attempts_total", 1, "operation" => ctx.operation_name.clone());

            let end = if ctx.cancellation.is_cancelled() {
                AttemptEnd::Cancelled
            } else {
                run_attempt(&ctx, operation(attempt)).await
            };

            let error = match end {
                AttemptEnd::Completed(Ok(value)) => {
                    if attempt > 1 {
                        info!(
                            operation = %ctx.operation_name,
                            correlation_id = %ctx.correlation_id,
                            attempt = attempt,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Operation succeeded after retries"
                        );
                    }
                    break Ok(value);
                }
                AttemptEnd::Completed(Err(failure)) => ctx.classify(&failure),
                AttemptEnd::AttemptTimedOut(limit) => ctx.classify(&Failure::connection(
                    ConnectionCause::Timeout,
                    format!("attempt {} exceeded {}ms", attempt, limit.as_millis()),
                )),
                AttemptEnd::DeadlineHit => {
                    break Err(ctx.classify(&Failure::DeadlineExceeded {
                        elapsed: start.elapsed(),
                    }));
                }
                AttemptEnd::Cancelled => break Err(ctx.classify(&Failure::Cancelled)),
            };

            if !error.retryable || attempt >= ctx.max_attempts {
                debug!(
                    operation = %ctx.operation_name,
                    correlation_id = %ctx.correlation_id,
                    attempt = attempt,
                    max_attempts = ctx.max_attempts,
                    error_kind = %error.kind,
                    "Giving up"
                );
                break Err(error);
            }

            let delay = ctx.delay_after(attempt, &error);
            if let Some(deadline) = ctx.deadline {
                if Instant::now() + delay >= deadline {
                    warn!(
                        operation = %ctx.operation_name,
                        correlation_id = %ctx.correlation_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Next backoff would cross the deadline"
                    );
                    break Err(ctx
                        .classify(&Failure::DeadlineExceeded {
                            elapsed: start.elapsed(),
                        })
                        .originating(error.to_string()));
                }
            }

            debug!(
                operation = %ctx.operation_name,
                correlation_id = %ctx.correlation_id,
                attempt = attempt,
                max_attempts = ctx.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error_kind = %error.kind,
                "Retrying after error"
            );
            counter!("resilience_retries_total", 1, "operation" => ctx.operation_name.clone());

            let cancelled = tokio::select! {
                biased;
                _ = ctx.cancellation.cancelled() => true,
                _ = sleep(delay) => false,
            };
            if cancelled {
                break Err(ctx.classify(&Failure::Cancelled));
            }
        };

        let total_duration = start.elapsed();
        self.record(&ctx, &result, total_duration);

        RetryOutcome {
            result,
            attempts: ctx.attempt,
            total_duration,
        }
    }

    fn record<T>(&self, ctx: &RetryContext, result: &Result<T, ErrorRecord>, duration: Duration) {
        histogram!(
            "resilience_retry_duration_ms",
            duration.as_millis() as f64,
            "operation" => ctx.operation_name.clone()
        );
        match result {
            Ok(_) => {
                counter!("resilience_retry_success_total", 1, "operation" => ctx.operation_name.clone());
            }
            Err(err) => {
                counter!(
                    "resilience_retry_failure_total",
                    1,
                    "operation" => ctx.operation_name.clone(),
                    "kind" => err.kind.wire_type()
                );
            }
        }

        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let entry = metrics.entry(ctx.operation_name.clone()).or_default();
        entry.calls += 1;
        entry.attempts += u64::from(ctx.attempt);
        entry.retries += u64::from(ctx.attempt.saturating_sub(1));
        entry.total_duration_ms += duration.as_millis() as u64;
        match result {
            Ok(_) => entry.successes += 1,
            Err(err) => {
                entry.failures += 1;
                entry.last_error_kind = Some(err.kind);
                entry.last_failure_at = Some(err.timestamp);
            }
        }
    }

    /// Snapshot of per-operation counters
    pub fn get_metrics(&self) -> HashMap<String, OperationMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Counters for a single operation
    pub fn operation_metrics(&self, operation: &str) -> Option<OperationMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(operation)
            .cloned()
    }

    pub fn reset_metrics(&self) {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

async fn run_attempt<T, Fut>(ctx: &RetryContext, attempt: Fut) -> AttemptEnd<T>
where
    Fut: Future<Output = Result<T, Failure>>,
{
    let remaining = ctx
        .deadline
        .map(|deadline| deadline.saturating_duration_since(Instant::now()));
    if remaining == Some(Duration::ZERO) {
        return AttemptEnd::DeadlineHit;
    }

    // The tighter of the per-attempt timeout and the remaining deadline wins
    let (limit, limit_is_deadline) = match (ctx.attempt_timeout, remaining) {
        (Some(timeout), Some(left)) if left <= timeout => (Some(left), true),
        (Some(timeout), _) => (Some(timeout), false),
        (None, Some(left)) => (Some(left), true),
        (None, None) => (None, false),
    };

    let bounded = async move {
        match limit {
            Some(limit) => tokio::time::timeout(limit, attempt).await.ok(),
            None => Some(attempt.await),
        }
    };

    tokio::select! {
        biased;
        _ = ctx.cancellation.cancelled() => AttemptEnd::Cancelled,
        finished = bounded => match (finished, limit) {
            (Some(result), _) => AttemptEnd::Completed(result),
            (None, _) if limit_is_deadline => AttemptEnd::DeadlineHit,
            (None, limit) => AttemptEnd::AttemptTimedOut(limit.unwrap_or_default()),
        },
    }
}

/// All per-operation metrics, keyed by strategy name
pub type RetryMetricsSnapshot = HashMap<String, HashMap<String, OperationMetrics>>;

/// Keeps one retry strategy per name
#[derive(Debug, Default)]
pub struct RetryStrategyRegistry {
    default_config: RetryConfig,
    strategies: Mutex<HashMap<String, Arc<RetryStrategy>>>,
}

impl RetryStrategyRegistry {
    pub fn new(default_config: RetryConfig) -> Self {
        Self {
            default_config,
            strategies: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the strategy for `name`, creating it with the default config
    pub fn get_strategy(&self, name: &str) -> Arc<RetryStrategy> {
        self.get_with_config(name, None)
    }

    /// Returns the strategy for `name`. `config` only applies on creation.
    pub fn get_with_config(&self, name: &str, config: Option<RetryConfig>) -> Arc<RetryStrategy> {
        let mut strategies = self.strategies.lock().unwrap_or_else(|e| e.into_inner());
        strategies
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(RetryStrategy::new(
                    name,
                    config.unwrap_or_else(|| self.default_config.clone()),
                ))
            })
            .clone()
    }

    pub fn get_all_metrics(&self) -> RetryMetricsSnapshot {
        let strategies: Vec<Arc<RetryStrategy>> = self
            .strategies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        strategies
            .into_iter()
            .map(|strategy| (strategy.name().to_string(), strategy.get_metrics()))
            .collect()
    }

    pub fn reset_all(&self) {
        let strategies = self.strategies.lock().unwrap_or_else(|e| e.into_inner());
        for strategy in strategies.values() {
            strategy.reset_metrics();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::HttpFailure;
    use crate::classifier::Provider;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
            jitter_ceiling: Duration::ZERO,
            attempt_timeout: Some(Duration::from_secs(1)),
        }
    }

    fn ctx(config: &RetryConfig) -> RetryContext {
        RetryContext::new("test_op", "corr-retry", config)
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let config = fast_config(3);
        let strategy = RetryStrategy::new("test", config.clone());

        let outcome = strategy
            .execute_with_retry(ctx(&config), |_| async { Ok::<_, Failure>(42) })
            .await;

        assert_eq!(assert_ok!(outcome.result), 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_success_after_two_503s() {
        let config = fast_config(3);
        let strategy = RetryStrategy::new("test", config.clone());
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        let outcome = strategy
            .execute_with_retry(ctx(&config), move |_| {
                let counter = counter_clone.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Failure::http(503))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert!(outcome.is_success());
        assert!(outcome.retry_used());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unauthorized_consumes_one_attempt() {
        let config = fast_config(5);
        let strategy = RetryStrategy::new("test", config.clone());
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        let outcome = strategy
            .execute_with_retry(ctx(&config), move |_| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Failure::http(401)) }
            })
            .await;

        let err = assert_err!(outcome.result);
        assert_eq!(err.kind, ErrorKind::Unauthorized);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_budget() {
        let config = fast_config(3);
        let strategy = RetryStrategy::new("test", config.clone());
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        let outcome = strategy
            .execute_with_retry(ctx(&config), move |_| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Failure::http(502)) }
            })
            .await;

        let err = assert_err!(outcome.result);
        assert_eq!(err.kind, ErrorKind::UpstreamError);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_sequence() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_factor: 2.0,
            jitter_ceiling: Duration::ZERO,
            attempt_timeout: None,
        };
        let ctx = ctx(&config);

        let delays: Vec<u64> = (1..=5)
            .map(|attempt| ctx.backoff_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000]);
    }

    #[test]
    fn test_jitter_stays_below_ceiling() {
        let config = RetryConfig {
            jitter_ceiling: Duration::from_millis(250),
            ..RetryConfig::default()
        };
        let ctx = ctx(&config);
        let err = ErrorRecord::new(ErrorKind::UpstreamError, "boom", "c");

        for _ in 0..200 {
            let delay = ctx.delay_after(1, &err);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay < Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_rate_limit_respects_retry_after_up_to_cap() {
        let config = RetryConfig {
            jitter_ceiling: Duration::ZERO,
            ..RetryConfig::default()
        };
        let ctx = ctx(&config);

        let polite = ErrorRecord::new(ErrorKind::RateLimited, "slow", "c")
            .retry_after(Some(Duration::from_millis(3500)));
        assert_eq!(ctx.delay_after(1, &polite), Duration::from_millis(3500));

        let greedy = ErrorRecord::new(ErrorKind::RateLimited, "slow", "c")
            .retry_after(Some(Duration::from_secs(60)));
        assert_eq!(ctx.delay_after(1, &greedy), Duration::from_millis(10_000));

        // retry_after only applies to rate limits
        let other = ErrorRecord::new(ErrorKind::UpstreamError, "boom", "c")
            .retry_after(Some(Duration::from_millis(3500)));
        assert_eq!(ctx.delay_after(1, &other), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let mut config = fast_config(2);
        config.attempt_timeout = Some(Duration::from_millis(10));
        let strategy = RetryStrategy::new("test", config.clone());

        let outcome = strategy
            .execute_with_retry(ctx(&config), |_| async {
                sleep(Duration::from_millis(200)).await;
                Ok::<_, Failure>(())
            })
            .await;

        let err = assert_err!(outcome.result);
        assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_deadline_mid_attempt_stops_with_timeout() {
        let config = fast_config(5);
        let strategy = RetryStrategy::new("test", config.clone());
        let mut retry_ctx = ctx(&config);
        retry_ctx.deadline = Some(Instant::now() + Duration::from_millis(30));

        let outcome = strategy
            .execute_with_retry(retry_ctx, |_| async {
                sleep(Duration::from_millis(500)).await;
                Ok::<_, Failure>(())
            })
            .await;

        let err = assert_err!(outcome.result);
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.http_status, 504);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_backoff_crossing_deadline_stops_early() {
        let mut config = fast_config(5);
        config.base_delay = Duration::from_millis(500);
        config.max_delay = Duration::from_millis(500);
        let strategy = RetryStrategy::new("test", config.clone());
        let mut retry_ctx = ctx(&config);
        retry_ctx.deadline = Some(Instant::now() + Duration::from_millis(100));

        let started = Instant::now();
        let outcome = strategy
            .execute_with_retry(retry_ctx, |_| async { Err::<(), _>(Failure::http(503)) })
            .await;

        let err = assert_err!(outcome.result);
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(outcome.attempts, 1);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let mut config = fast_config(5);
        config.base_delay = Duration::from_secs(5);
        config.max_delay = Duration::from_secs(5);
        let strategy = RetryStrategy::new("test", config.clone());
        let token = CancellationToken::new();
        let handle = token.clone();
        let mut retry_ctx = ctx(&config);
        retry_ctx.cancellation = token;

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let outcome = strategy
            .execute_with_retry(retry_ctx, |_| async { Err::<(), _>(Failure::http(503)) })
            .await;
        canceller.await.unwrap();

        let err = assert_err!(outcome.result);
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_rate_limited_failure_is_retried() {
        let config = fast_config(2);
        let strategy = RetryStrategy::new("test", config.clone());
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        let outcome = strategy
            .execute_with_retry(ctx(&config), move |_| {
                let counter = counter_clone.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Failure::Http(HttpFailure::new(429, Provider::Azure).retry_after("0")))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(assert_ok!(outcome.result), 7);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_metrics_accumulate_and_reset() {
        let config = fast_config(2);
        let strategy = RetryStrategy::new("test", config.clone());

        let _ = strategy
            .execute_with_retry(ctx(&config), |_| async { Ok::<_, Failure>(()) })
            .await;
        let _ = strategy
            .execute_with_retry(ctx(&config), |_| async { Err::<(), _>(Failure::http(500)) })
            .await;

        let metrics = strategy.operation_metrics("test_op").unwrap();
        assert_eq!(metrics.calls, 2);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.attempts, 3);
        assert_eq!(metrics.retries, 1);
        assert_eq!(metrics.last_error_kind, Some(ErrorKind::UpstreamError));

        strategy.reset_metrics();
        assert!(strategy.get_metrics().is_empty());
    }

    #[test]
    fn test_registry_caches_by_name() {
        let registry = RetryStrategyRegistry::new(RetryConfig::default());
        let a = registry.get_strategy("azure");
        let b = registry.get_with_config("azure", Some(fast_config(9)));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().max_attempts, 3);
        assert!(registry.get_all_metrics().contains_key("azure"));
    }
}
