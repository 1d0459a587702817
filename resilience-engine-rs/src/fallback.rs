//! # Fallback Handler
//!
//! Produces a substitute result once the primary path is exhausted or the
//! circuit is open. Sources are tried in order:
//!
//! 1. A secondary provider, bounded by a timeout and raced against
//!    cancellation. Panics inside it are caught.
//! 2. A cached response for the request, fresh or within the stale window.
//! 3. A configured static degraded response.
//! 4. A structured apology tagged `error_fallback`.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, ClassifyContext, Failure};
use crate::clock::{Clock, SystemClock};
use crate::context::CancellationToken;
use crate::sanitization::{user_message, ErrorBody};
use crate::types::{duration_ms, duration_ms_opt, ErrorKind, ErrorRecord};

/// Configuration for fallback behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Bound on the secondary provider call
    #[serde(with = "duration_ms")]
    pub secondary_timeout: Duration,
    /// How long a cached primary response counts as fresh
    #[serde(with = "duration_ms")]
    pub cache_ttl: Duration,
    /// How long past its ttl a cached response may still be served
    #[serde(with = "duration_ms_opt")]
    pub max_stale: Option<Duration>,
    /// Upper bound on cached responses; the oldest is evicted first
    pub max_cache_entries: usize,
    /// Canned response served when nothing better is available
    pub static_response: Option<Value>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            secondary_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(60),
            max_stale: Some(Duration::from_secs(3600)),
            max_cache_entries: 1000,
            static_response: None,
        }
    }
}

impl TryFrom<config::Config> for FallbackConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = FallbackConfig::default();

        if let Ok(ms) = cfg.get::<u64>("fallback.secondary_timeout_ms") {
            base.secondary_timeout = Duration::from_millis(ms);
        }
        if let Ok(ms) = cfg.get::<u64>("fallback.cache_ttl_ms") {
            base.cache_ttl = Duration::from_millis(ms);
        }
        if let Ok(ms) = cfg.get::<u64>("fallback.max_stale_ms") {
            base.max_stale = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Ok(entries) = cfg.get::<usize>("fallback.max_cache_entries") {
            base.max_cache_entries = entries;
        }
        if let Ok(raw) = cfg.get::<String>("fallback.static_response") {
            base.static_response = Some(
                serde_json::from_str(&raw)
                    .map_err(|e| config::ConfigError::Message(format!("fallback.static_response: {}", e)))?,
            );
        }

        Ok(base)
    }
}

/// Where a substitute result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackType {
    SecondaryProvider,
    Cache,
    StaticResponse,
    ErrorFallback,
}

impl FallbackType {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackType::SecondaryProvider => "secondary_provider",
            FallbackType::Cache => "cache",
            FallbackType::StaticResponse => "static_response",
            FallbackType::ErrorFallback => "error_fallback",
        }
    }
}

impl fmt::Display for FallbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alternative upstream consulted before cached or static responses
#[async_trait]
pub trait SecondaryProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn send(&self, request: &FallbackRequest) -> Result<Value, Failure>;
}

/// Everything the fallback path knows about the failed call
#[derive(Debug, Clone)]
pub struct FallbackRequest {
    pub operation: String,
    pub correlation_id: String,
    /// The opaque request body of the primary call
    pub payload: Value,
    pub cache_key: Option<String>,
    pub cancellation: CancellationToken,
    /// Why the primary path gave up
    pub primary_error: Option<ErrorRecord>,
}

impl FallbackRequest {
    pub fn new<O: Into<String>, C: Into<String>>(operation: O, correlation_id: C, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            correlation_id: correlation_id.into(),
            payload,
            cache_key: None,
            cancellation: CancellationToken::new(),
            primary_error: None,
        }
    }

    pub fn cache_key<S: Into<String>>(mut self, key: S) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn primary_error(mut self, error: ErrorRecord) -> Self {
        self.primary_error = Some(error);
        self
    }
}

/// Result of the fallback path
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub success: bool,
    pub response: Option<Value>,
    pub error: Option<ErrorRecord>,
    pub fallback_used: FallbackType,
    /// The response came from a cache entry past its ttl
    pub stale: bool,
}

impl FallbackOutcome {
    fn served(fallback_used: FallbackType, response: Value) -> Self {
        Self {
            success: true,
            response: Some(response),
            error: None,
            fallback_used,
            stale: false,
        }
    }

    fn failed(error: ErrorRecord) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error),
            fallback_used: FallbackType::ErrorFallback,
            stale: false,
        }
    }
}

/// Body of the `error_fallback` response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorFallbackPayload<'a> {
    #[serde(rename = "type")]
    payload_type: &'static str,
    fallback: bool,
    message: &'static str,
    correlation_id: &'a str,
    error: Option<ErrorBody>,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    data: V,
    stored_at: Instant,
    ttl: Duration,
}

/// A cache hit
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<V> {
    pub value: V,
    pub stale: bool,
    pub age: Duration,
}

/// Bounded ttl cache for fallback values. Expired entries stay servable for
/// `max_stale` past their ttl.
#[derive(Debug)]
pub struct FallbackCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    name: String,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    default_ttl: Duration,
    max_stale: Option<Duration>,
    max_entries: usize,
    clock: Arc<dyn Clock>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl<K, V> FallbackCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    pub fn new<S: Into<String>>(name: S, config: &FallbackConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            default_ttl: config.cache_ttl,
            max_stale: config.max_stale,
            max_entries: config.max_cache_entries.max(1),
            clock,
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<CachedValue<V>> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        let hit = entries.get(key).and_then(|entry| {
            let age = now.saturating_duration_since(entry.stored_at);
            if age <= entry.ttl {
                return Some(CachedValue {
                    value: entry.data.clone(),
                    stale: false,
                    age,
                });
            }
            match self.max_stale {
                Some(max_stale) if age <= entry.ttl + max_stale => {
                    debug!(cache = %self.name, key = ?key, age_secs = age.as_secs(), "Using stale cache entry");
                    Some(CachedValue {
                        value: entry.data.clone(),
                        stale: true,
                        age,
                    })
                }
                _ => None,
            }
        });

        match hit {
            Some(_) => self.hit_count.fetch_add(1, Ordering::Relaxed),
            None => self.miss_count.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    pub fn put(&self, key: K, value: V, ttl: Option<Duration>) {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                data: value,
                stored_at: now,
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
        gauge!("resilience_fallback_cache_size", entries.len() as f64, "cache" => self.name.clone());
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn size(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Hit rate since creation, zero before the first lookup
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let total = hits + self.miss_count.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Runs the fallback chain for failed calls
#[derive(Debug)]
pub struct FallbackHandler {
    config: FallbackConfig,
    secondary: Option<Arc<dyn SecondaryProvider>>,
    cache: FallbackCache<String, Value>,
    debug_errors: bool,
}

impl FallbackHandler {
    pub fn new(config: FallbackConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = FallbackCache::new("responses", &config, clock);
        Self {
            config,
            secondary: None,
            cache,
            debug_errors: false,
        }
    }

    pub fn with_secondary(mut self, provider: Arc<dyn SecondaryProvider>) -> Self {
        self.secondary = Some(provider);
        self
    }

    /// Includes sanitized failure detail in `error_fallback` payloads
    pub fn debug_errors(mut self, enabled: bool) -> Self {
        self.debug_errors = enabled;
        self
    }

    pub fn cache(&self) -> &FallbackCache<String, Value> {
        &self.cache
    }

    /// Stores a successful primary response for later fallback use
    pub fn remember<S: Into<String>>(&self, key: S, response: Value) {
        self.cache.put(key.into(), response, None);
    }

    /// Produces a substitute result. Never panics outward.
    pub async fn execute_fallback(&self, request: &FallbackRequest) -> FallbackOutcome {
        let outcome = self.run_chain(request).await;

        let success = if outcome.success { "true" } else { "false" };
        counter!(
            "resilience_fallback_total",
            1,
            "operation" => request.operation.clone(),
            "type" => outcome.fallback_used.as_str(),
            "success" => success
        );
        info!(
            operation = %request.operation,
            correlation_id = %request.correlation_id,
            fallback = %outcome.fallback_used,
            success = outcome.success,
            stale = outcome.stale,
            "Fallback served"
        );

        outcome
    }

    async fn run_chain(&self, request: &FallbackRequest) -> FallbackOutcome {
        if request.cancellation.is_cancelled() {
            return FallbackOutcome::failed(self.cancelled(request));
        }

        if let Some(provider) = &self.secondary {
            match self.try_secondary(provider.as_ref(), request).await {
                SecondaryResult::Served(response) => {
                    return FallbackOutcome::served(FallbackType::SecondaryProvider, response)
                }
                SecondaryResult::Cancelled => return FallbackOutcome::failed(self.cancelled(request)),
                SecondaryResult::Failed => {}
            }
        }

        if let Some(key) = &request.cache_key {
            if let Some(hit) = self.cache.get(key) {
                let mut outcome = FallbackOutcome::served(FallbackType::Cache, hit.value);
                outcome.stale = hit.stale;
                return outcome;
            }
        }

        if let Some(response) = &self.config.static_response {
            return FallbackOutcome::served(FallbackType::StaticResponse, response.clone());
        }

        self.error_fallback(request)
    }

    async fn try_secondary(&self, provider: &dyn SecondaryProvider, request: &FallbackRequest) -> SecondaryResult {
        let call = AssertUnwindSafe(provider.send(request)).catch_unwind();
        let bounded = tokio::time::timeout(self.config.secondary_timeout, call);

        let finished = tokio::select! {
            biased;
            _ = request.cancellation.cancelled() => return SecondaryResult::Cancelled,
            finished = bounded => finished,
        };

        match finished {
            Ok(Ok(Ok(response))) => {
                debug!(provider = provider.name(), correlation_id = %request.correlation_id, "Secondary provider answered");
                SecondaryResult::Served(response)
            }
            Ok(Ok(Err(failure))) => {
                let record = classify(
                    &failure,
                    &ClassifyContext::new(&request.correlation_id, &request.operation),
                );
                warn!(
                    provider = provider.name(),
                    correlation_id = %request.correlation_id,
                    error_kind = %record.kind,
                    "Secondary provider failed"
                );
                SecondaryResult::Failed
            }
            Ok(Err(_panic)) => {
                error!(provider = provider.name(), correlation_id = %request.correlation_id, "Secondary provider panicked");
                SecondaryResult::Failed
            }
            Err(_) => {
                warn!(
                    provider = provider.name(),
                    correlation_id = %request.correlation_id,
                    timeout_ms = self.config.secondary_timeout.as_millis() as u64,
                    "Secondary provider timed out"
                );
                SecondaryResult::Failed
            }
        }
    }

    fn error_fallback(&self, request: &FallbackRequest) -> FallbackOutcome {
        let kind = request
            .primary_error
            .as_ref()
            .map(|err| err.kind)
            .unwrap_or(ErrorKind::ServiceUnavailable);
        let payload = ErrorFallbackPayload {
            payload_type: FallbackType::ErrorFallback.as_str(),
            fallback: true,
            message: user_message(kind),
            correlation_id: &request.correlation_id,
            error: request
                .primary_error
                .as_ref()
                .map(|err| ErrorBody::from_record(err, self.debug_errors)),
        };

        match serde_json::to_value(&payload) {
            Ok(response) => FallbackOutcome::served(FallbackType::ErrorFallback, response),
            Err(e) => {
                error!(correlation_id = %request.correlation_id, error = %e, "Failed to build fallback payload");
                FallbackOutcome::failed(classify(
                    &Failure::Internal(e.to_string()),
                    &ClassifyContext::new(&request.correlation_id, &request.operation),
                ))
            }
        }
    }

    fn cancelled(&self, request: &FallbackRequest) -> ErrorRecord {
        classify(
            &Failure::Cancelled,
            &ClassifyContext::new(&request.correlation_id, &request.operation),
        )
    }
}

impl Default for FallbackHandler {
    fn default() -> Self {
        Self::new(FallbackConfig::default(), Arc::new(SystemClock))
    }
}

enum SecondaryResult {
    Served(Value),
    Failed,
    Cancelled,
}
