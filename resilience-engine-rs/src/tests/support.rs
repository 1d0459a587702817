//! Shared fixtures for the end-to-end tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::classifier::{ConnectionCause, Failure};
use crate::client::{ClientConfig, UpstreamRequest, UpstreamTransport};
use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::engine::ResilienceEngine;
use crate::fallback::{FallbackRequest, SecondaryProvider};
use crate::retry::RetryConfig;

pub const CIRCUIT: &str = "azure-responses-api";

/// Replays scripted results, then repeats `then` forever
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Value, Failure>>>,
    then: Result<Value, Failure>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedTransport {
    pub fn always(result: Result<Value, Failure>) -> Self {
        Self::script(Vec::new(), result)
    }

    pub fn script(script: Vec<Result<Value, Failure>>, then: Result<Value, Failure>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            then,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn send(&self, _request: &UpstreamRequest) -> Result<Value, Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.then.clone())
    }
}

#[derive(Debug)]
pub struct PanickingTransport;

#[async_trait]
impl UpstreamTransport for PanickingTransport {
    async fn send(&self, _request: &UpstreamRequest) -> Result<Value, Failure> {
        panic!("transport bug")
    }
}

/// A secondary provider that always answers
#[derive(Debug, Default)]
pub struct EchoSecondary {
    calls: AtomicU32,
}

impl EchoSecondary {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecondaryProvider for EchoSecondary {
    fn name(&self) -> &str {
        "bedrock"
    }

    async fn send(&self, request: &FallbackRequest) -> Result<Value, Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"provider": "bedrock", "operation": request.operation}))
    }
}

pub fn econnreset() -> Failure {
    Failure::connection(ConnectionCause::Reset, "read ECONNRESET")
}

pub fn status(code: u16) -> Failure {
    Failure::http(code)
}

/// Engine config with millisecond backoff so retries stay fast
pub fn fast_config(client: ClientConfig) -> EngineConfig {
    EngineConfig {
        client,
        retry: RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_ceiling: Duration::from_millis(1),
            ..RetryConfig::default()
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        },
        ..EngineConfig::default()
    }
}

pub fn engine(client: ClientConfig, clock: Arc<ManualClock>) -> ResilienceEngine {
    ResilienceEngine::builder(fast_config(client))
        .clock(clock)
        .build()
        .unwrap()
}

/// Fallback stays on; one attempt per call
pub fn single_attempt() -> ClientConfig {
    ClientConfig {
        max_retries: 1,
        ..ClientConfig::default()
    }
}

pub fn no_fallback(max_retries: u32) -> ClientConfig {
    ClientConfig {
        max_retries,
        enable_fallback: false,
        ..ClientConfig::default()
    }
}
