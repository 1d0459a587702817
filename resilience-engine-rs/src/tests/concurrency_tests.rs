//! Concurrent load against shared breaker and service level state

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;
    use serde_json::json;

    use crate::circuit_breaker::CircuitState;
    use crate::client::ClientConfig;
    use crate::clock::ManualClock;
    use crate::context::CallContext;
    use crate::tests::support::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_half_open_admits_a_single_probe() {
        let clock = Arc::new(ManualClock::new());
        let engine = engine(no_fallback(1), clock.clone());
        let failing = engine.client(Arc::new(ScriptedTransport::always(Err(econnreset()))));
        for _ in 0..5 {
            failing.execute(json!({}), CallContext::new("probe")).await;
        }
        clock.advance(Duration::from_secs(30));

        let slow = Arc::new(ScriptedTransport::always(Ok(json!({"ok": true}))).delay(Duration::from_millis(300)));
        let client = engine.client(slow.clone());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.execute(json!({}), CallContext::new("probe")).await })
            })
            .collect();
        let responses: Vec<_> = join_all(handles).await.into_iter().map(Result::unwrap).collect();

        let admitted = responses.iter().filter(|r| r.success).count();
        let rejected = responses
            .iter()
            .filter(|r| r.error.as_ref().map(|e| e.error_type.as_str()) == Some("circuit_breaker"))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(rejected, 15);
        assert_eq!(slow.calls(), 1);
        assert_eq!(
            engine.circuit_breakers().get_circuit_breaker(CIRCUIT).state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_circuit_once() {
        let clock = Arc::new(ManualClock::new());
        let engine = engine(no_fallback(1), clock);
        let transport = Arc::new(ScriptedTransport::always(Err(status(503))).delay(Duration::from_millis(5)));
        let client = engine.client(transport.clone());
        let mut transitions = engine.circuit_breakers().subscribe();

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    // Stagger so later calls arrive after the circuit opened
                    tokio::time::sleep(Duration::from_millis(i * 2)).await;
                    client.execute(json!({}), CallContext::new("load")).await
                })
            })
            .collect();
        let responses: Vec<_> = join_all(handles).await.into_iter().map(Result::unwrap).collect();

        let upstream_failures = responses
            .iter()
            .filter(|r| r.error.as_ref().map(|e| e.error_type.as_str()) == Some("service_unavailable"))
            .count();
        let rejected = responses
            .iter()
            .filter(|r| r.error.as_ref().map(|e| e.error_type.as_str()) == Some("circuit_breaker"))
            .count();

        assert_eq!(upstream_failures + rejected, 40);
        assert_eq!(upstream_failures as u32, transport.calls());
        assert!(upstream_failures >= 5);

        let metrics = engine.circuit_breakers().get_circuit_breaker(CIRCUIT).metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.rejections as usize, rejected);

        let opened = std::iter::from_fn(|| transitions.try_recv().ok())
            .filter(|t| t.to == CircuitState::Open)
            .count();
        assert_eq!(opened, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_share_service_level() {
        let clock = Arc::new(ManualClock::new());
        let engine = engine(ClientConfig::default(), clock);
        engine.degradation().degrade_service_level("drill", "ops");

        let client = engine.client(Arc::new(ScriptedTransport::always(Ok(json!({"id": "r"})))));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.execute(json!({}), CallContext::new("level")).await })
            })
            .collect();

        for response in join_all(handles).await.into_iter().map(Result::unwrap) {
            assert!(response.success);
            // A burst of successes never raises the level on its own
            assert_eq!(response.metadata.service_level, crate::ServiceLevel::Reduced);
        }
    }
}
