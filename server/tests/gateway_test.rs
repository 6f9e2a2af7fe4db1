//! Gateway behavior under unavailable targets: timeout racing, circuit
//! breaking, and fallback resolution. Uses scripted transports and a paused
//! clock, so no external services are touched.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use tb_server::delegation::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitStatus};
use tb_server::delegation::fallback::{FallbackDispatcher, FallbackStrategy, ResultCache};
use tb_server::delegation::gateway::DelegationGateway;
use tb_server::delegation::queue::AsyncJobQueue;
use tb_server::delegation::transport::{DelegationRequest, Transport};
use tb_server::delegation::types::{
    Capability, DelegationError, DelegationTarget, FallbackKind, Outcome,
};
use tb_server::notify::LogBroadcaster;
use tb_server::observability::recorder::MetricsRecorder;

/// Transport that waits `delay` before answering.
#[derive(Clone)]
struct SlowTransport {
    delay: Duration,
    calls: Arc<AtomicU32>,
}

impl Transport for SlowTransport {
    async fn invoke(
        &self,
        _target: &DelegationTarget,
        _request: &DelegationRequest,
    ) -> Result<Value, DelegationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "winners": ["remote"] }))
    }
}

/// Transport that refuses every call.
#[derive(Clone)]
struct DownTransport {
    calls: Arc<AtomicU32>,
}

impl Transport for DownTransport {
    async fn invoke(
        &self,
        _target: &DelegationTarget,
        _request: &DelegationRequest,
    ) -> Result<Value, DelegationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DelegationError::Transport("connection refused".to_owned()))
    }
}

/// Transport that succeeds for the first `ok_calls` invocations, then fails.
#[derive(Clone)]
struct DegradingTransport {
    calls: Arc<AtomicU32>,
    ok_calls: u32,
}

impl Transport for DegradingTransport {
    async fn invoke(
        &self,
        _target: &DelegationTarget,
        _request: &DelegationRequest,
    ) -> Result<Value, DelegationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.ok_calls {
            Ok(json!({ "report": { "entries": 412 } }))
        } else {
            Err(DelegationError::Transport("connection reset".to_owned()))
        }
    }
}

fn test_target(capability: Capability, timeout_ms: i32) -> DelegationTarget {
    DelegationTarget {
        application_id: Uuid::new_v4(),
        capability,
        endpoint: "https://bot.example/hooks/delegate".to_owned(),
        timeout_ms,
        is_async: false,
        max_attempts: 3,
        backoff_base_ms: 500,
        backoff_cap_ms: 60_000,
        signing_secret: "secret".to_owned(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

/// Gateway whose DB pool and Redis client are never connected. Only the
/// in-process paths (transport, circuit, local fallbacks, cache) run.
fn offline_gateway<T: Transport>(
    transport: T,
    cache: Arc<ResultCache>,
    register: impl FnOnce(&FallbackDispatcher),
) -> DelegationGateway<T> {
    let lazy_pool = || {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool")
    };
    let redis_config = fred::types::config::Config::from_url("redis://localhost:6379").unwrap();
    let redis = fred::clients::Client::new(redis_config, None, None, None);
    let queue = Arc::new(AsyncJobQueue::new(lazy_pool(), redis));

    let dispatcher = FallbackDispatcher::new(Arc::clone(&cache), lazy_pool(), Arc::clone(&queue));
    register(&dispatcher);

    let (metrics, _rx) = MetricsRecorder::channel(64);
    DelegationGateway::new(
        lazy_pool(),
        transport,
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        Arc::new(dispatcher),
        cache,
        queue,
        metrics,
        Arc::new(LogBroadcaster),
    )
}

#[tokio::test(start_paused = true)]
async fn slow_target_resolves_through_fallback_at_the_deadline() {
    let calls = Arc::new(AtomicU32::new(0));
    let transport = SlowTransport {
        delay: Duration::from_millis(500),
        calls: Arc::clone(&calls),
    };
    let gateway = offline_gateway(transport, Arc::new(ResultCache::new()), |d| {
        d.register(
            Capability::WinnerSelection,
            FallbackStrategy::DefaultBehavior(Arc::new(|_ctx| Ok(json!({ "degraded": true })))),
        );
    });

    let target = test_target(Capability::WinnerSelection, 100);
    let started = tokio::time::Instant::now();
    let outcome = gateway.call(&target, json!({})).await.unwrap();
    let elapsed = started.elapsed();

    // Resolved at the 100ms deadline, not the transport's 500ms
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(500));
    assert!(matches!(
        outcome,
        Outcome::Fallback { strategy: FallbackKind::DefaultBehavior, .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_short_circuits_without_invoking_the_target() {
    let calls = Arc::new(AtomicU32::new(0));
    let transport = DownTransport {
        calls: Arc::clone(&calls),
    };
    let gateway = offline_gateway(transport, Arc::new(ResultCache::new()), |d| {
        d.register(
            Capability::WinnerSelection,
            FallbackStrategy::DefaultBehavior(Arc::new(|_ctx| Ok(json!({ "degraded": true })))),
        );
    });

    let target = test_target(Capability::WinnerSelection, 100);
    for _ in 0..5 {
        let outcome = gateway.call(&target, json!({})).await.unwrap();
        assert!(matches!(outcome, Outcome::Fallback { .. }));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // Circuit is now open; the sixth call must not reach the transport
    let outcome = gateway.call(&target, json!({})).await.unwrap();
    assert!(matches!(outcome, Outcome::Fallback { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn successful_result_feeds_the_cached_fallback() {
    let calls = Arc::new(AtomicU32::new(0));
    let transport = DegradingTransport {
        calls: Arc::clone(&calls),
        ok_calls: 1,
    };
    let cache = Arc::new(ResultCache::new());
    let gateway = offline_gateway(transport, Arc::clone(&cache), |d| {
        d.register(
            Capability::AnalyticsReport,
            FallbackStrategy::CachedResult {
                freshness: Duration::from_secs(300),
            },
        );
    });

    let target = test_target(Capability::AnalyticsReport, 100);

    let first = gateway.call(&target, json!({})).await.unwrap();
    let Outcome::Delegated { data } = first else {
        panic!("expected delegated outcome");
    };
    assert_eq!(data["report"]["entries"], 412);

    // Target now fails; the last good result answers from the cache
    let second = gateway.call(&target, json!({})).await.unwrap();
    let Outcome::Fallback { strategy, data } = second else {
        panic!("expected fallback outcome");
    };
    assert_eq!(strategy, FallbackKind::CachedResult);
    assert_eq!(data["report"]["entries"], 412);
}

#[tokio::test(start_paused = true)]
async fn recovered_target_recloses_the_circuit() {
    let calls = Arc::new(AtomicU32::new(0));
    // Fails 5 times to open the circuit, then recovers
    let transport = RecoveringTransport {
        calls: Arc::clone(&calls),
        fail_calls: 5,
    };
    let gateway = offline_gateway(transport, Arc::new(ResultCache::new()), |d| {
        d.register(
            Capability::WinnerSelection,
            FallbackStrategy::DefaultBehavior(Arc::new(|_ctx| Ok(json!({ "degraded": true })))),
        );
    });

    let target = test_target(Capability::WinnerSelection, 100);
    for _ in 0..5 {
        gateway.call(&target, json!({})).await.unwrap();
    }
    assert_eq!(
        gateway_status(&gateway, &target),
        Some(CircuitStatus::Open)
    );

    // After the recovery timeout, trial calls succeed and reclose the circuit
    tokio::time::advance(Duration::from_secs(61)).await;
    for _ in 0..3 {
        let outcome = gateway.call(&target, json!({})).await.unwrap();
        assert!(matches!(outcome, Outcome::Delegated { .. }));
    }
    assert_eq!(
        gateway_status(&gateway, &target),
        Some(CircuitStatus::Closed)
    );
}

/// Transport that fails for the first `fail_calls` invocations, then recovers.
#[derive(Clone)]
struct RecoveringTransport {
    calls: Arc<AtomicU32>,
    fail_calls: u32,
}

impl Transport for RecoveringTransport {
    async fn invoke(
        &self,
        _target: &DelegationTarget,
        _request: &DelegationRequest,
    ) -> Result<Value, DelegationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_calls {
            Err(DelegationError::Transport("connection refused".to_owned()))
        } else {
            Ok(json!({ "winners": ["remote"] }))
        }
    }
}

fn gateway_status<T: Transport>(
    gateway: &DelegationGateway<T>,
    target: &DelegationTarget,
) -> Option<CircuitStatus> {
    gateway.breaker().snapshot(target.key()).map(|s| s.status)
}
