//! HTTP surface of the delegation operator API, driven through the router
//! with `tower::ServiceExt::oneshot`. Only endpoints that stay in-process
//! are exercised; storage-backed routes are covered by the queue tests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use tb_server::api::{create_router, AppState};
use tb_server::config::Config;
use tb_server::delegation::circuit::CircuitBreaker;
use tb_server::delegation::fallback::{FallbackDispatcher, ResultCache};
use tb_server::delegation::gateway::DelegationGateway;
use tb_server::delegation::queue::AsyncJobQueue;
use tb_server::delegation::transport::HttpTransport;
use tb_server::notify::LogBroadcaster;
use tb_server::observability::recorder::MetricsRecorder;

fn test_config() -> Config {
    // from_env with only DATABASE_URL required
    std::env::set_var("DATABASE_URL", "postgres://localhost/unused");
    Config::from_env().unwrap()
}

/// Router over unconnected storage handles; requests must not reach them.
fn offline_router() -> axum::Router {
    let lazy_pool = || {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool")
    };
    let redis_config = fred::types::config::Config::from_url("redis://localhost:6379").unwrap();
    let redis = fred::clients::Client::new(redis_config, None, None, None);

    let config = Arc::new(test_config());
    let breaker = Arc::new(CircuitBreaker::new(config.circuit_config()));
    let cache = Arc::new(ResultCache::new());
    let queue = Arc::new(AsyncJobQueue::new(lazy_pool(), redis));
    let fallbacks = Arc::new(FallbackDispatcher::new(
        Arc::clone(&cache),
        lazy_pool(),
        Arc::clone(&queue),
    ));
    let (metrics, _rx) = MetricsRecorder::channel(64);
    let gateway = Arc::new(DelegationGateway::new(
        lazy_pool(),
        HttpTransport::new(),
        Arc::clone(&breaker),
        fallbacks,
        cache,
        Arc::clone(&queue),
        metrics,
        Arc::new(LogBroadcaster),
    ));

    create_router(AppState {
        db: lazy_pool(),
        config,
        breaker,
        queue,
        gateway,
    })
}

fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json");
    match body {
        Some(value) => builder
            .body(Body::from(serde_json::to_vec(&value).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let app = offline_router();
    let response = app
        .oneshot(request(Method::GET, "/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn circuits_start_empty() {
    let app = offline_router();
    let response = app
        .oneshot(request(Method::GET, "/api/delegation/circuits", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn unknown_capability_in_path_is_rejected() {
    let app = offline_router();
    let uri = format!(
        "/api/delegation/circuits/{}/winner-selection",
        Uuid::new_v4()
    );
    let response = app.oneshot(request(Method::GET, &uri, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn untracked_circuit_is_not_found() {
    let app = offline_router();
    let uri = format!(
        "/api/delegation/circuits/{}/winner.selection",
        Uuid::new_v4()
    );
    let response = app.oneshot(request(Method::GET, &uri, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn circuit_reset_is_a_noop_for_unknown_targets() {
    let app = offline_router();
    let uri = format!(
        "/api/delegation/circuits/{}/winner.selection/reset",
        Uuid::new_v4()
    );
    let response = app
        .oneshot(request(Method::POST, &uri, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn invalid_metrics_window_is_rejected() {
    let app = offline_router();
    let uri = format!(
        "/api/delegation/metrics/{}/winner.selection?window=30d",
        Uuid::new_v4()
    );
    let response = app.oneshot(request(Method::GET, &uri, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn target_registration_validates_the_endpoint() {
    let app = offline_router();
    let uri = format!(
        "/api/delegation/targets/{}/winner.selection",
        Uuid::new_v4()
    );
    let response = app
        .oneshot(request(
            Method::PUT,
            &uri,
            Some(json!({ "endpoint": "ftp://bot.example/hooks" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn target_registration_validates_the_timeout_range() {
    let app = offline_router();
    let uri = format!(
        "/api/delegation/targets/{}/prize.allocation",
        Uuid::new_v4()
    );
    let response = app
        .oneshot(request(
            Method::PUT,
            &uri,
            Some(json!({
                "endpoint": "https://bot.example/hooks/delegate",
                "timeout_ms": 31_000
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
