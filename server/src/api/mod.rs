//! API Router and Application State
//!
//! Central routing configuration and shared state.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::delegation::circuit::CircuitBreaker;
use crate::delegation::gateway::DelegationGateway;
use crate::delegation::handlers;
use crate::delegation::queue::AsyncJobQueue;
use crate::delegation::transport::HttpTransport;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: PgPool,
    /// Server configuration
    pub config: Arc<Config>,
    /// Circuit breaker store, shared with the gateway
    pub breaker: Arc<CircuitBreaker>,
    /// Async delegation job queue
    pub queue: Arc<AsyncJobQueue>,
    /// Delegation gateway over the production HTTP transport
    pub gateway: Arc<DelegationGateway<HttpTransport>>,
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let delegation_routes = Router::new()
        .route("/invoke", post(handlers::invoke))
        .route("/circuits", get(handlers::list_circuits))
        .route("/circuits/{app_id}/{capability}", get(handlers::get_circuit))
        .route(
            "/circuits/{app_id}/{capability}/reset",
            post(handlers::reset_circuit),
        )
        .route(
            "/metrics/{app_id}/{capability}",
            get(handlers::get_metrics),
        )
        .route("/dead-letters", get(handlers::list_dead_letters))
        .route(
            "/dead-letters/{id}",
            get(handlers::get_dead_letter).delete(handlers::delete_dead_letter),
        )
        .route(
            "/dead-letters/{id}/requeue",
            post(handlers::requeue_dead_letter),
        )
        .route("/targets", get(handlers::list_targets))
        .route(
            "/targets/{app_id}/{capability}",
            put(handlers::upsert_target),
        );

    Router::new()
        // Health check
        .route("/health", get(health_check))
        .nest("/api/delegation", delegation_routes)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // State
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    /// Service status
    status: &'static str,
    /// Circuits currently tracked
    circuits: usize,
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        circuits: state.breaker.snapshots().len(),
    })
}
