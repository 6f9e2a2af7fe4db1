//! Delegation API Handlers
//!
//! Operator endpoints for circuits, metrics, dead letters, and target
//! registration, plus the invoke surface used by platform components.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use super::circuit::CircuitSnapshot;
use super::gateway::DelegateError;
use super::types::{
    Capability, DeadLetterJob, DelegationMode, DelegationTarget, Outcome, TargetKey,
};
use super::{queries, signing};
use crate::api::AppState;
use crate::observability::recorder::{aggregate_window, Window, WindowStats};

#[derive(Error, Debug)]
enum ApiError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Validation(String),
}

impl From<ApiError> for (StatusCode, String) {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, err.to_string()),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
        }
    }
}

impl From<DelegateError> for (StatusCode, String) {
    fn from(err: DelegateError) -> Self {
        match err {
            DelegateError::UnknownTarget(key) => (
                StatusCode::NOT_FOUND,
                format!("no delegation target registered for {key}"),
            ),
            DelegateError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            DelegateError::Queue(e) => {
                tracing::error!("Queue error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Delegation queue unavailable".to_string(),
                )
            }
            // The target is down AND its fallback could not resolve
            DelegateError::Fallback(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
        }
    }
}

/// Parse a `{app_id}/{capability}` path pair into a target key.
fn parse_key(app_id: Uuid, capability: &str) -> Result<TargetKey, ApiError> {
    let capability = Capability::parse_str(capability)
        .ok_or_else(|| ApiError::Validation(format!("unknown capability '{capability}'")))?;
    Ok(TargetKey::new(app_id, capability))
}

// ---- Invoke ----

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub application_id: Uuid,
    pub capability: Capability,
    pub payload: Value,
    #[serde(default)]
    pub mode: Option<DelegationMode>,
}

/// POST /`api/delegation/invoke`
#[instrument(skip(state, req))]
pub async fn invoke(
    State(state): State<AppState>,
    Json(req): Json<InvokeRequest>,
) -> Result<Json<Outcome>, (StatusCode, String)> {
    let mode = req.mode.unwrap_or(DelegationMode::Sync);
    let outcome = state
        .gateway
        .delegate(req.application_id, req.capability, req.payload, mode)
        .await?;
    Ok(Json(outcome))
}

// ---- Circuits ----

/// GET /`api/delegation/circuits`
pub async fn list_circuits(State(state): State<AppState>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.breaker.snapshots())
}

/// GET /`api/delegation/circuits/{app_id}/{capability}`
pub async fn get_circuit(
    State(state): State<AppState>,
    Path((app_id, capability)): Path<(Uuid, String)>,
) -> Result<Json<CircuitSnapshot>, (StatusCode, String)> {
    let key = parse_key(app_id, &capability)?;
    let snapshot = state.breaker.snapshot(key).ok_or(ApiError::NotFound)?;
    Ok(Json(snapshot))
}

/// POST /`api/delegation/circuits/{app_id}/{capability}/reset`
#[instrument(skip(state))]
pub async fn reset_circuit(
    State(state): State<AppState>,
    Path((app_id, capability)): Path<(Uuid, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let key = parse_key(app_id, &capability)?;
    state.breaker.force_reset(key);
    info!(target_key = %key, "Circuit manually reset");
    Ok(StatusCode::NO_CONTENT)
}

// ---- Metrics ----

#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    pub window: Option<String>,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub target: TargetKey,
    pub window: Window,
    #[serde(flatten)]
    pub stats: WindowStats,
    pub success_rate: Option<f64>,
    pub timeout_rate: Option<f64>,
}

/// GET /`api/delegation/metrics/{app_id}/{capability}?window=1h`
pub async fn get_metrics(
    State(state): State<AppState>,
    Path((app_id, capability)): Path<(Uuid, String)>,
    Query(params): Query<MetricsParams>,
) -> Result<Json<MetricsResponse>, (StatusCode, String)> {
    let key = parse_key(app_id, &capability)?;
    let window = match params.window.as_deref() {
        None => Window::H1,
        Some(s) => Window::parse_str(s).ok_or_else(|| {
            ApiError::Validation(format!("unknown window '{s}', expected 1h, 24h, or 7d"))
        })?,
    };

    let stats = aggregate_window(&state.db, key, window)
        .await
        .map_err(ApiError::Database)?;

    Ok(Json(MetricsResponse {
        target: key,
        window,
        success_rate: stats.success_rate(),
        timeout_rate: stats.timeout_rate(),
        stats,
    }))
}

// ---- Dead letters ----

#[derive(Debug, Deserialize)]
pub struct DeadLetterParams {
    pub application_id: Option<Uuid>,
    pub capability: Option<Capability>,
    pub limit: Option<i64>,
}

/// GET /`api/delegation/dead-letters`
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<DeadLetterParams>,
) -> Result<Json<Vec<DeadLetterJob>>, (StatusCode, String)> {
    let filter = queries::DeadLetterFilter {
        application_id: params.application_id,
        capability: params.capability,
        limit: params.limit,
    };
    let letters = queries::list_dead_letters(&state.db, &filter)
        .await
        .map_err(ApiError::Database)?;
    Ok(Json(letters))
}

/// GET /`api/delegation/dead-letters/{id}`
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeadLetterJob>, (StatusCode, String)> {
    let letter = queries::get_dead_letter(&state.db, id)
        .await
        .map_err(ApiError::Database)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(letter))
}

#[derive(Serialize)]
pub struct RequeueResponse {
    pub job_id: Uuid,
    pub request_id: Uuid,
}

/// POST /`api/delegation/dead-letters/{id}/requeue`
#[instrument(skip(state))]
pub async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RequeueResponse>), (StatusCode, String)> {
    let job = queries::requeue_dead_letter(&state.db, id)
        .await
        .map_err(ApiError::Database)?
        .ok_or(ApiError::NotFound)?;

    // Postgres already holds the job; Redis push is only for pickup latency
    if let Err(e) = state.queue.push_now(job.id).await {
        tracing::warn!(job_id = %job.id, error = %e, "Requeued job not pushed to Redis, will surface on recovery");
    }

    info!(dead_letter_id = %id, job_id = %job.id, "Dead letter requeued");
    Ok((
        StatusCode::ACCEPTED,
        Json(RequeueResponse {
            job_id: job.id,
            request_id: job.request_id,
        }),
    ))
}

/// DELETE /`api/delegation/dead-letters/{id}`
#[instrument(skip(state))]
pub async fn delete_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let deleted = queries::delete_dead_letter(&state.db, id)
        .await
        .map_err(ApiError::Database)?;
    if !deleted {
        return Err(ApiError::NotFound.into());
    }
    info!(dead_letter_id = %id, "Dead letter purged");
    Ok(StatusCode::NO_CONTENT)
}

// ---- Targets ----

/// Validate an endpoint URL for delegation delivery.
fn validate_endpoint(url: &str) -> Result<(), ApiError> {
    if url.len() < 10 || url.len() > 2048 {
        return Err(ApiError::Validation(
            "Endpoint must be between 10 and 2048 characters".to_string(),
        ));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ApiError::Validation(
            "Endpoint must start with http:// or https://".to_string(),
        ));
    }
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| ApiError::Validation("Invalid endpoint URL".to_string()))?;
    if parsed.host_str().is_none() {
        return Err(ApiError::Validation(
            "Endpoint must contain a host".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct UpsertTargetRequest {
    pub endpoint: String,
    pub timeout_ms: Option<i32>,
    #[serde(default)]
    pub is_async: bool,
    pub max_attempts: Option<i32>,
    pub backoff_base_ms: Option<i32>,
    pub backoff_cap_ms: Option<i32>,
    /// Explicitly replace the signing secret of an existing target.
    #[serde(default)]
    pub rotate_secret: bool,
}

#[derive(Serialize)]
pub struct TargetRegisteredResponse {
    #[serde(flatten)]
    pub target: DelegationTarget,
    /// Present only when a secret was just generated (creation or explicit
    /// rotation); not retrievable afterwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

/// Pick the signing secret for an upsert: keep the current one on plain
/// updates, generate a fresh one for new targets or explicit rotation.
/// Returns the secret and whether it is newly generated.
fn resolve_secret(current: Option<&str>, rotate: bool) -> (String, bool) {
    match current {
        Some(secret) if !rotate => (secret.to_owned(), false),
        _ => (signing::generate_signing_secret(), true),
    }
}

/// GET /`api/delegation/targets`
pub async fn list_targets(
    State(state): State<AppState>,
) -> Result<Json<Vec<DelegationTarget>>, (StatusCode, String)> {
    let targets = queries::list_targets(&state.db)
        .await
        .map_err(ApiError::Database)?;
    Ok(Json(targets))
}

/// PUT /`api/delegation/targets/{app_id}/{capability}`
#[instrument(skip(state, req))]
pub async fn upsert_target(
    State(state): State<AppState>,
    Path((app_id, capability)): Path<(Uuid, String)>,
    Json(req): Json<UpsertTargetRequest>,
) -> Result<(StatusCode, Json<TargetRegisteredResponse>), (StatusCode, String)> {
    let key = parse_key(app_id, &capability)?;
    validate_endpoint(&req.endpoint)?;

    let timeout_ms = req.timeout_ms.unwrap_or(state.config.default_timeout_ms);
    if !(50..=30_000).contains(&timeout_ms) {
        return Err(ApiError::Validation(
            "timeout_ms must be between 50 and 30000".to_string(),
        )
        .into());
    }
    let max_attempts = req.max_attempts.unwrap_or(state.config.default_max_attempts);
    if !(1..=10).contains(&max_attempts) {
        return Err(ApiError::Validation("max_attempts must be between 1 and 10".to_string()).into());
    }

    // A manifest tweak must not silently invalidate signatures the endpoint
    // already verifies against, so an update keeps the current secret
    let existing = queries::get_target(&state.db, key.application_id, key.capability)
        .await
        .map_err(ApiError::Database)?;
    let (secret, generated) = resolve_secret(
        existing.as_ref().map(|t| t.signing_secret.as_str()),
        req.rotate_secret,
    );

    let upsert = queries::UpsertTarget {
        application_id: key.application_id,
        capability: key.capability,
        endpoint: req.endpoint,
        timeout_ms,
        is_async: req.is_async,
        max_attempts,
        backoff_base_ms: req
            .backoff_base_ms
            .unwrap_or(state.config.default_backoff_base_ms),
        backoff_cap_ms: req
            .backoff_cap_ms
            .unwrap_or(state.config.default_backoff_cap_ms),
        signing_secret: secret.clone(),
    };

    let target = queries::upsert_target(&state.db, &upsert)
        .await
        .map_err(ApiError::Database)?;

    let status = if existing.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    info!(target_key = %key, new_secret = generated, "Delegation target registered");
    Ok((
        status,
        Json(TargetRegisteredResponse {
            target,
            signing_secret: generated.then_some(secret),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_validation_rejects_bad_urls() {
        assert!(validate_endpoint("https://bot.example/hooks/delegate").is_ok());
        assert!(validate_endpoint("short").is_err());
        assert!(validate_endpoint("ftp://bot.example/hooks").is_err());
        assert!(validate_endpoint("https://").is_err());
    }

    #[test]
    fn plain_updates_keep_the_existing_signing_secret() {
        let (secret, generated) = resolve_secret(Some("shh"), false);
        assert_eq!(secret, "shh");
        assert!(!generated);
    }

    #[test]
    fn creation_and_rotation_generate_a_fresh_secret() {
        let (created, generated) = resolve_secret(None, false);
        assert!(generated);
        assert!(!created.is_empty());

        let (rotated, generated) = resolve_secret(Some("shh"), true);
        assert!(generated);
        assert_ne!(rotated, "shh");
    }

    #[test]
    fn path_capability_must_be_known() {
        let app_id = Uuid::new_v4();
        assert!(parse_key(app_id, "winner.selection").is_ok());
        assert!(parse_key(app_id, "winner-selection").is_err());
    }
}
