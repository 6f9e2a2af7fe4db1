//! Delegation Gateway
//!
//! Synchronous entry point for delegated calls. Races the signed outbound
//! call against the target's deadline, consults the circuit breaker, and on
//! any failure mode resolves through the fallback dispatcher — so callers
//! always get an answer within `timeout_ms` plus bounded overhead,
//! regardless of how long the remote side takes.

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::circuit::CircuitBreaker;
use super::fallback::{FallbackContext, FallbackDispatcher, ResultCache};
use super::queue::AsyncJobQueue;
use super::transport::{DelegationRequest, Transport};
use super::types::{
    Capability, DelegationError, DelegationMode, DelegationTarget, FallbackError, Outcome,
    QueueError, TargetKey,
};
use super::queries;
use crate::notify::{DelegationEvent, EventBroadcaster};
use crate::observability::recorder::MetricsRecorder;

/// Errors surfaced by [`DelegationGateway::delegate`].
///
/// Remote unavailability never appears here; only configuration gaps and
/// infrastructure failures propagate.
#[derive(Error, Debug)]
pub enum DelegateError {
    #[error("no delegation target registered for {0}")]
    UnknownTarget(TargetKey),
    #[error(transparent)]
    Fallback(#[from] FallbackError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Composes the circuit breaker, transport, and fallback dispatcher into the
/// platform-facing delegation surface.
pub struct DelegationGateway<T: Transport> {
    db: PgPool,
    transport: T,
    breaker: Arc<CircuitBreaker>,
    fallbacks: Arc<FallbackDispatcher>,
    cache: Arc<ResultCache>,
    queue: Arc<AsyncJobQueue>,
    metrics: MetricsRecorder,
    broadcaster: Arc<dyn EventBroadcaster>,
}

impl<T: Transport> DelegationGateway<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: PgPool,
        transport: T,
        breaker: Arc<CircuitBreaker>,
        fallbacks: Arc<FallbackDispatcher>,
        cache: Arc<ResultCache>,
        queue: Arc<AsyncJobQueue>,
        metrics: MetricsRecorder,
        broadcaster: Arc<dyn EventBroadcaster>,
    ) -> Self {
        Self {
            db,
            transport,
            breaker,
            fallbacks,
            cache,
            queue,
            metrics,
            broadcaster,
        }
    }

    /// The circuit state store backing this gateway.
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Inbound surface for platform components: resolve the target and
    /// delegate in the requested mode.
    pub async fn delegate(
        &self,
        application_id: Uuid,
        capability: Capability,
        payload: Value,
        mode: DelegationMode,
    ) -> Result<Outcome, DelegateError> {
        let key = TargetKey::new(application_id, capability);
        let target = queries::get_target(&self.db, application_id, capability)
            .await?
            .ok_or(DelegateError::UnknownTarget(key))?;

        match mode {
            DelegationMode::Sync => Ok(self.call(&target, payload).await?),
            DelegationMode::Async => {
                let job_id = self.queue.enqueue(&target, payload).await?;
                Ok(Outcome::Deferred { job_id })
            }
        }
    }

    /// Execute one synchronous delegated call.
    ///
    /// Always resolves within the target's deadline plus bounded overhead:
    /// the outbound call is raced against `tokio::time::timeout` and its
    /// future dropped on expiry (best-effort cancellation — the remote side
    /// may still finish, which is why endpoints must be idempotent on
    /// `request_id`). Timeout, transport, and circuit-open failures resolve
    /// through the fallback dispatcher; only fallback errors propagate.
    pub async fn call(
        &self,
        target: &DelegationTarget,
        payload: Value,
    ) -> Result<Outcome, FallbackError> {
        let key = target.key();
        let request = DelegationRequest::sync(payload.clone());
        let deadline = target.timeout();

        self.breaker
            .call(
                key,
                || async {
                    let start = tokio::time::Instant::now();
                    let result = match tokio::time::timeout(
                        deadline,
                        self.transport.invoke(target, &request),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(DelegationError::Timeout(deadline.as_millis() as u64)),
                    };
                    let duration = start.elapsed();
                    self.metrics.record(
                        key,
                        duration,
                        result.is_ok(),
                        result.as_ref().is_err_and(DelegationError::is_timeout),
                    );

                    let data = result?;
                    // Feed the CachedResult strategy and fan the result out
                    self.cache.store(key, data.clone());
                    self.broadcaster.delegation_completed(DelegationEvent {
                        target: key,
                        request_id: request.request_id,
                        job_id: None,
                        data: data.clone(),
                    });
                    debug!(target_key = %key, request_id = %request.request_id, "Delegation succeeded");
                    Ok(Outcome::Delegated { data })
                },
                |err| async {
                    warn!(target_key = %key, error = %err, "Delegation unavailable, executing fallback");
                    self.fallbacks
                        .execute(&FallbackContext {
                            target: target.clone(),
                            payload,
                            error: err,
                        })
                        .await
                },
            )
            .await
    }
}
