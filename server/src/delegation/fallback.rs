//! Fallback Strategies
//!
//! Degradation paths executed when delegation is unavailable. Strategies are
//! bound per capability at registration time, not chosen per call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde_json::Value;
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::queue::AsyncJobQueue;
use super::types::{
    Capability, DelegationError, DelegationTarget, FallbackError, FallbackKind, Outcome, TargetKey,
};
use super::queries;

/// Everything a strategy may need to produce a substitute outcome.
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub target: DelegationTarget,
    pub payload: Value,
    /// The failure that routed the call here.
    pub error: DelegationError,
}

/// Synchronous local computation used by [`FallbackStrategy::DefaultBehavior`].
pub type LocalFallbackFn = dyn Fn(&FallbackContext) -> Result<Value, String> + Send + Sync;

/// A degradation strategy for one capability.
pub enum FallbackStrategy {
    /// Synchronous local equivalent of the capability; fails only if the
    /// local computation itself errors.
    DefaultBehavior(Arc<LocalFallbackFn>),
    /// Last successful result within the freshness window.
    CachedResult { freshness: Duration },
    /// Enqueue an async job and acknowledge immediately.
    DeferredQueue,
    /// Persist a pending-review record and report "pending".
    ManualApproval,
}

impl FallbackStrategy {
    #[must_use]
    pub const fn kind(&self) -> FallbackKind {
        match self {
            Self::DefaultBehavior(_) => FallbackKind::DefaultBehavior,
            Self::CachedResult { .. } => FallbackKind::CachedResult,
            Self::DeferredQueue => FallbackKind::DeferredQueue,
            Self::ManualApproval => FallbackKind::ManualApproval,
        }
    }
}

impl fmt::Debug for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FallbackStrategy::{:?}", self.kind())
    }
}

/// Last successful delegation results, per target.
///
/// In-process only; entries carry their write instant so freshness windows
/// are evaluated per strategy.
#[derive(Default)]
pub struct ResultCache {
    entries: DashMap<TargetKey, (Instant, Value)>,
}

impl ResultCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest successful result for a target.
    pub fn store(&self, key: TargetKey, value: Value) {
        self.entries.insert(key, (Instant::now(), value));
    }

    /// The cached result if written within `window`.
    pub fn fresh_within(&self, key: TargetKey, window: Duration) -> Option<Value> {
        self.entries
            .get(&key)
            .filter(|entry| entry.0.elapsed() <= window)
            .map(|entry| entry.1.clone())
    }
}

/// Registry of fallback strategies, one per capability.
pub struct FallbackDispatcher {
    strategies: DashMap<Capability, FallbackStrategy>,
    cache: Arc<ResultCache>,
    db: PgPool,
    queue: Arc<AsyncJobQueue>,
}

/// Internal routing decision extracted before any await, so the registry
/// guard is never held across suspension points.
enum Routed {
    Local(Arc<LocalFallbackFn>),
    Cached(Duration),
    Defer,
    Manual,
}

impl FallbackDispatcher {
    #[must_use]
    pub fn new(cache: Arc<ResultCache>, db: PgPool, queue: Arc<AsyncJobQueue>) -> Self {
        Self {
            strategies: DashMap::new(),
            cache,
            db,
            queue,
        }
    }

    /// Bind a strategy to a capability. Re-registration replaces the
    /// previous binding.
    pub fn register(&self, capability: Capability, strategy: FallbackStrategy) {
        debug!(capability = %capability, strategy = ?strategy.kind(), "Fallback strategy registered");
        if self.strategies.insert(capability, strategy).is_some() {
            warn!(capability = %capability, "Fallback strategy replaced an existing binding");
        }
    }

    /// Execute the bound strategy for the context's capability.
    pub async fn execute(&self, ctx: &FallbackContext) -> Result<Outcome, FallbackError> {
        let capability = ctx.target.capability;
        let routed = {
            let strategy = self
                .strategies
                .get(&capability)
                .ok_or(FallbackError::Unregistered(capability))?;
            match &*strategy {
                FallbackStrategy::DefaultBehavior(f) => Routed::Local(Arc::clone(f)),
                FallbackStrategy::CachedResult { freshness } => Routed::Cached(*freshness),
                FallbackStrategy::DeferredQueue => Routed::Defer,
                FallbackStrategy::ManualApproval => Routed::Manual,
            }
        };

        match routed {
            Routed::Local(f) => {
                let data = f(ctx).map_err(FallbackError::Local)?;
                Ok(Outcome::Fallback {
                    strategy: FallbackKind::DefaultBehavior,
                    data,
                })
            }
            Routed::Cached(freshness) => self
                .cache
                .fresh_within(ctx.target.key(), freshness)
                .map(|data| Outcome::Fallback {
                    strategy: FallbackKind::CachedResult,
                    data,
                })
                .ok_or(FallbackError::StaleCacheMiss),
            Routed::Defer => {
                let job_id = self.queue.enqueue(&ctx.target, ctx.payload.clone()).await?;
                Ok(Outcome::Deferred { job_id })
            }
            Routed::Manual => {
                let review_id =
                    queries::create_pending_review(&self.db, ctx.target.key(), &ctx.payload)
                        .await?;
                Ok(Outcome::PendingReview { review_id })
            }
        }
    }
}

/// Default-behavior fallback for winner selection: pick `winner_count`
/// random entries from the `participants` array in the call payload.
///
/// Local equivalent of the delegated draw; used when the external selector
/// is unavailable.
pub fn randomized_winner_selection(ctx: &FallbackContext) -> Result<Value, String> {
    let participants = ctx
        .payload
        .get("participants")
        .and_then(Value::as_array)
        .ok_or_else(|| "payload is missing a participants array".to_owned())?;

    let requested = ctx
        .payload
        .get("winner_count")
        .and_then(Value::as_u64)
        .unwrap_or(1) as usize;

    if participants.is_empty() {
        return Err("no participants to draw from".to_owned());
    }

    let count = requested.min(participants.len());
    let winners: Vec<Value> = participants
        .choose_multiple(&mut rand::thread_rng(), count)
        .cloned()
        .collect();

    Ok(serde_json::json!({ "winners": winners, "method": "local_random" }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn test_target(capability: Capability) -> DelegationTarget {
        DelegationTarget {
            application_id: Uuid::new_v4(),
            capability,
            endpoint: "https://bot.example/hooks/delegate".to_owned(),
            timeout_ms: 100,
            is_async: false,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 60_000,
            signing_secret: "secret".to_owned(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn test_context(capability: Capability, payload: Value) -> FallbackContext {
        FallbackContext {
            target: test_target(capability),
            payload,
            error: DelegationError::Transport("connection refused".to_owned()),
        }
    }

    /// Dispatcher whose DB pool and Redis client are never connected; only
    /// strategies that stay in-process may be exercised.
    fn offline_dispatcher(cache: Arc<ResultCache>) -> FallbackDispatcher {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        let config = fred::types::config::Config::from_url("redis://localhost:6379").unwrap();
        let redis = fred::clients::Client::new(config, None, None, None);
        FallbackDispatcher::new(cache, pool, Arc::new(AsyncJobQueue::new(
            sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/unused")
                .expect("lazy pool"),
            redis,
        )))
    }

    #[tokio::test]
    async fn unregistered_capability_is_an_error() {
        let dispatcher = offline_dispatcher(Arc::new(ResultCache::new()));
        let ctx = test_context(Capability::AnalyticsReport, json!({}));
        let err = dispatcher.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, FallbackError::Unregistered(Capability::AnalyticsReport)));
    }

    #[tokio::test]
    async fn default_behavior_runs_the_local_closure() {
        let dispatcher = offline_dispatcher(Arc::new(ResultCache::new()));
        dispatcher.register(
            Capability::WinnerSelection,
            FallbackStrategy::DefaultBehavior(Arc::new(randomized_winner_selection)),
        );

        let ctx = test_context(
            Capability::WinnerSelection,
            json!({ "participants": ["ana", "bo", "cy"], "winner_count": 2 }),
        );
        let outcome = dispatcher.execute(&ctx).await.unwrap();
        let Outcome::Fallback { strategy, data } = outcome else {
            panic!("expected fallback outcome");
        };
        assert_eq!(strategy, FallbackKind::DefaultBehavior);
        assert_eq!(data["winners"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn default_behavior_local_errors_propagate() {
        let dispatcher = offline_dispatcher(Arc::new(ResultCache::new()));
        dispatcher.register(
            Capability::WinnerSelection,
            FallbackStrategy::DefaultBehavior(Arc::new(randomized_winner_selection)),
        );

        let ctx = test_context(Capability::WinnerSelection, json!({ "participants": [] }));
        let err = dispatcher.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, FallbackError::Local(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cached_result_honors_the_freshness_window() {
        let cache = Arc::new(ResultCache::new());
        let dispatcher = offline_dispatcher(Arc::clone(&cache));
        dispatcher.register(
            Capability::AnalyticsReport,
            FallbackStrategy::CachedResult {
                freshness: Duration::from_secs(300),
            },
        );

        let ctx = test_context(Capability::AnalyticsReport, json!({}));
        cache.store(ctx.target.key(), json!({ "report": "cached" }));

        let outcome = dispatcher.execute(&ctx).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Fallback { strategy: FallbackKind::CachedResult, .. }
        ));

        // Past the freshness window the cache no longer answers
        tokio::time::advance(Duration::from_secs(301)).await;
        let err = dispatcher.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, FallbackError::StaleCacheMiss));
    }

    #[test]
    fn winner_selection_caps_at_participant_count() {
        let ctx = test_context(
            Capability::WinnerSelection,
            json!({ "participants": ["solo"], "winner_count": 5 }),
        );
        let data = randomized_winner_selection(&ctx).unwrap();
        assert_eq!(data["winners"], json!(["solo"]));
    }

    #[test]
    fn winner_selection_requires_participants() {
        let ctx = test_context(Capability::WinnerSelection, json!({}));
        assert!(randomized_winner_selection(&ctx).is_err());
    }
}
