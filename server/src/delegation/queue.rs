//! Async Job Queue
//!
//! Durable queue plus bounded worker pool for latency-tolerant delegation.
//!
//! Architecture:
//! - New jobs are written to `delegation_jobs` and their ids pushed onto
//!   `QUEUE_KEY` (Redis list, BRPOP).
//! - Failed attempts are scheduled into `RETRY_ZSET_KEY` (sorted set,
//!   score = millisecond Unix timestamp when due).
//! - Each worker loop polls both: immediate queue and due retries. The pool
//!   is fixed-size, so delivery concurrency is bounded by `worker_count`.
//! - On restart, `recover` re-enqueues every Pending/Active row so jobs
//!   survive lost Redis state.

use std::sync::Arc;
use std::time::Duration;

use fred::interfaces::{ListInterface, LuaInterface, SortedSetsInterface};
use fred::prelude::*;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::backoff::{backoff, DEFAULT_JITTER_RATIO};
use super::transport::{DelegationRequest, Transport};
use super::types::{DelegationError, DelegationTarget, Job, JobStatus, QueueError, TargetKey};
use super::queries;
use crate::notify::{Alert, AlertKind, AlertSeverity, DelegationEvent, EventBroadcaster, Notifier};
use crate::observability::recorder::MetricsRecorder;

/// Redis key for the immediate job queue.
const QUEUE_KEY: &str = "delegation:jobs:queue";

/// Redis key for the delayed retry sorted set (score = millisecond Unix
/// timestamp when due).
const RETRY_ZSET_KEY: &str = "delegation:jobs:retry";

/// Lua script that atomically removes and returns due job ids from the retry
/// sorted set. Prevents concurrent workers from double-promoting a job.
const PROMOTE_RETRIES_LUA: &str = r"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 50)
if #items > 0 then
    redis.call('ZREM', KEYS[1], unpack(items))
end
return items
";

/// Sorted-set score for a scheduled retry: milliseconds since the epoch.
///
/// Whole-second scores would let promotion run up to a second before
/// `next_run_at`, and the claim against the full-precision row predicate
/// would then miss while the queue entry is already consumed.
fn retry_score(due_at: chrono::DateTime<chrono::Utc>) -> f64 {
    due_at.timestamp_millis() as f64
}

/// Durable async job queue.
pub struct AsyncJobQueue {
    db: PgPool,
    redis: Client,
}

impl AsyncJobQueue {
    #[must_use]
    pub const fn new(db: PgPool, redis: Client) -> Self {
        Self { db, redis }
    }

    /// Enqueue a payload for async delegation. The job row is the durable
    /// record; the Redis push only makes it visible to workers.
    pub async fn enqueue(
        &self,
        target: &DelegationTarget,
        payload: serde_json::Value,
    ) -> Result<Uuid, QueueError> {
        let request_id = Uuid::new_v4();
        let job = queries::insert_job(&self.db, target.key(), &payload, request_id).await?;
        self.push_now(job.id).await?;
        info!(job_id = %job.id, target_key = %target.key(), "Job enqueued");
        Ok(job.id)
    }

    /// Make a job visible to workers immediately.
    pub async fn push_now(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.redis
            .lpush::<(), _, _>(QUEUE_KEY, job_id.to_string())
            .await?;
        Ok(())
    }

    /// Schedule a job to become visible at a future time.
    async fn schedule_retry(
        &self,
        job_id: Uuid,
        due_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), QueueError> {
        self.redis
            .zadd::<(), _, _>(
                RETRY_ZSET_KEY,
                None,
                None,
                false,
                false,
                (retry_score(due_at), job_id.to_string()),
            )
            .await?;
        Ok(())
    }

    /// Move due retries from the sorted set into the immediate queue
    /// (atomic via Lua).
    async fn promote_due_retries(&self) {
        let now = chrono::Utc::now().timestamp_millis() as f64;

        let items: Vec<String> = match self
            .redis
            .eval(
                PROMOTE_RETRIES_LUA,
                vec![RETRY_ZSET_KEY],
                vec![now.to_string()],
            )
            .await
        {
            Ok(items) => items,
            Err(e) => {
                error!("Failed to promote due retries (Lua): {}", e);
                return;
            }
        };

        for job_id in &items {
            if let Err(e) = self
                .redis
                .lpush::<(), _, _>(QUEUE_KEY, job_id.as_str())
                .await
            {
                error!(job_id, "Failed to re-enqueue promoted retry: {}", e);
            }
        }
    }

    /// Restore queue visibility for every job that survived a restart.
    ///
    /// Returns how many jobs were put back. Jobs due in the future go to
    /// the retry set; everything else is immediately visible.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let jobs = queries::recover_jobs(&self.db).await?;
        let now = chrono::Utc::now();
        let count = jobs.len();

        for (job_id, next_run_at) in jobs {
            if next_run_at <= now {
                self.push_now(job_id).await?;
            } else {
                self.schedule_retry(job_id, next_run_at).await?;
            }
        }

        if count > 0 {
            info!(recovered = count, "Re-enqueued jobs after restart");
        }
        Ok(count)
    }
}

/// Shared dependencies of the worker pool.
pub struct WorkerContext<T: Transport> {
    pub queue: Arc<AsyncJobQueue>,
    pub transport: T,
    pub metrics: MetricsRecorder,
    pub notifier: Arc<dyn Notifier>,
    pub broadcaster: Arc<dyn EventBroadcaster>,
    /// Deadline for one async delivery attempt; more generous than the
    /// target's synchronous timeout.
    pub attempt_deadline: Duration,
}

/// Spawn the fixed-size delivery worker pool.
pub fn spawn_workers<T: Transport + Clone>(
    count: usize,
    ctx: Arc<WorkerContext<T>>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    info!(workers = count, "Starting delivery worker pool");
    (0..count)
        .map(|worker_id| {
            let ctx = Arc::clone(&ctx);
            let shutdown = shutdown.subscribe();
            tokio::spawn(worker_loop(worker_id, ctx, shutdown))
        })
        .collect()
}

async fn worker_loop<T: Transport + Clone>(
    worker_id: usize,
    ctx: Arc<WorkerContext<T>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    // Track consecutive Redis errors for exponential backoff on outages
    let mut consecutive_errors: u32 = 0;

    loop {
        // Promote any due retries into the immediate queue
        ctx.queue.promote_due_retries().await;

        // BRPOP with 2-second timeout (short so we check retries frequently)
        let popped = tokio::select! {
            result = ctx.queue.redis.brpop::<Option<(String, String)>, _>(QUEUE_KEY, 2.0) => result,
            _ = shutdown.recv() => {
                info!(worker_id, "Delivery worker received shutdown signal, exiting");
                break;
            }
        };

        let raw_id = match popped {
            Ok(Some((_key, value))) => {
                consecutive_errors = 0;
                value
            }
            Ok(None) => {
                consecutive_errors = 0;
                continue; // Timeout, no jobs
            }
            Err(e) => {
                consecutive_errors += 1;
                let backoff_secs = 1u64 << consecutive_errors.min(6); // 2, 4, 8, ... 64
                if backoff_secs > 30 {
                    error!(
                        worker_id,
                        consecutive_errors,
                        backoff_secs,
                        "Persistent Redis failure in delivery worker, backing off: {}",
                        e
                    );
                } else {
                    error!(worker_id, "Failed to BRPOP from job queue: {}", e);
                }
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                continue;
            }
        };

        let Ok(job_id) = Uuid::parse_str(&raw_id) else {
            error!(worker_id, raw_id, "Unparseable job id on queue, discarding");
            continue;
        };

        process_job(&ctx, job_id).await;
    }
}

/// Run one delivery attempt for a claimed job.
async fn process_job<T: Transport + Clone>(ctx: &WorkerContext<T>, job_id: Uuid) {
    // Claim the job; a miss means it was completed, dead-lettered, or the
    // queue entry arrived ahead of next_run_at
    let job = match queries::claim_job(&ctx.queue.db, job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            // The pop consumed the only queue entry; a row that is still
            // pending must go back into the retry set or it stays invisible
            // until the next restart's recovery
            restore_unclaimed(ctx, job_id).await;
            return;
        }
        Err(e) => {
            error!(job_id = %job_id, "Failed to claim job: {}", e);
            let due = chrono::Utc::now() + chrono::Duration::seconds(2);
            if let Err(e) = ctx.queue.schedule_retry(job_id, due).await {
                error!(job_id = %job_id, "Failed to reschedule unclaimed job: {}", e);
            }
            return;
        }
    };

    let key = TargetKey::new(job.application_id, job.capability);
    let target = match queries::get_target(&ctx.queue.db, job.application_id, job.capability).await
    {
        Ok(Some(target)) => target,
        Ok(None) => {
            warn!(job_id = %job.id, target_key = %key, "Target deregistered before delivery, dead-lettering");
            finalize_exhausted(ctx, &job, job.attempts_made, "target deregistered").await;
            return;
        }
        Err(e) => {
            // Transient DB error: put the attempt back without burning it
            error!(job_id = %job.id, "Failed to load target: {}", e);
            requeue_unburned(ctx, &job).await;
            return;
        }
    };

    let attempt = (job.attempts_made + 1).max(1) as u32;
    let max_attempts = target.max_attempts.max(1) as u32;
    let request = DelegationRequest {
        request_id: job.request_id,
        payload: job.payload.clone(),
        attempt: Some((attempt, max_attempts)),
    };

    // Async deliveries get a generous deadline, never below the target's own
    let deadline = ctx.attempt_deadline.max(target.timeout());
    let start = tokio::time::Instant::now();
    let result = match tokio::time::timeout(deadline, ctx.transport.invoke(&target, &request)).await
    {
        Ok(result) => result,
        Err(_) => Err(DelegationError::Timeout(deadline.as_millis() as u64)),
    };
    let duration = start.elapsed();
    ctx.metrics
        .record(key, duration, result.is_ok(), matches!(result, Err(DelegationError::Timeout(_))));

    match result {
        Ok(data) => {
            if let Err(e) = queries::complete_job(&ctx.queue.db, job.id).await {
                error!(job_id = %job.id, "Failed to remove completed job: {}", e);
            }
            ctx.broadcaster.delegation_completed(DelegationEvent {
                target: key,
                request_id: job.request_id,
                job_id: Some(job.id),
                data,
            });
        }
        Err(err) => {
            warn!(
                job_id = %job.id,
                target_key = %key,
                attempt,
                error = %err,
                "Async delivery attempt failed"
            );
            handle_failed_attempt(ctx, &job, &target, attempt, &err).await;
        }
    }
}

/// Schedule the next attempt, or dead-letter when retries are exhausted.
async fn handle_failed_attempt<T: Transport + Clone>(
    ctx: &WorkerContext<T>,
    job: &Job,
    target: &DelegationTarget,
    attempt: u32,
    err: &DelegationError,
) {
    let max_attempts = target.max_attempts.max(1) as u32;
    if attempt < max_attempts {
        let delay = backoff(
            attempt,
            target.backoff_base_ms.max(0) as u64,
            target.backoff_cap_ms.max(0) as u64,
            DEFAULT_JITTER_RATIO,
        );
        let next_run_at = chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        if let Err(e) =
            queries::schedule_job_retry(&ctx.queue.db, job.id, attempt as i32, next_run_at).await
        {
            error!(job_id = %job.id, "Failed to record retry schedule: {}", e);
            return;
        }
        if let Err(e) = ctx.queue.schedule_retry(job.id, next_run_at).await {
            // Dead-letter fallback when retry scheduling fails outright
            error!(job_id = %job.id, "Failed to schedule retry, dead-lettering: {}", e);
            finalize_exhausted(
                ctx,
                job,
                attempt as i32,
                &format!("{err} (retry scheduling failed: {e})"),
            )
            .await;
        }
    } else {
        warn!(
            job_id = %job.id,
            request_id = %job.request_id,
            "Job exhausted all retries, dead-lettering"
        );
        finalize_exhausted(ctx, job, attempt as i32, &err.to_string()).await;
    }
}

/// Move a job to the dead-letter store and raise the alert.
async fn finalize_exhausted<T: Transport + Clone>(
    ctx: &WorkerContext<T>,
    job: &Job,
    attempts_made: i32,
    final_error: &str,
) {
    let key = TargetKey::new(job.application_id, job.capability);
    match queries::dead_letter_job(&ctx.queue.db, job, attempts_made, final_error).await {
        Ok(_) => {
            ctx.notifier.notify(Alert {
                severity: AlertSeverity::Warning,
                kind: AlertKind::RetriesExhausted,
                target: Some(key),
                message: format!(
                    "Job {} dead-lettered after {attempts_made} attempts: {final_error}",
                    job.id
                ),
            });
        }
        Err(e) => error!(job_id = %job.id, "Failed to insert dead letter: {}", e),
    }
}

/// Put a popped-but-unclaimable job back into the retry set if its row is
/// still pending.
async fn restore_unclaimed<T: Transport + Clone>(ctx: &WorkerContext<T>, job_id: Uuid) {
    match queries::get_job(&ctx.queue.db, job_id).await {
        Ok(Some(job)) if job.status == JobStatus::Pending => {
            if let Err(e) = ctx.queue.schedule_retry(job.id, job.next_run_at).await {
                error!(job_id = %job.id, "Failed to restore pending job to the retry set: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => error!(job_id = %job_id, "Failed to check unclaimed job: {}", e),
    }
}

/// Put a claimed job back on the queue without consuming an attempt.
async fn requeue_unburned<T: Transport + Clone>(ctx: &WorkerContext<T>, job: &Job) {
    if let Err(e) = queries::schedule_job_retry(
        &ctx.queue.db,
        job.id,
        job.attempts_made,
        chrono::Utc::now(),
    )
    .await
    {
        error!(job_id = %job.id, "Failed to release claimed job: {}", e);
        return;
    }
    if let Err(e) = ctx.queue.push_now(job.id).await {
        error!(job_id = %job.id, "Failed to re-enqueue released job: {}", e);
    }
}
