//! Delegation Database Queries
//!
//! All delegation-related `PostgreSQL` operations: targets, jobs, dead
//! letters, and pending reviews. Uses runtime queries (`sqlx::query` /
//! `sqlx::query_as`) to avoid requiring a live database at compile time.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::types::{Capability, DeadLetterJob, DelegationTarget, Job, TargetKey};

/// Fields accepted for a manifest upsert of a delegation target.
#[derive(Debug, Clone)]
pub struct UpsertTarget {
    pub application_id: Uuid,
    pub capability: Capability,
    pub endpoint: String,
    pub timeout_ms: i32,
    pub is_async: bool,
    pub max_attempts: i32,
    pub backoff_base_ms: i32,
    pub backoff_cap_ms: i32,
    pub signing_secret: String,
}

/// Create or update a delegation target from an application manifest.
pub async fn upsert_target(pool: &PgPool, t: &UpsertTarget) -> sqlx::Result<DelegationTarget> {
    sqlx::query_as::<_, DelegationTarget>(
        r"
        INSERT INTO delegation_targets
            (application_id, capability, endpoint, timeout_ms, is_async,
             max_attempts, backoff_base_ms, backoff_cap_ms, signing_secret)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (application_id, capability) DO UPDATE SET
            endpoint = EXCLUDED.endpoint,
            timeout_ms = EXCLUDED.timeout_ms,
            is_async = EXCLUDED.is_async,
            max_attempts = EXCLUDED.max_attempts,
            backoff_base_ms = EXCLUDED.backoff_base_ms,
            backoff_cap_ms = EXCLUDED.backoff_cap_ms,
            signing_secret = EXCLUDED.signing_secret,
            updated_at = now()
        RETURNING *
        ",
    )
    .bind(t.application_id)
    .bind(t.capability)
    .bind(&t.endpoint)
    .bind(t.timeout_ms)
    .bind(t.is_async)
    .bind(t.max_attempts)
    .bind(t.backoff_base_ms)
    .bind(t.backoff_cap_ms)
    .bind(&t.signing_secret)
    .fetch_one(pool)
    .await
}

/// Look up a single delegation target.
pub async fn get_target(
    pool: &PgPool,
    application_id: Uuid,
    capability: Capability,
) -> sqlx::Result<Option<DelegationTarget>> {
    sqlx::query_as::<_, DelegationTarget>(
        r"
        SELECT * FROM delegation_targets
        WHERE application_id = $1 AND capability = $2
        ",
    )
    .bind(application_id)
    .bind(capability)
    .fetch_optional(pool)
    .await
}

/// List all registered delegation targets.
pub async fn list_targets(pool: &PgPool) -> sqlx::Result<Vec<DelegationTarget>> {
    sqlx::query_as::<_, DelegationTarget>(
        r"
        SELECT * FROM delegation_targets
        ORDER BY application_id, capability
        ",
    )
    .fetch_all(pool)
    .await
}

/// Insert a new async job in Pending state, runnable immediately.
pub async fn insert_job(
    pool: &PgPool,
    key: TargetKey,
    payload: &Value,
    request_id: Uuid,
) -> sqlx::Result<Job> {
    sqlx::query_as::<_, Job>(
        r"
        INSERT INTO delegation_jobs
            (application_id, capability, payload, request_id, attempts_made, next_run_at, status)
        VALUES ($1, $2, $3, $4, 0, now(), 'pending')
        RETURNING *
        ",
    )
    .bind(key.application_id)
    .bind(key.capability)
    .bind(payload)
    .bind(request_id)
    .fetch_one(pool)
    .await
}

/// Claim a job for one delivery attempt.
///
/// Only Pending jobs whose `next_run_at` has arrived are claimed; the row
/// moves to Active atomically so two workers cannot process the same job.
pub async fn claim_job(pool: &PgPool, job_id: Uuid) -> sqlx::Result<Option<Job>> {
    sqlx::query_as::<_, Job>(
        r"
        UPDATE delegation_jobs
        SET status = 'active', updated_at = now()
        WHERE id = $1 AND status = 'pending' AND next_run_at <= now()
        RETURNING *
        ",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// Load a job by id regardless of status.
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> sqlx::Result<Option<Job>> {
    sqlx::query_as::<_, Job>("SELECT * FROM delegation_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Remove a job after a successful delivery.
///
/// Job rows exist only while work remains; exhausted jobs turn into dead
/// letters instead of lingering here.
pub async fn complete_job(pool: &PgPool, job_id: Uuid) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM delegation_jobs WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a failed attempt and schedule the next one.
pub async fn schedule_job_retry(
    pool: &PgPool,
    job_id: Uuid,
    attempts_made: i32,
    next_run_at: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r"
        UPDATE delegation_jobs
        SET status = 'pending', attempts_made = $2, next_run_at = $3, updated_at = now()
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(attempts_made)
    .bind(next_run_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Convert an exhausted job into a dead letter.
///
/// The job row is removed from the active queue and its snapshot inserted
/// into `delegation_dead_letters` in one transaction.
pub async fn dead_letter_job(
    pool: &PgPool,
    job: &Job,
    attempts_made: i32,
    final_error: &str,
) -> sqlx::Result<Uuid> {
    let mut tx = pool.begin().await?;

    let row: (Uuid,) = sqlx::query_as(
        r"
        INSERT INTO delegation_dead_letters
            (job_id, application_id, capability, payload, request_id,
             attempts_made, final_error, failed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, now())
        RETURNING id
        ",
    )
    .bind(job.id)
    .bind(job.application_id)
    .bind(job.capability)
    .bind(&job.payload)
    .bind(job.request_id)
    .bind(attempts_made)
    .bind(final_error)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM delegation_jobs WHERE id = $1")
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(row.0)
}

/// Filter for listing dead letters.
#[derive(Debug, Default, Clone)]
pub struct DeadLetterFilter {
    pub application_id: Option<Uuid>,
    pub capability: Option<Capability>,
    pub limit: Option<i64>,
}

/// List dead letters, newest first.
pub async fn list_dead_letters(
    pool: &PgPool,
    filter: &DeadLetterFilter,
) -> sqlx::Result<Vec<DeadLetterJob>> {
    sqlx::query_as::<_, DeadLetterJob>(
        r"
        SELECT * FROM delegation_dead_letters
        WHERE ($1::uuid IS NULL OR application_id = $1)
          AND ($2::delegation_capability IS NULL OR capability = $2)
        ORDER BY failed_at DESC
        LIMIT $3
        ",
    )
    .bind(filter.application_id)
    .bind(filter.capability)
    .bind(filter.limit.unwrap_or(100).clamp(1, 500))
    .fetch_all(pool)
    .await
}

/// Get a single dead letter.
pub async fn get_dead_letter(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<DeadLetterJob>> {
    sqlx::query_as::<_, DeadLetterJob>("SELECT * FROM delegation_dead_letters WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Count dead letters currently held. Drives the backlog alert.
pub async fn count_dead_letters(pool: &PgPool) -> sqlx::Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT count(*) FROM delegation_dead_letters")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Requeue a dead letter: reinsert as a fresh Pending job with
/// `attempts_made` reset to 0 and delete the dead-letter row.
///
/// The returned job keeps the original `request_id` so the endpoint's
/// idempotency contract still applies.
pub async fn requeue_dead_letter(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<Job>> {
    let mut tx = pool.begin().await?;

    let dead: Option<DeadLetterJob> = sqlx::query_as(
        r"
        UPDATE delegation_dead_letters
        SET requeued_at = now()
        WHERE id = $1 AND requeued_at IS NULL
        RETURNING *
        ",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(dead) = dead else {
        tx.rollback().await?;
        return Ok(None);
    };

    let job: Job = sqlx::query_as(
        r"
        INSERT INTO delegation_jobs
            (application_id, capability, payload, request_id, attempts_made, next_run_at, status)
        VALUES ($1, $2, $3, $4, 0, now(), 'pending')
        RETURNING *
        ",
    )
    .bind(dead.application_id)
    .bind(dead.capability)
    .bind(&dead.payload)
    .bind(dead.request_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM delegation_dead_letters WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Some(job))
}

/// Delete (purge) a dead letter. Returns false if it did not exist.
pub async fn delete_dead_letter(pool: &PgPool, id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM delegation_dead_letters WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Persist a pending-review record for the `ManualApproval` fallback.
pub async fn create_pending_review(
    pool: &PgPool,
    key: TargetKey,
    context: &Value,
) -> sqlx::Result<Uuid> {
    let row: (Uuid,) = sqlx::query_as(
        r"
        INSERT INTO delegation_pending_reviews (application_id, capability, context)
        VALUES ($1, $2, $3)
        RETURNING id
        ",
    )
    .bind(key.application_id)
    .bind(key.capability)
    .bind(context)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// Jobs to put back on the queue after a restart.
///
/// Active jobs were mid-attempt when the process died; they are reset to
/// Pending (the endpoint contract makes a duplicated attempt a no-op).
pub async fn recover_jobs(pool: &PgPool) -> sqlx::Result<Vec<(Uuid, DateTime<Utc>)>> {
    sqlx::query_as(
        r"
        UPDATE delegation_jobs
        SET status = 'pending', updated_at = now()
        WHERE status IN ('pending', 'active')
        RETURNING id, next_run_at
        ",
    )
    .fetch_all(pool)
    .await
}
