//! Metric Sample Recording
//!
//! Per-call samples flow through a bounded mpsc channel into a background
//! writer that batch-inserts into `PostgreSQL`. Recording never blocks the
//! caller; samples are dropped when the channel is full.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::delegation::types::{Capability, TargetKey};

/// One per-call sample.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub application_id: uuid::Uuid,
    pub capability: Capability,
    pub duration_ms: i32,
    pub success: bool,
    pub timed_out: bool,
    pub ts: DateTime<Utc>,
}

/// Cloneable handle for appending samples.
#[derive(Clone)]
pub struct MetricsRecorder {
    tx: mpsc::Sender<MetricSample>,
}

impl MetricsRecorder {
    /// Create the recording channel (bounded). Pass the receiver to
    /// [`spawn_sample_writer`] once the database pool exists.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MetricSample>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Append a sample. Non-blocking; dropped if the channel is full.
    pub fn record(&self, key: TargetKey, duration: Duration, success: bool, timed_out: bool) {
        let sample = MetricSample {
            application_id: key.application_id,
            capability: key.capability,
            duration_ms: duration.as_millis().min(i32::MAX as u128) as i32,
            success,
            timed_out,
            ts: Utc::now(),
        };
        let _ = self.tx.try_send(sample);
    }
}

/// Max samples to accumulate before flushing a batch INSERT.
const BATCH_CAPACITY: usize = 64;

/// Spawn the background worker that drains the sample channel and writes to
/// the database. Call in `main()` after the pool is created.
pub fn spawn_sample_writer(
    pool: PgPool,
    mut rx: mpsc::Receiver<MetricSample>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut batch = Vec::with_capacity(BATCH_CAPACITY);
        loop {
            batch.clear();
            // Wait for at least one sample (blocks until available or closed)
            let Some(first) = rx.recv().await else {
                break;
            };
            batch.push(first);
            // Drain any immediately available samples up to batch capacity
            while batch.len() < BATCH_CAPACITY {
                match rx.try_recv() {
                    Ok(sample) => batch.push(sample),
                    Err(_) => break,
                }
            }

            let mut qb: sqlx::QueryBuilder<'_, sqlx::Postgres> = sqlx::QueryBuilder::new(
                "INSERT INTO delegation_metric_samples \
                 (application_id, capability, duration_ms, success, timed_out, ts) ",
            );
            qb.push_values(&batch, |mut b, sample| {
                b.push_bind(sample.application_id)
                    .push_bind(sample.capability)
                    .push_bind(sample.duration_ms)
                    .push_bind(sample.success)
                    .push_bind(sample.timed_out)
                    .push_bind(sample.ts);
            });
            if let Err(e) = qb.build().execute(&pool).await {
                tracing::debug!(error = %e, batch_size = batch.len(), "Failed to persist metric samples");
            }
        }
    })
}

/// Rolling aggregation windows exposed to operators and the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    H1,
    H24,
    D7,
}

impl Window {
    /// Parse the query-parameter form (`1h`, `24h`, `7d`).
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(Self::H1),
            "24h" => Some(Self::H24),
            "7d" => Some(Self::D7),
            _ => None,
        }
    }

    const fn as_interval(self) -> &'static str {
        match self {
            Self::H1 => "1 hour",
            Self::H24 => "24 hours",
            Self::D7 => "7 days",
        }
    }
}

/// Aggregated window statistics for one target.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WindowStats {
    pub total: i64,
    pub successes: i64,
    pub timeouts: i64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

impl WindowStats {
    /// Fraction of calls that succeeded; `None` with no samples.
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.successes as f64 / self.total as f64)
    }

    /// Fraction of calls that timed out; `None` with no samples.
    #[must_use]
    pub fn timeout_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.timeouts as f64 / self.total as f64)
    }
}

/// Aggregate one target's samples over a rolling window.
pub async fn aggregate_window(
    pool: &PgPool,
    key: TargetKey,
    window: Window,
) -> sqlx::Result<WindowStats> {
    sqlx::query_as::<_, WindowStats>(
        r"
        SELECT count(*) AS total,
               count(*) FILTER (WHERE success) AS successes,
               count(*) FILTER (WHERE timed_out) AS timeouts,
               percentile_cont(0.5) WITHIN GROUP (ORDER BY duration_ms) AS p50_ms,
               percentile_cont(0.95) WITHIN GROUP (ORDER BY duration_ms) AS p95_ms,
               percentile_cont(0.99) WITHIN GROUP (ORDER BY duration_ms) AS p99_ms
        FROM delegation_metric_samples
        WHERE application_id = $1 AND capability = $2
          AND ts >= now() - $3::interval
        ",
    )
    .bind(key.application_id)
    .bind(key.capability)
    .bind(window.as_interval())
    .fetch_one(pool)
    .await
}
