//! Health Monitor
//!
//! Periodically aggregates metric windows and circuit state into alert
//! decisions. The monitor decides *when* to alert; delivery is the
//! notifier's concern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{error, info};

use super::recorder::{aggregate_window, Window};
use crate::delegation::circuit::{CircuitBreaker, CircuitStatus};
use crate::delegation::types::TargetKey;
use crate::delegation::queries;
use crate::notify::{Alert, AlertKind, AlertSeverity, Notifier};

/// Alert thresholds. Rates are fractions in `0.0..=1.0`.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Success rate below this is a warning.
    pub success_rate_warning: f64,
    /// Success rate below this is critical.
    pub success_rate_critical: f64,
    /// p95 latency above this fraction of the configured timeout is a warning.
    pub latency_timeout_ratio: f64,
    /// Dead letters held above this count is a warning.
    pub dead_letter_threshold: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            success_rate_warning: 0.95,
            success_rate_critical: 0.90,
            latency_timeout_ratio: 0.80,
            dead_letter_threshold: 100,
        }
    }
}

/// Background evaluator of per-target health and platform-wide backlog.
pub struct HealthMonitor {
    db: PgPool,
    breaker: Arc<CircuitBreaker>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        db: PgPool,
        breaker: Arc<CircuitBreaker>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            db,
            breaker,
            notifier,
            interval,
            thresholds,
        }
    }

    /// Run until the shutdown signal arrives.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.interval);
        // Circuit statuses seen last tick, to detect transitions to Open
        let mut last_statuses: HashMap<TargetKey, CircuitStatus> = HashMap::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate(&mut last_statuses).await;
                }
                _ = shutdown.recv() => {
                    info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    async fn evaluate(&self, last_statuses: &mut HashMap<TargetKey, CircuitStatus>) {
        self.check_circuits(last_statuses);
        self.check_targets().await;
        self.check_dead_letter_backlog().await;
    }

    /// Alert on circuits newly observed Open since the previous tick.
    fn check_circuits(&self, last_statuses: &mut HashMap<TargetKey, CircuitStatus>) {
        for snapshot in self.breaker.snapshots() {
            let previous = last_statuses.insert(snapshot.target, snapshot.status);
            if snapshot.status == CircuitStatus::Open && previous != Some(CircuitStatus::Open) {
                self.notifier.notify(Alert {
                    severity: AlertSeverity::Critical,
                    kind: AlertKind::CircuitOpened,
                    target: Some(snapshot.target),
                    message: format!(
                        "Circuit opened for {} after {} consecutive failures",
                        snapshot.target, snapshot.consecutive_failures
                    ),
                });
            }
        }
    }

    /// Evaluate success-rate and latency rules per target over the 1h window.
    async fn check_targets(&self) {
        let targets = match queries::list_targets(&self.db).await {
            Ok(targets) => targets,
            Err(e) => {
                error!("Health monitor failed to list targets: {}", e);
                return;
            }
        };

        for target in targets {
            let key = target.key();
            let stats = match aggregate_window(&self.db, key, Window::H1).await {
                Ok(stats) => stats,
                Err(e) => {
                    error!(target_key = %key, "Health monitor failed to aggregate window: {}", e);
                    continue;
                }
            };

            if let Some(rate) = stats.success_rate() {
                if rate < self.thresholds.success_rate_critical {
                    self.notifier.notify(Alert {
                        severity: AlertSeverity::Critical,
                        kind: AlertKind::LowSuccessRate,
                        target: Some(key),
                        message: format!(
                            "Success rate {:.1}% over the last hour ({} calls)",
                            rate * 100.0,
                            stats.total
                        ),
                    });
                } else if rate < self.thresholds.success_rate_warning {
                    self.notifier.notify(Alert {
                        severity: AlertSeverity::Warning,
                        kind: AlertKind::LowSuccessRate,
                        target: Some(key),
                        message: format!(
                            "Success rate {:.1}% over the last hour ({} calls)",
                            rate * 100.0,
                            stats.total
                        ),
                    });
                }
            }

            if let Some(p95) = stats.p95_ms {
                let budget = f64::from(target.timeout_ms) * self.thresholds.latency_timeout_ratio;
                if p95 > budget {
                    self.notifier.notify(Alert {
                        severity: AlertSeverity::Warning,
                        kind: AlertKind::ElevatedLatency,
                        target: Some(key),
                        message: format!(
                            "p95 latency {p95:.0}ms exceeds {:.0}% of the {}ms timeout",
                            self.thresholds.latency_timeout_ratio * 100.0,
                            target.timeout_ms
                        ),
                    });
                }
            }
        }
    }

    /// Warn when the dead-letter store grows past the configured threshold.
    async fn check_dead_letter_backlog(&self) {
        match queries::count_dead_letters(&self.db).await {
            Ok(count) if count > self.thresholds.dead_letter_threshold => {
                self.notifier.notify(Alert {
                    severity: AlertSeverity::Warning,
                    kind: AlertKind::DeadLetterBacklog,
                    target: None,
                    message: format!(
                        "Dead-letter store holds {count} jobs (threshold {})",
                        self.thresholds.dead_letter_threshold
                    ),
                });
            }
            Ok(_) => {}
            Err(e) => error!("Health monitor failed to count dead letters: {}", e),
        }
    }
}
