//! Alerting & Broadcast Seams
//!
//! The resilience layer decides *when* to alert and *what* to fan out;
//! delivery belongs to collaborators behind these traits. The default
//! implementations emit structured log events only.

use serde::Serialize;
use uuid::Uuid;

use crate::delegation::types::TargetKey;

/// Alert severity for operator notification routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// What triggered an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowSuccessRate,
    ElevatedLatency,
    CircuitOpened,
    DeadLetterBacklog,
    RetriesExhausted,
}

/// An alert event raised by the resilience layer.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    /// Absent for platform-wide conditions such as dead-letter backlog.
    pub target: Option<TargetKey>,
    pub message: String,
}

/// Receives alert events. Delivery mechanism is out of scope here.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Default notifier: structured log events only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Warning => tracing::warn!(
                kind = ?alert.kind,
                target = alert.target.map(|t| t.to_string()),
                "{}",
                alert.message
            ),
            AlertSeverity::Critical => tracing::error!(
                kind = ?alert.kind,
                target = alert.target.map(|t| t.to_string()),
                "{}",
                alert.message
            ),
        }
    }
}

/// A successfully delegated result, to be fanned out to connected clients.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationEvent {
    pub target: TargetKey,
    pub request_id: Uuid,
    /// Set for async deliveries.
    pub job_id: Option<Uuid>,
    pub data: serde_json::Value,
}

/// Informed after every successful delegation. Fan-out is out of scope.
pub trait EventBroadcaster: Send + Sync {
    fn delegation_completed(&self, event: DelegationEvent);
}

/// Default broadcaster: structured log events only.
pub struct LogBroadcaster;

impl EventBroadcaster for LogBroadcaster {
    fn delegation_completed(&self, event: DelegationEvent) {
        tracing::debug!(
            target_key = %event.target,
            request_id = %event.request_id,
            job_id = event.job_id.map(|id| id.to_string()),
            "Delegation completed"
        );
    }
}
