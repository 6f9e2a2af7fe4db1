//! Delegation Types
//!
//! Data structures for delegation targets, jobs, dead letters, and the
//! error taxonomy of the resilience layer.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Delegatable capabilities matching the `delegation_capability` `PostgreSQL` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delegation_capability", rename_all = "snake_case")]
pub enum Capability {
    /// Pick winners for a room's prize draw.
    #[serde(rename = "winner.selection")]
    #[sqlx(rename = "winner.selection")]
    WinnerSelection,
    /// Validate and register a participant entering a room.
    #[serde(rename = "participant.registration")]
    #[sqlx(rename = "participant.registration")]
    ParticipantRegistration,
    /// Produce an analytics report for a finished room.
    #[serde(rename = "analytics.report")]
    #[sqlx(rename = "analytics.report")]
    AnalyticsReport,
    /// Allocate prizes across selected winners.
    #[serde(rename = "prize.allocation")]
    #[sqlx(rename = "prize.allocation")]
    PrizeAllocation,
}

impl Capability {
    /// Parse from the dot-separated string form (e.g., `"winner.selection"`).
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "winner.selection" => Some(Self::WinnerSelection),
            "participant.registration" => Some(Self::ParticipantRegistration),
            "analytics.report" => Some(Self::AnalyticsReport),
            "prize.allocation" => Some(Self::PrizeAllocation),
            _ => None,
        }
    }

    /// Convert to the dot-separated string form.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WinnerSelection => "winner.selection",
            Self::ParticipantRegistration => "participant.registration",
            Self::AnalyticsReport => "analytics.report",
            Self::PrizeAllocation => "prize.allocation",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying one delegation target: an application offering a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TargetKey {
    pub application_id: Uuid,
    pub capability: Capability,
}

impl TargetKey {
    #[must_use]
    pub const fn new(application_id: Uuid, capability: Capability) -> Self {
        Self {
            application_id,
            capability,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application_id, self.capability)
    }
}

/// A delegation target registered via an application manifest.
///
/// Immutable at call time; mutated only through manifest upsert.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DelegationTarget {
    pub application_id: Uuid,
    pub capability: Capability,
    /// Endpoint URL the capability is delivered to.
    pub endpoint: String,
    /// Synchronous call deadline in milliseconds.
    pub timeout_ms: i32,
    /// Whether the capability is normally invoked asynchronously.
    pub is_async: bool,
    /// Retry policy for async delivery.
    pub max_attempts: i32,
    pub backoff_base_ms: i32,
    pub backoff_cap_ms: i32,
    /// HMAC signing secret shared out-of-band with the application.
    #[serde(skip_serializing)]
    pub signing_secret: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DelegationTarget {
    #[must_use]
    pub const fn key(&self) -> TargetKey {
        TargetKey::new(self.application_id, self.capability)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(0) as u64)
    }
}

/// Result of a delegation attempt as observed by the caller.
///
/// Synchronous callers always receive one of these within the target's
/// deadline plus bounded overhead; the variant says whether the remote
/// endpoint answered or which degradation path produced the value.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The remote endpoint answered successfully.
    Delegated { data: serde_json::Value },
    /// A fallback strategy substituted for the remote endpoint.
    Fallback {
        strategy: FallbackKind,
        data: serde_json::Value,
    },
    /// The call was enqueued for async delivery; result will arrive later.
    Deferred { job_id: Uuid },
    /// A pending-review record was persisted; an operator must resolve it.
    PendingReview { review_id: Uuid },
}

/// Which fallback strategy produced an [`Outcome::Fallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    DefaultBehavior,
    CachedResult,
    DeferredQueue,
    ManualApproval,
}

/// Invocation mode requested by a platform component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationMode {
    Sync,
    Async,
}

/// Job status matching the `delegation_job_status` `PostgreSQL` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delegation_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

/// An async delegation job.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub application_id: Uuid,
    pub capability: Capability,
    pub payload: serde_json::Value,
    /// Stable across attempts; the endpoint contract treats repeated
    /// identical request ids as a no-op returning the prior result.
    pub request_id: Uuid,
    pub attempts_made: i32,
    pub next_run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of a job that exhausted its retries.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeadLetterJob {
    pub id: Uuid,
    pub job_id: Uuid,
    pub application_id: Uuid,
    pub capability: Capability,
    pub payload: serde_json::Value,
    pub request_id: Uuid,
    pub attempts_made: i32,
    pub final_error: String,
    pub failed_at: DateTime<Utc>,
    pub requeued_at: Option<DateTime<Utc>>,
}

/// A pending-review record persisted by the `ManualApproval` fallback.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PendingReview {
    pub id: Uuid,
    pub application_id: Uuid,
    pub capability: Capability,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Failure modes of a single delegated call.
///
/// `Timeout`, `Transport`, and `CircuitOpen` never escape the gateway; they
/// are converted into a fallback outcome. Only fallback failures propagate.
#[derive(Error, Debug, Clone)]
pub enum DelegationError {
    #[error("delegated call exceeded the {0}ms deadline")]
    Timeout(u64),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote endpoint reported failure: {0}")]
    Remote(String),
    #[error("circuit open, call short-circuited")]
    CircuitOpen,
    #[error("malformed endpoint response: {0}")]
    Validation(String),
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
}

impl DelegationError {
    /// Whether the attempt is known to have timed out at the deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Failures of the degradation path itself.
///
/// These signal a configuration gap rather than remote unavailability, so
/// they do propagate to the caller.
#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("no fallback strategy registered for capability {0}")]
    Unregistered(Capability),
    #[error("no cached result within the freshness window")]
    StaleCacheMiss,
    #[error("local fallback computation failed: {0}")]
    Local(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Failures while enqueuing or scheduling async jobs.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("redis error: {0}")]
    Redis(#[from] fred::error::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trips_through_string_form() {
        for cap in [
            Capability::WinnerSelection,
            Capability::ParticipantRegistration,
            Capability::AnalyticsReport,
            Capability::PrizeAllocation,
        ] {
            assert_eq!(Capability::parse_str(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse_str("room.created"), None);
    }

    #[test]
    fn target_key_display_is_app_slash_capability() {
        let id = Uuid::nil();
        let key = TargetKey::new(id, Capability::WinnerSelection);
        assert_eq!(
            key.to_string(),
            format!("{id}/winner.selection")
        );
    }
}
