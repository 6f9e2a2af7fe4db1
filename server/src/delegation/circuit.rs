//! Circuit Breaker
//!
//! Per-target failure-pattern detector that stops calling endpoints detected
//! as persistently failing.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: endpoint assumed down, calls short-circuit to fallback
//! - Half-Open: trial recovery after the recovery timeout
//!
//! # State Transitions
//! ```text
//! Closed    → Open:      consecutive failures >= failure_threshold
//! Open      → Half-Open: recovery timeout elapsed since last failure
//! Half-Open → Closed:    consecutive successes >= success_threshold
//! Half-Open → Open:      any failure (recovery timeout restarts)
//! ```
//!
//! State is kept per (`application_id`, capability) in an injected store,
//! created lazily on first call and reset only by operator action. All
//! mutations are per-entry read-modify-write under a mutex, so transitions
//! stay linearizable under concurrent callers hitting the same target.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::types::{DelegationError, TargetKey};

/// Circuit breaker tuning. Defaults follow the platform-wide policy.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while Closed before the circuit opens.
    pub failure_threshold: u32,
    /// Time the circuit stays Open before a trial call is allowed.
    pub recovery_timeout: Duration,
    /// Consecutive Half-Open successes before the circuit closes.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

/// Circuit status as exposed to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Per-target circuit state. Interior of one store entry.
#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Monotonic instant of the last failure, drives the recovery timer.
    last_failure_at: Option<Instant>,
    /// Wall-clock mirror of `last_failure_at` for operator reporting.
    last_failure_wall: Option<DateTime<Utc>>,
}

impl CircuitState {
    const fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_failure_wall: None,
        }
    }
}

/// Operator-facing snapshot of one circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub target: TargetKey,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Store of circuit states keyed by (`application_id`, capability).
///
/// Lifecycle is tied to the process; see DESIGN notes on cross-instance
/// sharing.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: DashMap<TargetKey, Mutex<CircuitState>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    /// Run `f` against the (lazily created) state entry for `key`.
    fn with_state<T>(&self, key: TargetKey, f: impl FnOnce(&mut CircuitState) -> T) -> T {
        let entry = self.states.entry(key).or_insert_with(|| Mutex::new(CircuitState::new()));
        let mut state = entry.lock().expect("circuit state mutex poisoned");
        f(&mut state)
    }

    /// Gate a call: returns false when the circuit is Open and the recovery
    /// timeout has not elapsed. Moves Open circuits to Half-Open once it has.
    fn admit(&self, key: TargetKey) -> bool {
        self.with_state(key, |state| match state.status {
            CircuitStatus::Closed | CircuitStatus::HalfOpen => true,
            CircuitStatus::Open => {
                let recovered = state
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    state.status = CircuitStatus::HalfOpen;
                    state.consecutive_successes = 0;
                    info!(target_key = %key, "Circuit half-open, allowing trial call");
                }
                recovered
            }
        })
    }

    /// Record a successful call. Returns true if the circuit just closed.
    fn record_success(&self, key: TargetKey) -> bool {
        self.with_state(key, |state| match state.status {
            CircuitStatus::Closed => {
                state.consecutive_failures = 0;
                false
            }
            CircuitStatus::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.status = CircuitStatus::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    return true;
                }
                false
            }
            // Late result from a call admitted before the circuit opened
            CircuitStatus::Open => false,
        })
    }

    /// Record a failed call. Returns true if the circuit just opened.
    fn record_failure(&self, key: TargetKey) -> bool {
        self.with_state(key, |state| {
            state.last_failure_at = Some(Instant::now());
            state.last_failure_wall = Some(Utc::now());
            match state.status {
                CircuitStatus::Closed => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.failure_threshold {
                        state.status = CircuitStatus::Open;
                        return true;
                    }
                    false
                }
                CircuitStatus::HalfOpen => {
                    state.status = CircuitStatus::Open;
                    state.consecutive_successes = 0;
                    true
                }
                CircuitStatus::Open => false,
            }
        })
    }

    /// Execute `primary` under circuit protection.
    ///
    /// While Open and before the recovery timeout, `primary` is invoked zero
    /// times and `fallback` receives [`DelegationError::CircuitOpen`].
    /// Otherwise `primary` runs and its outcome drives the state machine;
    /// any failure is handed to `fallback`, whose result (or error) is the
    /// final outcome. Errors surface only from `fallback`.
    pub async fn call<T, E, P, PFut, F, FFut>(
        &self,
        key: TargetKey,
        primary: P,
        fallback: F,
    ) -> Result<T, E>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, DelegationError>>,
        F: FnOnce(DelegationError) -> FFut,
        FFut: Future<Output = Result<T, E>>,
    {
        if !self.admit(key) {
            return fallback(DelegationError::CircuitOpen).await;
        }

        match primary().await {
            Ok(value) => {
                if self.record_success(key) {
                    info!(target_key = %key, "Circuit closed after successful recovery");
                }
                Ok(value)
            }
            Err(err) => {
                if self.record_failure(key) {
                    warn!(target_key = %key, error = %err, "Circuit opened");
                }
                fallback(err).await
            }
        }
    }

    /// Operator action: force a circuit back to Closed with cleared counters.
    /// Returns false if no circuit exists for the key yet.
    pub fn force_reset(&self, key: TargetKey) -> bool {
        let Some(entry) = self.states.get(&key) else {
            return false;
        };
        let mut state = entry.lock().expect("circuit state mutex poisoned");
        *state = CircuitState::new();
        info!(target_key = %key, "Circuit force-reset by operator");
        true
    }

    /// Snapshot one circuit, if it has been created.
    pub fn snapshot(&self, key: TargetKey) -> Option<CircuitSnapshot> {
        self.states.get(&key).map(|entry| {
            let state = entry.lock().expect("circuit state mutex poisoned");
            CircuitSnapshot {
                target: key,
                status: state.status,
                consecutive_failures: state.consecutive_failures,
                consecutive_successes: state.consecutive_successes,
                last_failure_at: state.last_failure_wall,
            }
        })
    }

    /// Snapshot every circuit created so far.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.states
            .iter()
            .map(|entry| {
                let state = entry.value().lock().expect("circuit state mutex poisoned");
                CircuitSnapshot {
                    target: *entry.key(),
                    status: state.status,
                    consecutive_failures: state.consecutive_failures,
                    consecutive_successes: state.consecutive_successes,
                    last_failure_at: state.last_failure_wall,
                }
            })
            .collect()
    }
}
