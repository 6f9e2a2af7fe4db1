//! Server Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

use crate::delegation::circuit::CircuitBreakerConfig;
use crate::observability::monitor::HealthThresholds;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// `PostgreSQL` connection URL
    pub database_url: String,

    /// Redis connection URL
    pub redis_url: String,

    /// Number of async delegation workers (default: 4)
    pub worker_count: usize,

    /// Per-attempt deadline for async job delivery in seconds (default: 30)
    pub async_attempt_deadline_secs: u64,

    /// Consecutive failures before a circuit opens (default: 5)
    pub circuit_failure_threshold: u32,

    /// Seconds an open circuit waits before admitting a trial call (default: 60)
    pub circuit_recovery_timeout_secs: u64,

    /// Consecutive half-open successes before a circuit recloses (default: 3)
    pub circuit_success_threshold: u32,

    /// Freshness window for the cached-result fallback in seconds (default: 300)
    pub fallback_cache_freshness_secs: u64,

    /// Dead-letter count above which the monitor warns (default: 100)
    pub dead_letter_alert_threshold: i64,

    /// Health monitor evaluation interval in seconds (default: 60)
    pub health_interval_secs: u64,

    /// Default sync timeout for newly registered targets in ms (default: 100)
    pub default_timeout_ms: i32,

    /// Default max delivery attempts for async jobs (default: 3)
    pub default_max_attempts: i32,

    /// Default backoff base for async retries in ms (default: 500)
    pub default_backoff_base_ms: i32,

    /// Default backoff cap for async retries in ms (default: 60000)
    pub default_backoff_cap_ms: i32,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
            worker_count: env_parsed("DELEGATION_WORKER_COUNT", 4),
            async_attempt_deadline_secs: env_parsed("DELEGATION_ATTEMPT_DEADLINE_SECS", 30),
            circuit_failure_threshold: env_parsed("CIRCUIT_FAILURE_THRESHOLD", 5),
            circuit_recovery_timeout_secs: env_parsed("CIRCUIT_RECOVERY_TIMEOUT_SECS", 60),
            circuit_success_threshold: env_parsed("CIRCUIT_SUCCESS_THRESHOLD", 3),
            fallback_cache_freshness_secs: env_parsed("FALLBACK_CACHE_FRESHNESS_SECS", 300),
            dead_letter_alert_threshold: env_parsed("DEAD_LETTER_ALERT_THRESHOLD", 100),
            health_interval_secs: env_parsed("HEALTH_INTERVAL_SECS", 60),
            default_timeout_ms: env_parsed("DELEGATION_DEFAULT_TIMEOUT_MS", 100),
            default_max_attempts: env_parsed("DELEGATION_DEFAULT_MAX_ATTEMPTS", 3),
            default_backoff_base_ms: env_parsed("DELEGATION_DEFAULT_BACKOFF_BASE_MS", 500),
            default_backoff_cap_ms: env_parsed("DELEGATION_DEFAULT_BACKOFF_CAP_MS", 60_000),
        })
    }

    /// Circuit breaker thresholds from the loaded configuration.
    #[must_use]
    pub const fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_recovery_timeout_secs),
            success_threshold: self.circuit_success_threshold,
        }
    }

    /// Alert thresholds for the health monitor.
    #[must_use]
    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            dead_letter_threshold: self.dead_letter_alert_threshold,
            ..HealthThresholds::default()
        }
    }
}
