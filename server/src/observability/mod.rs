//! Observability
//!
//! Delegation metric recording, window aggregation, and the background
//! health monitor that turns windows and circuit state into alerts.

pub mod monitor;
pub mod recorder;
