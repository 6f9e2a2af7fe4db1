//! Capability Delegation & Webhook Resilience
//!
//! Signed HTTP delegation of giveaway capabilities to registered bot
//! endpoints, with timeout racing, per-target circuit breaking, pluggable
//! fallback strategies, and a durable retry queue with dead-lettering.

pub mod backoff;
pub mod circuit;
pub mod fallback;
pub mod gateway;
pub mod handlers;
pub mod queries;
pub mod queue;
pub mod signing;
pub mod transport;
pub mod types;
