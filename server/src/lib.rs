//! Tombola Server
//!
//! Giveaway platform backend: capability delegation to registered bot
//! endpoints with timeout racing, circuit breaking, fallbacks, and a
//! durable async retry queue.

pub mod api;
pub mod config;
pub mod db;
pub mod delegation;
pub mod notify;
pub mod observability;
