//! Core data models for the archive storage layer.
//!
//! Metadata rows map to database tables via `sqlx::FromRow` helper structs
//! and everything that leaves the crate serializes as JSON via `serde`.

pub mod category;
pub mod object;
pub mod offer_log;
pub mod strategy;
pub mod sync_status;
