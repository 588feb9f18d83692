//! Storage layer of the archive: content-addressed offers with per-container
//! logs, a distribution layer fanning writes out to every offer of a
//! strategy, and a synchronization service replaying one offer onto another.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
