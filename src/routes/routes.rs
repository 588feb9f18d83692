//! HTTP surface of the storage node.
//!
//! - `GET /healthz` -> liveness
//! - `GET /readyz` -> readiness of every offer
//! - `GET /sync/status` -> last synchronization status
//! - `GET /sync/running` -> whether a synchronization is in progress
//!
//! Storage operations themselves are a Rust API, not HTTP routes.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        sync_handlers::{sync_running, sync_status},
    },
    state::AppState,
};
use axum::{Router, routing::get};

/// Build the router. Handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/sync/status", get(sync_status))
        .route("/sync/running", get(sync_running))
}
