//! Read-only probes of the synchronization service.
//!
//! - GET /sync/status   -> last job status, 404 before the first job
//! - GET /sync/running  -> `{"running": bool}`

use crate::{errors::AppError, models::sync_status::SyncStatus, state::AppState};
use axum::{Json, extract::State};
use serde::Serialize;

pub async fn sync_status(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    state
        .sync
        .get_last_synchronization_status()
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("no synchronization has run yet"))
}

pub async fn sync_running(State(state): State<AppState>) -> Json<RunningResponse> {
    Json(RunningResponse {
        running: state.sync.is_synchronization_running(),
    })
}

#[derive(Serialize)]
pub struct RunningResponse {
    running: bool,
}
