//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that pings every offer (metadata store and disk I/O)

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;

/// `GET /healthz`
///
/// Very small liveness probe. Always 200 OK, never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Pings every registered offer concurrently. HTTP 200 when all of them
/// answer, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let offers: Vec<_> = state.registry.offers().cloned().collect();
    let pings = join_all(offers.iter().map(|offer| offer.ping())).await;

    let mut checks = BTreeMap::new();
    for (offer, result) in offers.iter().zip(pings) {
        let check = match result {
            Ok(()) => CheckStatus {
                ok: true,
                error: None,
            },
            Err(err) => {
                tracing::warn!(offer_id = %offer.id(), error = %err, "offer not ready");
                CheckStatus {
                    ok: false,
                    error: Some(err.to_string()),
                }
            }
        };
        checks.insert(offer.id().to_string(), check);
    }

    let overall_ok = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
