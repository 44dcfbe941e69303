//! Liveness and readiness.
//!
//! Liveness never touches dependencies; a 200 only says the event loop is
//! progressing. Readiness checks that the signal store accepts writes and
//! that either a broker account is reachable or simulation fallback will
//! service executions.

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;

use super::{AppState, VERSION};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "alive",
        version: VERSION,
    })
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub store_writable: bool,
    pub broker_reachable: bool,
    pub simulation_fallback: bool,
}

pub async fn readiness(
    State(state): State<AppState>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    let store_writable = state.signal_store.writable();
    let broker_reachable = matches!(
        timeout(Duration::from_secs(2), state.broker.account()).await,
        Ok(Ok(_))
    );
    let simulation_fallback = state.config.features.simulation_fallback;

    let ready = store_writable && (broker_reachable || simulation_fallback);
    let body = ReadinessResponse {
        status: if ready { "ready" } else { "not_ready" },
        store_writable,
        broker_reachable,
        simulation_fallback,
    };

    if ready {
        Ok(Json(body))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}
