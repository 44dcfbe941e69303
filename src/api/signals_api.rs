//! Signal read surface: ordered reads, single lookups, rolling stats.
//! Every signal leaves with a server-side `verified` flag (fingerprint
//! recomputation) and its order refs resolved from executor state.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::fingerprint;
use crate::models::{OrderRef, Signal};
use crate::store::SignalStats;

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub premium_only: bool,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct SignalView {
    #[serde(flatten)]
    pub signal: Signal,
    /// Server-side fingerprint verification result.
    pub verified: bool,
}

#[derive(Debug, Serialize)]
pub struct SignalsResponse {
    pub signals: Vec<SignalView>,
    pub count: usize,
}

fn view(state: &AppState, mut signal: Signal) -> SignalView {
    let verified = fingerprint::verify(&signal);
    signal.order_refs = state
        .exec_store
        .orders_for_signal(&signal.signal_id)
        .unwrap_or_default()
        .into_iter()
        .map(|order| OrderRef {
            executor_id: order.executor_id,
            order_id: order.order_id,
        })
        .collect();
    SignalView { signal, verified }
}

/// GET /api/signals/latest?limit=N&premium_only=bool
pub async fn latest_signals(
    State(state): State<AppState>,
    Query(params): Query<LatestQuery>,
) -> Result<Json<SignalsResponse>, ApiError> {
    let min_confidence = params
        .premium_only
        .then_some(state.config.consensus.premium_confidence);
    let limit = params.limit.clamp(1, 500);

    let signals = state
        .signal_store
        .latest(limit, min_confidence)
        .map_err(|e| ApiError::internal("STORE_READ_FAILED", e.to_string()))?
        .into_iter()
        .map(|s| view(&state, s))
        .collect::<Vec<_>>();

    Ok(Json(SignalsResponse {
        count: signals.len(),
        signals,
    }))
}

/// GET /api/signals/:signal_id
pub async fn get_signal(
    State(state): State<AppState>,
    Path(signal_id): Path<String>,
) -> Result<Json<SignalView>, ApiError> {
    let signal = state
        .signal_store
        .get(&signal_id)
        .map_err(|e| ApiError::internal("STORE_READ_FAILED", e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("signal {} not found", signal_id)))?;
    Ok(Json(view(&state, signal)))
}

/// GET /api/signals/stats: aggregate counts over a rolling 24h window.
pub async fn signal_stats(
    State(state): State<AppState>,
) -> Result<Json<SignalStats>, ApiError> {
    let stats = state
        .signal_store
        .stats(24, state.config.consensus.premium_confidence)
        .map_err(|e| ApiError::internal("STORE_READ_FAILED", e.to_string()))?;
    Ok(Json(stats))
}
