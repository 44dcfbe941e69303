//! Trading surface: execute, per-executor status, and the admin-only
//! account snapshot view. HTTP 200 covers both live and simulated fills;
//! the `SIM_` order-id prefix is the discriminator.

use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::executor::{ExecutionDecision, RejectionCode};
use crate::fingerprint;
use crate::models::Signal;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// Either a stored signal id...
    pub signal_id: Option<String>,
    /// ...or a full signal payload (fingerprint-verified server-side).
    pub signal: Option<Signal>,
    /// Defaults to the first configured executor.
    pub executor_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub order_id: String,
    pub executor_id: String,
    pub simulated: bool,
    /// True when this signal had already been executed (redelivery).
    pub duplicate: bool,
}

/// POST /api/v1/trading/execute
pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let signal = match (&request.signal_id, request.signal) {
        (Some(signal_id), _) => state
            .signal_store
            .get(signal_id)
            .map_err(|e| ApiError::internal("STORE_READ_FAILED", e.to_string()))?
            .ok_or_else(|| ApiError::not_found(format!("signal {} not found", signal_id)))?,
        (None, Some(signal)) => {
            if !fingerprint::verify(&signal) {
                return Err(ApiError::bad_request(
                    "INVALID_FINGERPRINT",
                    "signal payload fingerprint does not verify",
                ));
            }
            signal
        }
        (None, None) => {
            return Err(ApiError::bad_request(
                "MISSING_SIGNAL",
                "provide signal_id or a signal payload",
            ));
        }
    };

    let executor = match &request.executor_id {
        Some(id) => state.executor(id).ok_or_else(|| {
            // Unknown executor id is an invariant violation, not a 404: the
            // caller addressed an identity this deployment does not run.
            ApiError::internal("INVARIANT_VIOLATION", format!("unknown executor {}", id))
        })?,
        None => state
            .default_executor()
            .ok_or_else(|| ApiError::internal("INVARIANT_VIOLATION", "no executors configured"))?,
    };

    let decision = executor
        .handle_signal(&signal)
        .await
        .map_err(|e| ApiError::internal("EXECUTION_FAILED", e.to_string()))?;

    match decision {
        ExecutionDecision::Placed(order) => Ok(Json(ExecuteResponse {
            success: true,
            order_id: order.order_id,
            executor_id: order.executor_id,
            simulated: false,
            duplicate: false,
        })),
        ExecutionDecision::Simulated(order) => Ok(Json(ExecuteResponse {
            success: true,
            order_id: order.order_id.clone(),
            executor_id: order.executor_id,
            simulated: true,
            duplicate: false,
        })),
        ExecutionDecision::Duplicate(order) => Ok(Json(ExecuteResponse {
            success: true,
            simulated: order.is_simulated(),
            order_id: order.order_id,
            executor_id: executor.executor_id().to_string(),
            duplicate: true,
        })),
        ExecutionDecision::Rejected { code, reason } => {
            Err(reject_response(code, reason))
        }
    }
}

fn reject_response(code: RejectionCode, reason: String) -> ApiError {
    let mut err = ApiError::policy_rejected(reason);
    // POLICY_REJECTED{reason: <stable code>}: the reason field carries the
    // machine-readable sub-code.
    err.message = format!("{}: {}", code.as_str(), err.message);
    err
}

#[derive(Debug, Serialize)]
pub struct ExecutorStatus {
    pub executor_id: String,
    pub paused: bool,
    pub open_positions: usize,
    pub daily_pnl_pct: f64,
    pub drawdown_pct: f64,
}

/// GET /api/v1/trading/status
pub async fn trading_status(
    State(state): State<AppState>,
) -> Result<Json<Vec<ExecutorStatus>>, ApiError> {
    let now = Utc::now();
    let mut statuses = Vec::with_capacity(state.executors.len());
    for executor in &state.executors {
        let executor_id = executor.executor_id().to_string();
        let open_positions = state
            .exec_store
            .open_position_count(&executor_id)
            .map_err(|e| ApiError::internal("STORE_READ_FAILED", e.to_string()))?;
        let daily_pnl_pct = state
            .exec_store
            .realized_daily_pnl_pct(&executor_id, now)
            .unwrap_or(0.0);
        let drawdown_pct = state
            .monitors
            .get(&executor_id)
            .and_then(|m| m.last_known())
            .map(|s| s.drawdown_pct)
            .unwrap_or(0.0);

        statuses.push(ExecutorStatus {
            paused: executor.pause_flag().is_paused(),
            executor_id,
            open_positions,
            daily_pnl_pct,
            drawdown_pct,
        });
    }
    Ok(Json(statuses))
}

/// GET /api/v1/execution/account-states, admin-only full snapshot.
pub async fn account_states(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let mut accounts = Vec::with_capacity(state.executors.len());
    for executor in &state.executors {
        let executor_id = executor.executor_id();
        let (paused, paused_reason, latched) = state
            .exec_store
            .pause_state(executor_id)
            .map_err(|e| ApiError::internal("STORE_READ_FAILED", e.to_string()))?;
        let positions = state
            .exec_store
            .open_positions(executor_id)
            .map_err(|e| ApiError::internal("STORE_READ_FAILED", e.to_string()))?;
        let snapshot = state
            .monitors
            .get(executor_id)
            .and_then(|m| m.last_known());

        accounts.push(json!({
            "executor_id": executor_id,
            "kind": executor.config().kind.as_str(),
            "limits": {
                "min_confidence": executor.config().min_confidence,
                "max_positions": executor.config().max_positions,
                "max_position_pct": executor.config().max_position_pct,
                "daily_loss_limit_pct": executor.config().daily_loss_limit_pct,
                "max_drawdown_pct": executor.config().max_drawdown_pct,
            },
            "paused": paused,
            "paused_reason": paused_reason,
            "pause_latched": latched,
            "snapshot": snapshot,
            "positions": positions,
        }));
    }
    Ok(Json(json!({ "accounts": accounts })))
}

/// POST /api/v1/execution/executors/:executor_id/unpause, operator action
/// clearing a latched pause.
pub async fn unpause_executor(
    State(state): State<AppState>,
    Path(executor_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.guard.operator_unpause(&executor_id) {
        return Err(ApiError::not_found(format!(
            "executor {} not found",
            executor_id
        )));
    }
    Ok(Json(json!({ "success": true, "executor_id": executor_id })))
}
