//! HTTP API
//! Mission: Every caller gets a decision: live order, simulated order, or a
//! typed rejection; never a silent failure

mod health;
mod signals_api;
mod trading;

pub use health::{health, readiness};
pub use signals_api::{get_signal, latest_signals, signal_stats};
pub use trading::{account_states, execute, trading_status, unpause_executor};

use axum::{
    http::StatusCode,
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::auth::{auth_middleware, require_admin, JwtHandler};
use crate::config::AppConfig;
use crate::executor::broker::BrokerClient;
use crate::executor::Executor;
use crate::middleware::request_logging;
use crate::risk::{AccountMonitor, RiskGuard};
use crate::store::{ExecutionStore, SignalStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub signal_store: Arc<SignalStore>,
    pub exec_store: Arc<ExecutionStore>,
    pub executors: Vec<Arc<Executor>>,
    pub monitors: HashMap<String, Arc<AccountMonitor>>,
    pub guard: Arc<RiskGuard>,
    pub broker: Arc<dyn BrokerClient>,
    pub jwt: Arc<JwtHandler>,
}

impl AppState {
    pub fn executor(&self, executor_id: &str) -> Option<&Arc<Executor>> {
        self.executors
            .iter()
            .find(|e| e.executor_id() == executor_id)
    }

    pub fn default_executor(&self) -> Option<&Arc<Executor>> {
        self.executors.first()
    }
}

/// Structured error envelope with stable codes. 5xx responses carry a
/// correlation id for the alert trail.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub correlation_id: Option<String>,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
            correlation_id: None,
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
            correlation_id: None,
        }
    }

    pub fn policy_rejected(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "POLICY_REJECTED",
            message: reason.into(),
            correlation_id: None,
        }
    }

    /// Invariant violations and unexpected internals: fatal for this
    /// request, alerting, process continues.
    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message = message.into();
        tracing::error!(code, correlation_id = %correlation_id, message, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code,
            message,
            correlation_id: Some(correlation_id),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": {
                "code": self.code,
                "message": self.message,
                "correlation_id": self.correlation_id,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/health/readiness", get(readiness));

    let authed = Router::new()
        .route("/api/signals/latest", get(latest_signals))
        .route("/api/signals/stats", get(signal_stats))
        .route("/api/signals/:signal_id", get(get_signal))
        .route("/api/v1/trading/execute", post(execute))
        .route("/api/v1/trading/status", get(trading_status))
        .layer(axum_mw::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ));

    let admin = Router::new()
        .route("/api/v1/execution/account-states", get(account_states))
        .route(
            "/api/v1/execution/executors/:executor_id/unpause",
            post(unpause_executor),
        )
        .layer(axum_mw::from_fn(require_admin))
        .layer(axum_mw::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ));

    public
        .merge(authed)
        .merge(admin)
        .layer(axum_mw::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
