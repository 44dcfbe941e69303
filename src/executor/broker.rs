//! Broker Client
//! Mission: Typed order submission with transient faults kept recoverable
//!
//! The REST client signs each request with HMAC-SHA256 over
//! `timestamp + method + path + body`. Error kinds split into transient
//! (retryable / simulation-fallback eligible) and permanent, mirroring the
//! adapter boundary discipline.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::Action;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub enum BrokerError {
    /// Network-level failure or timeout.
    Unreachable(String),
    /// HTTP 5xx or rate limiting.
    Transient { status: u16, body: String },
    /// Credentials rejected or the account cannot trade.
    InvalidAccount(String),
    /// Broker rejected this specific order (4xx other than auth/rate).
    Rejected(String),
    Parse(String),
}

impl BrokerError {
    /// True when simulation fallback (rather than a hard rejection) is the
    /// right response.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            BrokerError::Unreachable(_)
                | BrokerError::Transient { .. }
                | BrokerError::InvalidAccount(_)
        )
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Unreachable(msg) => write!(f, "broker unreachable: {}", msg),
            BrokerError::Transient { status, body } => {
                write!(f, "broker transient error {}: {}", status, body)
            }
            BrokerError::InvalidAccount(msg) => write!(f, "broker account invalid: {}", msg),
            BrokerError::Rejected(msg) => write!(f, "order rejected: {}", msg),
            BrokerError::Parse(msg) => write!(f, "broker payload parse error: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct AccountState {
    pub equity: f64,
    pub buying_power: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    /// Idempotency key: the signal id. Retries after a cancellation either
    /// find the prior order or submit once.
    pub client_order_id: String,
    pub symbol: String,
    pub side: Action,
    pub qty: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerFill {
    pub order_id: String,
    pub filled_qty: f64,
    pub fill_price: f64,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn account(&self) -> Result<AccountState, BrokerError>;
    async fn submit(&self, request: &OrderRequest) -> Result<BrokerFill, BrokerError>;
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

pub struct RestBroker {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    secret: Vec<u8>,
    timeout: Duration,
}

impl RestBroker {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        key_id: String,
        secret: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url,
            key_id,
            secret: secret.into_bytes(),
            timeout,
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<String>,
    ) -> Result<String, BrokerError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let timestamp = Utc::now().timestamp_millis().to_string();
        let body_str = body.clone().unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str);

        let mut req = self
            .client
            .request(method, &url)
            .timeout(self.timeout)
            .header("X-Key-Id", &self.key_id)
            .header("X-Timestamp", &timestamp)
            .header("X-Signature", signature);
        if let Some(body) = body {
            req = req.header("Content-Type", "application/json").body(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BrokerError::Parse(e.to_string()))?;

        if status.is_success() {
            return Ok(text);
        }
        let code = status.as_u16();
        match code {
            401 | 403 => Err(BrokerError::InvalidAccount(text)),
            429 => Err(BrokerError::Transient { status: code, body: text }),
            400..=499 => Err(BrokerError::Rejected(text)),
            _ => Err(BrokerError::Transient { status: code, body: text }),
        }
    }
}

#[async_trait]
impl BrokerClient for RestBroker {
    async fn account(&self) -> Result<AccountState, BrokerError> {
        let text = self.send(reqwest::Method::GET, "/account", None).await?;
        serde_json::from_str(&text).map_err(|e| BrokerError::Parse(e.to_string()))
    }

    async fn submit(&self, request: &OrderRequest) -> Result<BrokerFill, BrokerError> {
        let body =
            serde_json::to_string(request).map_err(|e| BrokerError::Parse(e.to_string()))?;
        debug!(
            client_order_id = %request.client_order_id,
            symbol = %request.symbol,
            side = request.side.as_str(),
            qty = request.qty,
            "submitting broker order"
        );
        let text = self
            .send(reqwest::Method::POST, "/orders", Some(body))
            .await?;
        serde_json::from_str(&text).map_err(|e| BrokerError::Parse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Paper implementation
// ---------------------------------------------------------------------------

/// In-memory broker for tests and paper trading: every order fills at its
/// reference price. Idempotent on client_order_id like the real thing.
pub struct PaperBroker {
    equity: Mutex<f64>,
    fills: Mutex<HashMap<String, BrokerFill>>,
    /// When set, every call fails with this error (outage injection).
    outage: Mutex<Option<BrokerError>>,
    seq: Mutex<u64>,
}

impl PaperBroker {
    pub fn new(equity: f64) -> Self {
        Self {
            equity: Mutex::new(equity),
            fills: Mutex::new(HashMap::new()),
            outage: Mutex::new(None),
            seq: Mutex::new(0),
        }
    }

    pub fn set_outage(&self, error: Option<BrokerError>) {
        *self.outage.lock() = error;
    }

    pub fn set_equity(&self, equity: f64) {
        *self.equity.lock() = equity;
    }

    pub fn fill_count(&self) -> usize {
        self.fills.lock().len()
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn account(&self) -> Result<AccountState, BrokerError> {
        if let Some(err) = self.outage.lock().clone() {
            return Err(err);
        }
        let equity = *self.equity.lock();
        Ok(AccountState {
            equity,
            buying_power: equity,
        })
    }

    async fn submit(&self, request: &OrderRequest) -> Result<BrokerFill, BrokerError> {
        if let Some(err) = self.outage.lock().clone() {
            return Err(err);
        }
        let mut fills = self.fills.lock();
        if let Some(existing) = fills.get(&request.client_order_id) {
            warn!(
                client_order_id = %request.client_order_id,
                "duplicate submission, returning prior fill"
            );
            return Ok(existing.clone());
        }
        let mut seq = self.seq.lock();
        *seq += 1;
        let fill = BrokerFill {
            order_id: format!("paper-{:06}", *seq),
            filled_qty: request.qty,
            fill_price: request.limit_price.unwrap_or(0.0),
        };
        fills.insert(request.client_order_id.clone(), fill.clone());
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paper_broker_is_idempotent_on_client_order_id() {
        let broker = PaperBroker::new(50_000.0);
        let req = OrderRequest {
            client_order_id: "sig-1".to_string(),
            symbol: "AAPL".to_string(),
            side: Action::Buy,
            qty: 10.0,
            limit_price: Some(187.0),
            stop_price: None,
            target_price: None,
        };

        let first = broker.submit(&req).await.unwrap();
        let second = broker.submit(&req).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(broker.fill_count(), 1);
    }

    #[tokio::test]
    async fn outage_surfaces_as_fallback_eligible() {
        let broker = PaperBroker::new(50_000.0);
        broker.set_outage(Some(BrokerError::Transient {
            status: 503,
            body: "maintenance".to_string(),
        }));

        let err = broker.account().await.unwrap_err();
        assert!(err.is_fallback_eligible());
    }

    #[test]
    fn rejection_is_not_fallback_eligible() {
        let err = BrokerError::Rejected("unknown symbol".to_string());
        assert!(!err.is_fallback_eligible());
    }
}
