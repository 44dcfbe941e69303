//! Executor
//! Mission: Turn admitted signals into orders without ever double-trading
//!
//! Two behaviorally identical instances run (STANDARD and PROP_FIRM),
//! differing only in configured limits. Per signal: dedup on signal_id,
//! pause check, pre-trade risk gate, sizing, broker submission with
//! simulation fallback, persistence. Submission per symbol is serialized
//! inside an executor; symbols proceed in parallel.

pub mod broker;
mod reconciler;

pub use reconciler::OutcomeReconciler;

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ExecutorConfig;
use crate::models::{
    Action, Order, OrderStatus, Position, SellPolicy, Signal, SIM_ORDER_PREFIX,
};
use crate::risk::{LimitBreach, PauseFlag, RiskGate};
use crate::store::ExecutionStore;
use broker::{BrokerClient, BrokerError, OrderRequest};

/// Stable rejection codes surfaced through the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionCode {
    Paused,
    Limit(LimitBreach),
    BelowMinNotional,
    SellWithoutPosition,
    BrokerRejected,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::Paused => "EXECUTOR_PAUSED",
            RejectionCode::Limit(breach) => breach.as_str(),
            RejectionCode::BelowMinNotional => "BELOW_MIN_NOTIONAL",
            RejectionCode::SellWithoutPosition => "SELL_WITHOUT_POSITION",
            RejectionCode::BrokerRejected => "BROKER_REJECTED",
        }
    }
}

/// Every handled signal resolves to exactly one of these; silence is not an
/// outcome.
#[derive(Debug)]
pub enum ExecutionDecision {
    Placed(Order),
    Simulated(Order),
    /// Redelivery: the order already recorded for this signal.
    Duplicate(Order),
    Rejected { code: RejectionCode, reason: String },
}

impl ExecutionDecision {
    pub fn order(&self) -> Option<&Order> {
        match self {
            ExecutionDecision::Placed(o)
            | ExecutionDecision::Simulated(o)
            | ExecutionDecision::Duplicate(o) => Some(o),
            ExecutionDecision::Rejected { .. } => None,
        }
    }
}

pub struct Executor {
    cfg: ExecutorConfig,
    broker: Arc<dyn BrokerClient>,
    store: Arc<ExecutionStore>,
    gate: RiskGate,
    pause: Arc<PauseFlag>,
    min_notional: f64,
    simulation_fallback: bool,
    /// Per-symbol submission locks; entries are created on first use.
    symbol_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Executor {
    pub fn new(
        cfg: ExecutorConfig,
        broker: Arc<dyn BrokerClient>,
        store: Arc<ExecutionStore>,
        gate: RiskGate,
        pause: Arc<PauseFlag>,
        min_notional: f64,
        simulation_fallback: bool,
    ) -> Self {
        Self {
            cfg,
            broker,
            store,
            gate,
            pause,
            min_notional,
            simulation_fallback,
            symbol_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn executor_id(&self) -> &str {
        &self.cfg.executor_id
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.cfg
    }

    pub fn pause_flag(&self) -> &Arc<PauseFlag> {
        &self.pause
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.symbol_locks
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Full per-signal pipeline. Idempotent on signal_id.
    pub async fn handle_signal(&self, signal: &Signal) -> anyhow::Result<ExecutionDecision> {
        let lock = self.symbol_lock(&signal.symbol);
        let _serialized = lock.lock().await;

        // Dedup before anything else: redelivery must be a no-op.
        if let Some(existing) = self
            .store
            .order_for_signal(&self.cfg.executor_id, &signal.signal_id)?
        {
            return Ok(ExecutionDecision::Duplicate(existing));
        }

        if self.pause.is_paused() {
            let (_, reason, _) = self.store.pause_state(&self.cfg.executor_id)?;
            return Ok(ExecutionDecision::Rejected {
                code: RejectionCode::Paused,
                reason: reason.unwrap_or_else(|| "executor paused".to_string()),
            });
        }

        // SELL policy: close-only executors no-op a SELL with no open long.
        let existing_position = self.store.get_position(&self.cfg.executor_id, &signal.symbol)?;
        if signal.action == Action::Sell
            && self.cfg.sell_policy == SellPolicy::CloseOnly
            && existing_position.as_ref().map_or(true, |p| p.qty <= 0.0)
        {
            return Ok(ExecutionDecision::Rejected {
                code: RejectionCode::SellWithoutPosition,
                reason: "close-only policy and no open long".to_string(),
            });
        }

        let now = Utc::now();
        let snapshot = match self.gate.pre_trade(self.cfg.max_position_pct, now).await {
            Ok(snapshot) => snapshot,
            Err(breach) => {
                info!(
                    executor = %self.cfg.executor_id,
                    signal = %signal.signal_id,
                    breach = breach.as_str(),
                    "signal rejected by risk gate"
                );
                return Ok(ExecutionDecision::Rejected {
                    code: RejectionCode::Limit(breach),
                    reason: format!("risk gate: {}", breach),
                });
            }
        };

        // Sizing: position fraction of equity, floored to the instrument's
        // quantity precision.
        let notional = snapshot.equity * self.cfg.max_position_pct;
        let qty = round_down_qty(notional / signal.entry_price, qty_precision(&signal.symbol));
        if qty <= 0.0 || qty * signal.entry_price < self.min_notional {
            return Ok(ExecutionDecision::Rejected {
                code: RejectionCode::BelowMinNotional,
                reason: format!(
                    "sized notional {:.2} below broker minimum {:.2}",
                    qty * signal.entry_price,
                    self.min_notional
                ),
            });
        }

        let request = OrderRequest {
            client_order_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.action,
            qty,
            limit_price: Some(signal.entry_price),
            stop_price: signal.stop_price,
            target_price: signal.target_price,
        };

        let template = |order_id: String, qty: f64, status: OrderStatus, filled: bool| Order {
            order_id,
            executor_id: self.cfg.executor_id.clone(),
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.action,
            qty,
            price_reference: signal.entry_price,
            status,
            submitted_at: now,
            filled_at: filled.then_some(now),
        };

        let order = match self.broker.submit(&request).await {
            Ok(fill) => template(fill.order_id, fill.filled_qty, OrderStatus::Filled, true),
            Err(e) if e.is_fallback_eligible() && self.simulation_fallback => {
                warn!(
                    executor = %self.cfg.executor_id,
                    signal = %signal.signal_id,
                    error = %e,
                    "broker unavailable, simulating fill"
                );
                template(
                    format!("{}{}", SIM_ORDER_PREFIX, uuid::Uuid::new_v4().simple()),
                    qty,
                    OrderStatus::Simulated,
                    true,
                )
            }
            Err(BrokerError::Rejected(reason)) => {
                return Ok(ExecutionDecision::Rejected {
                    code: RejectionCode::BrokerRejected,
                    reason,
                });
            }
            Err(e) => {
                // Fallback disabled: record a PENDING order so the signal is
                // not lost and operators can see the stall.
                warn!(
                    executor = %self.cfg.executor_id,
                    signal = %signal.signal_id,
                    error = %e,
                    "broker failure with fallback disabled, order left pending"
                );
                let pending = template(
                    format!("pending-{}", uuid::Uuid::new_v4().simple()),
                    qty,
                    OrderStatus::Pending,
                    false,
                );
                let stored = self.store.record_order(&pending)?;
                return Ok(ExecutionDecision::Placed(stored));
            }
        };

        // Persist. A concurrent redelivery race resolves here: the unique
        // (executor_id, signal_id) index returns the first order.
        let stored = self.store.record_order(&order)?;
        if stored.order_id != order.order_id {
            return Ok(ExecutionDecision::Duplicate(stored));
        }

        self.apply_fill(signal, &stored)?;

        info!(
            executor = %self.cfg.executor_id,
            signal = %signal.signal_id,
            order = %stored.order_id,
            simulated = stored.is_simulated(),
            qty = stored.qty,
            "order recorded"
        );

        Ok(match stored.status {
            OrderStatus::Simulated => ExecutionDecision::Simulated(stored),
            _ => ExecutionDecision::Placed(stored),
        })
    }

    /// Position bookkeeping after a (real or simulated) fill.
    fn apply_fill(&self, signal: &Signal, order: &Order) -> anyhow::Result<()> {
        if order.status == OrderStatus::Pending {
            return Ok(());
        }
        let existing = self.store.get_position(&self.cfg.executor_id, &signal.symbol)?;
        let signed_qty = match order.side {
            Action::Buy => order.qty,
            Action::Sell => -order.qty,
        };

        match existing {
            None => {
                self.store.upsert_position(&Position {
                    symbol: signal.symbol.clone(),
                    executor_id: self.cfg.executor_id.clone(),
                    qty: signed_qty,
                    avg_cost: order.price_reference,
                    opened_at: order.submitted_at,
                    signal_id: signal.signal_id.clone(),
                    target_price: signal.target_price,
                    stop_price: signal.stop_price,
                })?;
            }
            Some(position) => {
                let new_qty = position.qty + signed_qty;
                if new_qty.abs() < 1e-9 {
                    // Flat: realize pnl against the held position.
                    let pnl_pct = realized_pnl_pct(&position, order.price_reference);
                    self.store.close_position(
                        &self.cfg.executor_id,
                        &signal.symbol,
                        &position.signal_id,
                        pnl_pct,
                        order.submitted_at,
                    )?;
                } else {
                    let avg_cost = if position.qty.signum() == new_qty.signum() {
                        (position.avg_cost * position.qty.abs()
                            + order.price_reference * signed_qty.abs())
                            / (position.qty.abs() + signed_qty.abs())
                    } else {
                        order.price_reference
                    };
                    self.store.upsert_position(&Position {
                        symbol: signal.symbol.clone(),
                        executor_id: self.cfg.executor_id.clone(),
                        qty: new_qty,
                        avg_cost,
                        opened_at: position.opened_at,
                        signal_id: signal.signal_id.clone(),
                        target_price: signal.target_price,
                        stop_price: signal.stop_price,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Queue consumer: the distributor feeds admitted signals in order.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Signal>) {
        while let Some(signal) = rx.recv().await {
            if let Err(e) = self.handle_signal(&signal).await {
                warn!(
                    executor = %self.cfg.executor_id,
                    signal = %signal.signal_id,
                    error = %e,
                    "signal handling failed"
                );
            }
        }
        info!(executor = %self.cfg.executor_id, "signal channel closed, executor stopping");
    }
}

/// Percentage pnl for a closed position, sign-aware for shorts.
pub(crate) fn realized_pnl_pct(position: &Position, exit_price: f64) -> f64 {
    if position.avg_cost <= 0.0 {
        return 0.0;
    }
    let raw = (exit_price - position.avg_cost) / position.avg_cost * 100.0;
    if position.qty >= 0.0 {
        raw
    } else {
        -raw
    }
}

fn qty_precision(symbol: &str) -> u32 {
    // Crypto pairs carry a quote suffix; equities trade whole shares.
    if symbol.contains('-') {
        6
    } else {
        0
    }
}

fn round_down_qty(qty: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (qty * factor).floor() / factor
}
