//! Outcome Reconciler
//! Mission: Close what finished, expire what never started
//!
//! A background loop per process (not per executor) that watches open
//! positions against current prices, realizes pnl when a protective level
//! is crossed, and writes the signal outcome back to the system-of-record.
//! Signals that never produced an order age into EXPIRED when the policy
//! flag says so.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::realized_pnl_pct;
use crate::adapters::PriceBook;
use crate::config::ReconcilerConfig;
use crate::models::{Position, SignalOutcome};
use crate::store::{ExecutionStore, SignalStore};

pub struct OutcomeReconciler {
    executor_ids: Vec<String>,
    exec_store: Arc<ExecutionStore>,
    signal_store: Arc<SignalStore>,
    price_book: Arc<PriceBook>,
    cfg: ReconcilerConfig,
}

impl OutcomeReconciler {
    pub fn new(
        executor_ids: Vec<String>,
        exec_store: Arc<ExecutionStore>,
        signal_store: Arc<SignalStore>,
        price_book: Arc<PriceBook>,
        cfg: ReconcilerConfig,
    ) -> Self {
        Self {
            executor_ids,
            exec_store,
            signal_store,
            price_book,
            cfg,
        }
    }

    /// One reconciliation pass; exposed for tests.
    pub fn tick(&self) {
        for executor_id in &self.executor_ids {
            if let Err(e) = self.reconcile_positions(executor_id) {
                warn!(executor = %executor_id, error = %e, "position reconciliation failed");
            }
        }
        if self.cfg.expire_unfilled {
            if let Err(e) = self.expire_orderless_signals() {
                warn!(error = %e, "signal expiry pass failed");
            }
        }
    }

    fn reconcile_positions(&self, executor_id: &str) -> anyhow::Result<()> {
        for position in self.exec_store.open_positions(executor_id)? {
            let Some(price) = self.price_book.closes(&position.symbol).last().copied() else {
                continue;
            };
            let Some(exit_price) = exit_level_crossed(&position, price) else {
                continue;
            };

            let pnl_pct = realized_pnl_pct(&position, exit_price);
            let outcome = if pnl_pct > 0.0 {
                SignalOutcome::Win
            } else {
                SignalOutcome::Loss
            };

            let closed_at = Utc::now();
            self.exec_store.close_position(
                executor_id,
                &position.symbol,
                &position.signal_id,
                pnl_pct,
                closed_at,
            )?;
            if !self
                .signal_store
                .update_outcome(&position.signal_id, outcome, Some(pnl_pct))?
            {
                warn!(
                    signal = %position.signal_id,
                    "outcome update found no signal row"
                );
            }
            info!(
                executor = %executor_id,
                symbol = %position.symbol,
                signal = %position.signal_id,
                pnl_pct = format!("{:.2}", pnl_pct),
                outcome = outcome.as_str(),
                "position closed"
            );
        }
        Ok(())
    }

    /// Policy decision: outcome-less signals past their TTL with no order in
    /// any executor are recorded EXPIRED, so policy rejections age out
    /// instead of staying outcome-less forever.
    fn expire_orderless_signals(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - Duration::seconds(self.cfg.signal_ttl_secs as i64);
        for signal in self.signal_store.unresolved_before(cutoff, 256)? {
            if !self.exec_store.orders_for_signal(&signal.signal_id)?.is_empty() {
                continue;
            }
            debug!(signal = %signal.signal_id, "expiring order-less signal");
            self.signal_store
                .update_outcome(&signal.signal_id, SignalOutcome::Expired, None)?;
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(std::time::Duration::from_secs(self.cfg.interval_secs.max(1)));
        loop {
            ticker.tick().await;
            self.tick();
        }
    }
}

/// The price level a position exits at, if any was crossed. Stops win over
/// targets when a single print crosses both.
fn exit_level_crossed(position: &Position, price: f64) -> Option<f64> {
    let long = position.qty >= 0.0;
    if let Some(stop) = position.stop_price {
        let stopped = if long { price <= stop } else { price >= stop };
        if stopped {
            return Some(stop);
        }
    }
    if let Some(target) = position.target_price {
        let hit = if long { price >= target } else { price <= target };
        if hit {
            return Some(target);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(qty: f64, target: Option<f64>, stop: Option<f64>) -> Position {
        Position {
            symbol: "AAPL".to_string(),
            executor_id: "standard".to_string(),
            qty,
            avg_cost: 100.0,
            opened_at: Utc::now(),
            signal_id: "sig".to_string(),
            target_price: target,
            stop_price: stop,
        }
    }

    #[test]
    fn long_exits_at_target_or_stop() {
        let p = position(10.0, Some(110.0), Some(95.0));
        assert_eq!(exit_level_crossed(&p, 105.0), None);
        assert_eq!(exit_level_crossed(&p, 110.5), Some(110.0));
        assert_eq!(exit_level_crossed(&p, 94.0), Some(95.0));
    }

    #[test]
    fn short_exits_mirror_long() {
        let p = position(-10.0, Some(90.0), Some(105.0));
        assert_eq!(exit_level_crossed(&p, 100.0), None);
        assert_eq!(exit_level_crossed(&p, 89.0), Some(90.0));
        assert_eq!(exit_level_crossed(&p, 106.0), Some(105.0));
    }

    #[test]
    fn stop_is_checked_before_target() {
        // Inverted bracket (stop above target on a long): the stop still
        // takes precedence at a crossing print.
        let p = position(10.0, Some(110.0), Some(109.0));
        assert_eq!(exit_level_crossed(&p, 108.0), Some(109.0));
    }
}
