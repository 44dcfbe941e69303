//! Signal Distributor
//! Mission: At-least-once, per-executor-ordered fan-out with backpressure
//!
//! Tails the store's ordered stream from each executor's persisted cursor.
//! Admission filters (confidence floor, pause flag, symbol allow-list) are
//! evaluated per executor; filtered signals advance the cursor, a full
//! queue does not; that executor simply stops advancing while the others
//! continue. Redelivery after a crash is harmless because executors dedup
//! on signal_id.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::models::Signal;
use crate::risk::PauseFlag;
use crate::store::{ExecutionStore, SignalStore};

const BATCH_LIMIT: usize = 64;

/// Delivery target: one bounded queue per executor.
pub struct ExecutorEndpoint {
    pub executor_id: String,
    pub min_confidence: f64,
    /// Empty = every symbol permitted.
    pub symbols: Vec<String>,
    pub pause: Arc<PauseFlag>,
    pub tx: mpsc::Sender<Signal>,
}

impl ExecutorEndpoint {
    fn admits(&self, signal: &Signal) -> bool {
        if signal.confidence < self.min_confidence {
            return false;
        }
        if self.pause.is_paused() {
            return false;
        }
        self.symbols.is_empty() || self.symbols.iter().any(|s| *s == signal.symbol)
    }
}

pub struct SignalDistributor {
    store: Arc<SignalStore>,
    exec_store: Arc<ExecutionStore>,
    endpoints: Vec<ExecutorEndpoint>,
    poll_interval: Duration,
}

impl SignalDistributor {
    pub fn new(
        store: Arc<SignalStore>,
        exec_store: Arc<ExecutionStore>,
        endpoints: Vec<ExecutorEndpoint>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            exec_store,
            endpoints,
            poll_interval,
        }
    }

    /// One distribution pass; returns signals enqueued across executors.
    /// Exposed for tests and for the integration harness.
    pub fn tick(&self) -> anyhow::Result<usize> {
        let mut delivered = 0;
        for endpoint in &self.endpoints {
            delivered += self.drain_endpoint(endpoint)?;
        }
        Ok(delivered)
    }

    fn drain_endpoint(&self, endpoint: &ExecutorEndpoint) -> anyhow::Result<usize> {
        let mut delivered = 0;
        let mut cursor = self.exec_store.get_cursor(&endpoint.executor_id)?;

        loop {
            let batch = self.store.get_since(cursor.as_deref(), BATCH_LIMIT)?;
            if batch.is_empty() {
                break;
            }

            let mut advanced_to: Option<String> = None;
            let mut blocked = false;

            for signal in batch {
                if !endpoint.admits(&signal) {
                    // A filtered signal is a decision, not a deferral.
                    advanced_to = Some(signal.signal_id);
                    continue;
                }
                let signal_id = signal.signal_id.clone();
                match endpoint.tx.try_send(signal) {
                    Ok(()) => {
                        delivered += 1;
                        advanced_to = Some(signal_id);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Backpressure: hold this executor's cursor; the
                        // others keep flowing.
                        debug!(executor = %endpoint.executor_id, "queue full, holding cursor");
                        blocked = true;
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(executor = %endpoint.executor_id, "queue closed, holding cursor");
                        blocked = true;
                        break;
                    }
                }
            }

            if let Some(new_cursor) = advanced_to {
                self.exec_store.set_cursor(&endpoint.executor_id, &new_cursor)?;
                cursor = Some(new_cursor);
            }
            if blocked {
                break;
            }
        }
        Ok(delivered)
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick() {
                warn!(error = %e, "distribution pass failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::models::{Action, CalibrationTag, Regime, Signal};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tempfile::TempDir;

    fn stores() -> (TempDir, Arc<SignalStore>, Arc<ExecutionStore>) {
        let dir = TempDir::new().unwrap();
        let signals =
            Arc::new(SignalStore::new(dir.path().join("signals.db").to_str().unwrap()).unwrap());
        let exec =
            Arc::new(ExecutionStore::new(dir.path().join("exec.db").to_str().unwrap()).unwrap());
        (dir, signals, exec)
    }

    fn signal(idx: u32, symbol: &str, confidence: f64) -> Signal {
        let generated_at = Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap()
            + ChronoDuration::seconds(idx as i64);
        let mut signal = Signal {
            signal_id: format!("{:016x}-{:08}", generated_at.timestamp_micros(), idx),
            symbol: symbol.to_string(),
            action: Action::Buy,
            confidence,
            entry_price: 100.0,
            target_price: None,
            stop_price: None,
            regime: Regime::cold_start(generated_at),
            strategy_version: "consensus-v1".to_string(),
            generated_at,
            contributing_sources: Vec::new(),
            fingerprint: String::new(),
            calibration: CalibrationTag::Raw,
            outcome: None,
            pnl_pct: None,
            order_refs: Vec::new(),
        };
        signal.fingerprint = fingerprint::compute(&signal);
        signal
    }

    fn endpoint(
        executor_id: &str,
        min_confidence: f64,
        capacity: usize,
    ) -> (ExecutorEndpoint, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            ExecutorEndpoint {
                executor_id: executor_id.to_string(),
                min_confidence,
                symbols: Vec::new(),
                pause: Arc::new(PauseFlag::new(false, false)),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn confidence_filter_advances_cursor() {
        let (_dir, signals, exec) = stores();
        signals.put(&signal(1, "AAPL", 0.70)).unwrap();
        signals.put(&signal(2, "AAPL", 0.90)).unwrap();

        let (ep, mut rx) = endpoint("standard", 0.75, 8);
        let distributor =
            SignalDistributor::new(signals, exec.clone(), vec![ep], Duration::from_millis(10));

        let delivered = distributor.tick().unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.try_recv().unwrap().confidence, 0.90);
        // Cursor moved past both rows, including the filtered one.
        let cursor = exec.get_cursor("standard").unwrap().unwrap();
        assert!(distributor.store.get_since(Some(&cursor), 10).unwrap().is_empty());
    }

    #[test]
    fn backpressure_holds_cursor_per_executor() {
        let (_dir, signals, exec) = stores();
        for i in 1..=3 {
            signals.put(&signal(i, "AAPL", 0.9)).unwrap();
        }

        let (slow, mut slow_rx) = endpoint("standard", 0.5, 1);
        let (fast, mut fast_rx) = endpoint("prop_firm", 0.5, 8);
        let distributor = SignalDistributor::new(
            signals,
            exec.clone(),
            vec![slow, fast],
            Duration::from_millis(10),
        );

        distributor.tick().unwrap();

        // Fast executor saw everything, slow executor only one.
        let mut fast_count = 0;
        while fast_rx.try_recv().is_ok() {
            fast_count += 1;
        }
        assert_eq!(fast_count, 3);
        assert!(slow_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_err());

        // Slow cursor held back at the first signal.
        let slow_cursor = exec.get_cursor("standard").unwrap().unwrap();
        let fast_cursor = exec.get_cursor("prop_firm").unwrap().unwrap();
        assert!(slow_cursor < fast_cursor);

        // Draining the queue lets the next pass resume in order.
        let second = distributor.tick().unwrap();
        assert_eq!(second, 1);
    }

    #[test]
    fn paused_executor_admits_nothing() {
        let (_dir, signals, exec) = stores();
        signals.put(&signal(1, "AAPL", 0.9)).unwrap();

        let (mut ep, mut rx) = endpoint("standard", 0.5, 8);
        ep.pause = Arc::new(PauseFlag::new(true, false));
        let distributor =
            SignalDistributor::new(signals, exec, vec![ep], Duration::from_millis(10));

        assert_eq!(distributor.tick().unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn symbol_allowlist_enforced() {
        let (_dir, signals, exec) = stores();
        signals.put(&signal(1, "AAPL", 0.9)).unwrap();
        signals.put(&signal(2, "BTC-USD", 0.9)).unwrap();

        let (mut ep, mut rx) = endpoint("standard", 0.5, 8);
        ep.symbols = vec!["BTC-USD".to_string()];
        let distributor =
            SignalDistributor::new(signals, exec, vec![ep], Duration::from_millis(10));

        assert_eq!(distributor.tick().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().symbol, "BTC-USD");
    }
}
