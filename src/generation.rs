//! Signal Generation Service
//! Mission: Produce, never execute
//!
//! One independent serialized cycle per watched symbol: market-hours gate,
//! adapter fan-out joined under a hard deadline, consensus, persistence.
//! Cycle N+1 cannot start before cycle N has decided, so generation
//! timestamps stay ordered per symbol. Late adapter results are discarded
//! with their tasks; the next cycle is never blocked on an orphan.

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapters::{PriceBook, SourceAdapter};
use crate::consensus::{live_signal_id, ConsensusEngine, ConsensusOutcome};
use crate::models::{market_eligible, SourceOpinion, SymbolSpec};
use crate::regime::RegimeDetector;
use crate::store::SignalStore;

pub struct SignalGenerationService {
    symbols: Vec<SymbolSpec>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    consensus: Arc<ConsensusEngine>,
    regime: Arc<RegimeDetector>,
    price_book: Arc<PriceBook>,
    store: Arc<SignalStore>,
    cadence: Duration,
    cycle_deadline: Duration,
    force_24_7: bool,
}

impl SignalGenerationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbols: Vec<SymbolSpec>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        consensus: Arc<ConsensusEngine>,
        regime: Arc<RegimeDetector>,
        price_book: Arc<PriceBook>,
        store: Arc<SignalStore>,
        cadence: Duration,
        cycle_deadline: Duration,
        force_24_7: bool,
    ) -> Self {
        Self {
            symbols,
            adapters,
            consensus,
            regime,
            price_book,
            store,
            cadence,
            cycle_deadline,
            force_24_7,
        }
    }

    /// Spawn one serialized loop per symbol.
    pub fn spawn_all(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.symbols
            .iter()
            .cloned()
            .map(|spec| {
                let service = self.clone();
                tokio::spawn(async move {
                    service.run_symbol(spec).await;
                })
            })
            .collect()
    }

    async fn run_symbol(self: Arc<Self>, spec: SymbolSpec) {
        info!(symbol = %spec.symbol, class = spec.class.as_str(), "generation loop started");
        let mut ticker = interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.cycle(&spec).await;
        }
    }

    /// One complete generation cycle. Public for the integration harness.
    pub async fn cycle(&self, spec: &SymbolSpec) {
        let now = Utc::now();
        if !market_eligible(spec.class, now, self.force_24_7) {
            return;
        }

        let opinions = self.gather_opinions(spec).await;
        if opinions.is_empty() {
            return;
        }

        let now = Utc::now();
        let closes = self.price_book.closes(&spec.symbol);
        let regime = self.regime.observe(&spec.symbol, &closes, now);
        let anchor = self.price_book.anchor(&spec.symbol, now);

        match self
            .consensus
            .evaluate(spec, &opinions, regime, anchor, now)
        {
            ConsensusOutcome::Emit(draft) => {
                let signal = draft.into_signal(live_signal_id(now));
                match self.store.put(&signal) {
                    Ok(signal_id) => {
                        info!(
                            symbol = %spec.symbol,
                            signal = %signal_id,
                            action = signal.action.as_str(),
                            confidence = format!("{:.3}", signal.confidence),
                            regime = signal.regime.kind.as_str(),
                            "signal emitted"
                        );
                    }
                    Err(e) => {
                        error!(symbol = %spec.symbol, error = %e, "signal persistence failed");
                    }
                }
            }
            ConsensusOutcome::NoSignal(reason) => {
                debug!(symbol = %spec.symbol, reason = ?reason, "no signal this cycle");
            }
        }
    }

    /// Fan out every adapter with its own timeout, join under the cycle
    /// deadline. An adapter that misses either bound contributes an
    /// UNAVAILABLE opinion; permanent failures degrade the adapter but do
    /// not abort the cycle.
    async fn gather_opinions(&self, spec: &SymbolSpec) -> Vec<SourceOpinion> {
        let now = Utc::now();
        let tasks: Vec<JoinHandle<SourceOpinion>> = self
            .adapters
            .iter()
            .map(|adapter| {
                let adapter = adapter.clone();
                let spec = spec.clone();
                tokio::spawn(async move {
                    let source_id = adapter.source_id().to_string();
                    match timeout(adapter.timeout(), adapter.opinion(&spec, now)).await {
                        Ok(Ok(opinion)) => opinion,
                        Ok(Err(e)) => {
                            warn!(source = %source_id, symbol = %spec.symbol, error = %e,
                                  "adapter degraded");
                            SourceOpinion::unavailable(&source_id, &spec.symbol, now)
                        }
                        Err(_) => {
                            debug!(source = %source_id, symbol = %spec.symbol, "adapter timeout");
                            SourceOpinion::unavailable(&source_id, &spec.symbol, now)
                        }
                    }
                })
            })
            .collect();

        match timeout(self.cycle_deadline, join_all(tasks)).await {
            Ok(results) => results.into_iter().filter_map(|r| r.ok()).collect(),
            Err(_) => {
                // Deadline breach: drop whatever is still outstanding. The
                // per-adapter timeouts bound the orphans' lifetime.
                warn!(symbol = %spec.symbol, "generation cycle deadline exceeded");
                Vec::new()
            }
        }
    }
}
