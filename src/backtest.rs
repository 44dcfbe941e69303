//! Backtester
//! Mission: Replay the live consensus + risk + execution logic with research hygiene
//!
//! Per symbol the bar history splits 60/20/20 by time. The calibrator is
//! fitted on train+validation outcomes only; every reported metric comes
//! from the test segment. Replays are deterministic: bar timestamps drive
//! the clock, signal ids are sequence-derived, and the only randomness (the
//! Sharpe bootstrap) runs on a seeded generator. At bar t nothing after t
//! is visible to the synthetic adapters or consensus.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::sync::Arc;
use tracing::info;

use crate::adapters::{momentum_opinion, trend_opinion, PriceAnchor, TrendConfig};
use crate::config::{BacktestCostConfig, ConsensusSettings};
use crate::consensus::{
    CalibrationCurve, CalibratorHandle, ConsensusEngine, ConsensusOutcome, TrackWeights,
};
use crate::models::{
    Action, BacktestRun, BacktestStatus, Bar, SymbolSpec, TimeRange,
};
use crate::regime::{RegimeConfig, RegimeDetector};

const MIN_BARS: usize = 120;
const WARMUP_BARS: usize = 60;

/// Per-fill friction. Percent values (0.05 = 0.05%). Commission is quoted
/// per round trip so the documented total stays at ~0.17%:
/// slippage + 2 * half_spread + commission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostModel {
    pub slippage_pct: f64,
    pub half_spread_pct: f64,
    pub commission_pct: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            slippage_pct: 0.05,
            half_spread_pct: 0.01,
            commission_pct: 0.10,
        }
    }
}

impl CostModel {
    pub fn from_config(cfg: &BacktestCostConfig) -> Self {
        Self {
            slippage_pct: cfg.slippage_pct,
            half_spread_pct: cfg.half_spread_pct,
            commission_pct: cfg.commission_pct,
        }
    }

    pub fn round_trip_cost_pct(&self) -> f64 {
        self.slippage_pct + 2.0 * self.half_spread_pct + self.commission_pct
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityBucket {
    pub lo: f64,
    pub hi: f64,
    pub trades: usize,
    pub avg_confidence: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: DateTime<Utc>,
    pub equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub trades: usize,
    pub win_rate: f64,
    pub avg_return_pct: f64,
    pub sharpe: f64,
    /// Seeded-bootstrap 90% interval around the Sharpe estimate.
    pub sharpe_ci: (f64, f64),
    pub max_drawdown_pct: f64,
    pub profit_factor: f64,
    pub reliability: Vec<ReliabilityBucket>,
    pub equity_curve: Vec<EquityPoint>,
}

/// One simulated trade; the determinism law compares these tuples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub signal_id: String,
    pub entered_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    pub side: Action,
    pub entry_price: f64,
    pub exit_price: f64,
    pub raw_confidence: f64,
    pub reported_confidence: f64,
    pub return_pct: f64,
}

#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub run: BacktestRun,
    pub trades: Vec<TradeRecord>,
    pub calibrator: CalibrationCurve,
}

pub struct Backtester {
    consensus_settings: ConsensusSettings,
    weights: TrackWeights,
    trend_cfg: TrendConfig,
    regime_cfg: RegimeConfig,
    cost: CostModel,
    bootstrap_seed: u64,
    /// Bars a trade may stay open before a flat exit at the close.
    horizon_bars: usize,
}

impl Backtester {
    pub fn new(
        consensus_settings: ConsensusSettings,
        weights: TrackWeights,
        cost: CostModel,
        bootstrap_seed: u64,
    ) -> Self {
        Self {
            consensus_settings,
            weights,
            trend_cfg: TrendConfig::default(),
            regime_cfg: RegimeConfig {
                min_interval_secs: 0,
                ..RegimeConfig::default()
            },
            cost,
            bootstrap_seed,
            horizon_bars: 20,
        }
    }

    pub fn run(&self, symbol: &SymbolSpec, bars: &[Bar], run_id: &str) -> Result<BacktestReport> {
        if bars.len() < MIN_BARS {
            bail!(
                "{}: need at least {} bars, got {}",
                symbol.symbol,
                MIN_BARS,
                bars.len()
            );
        }
        if bars.windows(2).any(|w| w[0].ts >= w[1].ts) {
            bail!("{}: bars must be strictly time-ordered", symbol.symbol);
        }

        let n = bars.len();
        let train_end = n * 60 / 100;
        let val_end = n * 80 / 100;

        let ranges = (
            TimeRange { start: bars[0].ts, end: bars[train_end - 1].ts },
            TimeRange { start: bars[train_end].ts, end: bars[val_end - 1].ts },
            TimeRange { start: bars[val_end].ts, end: bars[n - 1].ts },
        );

        // Phase A: fit the calibrator on train+validation outcomes only.
        let fit_trades = self.replay(
            symbol,
            bars,
            WARMUP_BARS,
            val_end,
            &CalibratorHandle::identity(),
        );
        let pairs: Vec<(f64, bool)> = fit_trades
            .iter()
            .map(|t| (t.raw_confidence, t.return_pct > 0.0))
            .collect();
        let calibrator = CalibrationCurve::fit(&pairs, bars[val_end - 1].ts, "cal-v1");

        // Phase B: report only from the test segment.
        let fitted = CalibratorHandle::with_curve(calibrator.clone());
        let trades = self.replay(symbol, bars, val_end, n, &fitted);

        let metrics = self.metrics(&trades, bars[val_end].ts);
        info!(
            symbol = %symbol.symbol,
            fit_trades = fit_trades.len(),
            test_trades = trades.len(),
            win_rate = format!("{:.2}", metrics.win_rate),
            sharpe = format!("{:.2}", metrics.sharpe),
            "backtest complete"
        );

        Ok(BacktestReport {
            run: BacktestRun {
                run_id: run_id.to_string(),
                symbol: symbol.symbol.clone(),
                train_range: ranges.0,
                val_range: ranges.1,
                test_range: ranges.2,
                cost_model: self.cost,
                status: BacktestStatus::Complete,
                metrics: Some(metrics),
            },
            trades,
            calibrator,
        })
    }

    /// Replay consensus over `bars[start..end)`. At bar i only data up to
    /// and including i is visible; fills happen on bar i+1's open.
    fn replay(
        &self,
        symbol: &SymbolSpec,
        bars: &[Bar],
        start: usize,
        end: usize,
        calibrator: &CalibratorHandle,
    ) -> Vec<TradeRecord> {
        let engine = ConsensusEngine::new(
            self.consensus_settings.clone(),
            self.weights.clone(),
            Arc::new(CalibratorHandle::with_curve((*calibrator.current()).clone())),
        );
        let regime = RegimeDetector::new(self.regime_cfg.clone());

        let mut trades = Vec::new();
        let mut open: Option<OpenTrade> = None;
        let mut seq = 0u32;

        for i in start.max(WARMUP_BARS)..end {
            let visible = &bars[..=i];
            let bar = bars[i];
            let closes: Vec<f64> = visible.iter().map(|b| b.close).collect();

            // Manage the open trade first (exits fill before entries).
            if let Some(trade) = open.take() {
                match self.try_exit(&trade, &bar, i) {
                    Some(done) => trades.push(done),
                    None => open = Some(trade),
                }
            }

            if open.is_some() || i + 1 >= end {
                continue;
            }

            let current_regime = regime.observe(&symbol.symbol, &closes, bar.ts);
            let opinions = vec![
                trend_opinion("trend", &symbol.symbol, &closes, &self.trend_cfg, bar.ts),
                synthetic_vendor_opinion(&symbol.symbol, visible, bar.ts),
            ];
            let anchor = Some(PriceAnchor {
                price: bar.close,
                as_of: bar.ts,
                volatility: trailing_vol(&closes, 20),
            });

            let ConsensusOutcome::Emit(draft) =
                engine.evaluate(symbol, &opinions, current_regime, anchor, bar.ts)
            else {
                continue;
            };

            seq += 1;
            let signal_id = format!("bt-{:010}-{:04}", bar.ts.timestamp(), seq);
            let next_open = bars[i + 1].open;
            let entry_price = self.adverse_entry(next_open, draft.action);

            open = Some(OpenTrade {
                signal_id,
                side: draft.action,
                entry_price,
                entered_at: bars[i + 1].ts,
                entry_bar: i + 1,
                target: draft.target_price,
                stop: draft.stop_price,
                raw_confidence: draft.raw_confidence,
                reported_confidence: draft.calibrated_confidence,
            });
        }

        // Flat exit for anything still open at the segment boundary.
        if let Some(trade) = open {
            if let Some(last) = bars.get(end.saturating_sub(1)) {
                trades.push(self.close(&trade, last.close, last.ts));
            }
        }

        trades
    }

    fn try_exit(&self, trade: &OpenTrade, bar: &Bar, bar_idx: usize) -> Option<TradeRecord> {
        if bar_idx <= trade.entry_bar {
            return None;
        }
        let long = trade.side == Action::Buy;

        if let Some(stop) = trade.stop {
            let stopped = if long { bar.low <= stop } else { bar.high >= stop };
            if stopped {
                return Some(self.close(trade, stop, bar.ts));
            }
        }
        if let Some(target) = trade.target {
            let hit = if long { bar.high >= target } else { bar.low <= target };
            if hit {
                return Some(self.close(trade, target, bar.ts));
            }
        }
        if bar_idx - trade.entry_bar >= self.horizon_bars {
            return Some(self.close(trade, bar.close, bar.ts));
        }
        None
    }

    fn close(&self, trade: &OpenTrade, exit_price: f64, exited_at: DateTime<Utc>) -> TradeRecord {
        let raw = match trade.side {
            Action::Buy => (exit_price - trade.entry_price) / trade.entry_price,
            Action::Sell => (trade.entry_price - exit_price) / trade.entry_price,
        } * 100.0;
        // Entry slippage is already in entry_price; exit side pays the
        // remaining spread + commission here.
        let return_pct = raw - (self.cost.half_spread_pct + self.cost.commission_pct);

        TradeRecord {
            signal_id: trade.signal_id.clone(),
            entered_at: trade.entered_at,
            exited_at,
            side: trade.side,
            entry_price: trade.entry_price,
            exit_price,
            raw_confidence: trade.raw_confidence,
            reported_confidence: trade.reported_confidence,
            return_pct,
        }
    }

    fn adverse_entry(&self, open_price: f64, side: Action) -> f64 {
        let friction = (self.cost.slippage_pct + self.cost.half_spread_pct) / 100.0;
        match side {
            Action::Buy => open_price * (1.0 + friction),
            Action::Sell => open_price * (1.0 - friction),
        }
    }

    fn metrics(&self, trades: &[TradeRecord], start_ts: DateTime<Utc>) -> BacktestMetrics {
        let returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
        let wins = returns.iter().filter(|r| **r > 0.0).count();

        let mut equity = 100.0;
        let mut peak = equity;
        let mut max_dd = 0.0f64;
        let mut equity_curve = vec![EquityPoint { ts: start_ts, equity }];
        for trade in trades {
            equity *= 1.0 + trade.return_pct / 100.0;
            peak = peak.max(equity);
            if peak > 0.0 {
                max_dd = max_dd.max((peak - equity) / peak);
            }
            equity_curve.push(EquityPoint { ts: trade.exited_at, equity });
        }

        let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
        let gross_loss: f64 = -returns.iter().filter(|r| **r < 0.0).sum::<f64>();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let (sharpe, sharpe_ci) = if returns.len() >= 2 {
            let sharpe = sharpe_ratio(&returns);
            (sharpe, bootstrap_sharpe_ci(&returns, self.bootstrap_seed))
        } else {
            (0.0, (0.0, 0.0))
        };

        BacktestMetrics {
            trades: trades.len(),
            win_rate: if trades.is_empty() { 0.0 } else { wins as f64 / trades.len() as f64 },
            avg_return_pct: if returns.is_empty() { 0.0 } else { Statistics::mean(&returns) },
            sharpe,
            sharpe_ci,
            max_drawdown_pct: max_dd,
            profit_factor,
            reliability: reliability_buckets(trades),
            equity_curve,
        }
    }

    /// Parallel multi-symbol sweep; each symbol's replay is independent.
    pub fn run_all(
        &self,
        jobs: &[(SymbolSpec, Vec<Bar>)],
        run_prefix: &str,
    ) -> Vec<Result<BacktestReport>> {
        jobs.par_iter()
            .enumerate()
            .map(|(i, (symbol, bars))| {
                self.run(symbol, bars, &format!("{}-{}", run_prefix, i))
            })
            .collect()
    }
}

struct OpenTrade {
    signal_id: String,
    side: Action,
    entry_price: f64,
    entered_at: DateTime<Utc>,
    entry_bar: usize,
    target: Option<f64>,
    stop: Option<f64>,
    raw_confidence: f64,
    reported_confidence: f64,
}

fn trailing_vol(closes: &[f64], window: usize) -> f64 {
    if closes.len() < 3 {
        return 0.005;
    }
    let tail = &closes[closes.len().saturating_sub(window + 1)..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return 0.005;
    }
    Statistics::std_dev(&returns).max(1e-4)
}

/// Synthetic vendor feed: the live momentum mapping over the bar-to-bar
/// session change, so replays exercise the production coercion rules.
fn synthetic_vendor_opinion(symbol: &str, visible: &[Bar], ts: DateTime<Utc>) -> crate::models::SourceOpinion {
    let last = visible[visible.len() - 1];
    let prev_close = if visible.len() >= 2 {
        visible[visible.len() - 2].close
    } else {
        last.open
    };
    let change_pct = if prev_close > 0.0 {
        (last.close - prev_close) / prev_close * 100.0
    } else {
        0.0
    };
    momentum_opinion("quote_vendor", symbol, last.close, change_pct, 0.60, 0.05, ts)
}

fn sharpe_ratio(returns: &[f64]) -> f64 {
    let mean = Statistics::mean(returns);
    let std = Statistics::std_dev(returns);
    if std <= 0.0 {
        return 0.0;
    }
    mean / std * (252.0f64).sqrt()
}

/// 90% bootstrap interval, deterministic under a fixed seed.
fn bootstrap_sharpe_ci(returns: &[f64], seed: u64) -> (f64, f64) {
    const RESAMPLES: usize = 200;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut samples = Vec::with_capacity(RESAMPLES);
    for _ in 0..RESAMPLES {
        let resample: Vec<f64> = (0..returns.len())
            .map(|_| returns[rng.gen_range(0..returns.len())])
            .collect();
        samples.push(sharpe_ratio(&resample));
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let lo = samples[(RESAMPLES as f64 * 0.05) as usize];
    let hi = samples[(RESAMPLES as f64 * 0.95) as usize];
    (lo, hi)
}

fn reliability_buckets(trades: &[TradeRecord]) -> Vec<ReliabilityBucket> {
    const BUCKETS: usize = 10;
    let step = 1.0 / BUCKETS as f64;
    (0..BUCKETS)
        .map(|i| {
            let lo = i as f64 * step;
            let hi = if i == BUCKETS - 1 { 1.0 + f64::EPSILON } else { lo + step };
            let in_bucket: Vec<&TradeRecord> = trades
                .iter()
                .filter(|t| t.reported_confidence >= lo && t.reported_confidence < hi)
                .collect();
            let wins = in_bucket.iter().filter(|t| t.return_pct > 0.0).count();
            ReliabilityBucket {
                lo,
                hi: hi.min(1.0),
                trades: in_bucket.len(),
                avg_confidence: if in_bucket.is_empty() {
                    0.0
                } else {
                    in_bucket.iter().map(|t| t.reported_confidence).sum::<f64>()
                        / in_bucket.len() as f64
                },
                win_rate: if in_bucket.is_empty() {
                    0.0
                } else {
                    wins as f64 / in_bucket.len() as f64
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetClass;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    fn bars(n: usize) -> Vec<Bar> {
        // Deterministic wavy trend: enough structure to emit signals in
        // both directions without any RNG.
        let t0 = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let x = i as f64;
                let price = 100.0 + x * 0.05 + (x / 7.0).sin() * 4.0 + (x / 23.0).cos() * 2.0;
                Bar {
                    ts: t0 + Duration::hours(i as i64),
                    open: price,
                    high: price * 1.01,
                    low: price * 0.99,
                    close: price * (1.0 + ((x / 5.0).sin()) * 0.004),
                    volume: 1_000.0 + x,
                }
            })
            .collect()
    }

    fn backtester() -> Backtester {
        let mut weights = HashMap::new();
        weights.insert("trend".to_string(), 0.55);
        weights.insert("quote_vendor".to_string(), 0.45);
        Backtester::new(
            ConsensusSettings::default(),
            TrackWeights {
                stock: weights.clone(),
                crypto: weights,
            },
            CostModel::default(),
            7,
        )
    }

    #[test]
    fn rejects_short_or_unordered_history() {
        let bt = backtester();
        let symbol = SymbolSpec::new("AAPL", AssetClass::Stock);
        assert!(bt.run(&symbol, &bars(50), "run").is_err());

        let mut shuffled = bars(200);
        shuffled.swap(10, 11);
        assert!(bt.run(&symbol, &shuffled, "run").is_err());
    }

    #[test]
    fn split_is_60_20_20_by_time() {
        let bt = backtester();
        let symbol = SymbolSpec::new("AAPL", AssetClass::Stock);
        let data = bars(500);
        let report = bt.run(&symbol, &data, "run").unwrap();

        let run = &report.run;
        assert_eq!(run.train_range.start, data[0].ts);
        assert_eq!(run.train_range.end, data[299].ts);
        assert_eq!(run.val_range.end, data[399].ts);
        assert_eq!(run.test_range.end, data[499].ts);
        assert_eq!(run.status, BacktestStatus::Complete);
    }

    #[test]
    fn replay_is_deterministic() {
        let bt = backtester();
        let symbol = SymbolSpec::new("BTC-USD", AssetClass::Crypto);
        let data = bars(600);

        let a = bt.run(&symbol, &data, "run-a").unwrap();
        let b = bt.run(&symbol, &data, "run-b").unwrap();
        assert_eq!(a.trades, b.trades);

        let ma = a.run.metrics.unwrap();
        let mb = b.run.metrics.unwrap();
        assert_eq!(ma.sharpe, mb.sharpe);
        assert_eq!(ma.sharpe_ci, mb.sharpe_ci);
        assert_eq!(ma.win_rate, mb.win_rate);
    }

    #[test]
    fn trades_only_come_from_the_test_segment() {
        let bt = backtester();
        let symbol = SymbolSpec::new("AAPL", AssetClass::Stock);
        let data = bars(500);
        let report = bt.run(&symbol, &data, "run").unwrap();

        let test_start = report.run.test_range.start;
        for trade in &report.trades {
            assert!(trade.entered_at >= test_start);
        }
    }

    #[test]
    fn round_trip_cost_matches_documented_total() {
        let cost = CostModel::default();
        assert!((cost.round_trip_cost_pct() - 0.17).abs() < 1e-12);
    }

    #[test]
    fn bootstrap_is_seed_stable() {
        let returns: Vec<f64> = (0..50).map(|i| ((i % 7) as f64 - 3.0) * 0.4).collect();
        assert_eq!(bootstrap_sharpe_ci(&returns, 7), bootstrap_sharpe_ci(&returns, 7));
        assert_ne!(bootstrap_sharpe_ci(&returns, 7), bootstrap_sharpe_ci(&returns, 8));
    }
}
