//! Market Regime Detector
//!
//! Classifies each watched symbol into one of four regimes from a rolling
//! window of closes. Evaluation hierarchy (first match wins):
//!
//!   1. CRISIS : realized volatility above the hard threshold, or a
//!      drawdown spike inside the window.
//!   2. BULL   : close above the slow moving average with a sustained
//!      positive trend.
//!   3. BEAR   : mirror of BULL.
//!   4. CHOP   : range-bound, low realized volatility. Also the cold-start
//!      state.
//!
//! Non-crisis transitions require `confirm_bars` consecutive qualifying
//! evaluations; CRISIS bypasses the debounce. Re-classification runs at
//! most once per `min_interval` per symbol.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::models::{Regime, RegimeKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// Slow moving-average length in bars.
    pub slow_ma: usize,
    /// Bars inspected for trend persistence.
    pub trend_window: usize,
    /// Consecutive qualifying evaluations before a non-crisis switch.
    pub confirm_bars: usize,
    /// Realized-volatility (per-bar return stdev) crisis threshold.
    pub crisis_vol: f64,
    /// Peak-to-trough drawdown inside the window that forces CRISIS.
    pub crisis_drawdown: f64,
    /// Volatility below which a trendless market reads as CHOP.
    pub chop_vol: f64,
    /// Minimum seconds between re-classifications per symbol.
    pub min_interval_secs: i64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            slow_ma: 50,
            trend_window: 10,
            confirm_bars: 3,
            crisis_vol: 0.04,
            crisis_drawdown: 0.12,
            chop_vol: 0.01,
            min_interval_secs: 60,
        }
    }
}

struct SymbolState {
    current: Regime,
    candidate: RegimeKind,
    candidate_streak: usize,
    last_eval: DateTime<Utc>,
}

/// Thread-safe detector caching the latest regime per symbol.
pub struct RegimeDetector {
    cfg: RegimeConfig,
    states: RwLock<HashMap<String, SymbolState>>,
}

impl RegimeDetector {
    pub fn new(cfg: RegimeConfig) -> Self {
        Self {
            cfg,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Latest cached regime; CHOP with zero strength before any evaluation.
    pub fn current(&self, symbol: &str) -> Regime {
        self.states
            .read()
            .get(symbol)
            .map(|s| s.current)
            .unwrap_or_else(|| Regime::cold_start(Utc::now()))
    }

    /// Feed the rolling closes for one symbol. Returns the effective regime
    /// after debounce; a no-op when called inside the minimum interval.
    pub fn observe(&self, symbol: &str, closes: &[f64], now: DateTime<Utc>) -> Regime {
        let mut states = self.states.write();
        let state = states.entry(symbol.to_string()).or_insert_with(|| SymbolState {
            current: Regime::cold_start(now),
            candidate: RegimeKind::Chop,
            candidate_streak: 0,
            last_eval: now - Duration::seconds(self.cfg.min_interval_secs + 1),
        });

        if now - state.last_eval < Duration::seconds(self.cfg.min_interval_secs) {
            return state.current;
        }
        state.last_eval = now;

        let Some((kind, strength)) = classify(&self.cfg, closes) else {
            return state.current;
        };

        if kind == RegimeKind::Crisis {
            // Crisis is never debounced.
            if state.current.kind != RegimeKind::Crisis {
                debug!(symbol, strength = format!("{:.2}", strength), "regime -> CRISIS");
            }
            state.candidate = kind;
            state.candidate_streak = self.cfg.confirm_bars;
            state.current = Regime {
                kind,
                strength,
                classified_at: now,
            };
            return state.current;
        }

        if kind == state.candidate {
            state.candidate_streak += 1;
        } else {
            state.candidate = kind;
            state.candidate_streak = 1;
        }

        if kind == state.current.kind {
            // Same regime; refresh strength and timestamp.
            state.current = Regime {
                kind,
                strength,
                classified_at: now,
            };
        } else if state.candidate_streak >= self.cfg.confirm_bars {
            debug!(
                symbol,
                from = state.current.kind.as_str(),
                to = kind.as_str(),
                streak = state.candidate_streak,
                "regime transition confirmed"
            );
            state.current = Regime {
                kind,
                strength,
                classified_at: now,
            };
        }

        state.current
    }
}

/// Pure classification over a window of closes. None when the window is too
/// short for the slow MA.
fn classify(cfg: &RegimeConfig, closes: &[f64]) -> Option<(RegimeKind, f64)> {
    if closes.len() < cfg.slow_ma || closes.len() < 2 {
        return None;
    }

    let last = *closes.last()?;
    let ma_window = &closes[closes.len() - cfg.slow_ma..];
    let slow_ma = ma_window.iter().sum::<f64>() / cfg.slow_ma as f64;
    if slow_ma <= 0.0 || last <= 0.0 {
        return None;
    }

    let vol = realized_vol(closes, cfg.trend_window.max(2));
    let dd = window_drawdown(ma_window);

    if vol >= cfg.crisis_vol || dd >= cfg.crisis_drawdown {
        let strength = ((vol / cfg.crisis_vol).max(dd / cfg.crisis_drawdown)).min(2.0) / 2.0;
        return Some((RegimeKind::Crisis, strength.clamp(0.0, 1.0)));
    }

    let trend_bars = cfg.trend_window.min(closes.len());
    let recent = &closes[closes.len() - trend_bars..];
    let above = recent.iter().filter(|c| **c > slow_ma).count();
    let below = trend_bars - above;
    let deviation = (last - slow_ma) / slow_ma;

    if above == trend_bars && deviation > 0.0 {
        let strength = (deviation / 0.05).clamp(0.0, 1.0);
        return Some((RegimeKind::Bull, strength));
    }
    if below == trend_bars && deviation < 0.0 {
        let strength = (-deviation / 0.05).clamp(0.0, 1.0);
        return Some((RegimeKind::Bear, strength));
    }

    let strength = if vol <= cfg.chop_vol {
        1.0 - (vol / cfg.chop_vol).clamp(0.0, 1.0) * 0.5
    } else {
        0.3
    };
    Some((RegimeKind::Chop, strength))
}

/// Stdev of simple per-bar returns over the trailing window.
fn realized_vol(closes: &[f64], window: usize) -> f64 {
    let n = window.min(closes.len().saturating_sub(1));
    if n < 2 {
        return 0.0;
    }
    let tail = &closes[closes.len() - n - 1..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    var.sqrt()
}

fn window_drawdown(closes: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0f64;
    for &c in closes {
        if c > peak {
            peak = c;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - c) / peak);
        }
    }
    max_dd
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn detector() -> RegimeDetector {
        RegimeDetector::new(RegimeConfig {
            slow_ma: 10,
            trend_window: 5,
            confirm_bars: 2,
            min_interval_secs: 0,
            ..RegimeConfig::default()
        })
    }

    fn ts(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset)
    }

    #[test]
    fn cold_start_is_chop() {
        let d = detector();
        assert_eq!(d.current("AAPL").kind, RegimeKind::Chop);
    }

    #[test]
    fn sustained_uptrend_confirms_bull_after_debounce() {
        let d = detector();
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.4).collect();

        // First qualifying evaluation must not switch yet.
        let first = d.observe("AAPL", &closes, ts(0));
        assert_eq!(first.kind, RegimeKind::Chop);

        let second = d.observe("AAPL", &closes, ts(60));
        assert_eq!(second.kind, RegimeKind::Bull);
        assert!(second.strength > 0.0);
    }

    #[test]
    fn crisis_bypasses_debounce() {
        let d = detector();
        let mut closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.1).collect();
        closes.extend([95.0, 88.0, 80.0, 71.0]);

        let regime = d.observe("BTC-USD", &closes, ts(0));
        assert_eq!(regime.kind, RegimeKind::Crisis);
    }

    #[test]
    fn downtrend_confirms_bear() {
        let d = detector();
        let closes: Vec<f64> = (0..40).map(|i| 200.0 - i as f64 * 0.5).collect();
        d.observe("X", &closes, ts(0));
        let regime = d.observe("X", &closes, ts(60));
        assert_eq!(regime.kind, RegimeKind::Bear);
    }

    #[test]
    fn min_interval_suppresses_reclassification() {
        let d = RegimeDetector::new(RegimeConfig {
            slow_ma: 10,
            trend_window: 5,
            confirm_bars: 1,
            min_interval_secs: 60,
            ..RegimeConfig::default()
        });
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.4).collect();
        let first = d.observe("AAPL", &closes, ts(0));
        assert_eq!(first.kind, RegimeKind::Bull);

        // 10 seconds later: inside the interval, flat series must be ignored.
        let flat: Vec<f64> = vec![100.0; 30];
        let second = d.observe("AAPL", &flat, ts(10));
        assert_eq!(second.kind, RegimeKind::Bull);
    }
}
