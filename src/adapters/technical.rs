//! Technical (EMA-trend) adapter.
//!
//! Direction comes from full alignment of price, short EMA, and long EMA.
//! When the alignment is mixed but the EMA relation itself is decisive and
//! confidence clears the coercion floor, the NEUTRAL reading is coerced
//! into the EMA direction with a fixed confidence bump (technical
//! tie-break).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{AdapterError, PriceBook, SourceAdapter};
use crate::models::{Direction, SourceOpinion, SymbolSpec, Validity};

#[derive(Debug, Clone)]
pub struct TrendConfig {
    pub short_period: usize,
    pub long_period: usize,
    /// Minimum EMA spread (fraction of long EMA) before the relation counts
    /// as decisive.
    pub decisive_spread: f64,
    pub coerce_min_confidence: f64,
    pub coerce_bump: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            short_period: 12,
            long_period: 26,
            decisive_spread: 0.0015,
            coerce_min_confidence: 0.55,
            coerce_bump: 0.08,
        }
    }
}

pub struct TrendAdapter {
    source_id: String,
    cfg: TrendConfig,
    timeout: Duration,
    price_book: Arc<PriceBook>,
}

impl TrendAdapter {
    pub fn new(cfg: TrendConfig, timeout: Duration, price_book: Arc<PriceBook>) -> Self {
        Self {
            source_id: "trend".to_string(),
            cfg,
            timeout,
            price_book,
        }
    }
}

#[async_trait]
impl SourceAdapter for TrendAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn opinion(
        &self,
        symbol: &SymbolSpec,
        now: DateTime<Utc>,
    ) -> Result<SourceOpinion, AdapterError> {
        let closes = self.price_book.closes(&symbol.symbol);
        Ok(trend_opinion(&self.source_id, &symbol.symbol, &closes, &self.cfg, now))
    }
}

fn ema(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period || period == 0 {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = closes[..period].iter().sum::<f64>() / period as f64;
    Some(
        closes[period..]
            .iter()
            .fold(seed, |acc, close| alpha * close + (1.0 - alpha) * acc),
    )
}

/// Pure trend evaluation over a close series. The backtester replays the
/// live logic through this same function.
pub fn trend_opinion(
    source_id: &str,
    symbol: &str,
    closes: &[f64],
    cfg: &TrendConfig,
    now: DateTime<Utc>,
) -> SourceOpinion {
    let (Some(short), Some(long)) = (ema(closes, cfg.short_period), ema(closes, cfg.long_period))
    else {
        return SourceOpinion::unavailable(source_id, symbol, now);
    };
    let Some(&last) = closes.last() else {
        return SourceOpinion::unavailable(source_id, symbol, now);
    };
    if long <= 0.0 {
        return SourceOpinion::unavailable(source_id, symbol, now);
    }

    let spread = (short - long) / long;
    let aligned_long = last > short && short > long;
    let aligned_short = last < short && short < long;

    let mut confidence = (spread.abs() / 0.01).clamp(0.0, 1.0) * 0.6 + 0.3;
    let mut direction = if aligned_long && spread > 0.0 {
        Direction::Long
    } else if aligned_short && spread < 0.0 {
        Direction::Short
    } else {
        Direction::Neutral
    };

    let mut coerced = false;
    if direction == Direction::Neutral
        && confidence >= cfg.coerce_min_confidence
        && spread.abs() >= cfg.decisive_spread
    {
        direction = if spread > 0.0 { Direction::Long } else { Direction::Short };
        confidence = (confidence + cfg.coerce_bump).min(1.0);
        coerced = true;
    }

    let mut indicators = serde_json::Map::new();
    indicators.insert("ema_short".to_string(), json!(short));
    indicators.insert("ema_long".to_string(), json!(long));
    indicators.insert("spread".to_string(), json!(spread));
    indicators.insert("coerced".to_string(), json!(coerced));

    SourceOpinion {
        source_id: source_id.to_string(),
        symbol: symbol.to_string(),
        produced_at: now,
        direction,
        confidence: confidence.clamp(0.0, 1.0),
        indicators,
        validity: Validity::Ok,
    }
}
