//! Market-data vendor adapter.
//!
//! Primary price source for the pipeline: every successful quote also feeds
//! the shared price book that anchors entry prices. Directional reading is
//! momentum-based with the vendor-family coercion (>= 0.60 confidence,
//! +0.05 bump).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AdapterError, AdapterHealth, PriceBook, RateGate, SourceAdapter};
use crate::models::{Direction, SourceOpinion, SymbolSpec, Validity};

const MAX_RETRIES: u32 = 2;
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 400;

#[derive(Debug, Deserialize)]
struct QuotePayload {
    price: f64,
    #[serde(default)]
    change_pct: f64,
}

pub struct QuoteVendorAdapter {
    source_id: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    coerce_min_confidence: f64,
    coerce_bump: f64,
    gate: RateGate,
    health: Arc<AdapterHealth>,
    price_book: Arc<PriceBook>,
}

impl QuoteVendorAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
        rate_per_min: u32,
        health: Arc<AdapterHealth>,
        price_book: Arc<PriceBook>,
    ) -> Self {
        Self {
            source_id: "quote_vendor".to_string(),
            client,
            base_url,
            api_key,
            timeout,
            coerce_min_confidence: 0.60,
            coerce_bump: 0.05,
            gate: RateGate::per_minute(rate_per_min),
            health,
            price_book,
        }
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Option<QuotePayload>, AdapterError> {
        let url = format!("{}/quotes/{}", self.base_url.trim_end_matches('/'), symbol);

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = (BACKOFF_BASE_MS << (attempt - 1)).min(BACKOFF_CAP_MS);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let mut req = self.client.get(&url).timeout(self.timeout);
            if let Some(key) = &self.api_key {
                req = req.header("X-Api-Key", key);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.json::<QuotePayload>().await {
                            Ok(payload) => {
                                self.health.record_success();
                                return Ok(Some(payload));
                            }
                            Err(e) => {
                                self.health.record_failure("malformed quote payload");
                                warn!(symbol, error = %e, "quote payload parse failed");
                                return Ok(None);
                            }
                        }
                    }
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        self.health.record_failure("auth rejected");
                        return Err(AdapterError::Auth(format!("vendor returned {}", status)));
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        debug!(symbol, %status, attempt, "quote vendor transient error");
                        continue;
                    }
                    self.health.record_failure(&format!("http {}", status));
                    return Ok(None);
                }
                Err(e) => {
                    debug!(symbol, error = %e, attempt, "quote vendor transport error");
                    continue;
                }
            }
        }

        self.health.record_failure("retries exhausted");
        Ok(None)
    }
}

#[async_trait]
impl SourceAdapter for QuoteVendorAdapter {
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
        if !self.health.available() {
            return Ok(SourceOpinion::unavailable(&self.source_id, &symbol.symbol, now));
        }
        if !self.gate.acquire_within(Duration::from_millis(500)).await {
            return Ok(SourceOpinion::unavailable(&self.source_id, &symbol.symbol, now));
        }

        let Some(quote) = self.fetch_quote(&symbol.symbol).await? else {
            return Ok(SourceOpinion::unavailable(&self.source_id, &symbol.symbol, now));
        };

        self.price_book.push(&symbol.symbol, quote.price, now);

        Ok(momentum_opinion(
            &self.source_id,
            &symbol.symbol,
            quote.price,
            quote.change_pct,
            self.coerce_min_confidence,
            self.coerce_bump,
            now,
        ))
    }
}

/// Momentum reading from a session change percentage. Exposed for the
/// backtester's synthetic vendor feed.
pub(crate) fn momentum_opinion(
    source_id: &str,
    symbol: &str,
    price: f64,
    change_pct: f64,
    coerce_min_confidence: f64,
    coerce_bump: f64,
    now: DateTime<Utc>,
) -> SourceOpinion {
    // 1.5% session move maps to full directional conviction.
    let magnitude = (change_pct.abs() / 1.5).clamp(0.0, 1.0);
    let mut confidence = 0.35 + magnitude * 0.6;
    let mut direction = if change_pct >= 0.5 {
        Direction::Long
    } else if change_pct <= -0.5 {
        Direction::Short
    } else {
        Direction::Neutral
    };

    let mut coerced = false;
    if direction == Direction::Neutral && confidence >= coerce_min_confidence && change_pct != 0.0 {
        direction = if change_pct > 0.0 { Direction::Long } else { Direction::Short };
        confidence = (confidence + coerce_bump).min(1.0);
        coerced = true;
    }

    let mut indicators = serde_json::Map::new();
    indicators.insert("price".to_string(), json!(price));
    indicators.insert("change_pct".to_string(), json!(change_pct));
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap()
    }

    #[test]
    fn strong_positive_move_reads_long() {
        let op = momentum_opinion("quote_vendor", "AAPL", 190.0, 1.2, 0.60, 0.05, now());
        assert_eq!(op.direction, Direction::Long);
        assert!(op.confidence > 0.7);
    }

    #[test]
    fn small_move_with_high_confidence_is_coerced() {
        // 0.45% move: directionally undecided, but confidence floor is met.
        let op = momentum_opinion("quote_vendor", "AAPL", 190.0, 0.45, 0.50, 0.05, now());
        assert_eq!(op.direction, Direction::Long);
        assert_eq!(op.indicators["coerced"], serde_json::json!(true));
    }

    #[test]
    fn tiny_move_below_floor_stays_neutral() {
        let op = momentum_opinion("quote_vendor", "AAPL", 190.0, 0.1, 0.60, 0.05, now());
        assert_eq!(op.direction, Direction::Neutral);
    }
}
