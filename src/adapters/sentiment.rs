//! News-sentiment adapter. Stocks are only scored during the regular
//! session (the vendor's newsroom coverage is session-aligned); crypto is
//! always in scope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{AdapterError, AdapterHealth, RateGate, SourceAdapter};
use crate::models::{market_eligible, AssetClass, Direction, SourceOpinion, SymbolSpec, Validity};

#[derive(Debug, Deserialize)]
struct SentimentPayload {
    /// Aggregate score in [-1, 1].
    score: f64,
    #[serde(default)]
    article_count: u32,
}

pub struct NewsSentimentAdapter {
    source_id: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    force_24_7: bool,
    gate: RateGate,
    health: Arc<AdapterHealth>,
}

impl NewsSentimentAdapter {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
        rate_per_min: u32,
        force_24_7: bool,
        health: Arc<AdapterHealth>,
    ) -> Self {
        Self {
            source_id: "news_sentiment".to_string(),
            client,
            base_url,
            api_key,
            timeout,
            force_24_7,
            gate: RateGate::per_minute(rate_per_min),
            health,
        }
    }

    async fn fetch_sentiment(&self, symbol: &str) -> Result<Option<SentimentPayload>, AdapterError> {
        let url = format!("{}/sentiment/{}", self.base_url.trim_end_matches('/'), symbol);
        let mut req = self.client.get(&url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            req = req.header("X-Api-Key", key);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    match resp.json::<SentimentPayload>().await {
                        Ok(payload) => {
                            self.health.record_success();
                            Ok(Some(payload))
                        }
                        Err(_) => {
                            self.health.record_failure("malformed sentiment payload");
                            Ok(None)
                        }
                    }
                } else if status.as_u16() == 401 || status.as_u16() == 403 {
                    self.health.record_failure("auth rejected");
                    Err(AdapterError::Auth(format!("vendor returned {}", status)))
                } else {
                    debug!(symbol, %status, "sentiment vendor error");
                    self.health.record_failure(&format!("http {}", status));
                    Ok(None)
                }
            }
            Err(e) => {
                debug!(symbol, error = %e, "sentiment transport error");
                self.health.record_failure("transport");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for NewsSentimentAdapter {
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
        // Session gate applies to stocks only.
        if symbol.class == AssetClass::Stock
            && !market_eligible(AssetClass::Stock, now, self.force_24_7)
        {
            return Ok(SourceOpinion::unavailable(&self.source_id, &symbol.symbol, now));
        }
        if !self.health.available() {
            return Ok(SourceOpinion::unavailable(&self.source_id, &symbol.symbol, now));
        }
        if !self.gate.acquire_within(Duration::from_millis(500)).await {
            return Ok(SourceOpinion::unavailable(&self.source_id, &symbol.symbol, now));
        }

        let Some(payload) = self.fetch_sentiment(&symbol.symbol).await? else {
            return Ok(SourceOpinion::unavailable(&self.source_id, &symbol.symbol, now));
        };

        Ok(sentiment_opinion(
            &self.source_id,
            &symbol.symbol,
            payload.score,
            payload.article_count,
            now,
        ))
    }
}

pub(crate) fn sentiment_opinion(
    source_id: &str,
    symbol: &str,
    score: f64,
    article_count: u32,
    now: DateTime<Utc>,
) -> SourceOpinion {
    let score = score.clamp(-1.0, 1.0);
    let direction = if score >= 0.2 {
        Direction::Long
    } else if score <= -0.2 {
        Direction::Short
    } else {
        Direction::Neutral
    };

    // Thin coverage dampens conviction.
    let coverage = (article_count as f64 / 10.0).clamp(0.2, 1.0);
    let confidence = (0.3 + score.abs() * 0.65) * coverage;

    let mut indicators = serde_json::Map::new();
    indicators.insert("score".to_string(), json!(score));
    indicators.insert("article_count".to_string(), json!(article_count));

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
    fn strong_negative_sentiment_reads_short() {
        let op = sentiment_opinion("news_sentiment", "AAPL", -0.8, 12, now());
        assert_eq!(op.direction, Direction::Short);
        assert!(op.confidence > 0.6);
    }

    #[test]
    fn weak_score_is_neutral() {
        let op = sentiment_opinion("news_sentiment", "AAPL", 0.05, 12, now());
        assert_eq!(op.direction, Direction::Neutral);
    }

    #[test]
    fn thin_coverage_caps_confidence() {
        let thin = sentiment_opinion("news_sentiment", "AAPL", 0.9, 1, now());
        let broad = sentiment_opinion("news_sentiment", "AAPL", 0.9, 20, now());
        assert!(thin.confidence < broad.confidence);
    }
}
