//! Rolling close-price cache shared by the trend adapter, the regime
//! detector, and consensus price anchoring. Fed by the primary market-data
//! adapter; no component treats it as authoritative storage.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

const MAX_CLOSES: usize = 512;

/// Most recent trade price usable as an entry anchor, plus the realized
/// volatility estimate stops and targets derive from.
#[derive(Debug, Clone, Copy)]
pub struct PriceAnchor {
    pub price: f64,
    pub as_of: DateTime<Utc>,
    /// Per-bar return stdev over the trailing window, as a price fraction.
    pub volatility: f64,
}

struct SymbolPrices {
    closes: VecDeque<f64>,
    last_update: DateTime<Utc>,
}

pub struct PriceBook {
    /// Anchor freshness bound; older prices are not served.
    max_age: Duration,
    vol_window: usize,
    inner: RwLock<HashMap<String, SymbolPrices>>,
}

impl PriceBook {
    pub fn new(max_age_secs: i64, vol_window: usize) -> Self {
        Self {
            max_age: Duration::seconds(max_age_secs),
            vol_window: vol_window.max(2),
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn push(&self, symbol: &str, price: f64, ts: DateTime<Utc>) {
        if price <= 0.0 {
            return;
        }
        let mut inner = self.inner.write();
        let entry = inner.entry(symbol.to_string()).or_insert_with(|| SymbolPrices {
            closes: VecDeque::with_capacity(MAX_CLOSES),
            last_update: ts,
        });
        if entry.closes.len() >= MAX_CLOSES {
            entry.closes.pop_front();
        }
        entry.closes.push_back(price);
        entry.last_update = ts;
    }

    pub fn closes(&self, symbol: &str) -> Vec<f64> {
        self.inner
            .read()
            .get(symbol)
            .map(|p| p.closes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// None when no price is known or the latest is older than `max_age`.
    pub fn anchor(&self, symbol: &str, now: DateTime<Utc>) -> Option<PriceAnchor> {
        let inner = self.inner.read();
        let prices = inner.get(symbol)?;
        let price = *prices.closes.back()?;
        if now - prices.last_update > self.max_age {
            return None;
        }
        Some(PriceAnchor {
            price,
            as_of: prices.last_update,
            volatility: volatility(prices.closes.iter().copied(), self.vol_window),
        })
    }
}

fn volatility(closes: impl Iterator<Item = f64>, window: usize) -> f64 {
    let all: Vec<f64> = closes.collect();
    if all.len() < 3 {
        // Floor so freshly-seeded symbols still get non-degenerate stops.
        return 0.005;
    }
    let tail = &all[all.len().saturating_sub(window + 1)..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return 0.005;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    var.sqrt().max(1e-4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn anchor_serves_latest_fresh_price() {
        let book = PriceBook::new(30, 20);
        book.push("AAPL", 187.0, ts(0));
        book.push("AAPL", 187.5, ts(5));

        let anchor = book.anchor("AAPL", ts(10)).unwrap();
        assert_eq!(anchor.price, 187.5);
        assert!(anchor.volatility > 0.0);
    }

    #[test]
    fn stale_price_is_not_served() {
        let book = PriceBook::new(30, 20);
        book.push("AAPL", 187.0, ts(0));
        assert!(book.anchor("AAPL", ts(31)).is_none());
    }

    #[test]
    fn unknown_symbol_has_no_anchor() {
        let book = PriceBook::new(30, 20);
        assert!(book.anchor("MSFT", ts(0)).is_none());
    }
}
