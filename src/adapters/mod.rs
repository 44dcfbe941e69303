//! Data Source Adapters
//! Mission: One typed opinion per vendor per cycle, failures contained at the boundary
//!
//! Contract: transient faults (timeout, HTTP >= 500, transport) surface as
//! `Validity::Unavailable` opinions, never as errors. Only permanent faults
//! (auth, misconfiguration) cross the boundary as `AdapterError`, marking
//! the adapter degraded.

mod health;
mod market_data;
mod price_book;
mod rate_limit;
mod sentiment;
mod technical;

pub use health::AdapterHealth;
pub use market_data::QuoteVendorAdapter;
pub(crate) use market_data::momentum_opinion;
pub use price_book::{PriceAnchor, PriceBook};
pub use rate_limit::RateGate;
pub use sentiment::NewsSentimentAdapter;
pub use technical::{trend_opinion, TrendAdapter, TrendConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::models::{SourceOpinion, SymbolSpec};

/// Permanent adapter failure; transient faults never take this path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Credential rejected (HTTP 401/403). The adapter is degraded until
    /// operators rotate the key.
    Auth(String),
    Config(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::Auth(msg) => write!(f, "adapter auth failure: {}", msg),
            AdapterError::Config(msg) => write!(f, "adapter misconfigured: {}", msg),
        }
    }
}

impl std::error::Error for AdapterError {}

/// A single capability: given (symbol, now), produce an opinion.
///
/// Implementations are stateless across calls apart from rate-limit and
/// health bookkeeping.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Hard per-call timeout enforced by the caller.
    fn timeout(&self) -> Duration;

    async fn opinion(
        &self,
        symbol: &SymbolSpec,
        now: DateTime<Utc>,
    ) -> Result<SourceOpinion, AdapterError>;
}
