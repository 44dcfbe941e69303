//! Core Domain Types
//! Mission: One shared vocabulary for the whole signal pipeline

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Reserved order-id prefix for simulated fills. Orders carrying it are
/// never forwarded to the broker.
pub const SIM_ORDER_PREFIX: &str = "SIM_";

/// Asset classification; governs market-hours eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetClass {
    Stock,
    Crypto,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Stock => "STOCK",
            AssetClass::Crypto => "CRYPTO",
        }
    }
}

/// A watched instrument: uppercase symbol plus its classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub class: AssetClass,
    /// Quantity decimals the instrument supports (0 for whole shares).
    #[serde(default)]
    pub qty_precision: u32,
}

impl SymbolSpec {
    pub fn new(symbol: impl Into<String>, class: AssetClass) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            class,
            qty_precision: match class {
                AssetClass::Stock => 0,
                AssetClass::Crypto => 6,
            },
        }
    }
}

/// Directional view of a single source in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Neutral => "NEUTRAL",
        }
    }

    pub fn is_directional(&self) -> bool {
        !matches!(self, Direction::Neutral)
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Neutral => Direction::Neutral,
        }
    }
}

/// Committed signal action. `NEUTRAL` never reaches the store; the type
/// makes that unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }

    pub fn from_direction(direction: Direction) -> Option<Action> {
        match direction {
            Direction::Long => Some(Action::Buy),
            Direction::Short => Some(Action::Sell),
            Direction::Neutral => None,
        }
    }

    pub fn parse(s: &str) -> Option<Action> {
        match s {
            "BUY" => Some(Action::Buy),
            "SELL" => Some(Action::Sell),
            _ => None,
        }
    }
}

/// Freshness of an opinion within its aggregation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Validity {
    Ok,
    Stale,
    Unavailable,
}

/// One data source's view of one symbol in one cycle. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOpinion {
    pub source_id: String,
    pub symbol: String,
    pub produced_at: DateTime<Utc>,
    pub direction: Direction,
    pub confidence: f64,
    /// Opaque diagnostics bag. Consensus never branches on this.
    #[serde(default)]
    pub indicators: serde_json::Map<String, serde_json::Value>,
    pub validity: Validity,
}

impl SourceOpinion {
    pub fn unavailable(source_id: &str, symbol: &str, now: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.to_string(),
            symbol: symbol.to_string(),
            produced_at: now,
            direction: Direction::Neutral,
            confidence: 0.0,
            indicators: serde_json::Map::new(),
            validity: Validity::Unavailable,
        }
    }
}

/// Coarse market state used to bias stops, targets, and tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegimeKind {
    Bull,
    Bear,
    Chop,
    Crisis,
}

impl RegimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeKind::Bull => "BULL",
            RegimeKind::Bear => "BEAR",
            RegimeKind::Chop => "CHOP",
            RegimeKind::Crisis => "CRISIS",
        }
    }

    pub fn parse(s: &str) -> Option<RegimeKind> {
        match s {
            "BULL" => Some(RegimeKind::Bull),
            "BEAR" => Some(RegimeKind::Bear),
            "CHOP" => Some(RegimeKind::Chop),
            "CRISIS" => Some(RegimeKind::Crisis),
            _ => None,
        }
    }

    /// Directional bias used when a lone NEUTRAL opinion must be resolved.
    /// Chop carries no bias; Crisis biases defensive.
    pub fn dominant_bias(&self) -> Direction {
        match self {
            RegimeKind::Bull => Direction::Long,
            RegimeKind::Bear => Direction::Short,
            RegimeKind::Crisis => Direction::Short,
            RegimeKind::Chop => Direction::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Regime {
    pub kind: RegimeKind,
    pub strength: f64,
    pub classified_at: DateTime<Utc>,
}

impl Regime {
    pub fn cold_start(now: DateTime<Utc>) -> Self {
        Self {
            kind: RegimeKind::Chop,
            strength: 0.0,
            classified_at: now,
        }
    }
}

/// One source's contribution recorded on an emitted signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributingSource {
    pub source_id: String,
    pub direction: Direction,
    pub weight: f64,
    pub confidence: f64,
}

/// Whether the reported confidence went through a fitted calibrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationTag {
    /// No calibrator fitted yet; confidence is the raw consensus score.
    Raw,
    Fitted { version: String },
}

impl CalibrationTag {
    pub fn as_str(&self) -> String {
        match self {
            CalibrationTag::Raw => "raw".to_string(),
            CalibrationTag::Fitted { version } => format!("fitted:{}", version),
        }
    }

    pub fn parse(s: &str) -> CalibrationTag {
        match s.strip_prefix("fitted:") {
            Some(version) => CalibrationTag::Fitted {
                version: version.to_string(),
            },
            None => CalibrationTag::Raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalOutcome {
    Win,
    Loss,
    Expired,
}

impl SignalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalOutcome::Win => "WIN",
            SignalOutcome::Loss => "LOSS",
            SignalOutcome::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<SignalOutcome> {
        match s {
            "WIN" => Some(SignalOutcome::Win),
            "LOSS" => Some(SignalOutcome::Loss),
            "EXPIRED" => Some(SignalOutcome::Expired),
            _ => None,
        }
    }
}

/// Reference from a signal to an order an executor accepted for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    pub executor_id: String,
    pub order_id: String,
}

/// The system-of-record entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub symbol: String,
    pub action: Action,
    /// Calibrated confidence, never the raw consensus score.
    pub confidence: f64,
    pub entry_price: f64,
    pub target_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub regime: Regime,
    pub strategy_version: String,
    pub generated_at: DateTime<Utc>,
    pub contributing_sources: Vec<ContributingSource>,
    /// Lowercase hex SHA-256 over the canonical serialization of the
    /// immutable fields.
    pub fingerprint: String,
    pub calibration: CalibrationTag,
    pub outcome: Option<SignalOutcome>,
    pub pnl_pct: Option<f64>,
    #[serde(default)]
    pub order_refs: Vec<OrderRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutorKind {
    Standard,
    PropFirm,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Standard => "STANDARD",
            ExecutorKind::PropFirm => "PROP_FIRM",
        }
    }
}

/// Per-executor handling of a SELL signal when no long position is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellPolicy {
    /// SELL with no open long opens a short.
    OpenShort,
    /// SELL with no open long is a recorded no-op.
    CloseOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Simulated,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Simulated => "SIMULATED",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "FILLED" => Some(OrderStatus::Filled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "SIMULATED" => Some(OrderStatus::Simulated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub executor_id: String,
    pub signal_id: String,
    pub symbol: String,
    pub side: Action,
    pub qty: f64,
    pub price_reference: f64,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_simulated(&self) -> bool {
        self.order_id.starts_with(SIM_ORDER_PREFIX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub executor_id: String,
    /// Signed quantity: negative for short positions.
    pub qty: f64,
    pub avg_cost: f64,
    pub opened_at: DateTime<Utc>,
    /// Signal that opened the position; drives outcome attribution.
    pub signal_id: String,
    pub target_price: Option<f64>,
    pub stop_price: Option<f64>,
}

/// A single OHLCV bar used by the regime detector and the backtester.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BacktestStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl BacktestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BacktestStatus::Pending => "PENDING",
            BacktestStatus::Running => "RUNNING",
            BacktestStatus::Complete => "COMPLETE",
            BacktestStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<BacktestStatus> {
        match s {
            "PENDING" => Some(BacktestStatus::Pending),
            "RUNNING" => Some(BacktestStatus::Running),
            "COMPLETE" => Some(BacktestStatus::Complete),
            "FAILED" => Some(BacktestStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRun {
    pub run_id: String,
    pub symbol: String,
    pub train_range: TimeRange,
    pub val_range: TimeRange,
    pub test_range: TimeRange,
    pub cost_model: crate::backtest::CostModel,
    pub status: BacktestStatus,
    pub metrics: Option<crate::backtest::BacktestMetrics>,
}

/// Regular US equity session in UTC (14:30–21:00, Mon–Fri).
///
/// DST shifts the open by an hour twice a year; the 24/7 override flag is
/// the operational escape hatch rather than a timezone table.
pub fn stock_market_open(now: DateTime<Utc>) -> bool {
    match now.weekday() {
        Weekday::Sat | Weekday::Sun => return false,
        _ => {}
    }
    let minutes = now.hour() * 60 + now.minute();
    (14 * 60 + 30..21 * 60).contains(&minutes)
}

/// Whether a symbol is eligible for a generation cycle right now.
pub fn market_eligible(class: AssetClass, now: DateTime<Utc>, force_24_7: bool) -> bool {
    match class {
        AssetClass::Crypto => true,
        AssetClass::Stock => force_24_7 || stock_market_open(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn action_never_neutral() {
        assert_eq!(Action::from_direction(Direction::Neutral), None);
        assert_eq!(Action::from_direction(Direction::Long), Some(Action::Buy));
        assert_eq!(Action::from_direction(Direction::Short), Some(Action::Sell));
    }

    #[test]
    fn market_hours_weekday_session() {
        let open = Utc.with_ymd_and_hms(2024, 3, 5, 15, 0, 0).unwrap();
        let closed = Utc.with_ymd_and_hms(2024, 3, 5, 22, 0, 0).unwrap();
        let weekend = Utc.with_ymd_and_hms(2024, 3, 9, 15, 0, 0).unwrap();

        assert!(stock_market_open(open));
        assert!(!stock_market_open(closed));
        assert!(!stock_market_open(weekend));

        assert!(market_eligible(AssetClass::Crypto, weekend, false));
        assert!(market_eligible(AssetClass::Stock, closed, true));
        assert!(!market_eligible(AssetClass::Stock, closed, false));
    }

    #[test]
    fn calibration_tag_round_trip() {
        let fitted = CalibrationTag::Fitted {
            version: "cal-v3".to_string(),
        };
        assert_eq!(CalibrationTag::parse(&fitted.as_str()), fitted);
        assert_eq!(CalibrationTag::parse("raw"), CalibrationTag::Raw);
    }
}
