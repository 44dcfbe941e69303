//! Application Configuration
//! Mission: One hierarchical document per service; env wins over file, CLI wins over env
//!
//! Secrets (broker keys, vendor keys) are never stored in the TOML layer;
//! they resolve through `secret_from_env`, which honours `NAME` first and a
//! `NAME_FILE` indirection second.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;

use crate::models::{AssetClass, ExecutorKind, SellPolicy, SymbolSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub watchlist: Vec<WatchedSymbol>,
    pub sources: SourcesConfig,
    pub consensus: ConsensusSettings,
    pub generation: GenerationConfig,
    pub executors: Vec<ExecutorConfig>,
    pub broker: BrokerConfig,
    pub risk: RiskConfig,
    pub backtest: BacktestCostConfig,
    pub reconciler: ReconcilerConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub signals_path: String,
    pub execution_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            signals_path: "./alphapilot_signals.db".to_string(),
            execution_path: "./alphapilot_execution.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Resolved from JWT_SECRET / JWT_SECRET_FILE at load time.
    #[serde(skip_serializing)]
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedSymbol {
    pub symbol: String,
    pub class: AssetClass,
}

impl WatchedSymbol {
    pub fn spec(&self) -> SymbolSpec {
        SymbolSpec::new(self.symbol.clone(), self.class)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Base weights per source_id on the stock track.
    pub stock_weights: HashMap<String, f64>,
    /// Base weights per source_id on the crypto track.
    pub crypto_weights: HashMap<String, f64>,
    /// Hard per-adapter timeout, milliseconds.
    pub timeouts_ms: HashMap<String, u64>,
    /// Requests per minute per adapter.
    pub rate_limits_per_min: HashMap<String, u32>,
    pub quote_vendor_url: String,
    pub news_vendor_url: String,
    /// Consecutive failures before an adapter trips.
    pub trip_threshold: u32,
    /// Seconds a tripped adapter stays dark before retrying.
    pub trip_cooldown_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        let mut stock_weights = HashMap::new();
        stock_weights.insert("trend".to_string(), 0.40);
        stock_weights.insert("quote_vendor".to_string(), 0.35);
        stock_weights.insert("news_sentiment".to_string(), 0.25);

        let mut crypto_weights = HashMap::new();
        crypto_weights.insert("trend".to_string(), 0.45);
        crypto_weights.insert("quote_vendor".to_string(), 0.40);
        crypto_weights.insert("news_sentiment".to_string(), 0.15);

        let mut timeouts_ms = HashMap::new();
        timeouts_ms.insert("trend".to_string(), 1_500);
        timeouts_ms.insert("quote_vendor".to_string(), 3_000);
        timeouts_ms.insert("news_sentiment".to_string(), 4_000);

        let mut rate_limits_per_min = HashMap::new();
        rate_limits_per_min.insert("quote_vendor".to_string(), 120);
        rate_limits_per_min.insert("news_sentiment".to_string(), 30);

        Self {
            stock_weights,
            crypto_weights,
            timeouts_ms,
            rate_limits_per_min,
            quote_vendor_url: "https://data.vendor.example/v2".to_string(),
            news_vendor_url: "https://news.vendor.example/v1".to_string(),
            trip_threshold: 5,
            trip_cooldown_secs: 120,
        }
    }
}

impl SourcesConfig {
    pub fn timeout_ms(&self, source_id: &str) -> u64 {
        self.timeouts_ms.get(source_id).copied().unwrap_or(3_000)
    }

    pub fn slowest_timeout_ms(&self) -> u64 {
        self.timeouts_ms.values().copied().max().unwrap_or(3_000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    pub strategy_version: String,
    /// Multiples of the realized-volatility estimate.
    pub target_vol_multiple: f64,
    pub stop_vol_multiple: f64,
    /// Stop multiple shrink factor applied in CRISIS.
    pub crisis_stop_factor: f64,
    /// Confidence at or above which a signal counts as premium.
    pub premium_confidence: f64,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            strategy_version: "consensus-v1".to_string(),
            target_vol_multiple: 2.0,
            stop_vol_multiple: 1.0,
            crisis_stop_factor: 0.5,
            premium_confidence: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub cadence_secs: u64,
    /// Hard per-cycle deadline; must exceed the slowest adapter timeout.
    pub cycle_deadline_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            cadence_secs: 5,
            cycle_deadline_ms: 6_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub executor_id: String,
    pub kind: ExecutorKind,
    pub min_confidence: f64,
    pub max_positions: usize,
    /// Position fraction of equity per trade.
    pub max_position_pct: f64,
    pub daily_loss_limit_pct: f64,
    pub max_drawdown_pct: f64,
    /// Empty list means every watched symbol is permitted.
    #[serde(default)]
    pub symbols: Vec<String>,
    pub sell_policy: SellPolicy,
    /// Reject pre-trade when the account snapshot is unreadable or stale.
    #[serde(default)]
    pub strict_account_policy: bool,
}

impl ExecutorConfig {
    pub fn permits_symbol(&self, symbol: &str) -> bool {
        self.symbols.is_empty() || self.symbols.iter().any(|s| s == symbol)
    }
}

fn default_executors() -> Vec<ExecutorConfig> {
    vec![
        ExecutorConfig {
            executor_id: "standard".to_string(),
            kind: ExecutorKind::Standard,
            min_confidence: 0.75,
            max_positions: 8,
            max_position_pct: 0.05,
            daily_loss_limit_pct: 0.05,
            max_drawdown_pct: 0.15,
            symbols: Vec::new(),
            sell_policy: SellPolicy::OpenShort,
            strict_account_policy: false,
        },
        ExecutorConfig {
            executor_id: "prop_firm".to_string(),
            kind: ExecutorKind::PropFirm,
            min_confidence: 0.82,
            max_positions: 4,
            max_position_pct: 0.02,
            daily_loss_limit_pct: 0.03,
            max_drawdown_pct: 0.06,
            symbols: Vec::new(),
            sell_policy: SellPolicy::CloseOnly,
            strict_account_policy: true,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub base_url: String,
    /// Env var names, not values; resolved via `secret_from_env`.
    pub key_id_env: String,
    pub secret_env: String,
    pub min_notional: f64,
    pub request_timeout_ms: u64,
    /// Equity assumed for sizing when only simulation is available.
    pub paper_equity: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://broker.example/v2".to_string(),
            key_id_env: "BROKER_KEY_ID".to_string(),
            secret_env: "BROKER_SECRET".to_string(),
            min_notional: 1.0,
            request_timeout_ms: 5_000,
            paper_equity: 100_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub monitor_interval_secs: u64,
    /// Fraction of a limit at which warnings start (0.8 = warn at 80%).
    pub warn_margin: f64,
    /// Snapshot freshness bound for the synchronous pre-trade path.
    pub snapshot_ttl_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 5,
            warn_margin: 0.8,
            snapshot_ttl_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestCostConfig {
    pub slippage_pct: f64,
    pub half_spread_pct: f64,
    pub commission_pct: f64,
    /// Seed for the bootstrap confidence-interval resampler.
    pub bootstrap_seed: u64,
}

impl Default for BacktestCostConfig {
    fn default() -> Self {
        Self {
            slippage_pct: 0.05,
            half_spread_pct: 0.01,
            commission_pct: 0.10,
            bootstrap_seed: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    /// Signals with no outcome and no order past this age become EXPIRED.
    pub signal_ttl_secs: u64,
    pub expire_unfilled: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            signal_ttl_secs: 6 * 3600,
            expire_unfilled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub force_24_7_mode: bool,
    /// Wire the distributor to executors; off = signal-only service.
    pub auto_execute: bool,
    pub simulation_fallback: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            force_24_7_mode: false,
            auto_execute: true,
            simulation_fallback: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            watchlist: vec![
                WatchedSymbol {
                    symbol: "AAPL".to_string(),
                    class: AssetClass::Stock,
                },
                WatchedSymbol {
                    symbol: "BTC-USD".to_string(),
                    class: AssetClass::Crypto,
                },
            ],
            sources: SourcesConfig::default(),
            consensus: ConsensusSettings::default(),
            generation: GenerationConfig::default(),
            executors: default_executors(),
            broker: BrokerConfig::default(),
            risk: RiskConfig::default(),
            backtest: BacktestCostConfig::default(),
            reconciler: ReconcilerConfig::default(),
            features: FeatureFlags::default(),
        }
    }
}

impl AppConfig {
    /// Load the layered configuration: TOML file (when present), then env
    /// overrides, then validation. Invalid configuration is fatal.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                toml::from_str::<AppConfig>(&raw)
                    .with_context(|| format!("invalid config file {}", p.display()))?
            }
            Some(p) => bail!("config file {} does not exist", p.display()),
            None => AppConfig::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(port) = env_parse::<u16>("PORT") {
            self.http.port = port;
        }
        if let Ok(path) = env::var("SIGNALS_DB_PATH") {
            self.database.signals_path = path;
        }
        if let Ok(path) = env::var("EXECUTION_DB_PATH") {
            self.database.execution_path = path;
        }
        if let Some(secret) = secret_from_env("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(url) = env::var("QUOTE_VENDOR_URL") {
            self.sources.quote_vendor_url = url;
        }
        if let Ok(url) = env::var("NEWS_VENDOR_URL") {
            self.sources.news_vendor_url = url;
        }
        if let Ok(url) = env::var("BROKER_BASE_URL") {
            self.broker.base_url = url;
        }
        if let Some(v) = env_bool("FORCE_24_7_MODE") {
            self.features.force_24_7_mode = v;
        }
        if let Some(v) = env_bool("AUTO_EXECUTE") {
            self.features.auto_execute = v;
        }
        if let Some(v) = env_bool("SIMULATION_FALLBACK") {
            self.features.simulation_fallback = v;
        }
        if let Some(secs) = env_parse::<u64>("GENERATION_CADENCE_SECS") {
            self.generation.cadence_secs = secs;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.watchlist.is_empty() {
            bail!("watchlist must not be empty");
        }
        for entry in &self.watchlist {
            if entry.symbol.trim().is_empty() || entry.symbol != entry.symbol.to_uppercase() {
                bail!("watchlist symbol {:?} must be non-empty uppercase", entry.symbol);
            }
        }
        if self.executors.is_empty() {
            bail!("at least one executor must be configured");
        }
        let mut seen = std::collections::HashSet::new();
        for exec in &self.executors {
            if !seen.insert(exec.executor_id.as_str()) {
                bail!("duplicate executor_id {:?}", exec.executor_id);
            }
            if !(0.0..=1.0).contains(&exec.min_confidence) {
                bail!("executor {}: min_confidence out of [0,1]", exec.executor_id);
            }
            if !(0.0..=1.0).contains(&exec.max_position_pct) {
                bail!("executor {}: max_position_pct out of [0,1]", exec.executor_id);
            }
            if exec.max_positions == 0 {
                bail!("executor {}: max_positions must be positive", exec.executor_id);
            }
        }
        for (track, weights) in [
            ("stock", &self.sources.stock_weights),
            ("crypto", &self.sources.crypto_weights),
        ] {
            if weights.is_empty() {
                bail!("{} weight track must not be empty", track);
            }
            if weights.values().any(|w| *w <= 0.0) {
                bail!("{} weight track contains non-positive weights", track);
            }
        }
        if self.generation.cycle_deadline_ms <= self.sources.slowest_timeout_ms() {
            bail!(
                "cycle_deadline_ms ({}) must exceed the slowest adapter timeout ({})",
                self.generation.cycle_deadline_ms,
                self.sources.slowest_timeout_ms()
            );
        }
        if self.auth.jwt_secret.len() < 32 {
            bail!("JWT secret must be at least 32 bytes (set JWT_SECRET)");
        }
        Ok(())
    }

    pub fn executor(&self, executor_id: &str) -> Option<&ExecutorConfig> {
        self.executors.iter().find(|e| e.executor_id == executor_id)
    }

    pub fn weights_for(&self, class: AssetClass) -> &HashMap<String, f64> {
        match class {
            AssetClass::Stock => &self.sources.stock_weights,
            AssetClass::Crypto => &self.sources.crypto_weights,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
}

/// Resolve a secret from `NAME`, falling back to reading the file named by
/// `NAME_FILE`. Returns None when neither is set.
pub fn secret_from_env(name: &str) -> Option<String> {
    if let Ok(value) = env::var(name) {
        if !value.trim().is_empty() {
            return Some(value);
        }
    }
    let file_var = format!("{}_FILE", name);
    if let Ok(path) = env::var(&file_var) {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            let trimmed = contents.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
    }
    None
}
