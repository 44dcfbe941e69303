//! Risk / Prop-Firm Guard
//! Mission: One limit evaluator, two paths, synchronous gate and periodic truth
//!
//! The periodic monitor is the authoritative view: it refreshes account
//! snapshots, warns inside the configured margin, and flips the per-executor
//! atomic pause flag on breach. The synchronous pre-trade gate reuses the
//! most recent snapshot when fresher than the TTL. For PROP_FIRM accounts a
//! drawdown breach latches the pause until an operator clears it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{ExecutorConfig, RiskConfig};
use crate::executor::broker::BrokerClient;
use crate::models::ExecutorKind;
use crate::store::ExecutionStore;

/// Fractions throughout (0.05 = 5%).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    pub buying_power: f64,
    pub open_positions: usize,
    /// Realized loss since UTC midnight; zero when the day is profitable.
    pub daily_loss_pct: f64,
    /// Peak-to-trough drawdown against the tracked equity peak.
    pub drawdown_pct: f64,
    /// Signed realized pnl for the day (diagnostics; loss is the gate).
    pub daily_pnl_pct: f64,
    #[serde(skip)]
    pub taken_at: Option<Instant>,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LimitBreach {
    MaxPositions,
    PositionSize,
    DailyLossLimit,
    DrawdownLimit,
    AccountUnreadable,
}

impl LimitBreach {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitBreach::MaxPositions => "MAX_POSITIONS",
            LimitBreach::PositionSize => "POSITION_SIZE",
            LimitBreach::DailyLossLimit => "DAILY_LOSS_LIMIT",
            LimitBreach::DrawdownLimit => "DRAWDOWN_LIMIT",
            LimitBreach::AccountUnreadable => "ACCOUNT_UNREADABLE",
        }
    }
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared limit evaluation used by both the gate and the monitor.
pub fn evaluate_limits(
    cfg: &ExecutorConfig,
    snapshot: &AccountSnapshot,
    prospective_fraction: Option<f64>,
) -> Result<(), LimitBreach> {
    if snapshot.open_positions >= cfg.max_positions {
        return Err(LimitBreach::MaxPositions);
    }
    if let Some(fraction) = prospective_fraction {
        if fraction > cfg.max_position_pct + 1e-9 {
            return Err(LimitBreach::PositionSize);
        }
    }
    if snapshot.daily_loss_pct >= cfg.daily_loss_limit_pct {
        return Err(LimitBreach::DailyLossLimit);
    }
    if snapshot.drawdown_pct >= cfg.max_drawdown_pct {
        return Err(LimitBreach::DrawdownLimit);
    }
    Ok(())
}

/// Limits approached but not yet breached, for the warning log.
pub fn limit_warnings(
    cfg: &ExecutorConfig,
    snapshot: &AccountSnapshot,
    warn_margin: f64,
) -> Vec<String> {
    let mut warnings = Vec::new();
    let near = |value: f64, limit: f64| limit > 0.0 && value >= limit * warn_margin && value < limit;

    if cfg.max_positions > 0
        && snapshot.open_positions + 1 >= cfg.max_positions
        && snapshot.open_positions < cfg.max_positions
    {
        warnings.push(format!(
            "open positions {}/{}",
            snapshot.open_positions, cfg.max_positions
        ));
    }
    if near(snapshot.daily_loss_pct, cfg.daily_loss_limit_pct) {
        warnings.push(format!(
            "daily loss {:.2}% of {:.2}% limit",
            snapshot.daily_loss_pct * 100.0,
            cfg.daily_loss_limit_pct * 100.0
        ));
    }
    if near(snapshot.drawdown_pct, cfg.max_drawdown_pct) {
        warnings.push(format!(
            "drawdown {:.2}% of {:.2}% limit",
            snapshot.drawdown_pct * 100.0,
            cfg.max_drawdown_pct * 100.0
        ));
    }
    warnings
}

// ---------------------------------------------------------------------------
// Per-executor account monitoring
// ---------------------------------------------------------------------------

/// Tracks one executor's account: broker equity, store-derived positions and
/// realized pnl, an equity peak for drawdown, and the snapshot cache the
/// synchronous gate reads.
pub struct AccountMonitor {
    pub executor_id: String,
    broker: Arc<dyn BrokerClient>,
    store: Arc<ExecutionStore>,
    /// Equity assumed when the broker account is unavailable and policy is
    /// lenient (simulation-fallback sizing).
    paper_equity: f64,
    peak_equity: Mutex<Option<f64>>,
    cache: RwLock<Option<AccountSnapshot>>,
    ttl: Duration,
}

impl AccountMonitor {
    pub fn new(
        executor_id: String,
        broker: Arc<dyn BrokerClient>,
        store: Arc<ExecutionStore>,
        paper_equity: f64,
        ttl: Duration,
    ) -> Self {
        Self {
            executor_id,
            broker,
            store,
            paper_equity,
            peak_equity: Mutex::new(None),
            cache: RwLock::new(None),
            ttl,
        }
    }

    pub fn cached(&self) -> Option<AccountSnapshot> {
        let snapshot = (*self.cache.read())?;
        match snapshot.taken_at {
            Some(at) if at.elapsed() <= self.ttl => Some(snapshot),
            _ => None,
        }
    }

    /// Last snapshot regardless of freshness (lenient-policy fallback).
    pub fn last_known(&self) -> Option<AccountSnapshot> {
        *self.cache.read()
    }

    /// Refresh from broker + store. `Err(true)` marks an unreadable broker
    /// account (risk-relevant), store errors bubble as `Err(false)`.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<AccountSnapshot, bool> {
        let account = self.broker.account().await;

        let open_positions = self
            .store
            .open_position_count(&self.executor_id)
            .map_err(|e| {
                error!(executor = %self.executor_id, error = %e, "position count read failed");
                false
            })?;
        let daily_pnl_pct = self
            .store
            .realized_daily_pnl_pct(&self.executor_id, now)
            .unwrap_or(0.0)
            / 100.0;

        let equity = match account {
            Ok(state) => state.equity,
            Err(e) => {
                warn!(executor = %self.executor_id, error = %e, "broker account unreadable");
                return Err(true);
            }
        };

        let mut peak = self.peak_equity.lock();
        let peak_value = (*peak).map_or(equity, |p| p.max(equity));
        *peak = Some(peak_value);
        let drawdown_pct = if peak_value > 0.0 {
            ((peak_value - equity) / peak_value).clamp(0.0, 1.0)
        } else {
            0.0
        };
        drop(peak);

        let snapshot = AccountSnapshot {
            equity,
            buying_power: equity,
            open_positions,
            daily_loss_pct: (-daily_pnl_pct).max(0.0),
            drawdown_pct,
            daily_pnl_pct,
            taken_at: Some(Instant::now()),
            as_of: now,
        };
        *self.cache.write() = Some(snapshot);
        Ok(snapshot)
    }

    /// Rebaseline after an operator unpause: the drawdown peak restarts at
    /// current equity and the stale snapshot is dropped so the next gate
    /// call sees fresh numbers.
    pub fn reset_peak(&self) {
        *self.peak_equity.lock() = None;
        *self.cache.write() = None;
    }

    /// Store-only snapshot with paper equity, for lenient fallback when the
    /// broker has never been reachable.
    pub fn paper_snapshot(&self, now: DateTime<Utc>) -> AccountSnapshot {
        let open_positions = self.store.open_position_count(&self.executor_id).unwrap_or(0);
        let daily_pnl_pct = self
            .store
            .realized_daily_pnl_pct(&self.executor_id, now)
            .unwrap_or(0.0)
            / 100.0;
        AccountSnapshot {
            equity: self.paper_equity,
            buying_power: self.paper_equity,
            open_positions,
            daily_loss_pct: (-daily_pnl_pct).max(0.0),
            drawdown_pct: 0.0,
            daily_pnl_pct,
            taken_at: Some(Instant::now()),
            as_of: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Pre-trade gate (synchronous path)
// ---------------------------------------------------------------------------

pub struct RiskGate {
    cfg: ExecutorConfig,
    monitor: Arc<AccountMonitor>,
}

impl RiskGate {
    pub fn new(cfg: ExecutorConfig, monitor: Arc<AccountMonitor>) -> Self {
        Self { cfg, monitor }
    }

    /// Resolve a usable snapshot, then evaluate limits for a prospective
    /// position of `prospective_fraction` of equity.
    pub async fn pre_trade(
        &self,
        prospective_fraction: f64,
        now: DateTime<Utc>,
    ) -> Result<AccountSnapshot, LimitBreach> {
        let snapshot = match self.monitor.cached() {
            Some(snapshot) => snapshot,
            None => match self.monitor.refresh(now).await {
                Ok(snapshot) => snapshot,
                Err(_unreadable) => {
                    if self.cfg.strict_account_policy {
                        return Err(LimitBreach::AccountUnreadable);
                    }
                    match self.monitor.last_known() {
                        Some(stale) => stale,
                        None => self.monitor.paper_snapshot(now),
                    }
                }
            },
        };

        evaluate_limits(&self.cfg, &snapshot, Some(prospective_fraction))?;
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Periodic guard (authoritative path)
// ---------------------------------------------------------------------------

/// Pause handle shared with the executor fast path: a lock-free read there,
/// written only by the guard and the operator.
pub struct PauseFlag {
    flag: AtomicBool,
    latched: AtomicBool,
}

impl PauseFlag {
    pub fn new(paused: bool, latched: bool) -> Self {
        Self {
            flag: AtomicBool::new(paused),
            latched: AtomicBool::new(latched),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    fn set(&self, paused: bool, latched: bool) {
        self.latched.store(latched, Ordering::Release);
        self.flag.store(paused, Ordering::Release);
    }
}

pub struct GuardedExecutor {
    pub cfg: ExecutorConfig,
    pub monitor: Arc<AccountMonitor>,
    pub pause: Arc<PauseFlag>,
}

pub struct RiskGuard {
    executors: Vec<GuardedExecutor>,
    store: Arc<ExecutionStore>,
    cfg: RiskConfig,
}

impl RiskGuard {
    pub fn new(executors: Vec<GuardedExecutor>, store: Arc<ExecutionStore>, cfg: RiskConfig) -> Self {
        Self {
            executors,
            store,
            cfg,
        }
    }

    /// One evaluation pass over every executor. Separated from `run` so
    /// tests and operators can invoke it directly.
    pub async fn tick(&self, now: DateTime<Utc>) {
        for guarded in &self.executors {
            self.evaluate_executor(guarded, now).await;
        }
    }

    async fn evaluate_executor(&self, guarded: &GuardedExecutor, now: DateTime<Utc>) {
        let executor_id = &guarded.cfg.executor_id;

        let snapshot = match guarded.monitor.refresh(now).await {
            Ok(snapshot) => snapshot,
            Err(unreadable) => {
                if unreadable && guarded.cfg.strict_account_policy {
                    self.pause(guarded, LimitBreach::AccountUnreadable, false);
                }
                return;
            }
        };

        for warning in limit_warnings(&guarded.cfg, &snapshot, self.cfg.warn_margin) {
            warn!(executor = %executor_id, warning, "approaching risk limit");
        }

        match evaluate_limits(&guarded.cfg, &snapshot, None) {
            Err(breach) => {
                // PROP_FIRM drawdown is terminal until the operator clears it.
                let latch = guarded.cfg.kind == ExecutorKind::PropFirm
                    && breach == LimitBreach::DrawdownLimit;
                self.pause(guarded, breach, latch);
            }
            Ok(()) => {
                if guarded.pause.is_paused() && !guarded.pause.is_latched() {
                    info!(executor = %executor_id, "limits recovered, unpausing");
                    guarded.pause.set(false, false);
                    if let Err(e) = self.store.set_paused(executor_id, false, None, false) {
                        error!(executor = %executor_id, error = %e, "failed to persist unpause");
                    }
                }
            }
        }
    }

    fn pause(&self, guarded: &GuardedExecutor, breach: LimitBreach, latch: bool) {
        let executor_id = &guarded.cfg.executor_id;
        let already_latched = guarded.pause.is_latched();
        if guarded.pause.is_paused() && (already_latched || !latch) {
            return;
        }
        error!(
            executor = %executor_id,
            breach = breach.as_str(),
            latched = latch,
            "risk limit breached, pausing executor"
        );
        guarded.pause.set(true, latch || already_latched);
        if let Err(e) = self.store.set_paused(
            executor_id,
            true,
            Some(breach.as_str()),
            latch || already_latched,
        ) {
            error!(executor = %executor_id, error = %e, "failed to persist pause");
        }
    }

    /// Operator action: clears the pause and any latch.
    pub fn operator_unpause(&self, executor_id: &str) -> bool {
        let Some(guarded) = self
            .executors
            .iter()
            .find(|g| g.cfg.executor_id == executor_id)
        else {
            return false;
        };
        info!(executor = %executor_id, "operator unpause");
        guarded.pause.set(false, false);
        guarded.monitor.reset_peak();
        if let Err(e) = self.store.set_paused(executor_id, false, None, false) {
            error!(executor = %executor_id, error = %e, "failed to persist operator unpause");
        }
        true
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.cfg.monitor_interval_secs.max(1)));
        loop {
            ticker.tick().await;
            self.tick(Utc::now()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::broker::PaperBroker;
    use crate::models::SellPolicy;
    use tempfile::TempDir;

    fn exec_cfg(kind: ExecutorKind) -> ExecutorConfig {
        ExecutorConfig {
            executor_id: match kind {
                ExecutorKind::Standard => "standard".to_string(),
                ExecutorKind::PropFirm => "prop_firm".to_string(),
            },
            kind,
            min_confidence: 0.75,
            max_positions: 2,
            max_position_pct: 0.05,
            daily_loss_limit_pct: 0.05,
            max_drawdown_pct: 0.10,
            symbols: Vec::new(),
            sell_policy: SellPolicy::OpenShort,
            strict_account_policy: false,
        }
    }

    fn snapshot() -> AccountSnapshot {
        AccountSnapshot {
            equity: 100_000.0,
            buying_power: 100_000.0,
            open_positions: 0,
            daily_loss_pct: 0.0,
            drawdown_pct: 0.0,
            daily_pnl_pct: 0.0,
            taken_at: Some(Instant::now()),
            as_of: Utc::now(),
        }
    }

    #[test]
    fn evaluator_passes_healthy_account() {
        let cfg = exec_cfg(ExecutorKind::Standard);
        assert!(evaluate_limits(&cfg, &snapshot(), Some(0.05)).is_ok());
    }

    #[test]
    fn evaluator_rejects_each_limit() {
        let cfg = exec_cfg(ExecutorKind::Standard);

        let mut s = snapshot();
        s.open_positions = 2;
        assert_eq!(evaluate_limits(&cfg, &s, None), Err(LimitBreach::MaxPositions));

        assert_eq!(
            evaluate_limits(&cfg, &snapshot(), Some(0.06)),
            Err(LimitBreach::PositionSize)
        );

        let mut s = snapshot();
        s.daily_loss_pct = 0.05;
        assert_eq!(evaluate_limits(&cfg, &s, None), Err(LimitBreach::DailyLossLimit));

        let mut s = snapshot();
        s.drawdown_pct = 0.10;
        assert_eq!(evaluate_limits(&cfg, &s, None), Err(LimitBreach::DrawdownLimit));
    }

    #[test]
    fn warnings_fire_inside_margin() {
        let cfg = exec_cfg(ExecutorKind::Standard);
        let mut s = snapshot();
        s.daily_loss_pct = 0.045;
        s.open_positions = 1;
        let warnings = limit_warnings(&cfg, &s, 0.8);
        assert!(warnings.iter().any(|w| w.contains("daily loss")));
        assert!(warnings.iter().any(|w| w.contains("open positions")));
    }

    fn guard_fixture(kind: ExecutorKind) -> (TempDir, Arc<PaperBroker>, Arc<PauseFlag>, RiskGuard) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            ExecutionStore::new(dir.path().join("exec.db").to_str().unwrap()).unwrap(),
        );
        let broker = Arc::new(PaperBroker::new(100_000.0));
        let cfg = exec_cfg(kind);
        store.ensure_executor(&cfg.executor_id).unwrap();
        let monitor = Arc::new(AccountMonitor::new(
            cfg.executor_id.clone(),
            broker.clone(),
            store.clone(),
            100_000.0,
            Duration::from_secs(15),
        ));
        let pause = Arc::new(PauseFlag::new(false, false));
        let guard = RiskGuard::new(
            vec![GuardedExecutor {
                cfg,
                monitor,
                pause: pause.clone(),
            }],
            store,
            RiskConfig::default(),
        );
        (dir, broker, pause, guard)
    }

    #[tokio::test]
    async fn prop_firm_drawdown_breach_latches() {
        let (_dir, broker, pause, guard) = guard_fixture(ExecutorKind::PropFirm);

        // Establish a 100k peak, then draw down 12% (limit is 10%).
        guard.tick(Utc::now()).await;
        assert!(!pause.is_paused());

        broker.set_equity(88_000.0);
        guard.tick(Utc::now()).await;
        assert!(pause.is_paused());
        assert!(pause.is_latched());

        // Equity recovery must not clear a latched pause.
        broker.set_equity(101_000.0);
        guard.tick(Utc::now()).await;
        assert!(pause.is_paused());

        assert!(guard.operator_unpause("prop_firm"));
        assert!(!pause.is_paused());
        guard.tick(Utc::now()).await;
        assert!(!pause.is_paused());
    }

    #[tokio::test]
    async fn standard_drawdown_breach_is_not_latched() {
        let (_dir, broker, pause, guard) = guard_fixture(ExecutorKind::Standard);

        guard.tick(Utc::now()).await;
        broker.set_equity(88_000.0);
        guard.tick(Utc::now()).await;
        assert!(pause.is_paused());
        assert!(!pause.is_latched());

        // Recovery above the limit auto-unpauses.
        broker.set_equity(99_000.0);
        guard.tick(Utc::now()).await;
        assert!(!pause.is_paused());
    }
}
