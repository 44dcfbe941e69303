//! End-to-end executor scenarios over real stores: redelivery dedup, broker
//! outage simulation fallback, the prop-firm drawdown latch, and the
//! distributor-to-executor delivery path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;

use alphapilot_backend::config::{ExecutorConfig, RiskConfig};
use alphapilot_backend::distributor::{ExecutorEndpoint, SignalDistributor};
use alphapilot_backend::executor::broker::{BrokerError, PaperBroker};
use alphapilot_backend::executor::{ExecutionDecision, Executor, RejectionCode};
use alphapilot_backend::fingerprint;
use alphapilot_backend::models::{
    Action, CalibrationTag, ExecutorKind, OrderStatus, Regime, SellPolicy, Signal,
    SIM_ORDER_PREFIX,
};
use alphapilot_backend::risk::{
    AccountMonitor, GuardedExecutor, LimitBreach, PauseFlag, RiskGate, RiskGuard,
};
use alphapilot_backend::store::{ExecutionStore, SignalStore};

struct Fixture {
    _dir: TempDir,
    signals: Arc<SignalStore>,
    exec_store: Arc<ExecutionStore>,
    broker: Arc<PaperBroker>,
    executor: Arc<Executor>,
    pause: Arc<PauseFlag>,
    guard: RiskGuard,
}

fn executor_config(kind: ExecutorKind) -> ExecutorConfig {
    let (executor_id, min_confidence, max_drawdown_pct) = match kind {
        ExecutorKind::Standard => ("standard", 0.75, 0.15),
        ExecutorKind::PropFirm => ("prop_firm", 0.82, 0.06),
    };
    ExecutorConfig {
        executor_id: executor_id.to_string(),
        kind,
        min_confidence,
        max_positions: 8,
        max_position_pct: 0.05,
        daily_loss_limit_pct: 0.05,
        max_drawdown_pct,
        symbols: Vec::new(),
        sell_policy: SellPolicy::OpenShort,
        strict_account_policy: false,
    }
}

fn fixture(kind: ExecutorKind) -> Fixture {
    let dir = TempDir::new().unwrap();
    let signals =
        Arc::new(SignalStore::new(dir.path().join("signals.db").to_str().unwrap()).unwrap());
    let exec_store =
        Arc::new(ExecutionStore::new(dir.path().join("exec.db").to_str().unwrap()).unwrap());
    let broker = Arc::new(PaperBroker::new(100_000.0));

    let cfg = executor_config(kind);
    exec_store.ensure_executor(&cfg.executor_id).unwrap();

    let monitor = Arc::new(AccountMonitor::new(
        cfg.executor_id.clone(),
        broker.clone(),
        exec_store.clone(),
        100_000.0,
        Duration::from_secs(15),
    ));
    let pause = Arc::new(PauseFlag::new(false, false));

    let executor = Arc::new(Executor::new(
        cfg.clone(),
        broker.clone(),
        exec_store.clone(),
        RiskGate::new(cfg.clone(), monitor.clone()),
        pause.clone(),
        1.0,
        true,
    ));

    let guard = RiskGuard::new(
        vec![GuardedExecutor {
            cfg,
            monitor,
            pause: pause.clone(),
        }],
        exec_store.clone(),
        RiskConfig::default(),
    );

    Fixture {
        _dir: dir,
        signals,
        exec_store,
        broker,
        executor,
        pause,
        guard,
    }
}

fn signal(idx: u32, confidence: f64) -> Signal {
    let generated_at =
        Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap() + ChronoDuration::seconds(idx as i64);
    let mut signal = Signal {
        signal_id: format!("{:016x}-{:08}", generated_at.timestamp_micros(), idx),
        symbol: "AAPL".to_string(),
        action: Action::Buy,
        confidence,
        entry_price: 187.0,
        target_price: Some(192.0),
        stop_price: Some(183.0),
        regime: Regime::cold_start(generated_at),
        strategy_version: "consensus-v1".to_string(),
        generated_at,
        contributing_sources: Vec::new(),
        fingerprint: String::new(),
        calibration: CalibrationTag::Raw,
        outcome: None,
        pnl_pct: None,
        order_refs: Vec::new(),
    };
    signal.fingerprint = fingerprint::compute(&signal);
    signal
}

#[tokio::test]
async fn redelivery_creates_exactly_one_order() {
    let fx = fixture(ExecutorKind::Standard);
    let sig = signal(1, 0.90);

    let first = fx.executor.handle_signal(&sig).await.unwrap();
    let order_id = match first {
        ExecutionDecision::Placed(order) => order.order_id,
        other => panic!("expected placed order, got {:?}", other),
    };

    // Same signal delivered again: must be a no-op pointing at the original.
    let second = fx.executor.handle_signal(&sig).await.unwrap();
    match second {
        ExecutionDecision::Duplicate(order) => assert_eq!(order.order_id, order_id),
        other => panic!("expected duplicate, got {:?}", other),
    }

    assert_eq!(fx.exec_store.orders_for_signal(&sig.signal_id).unwrap().len(), 1);
    assert_eq!(fx.broker.fill_count(), 1);
}

#[tokio::test]
async fn broker_outage_falls_back_to_simulation() {
    let fx = fixture(ExecutorKind::Standard);
    fx.broker.set_outage(Some(BrokerError::Transient {
        status: 503,
        body: "upstream maintenance".to_string(),
    }));

    let sig = signal(1, 0.90);
    let decision = fx.executor.handle_signal(&sig).await.unwrap();

    let order = match decision {
        ExecutionDecision::Simulated(order) => order,
        other => panic!("expected simulated fill, got {:?}", other),
    };
    assert!(order.order_id.starts_with(SIM_ORDER_PREFIX));
    assert_eq!(order.status, OrderStatus::Simulated);

    // The simulated order is persisted like a live one.
    let stored = fx
        .exec_store
        .order_for_signal("standard", &sig.signal_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, OrderStatus::Simulated);
    assert!(stored.is_simulated());

    // And the broker never saw it.
    assert_eq!(fx.broker.fill_count(), 0);
}

#[tokio::test]
async fn prop_firm_drawdown_latch_blocks_until_operator_unpause() {
    let fx = fixture(ExecutorKind::PropFirm);

    // Establish the equity peak, then breach the 6% drawdown limit.
    fx.guard.tick(Utc::now()).await;
    fx.broker.set_equity(90_000.0);
    fx.guard.tick(Utc::now()).await;
    assert!(fx.pause.is_paused());
    assert!(fx.pause.is_latched());

    let (_, reason, latched) = fx.exec_store.pause_state("prop_firm").unwrap();
    assert_eq!(reason.as_deref(), Some(LimitBreach::DrawdownLimit.as_str()));
    assert!(latched);

    // A 0.90-confidence signal is rejected with a typed policy code.
    let sig = signal(1, 0.90);
    match fx.executor.handle_signal(&sig).await.unwrap() {
        ExecutionDecision::Rejected { code, .. } => {
            assert_eq!(code, RejectionCode::Paused);
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(fx.exec_store.orders_for_signal(&sig.signal_id).unwrap().is_empty());

    // Recovery alone must not clear the latch.
    fx.broker.set_equity(101_000.0);
    fx.guard.tick(Utc::now()).await;
    assert!(fx.pause.is_paused());

    // Operator unpause rebaselines and the next execute succeeds.
    assert!(fx.guard.operator_unpause("prop_firm"));
    match fx.executor.handle_signal(&sig).await.unwrap() {
        ExecutionDecision::Placed(order) => {
            assert_eq!(order.signal_id, sig.signal_id);
        }
        other => panic!("expected placed order after unpause, got {:?}", other),
    }
}

#[tokio::test]
async fn distributor_to_executor_path_delivers_in_order_without_doubles() {
    let fx = fixture(ExecutorKind::Standard);

    let low = signal(1, 0.60); // below the 0.75 floor
    let a = signal(2, 0.85);
    let b = signal(3, 0.95);
    for s in [&low, &a, &b] {
        fx.signals.put(s).unwrap();
    }

    let (tx, mut rx) = mpsc::channel(16);
    let distributor = SignalDistributor::new(
        fx.signals.clone(),
        fx.exec_store.clone(),
        vec![ExecutorEndpoint {
            executor_id: "standard".to_string(),
            min_confidence: 0.75,
            symbols: Vec::new(),
            pause: fx.pause.clone(),
            tx,
        }],
        Duration::from_millis(50),
    );

    assert_eq!(distributor.tick().unwrap(), 2);

    // Crash-replay: a second pass from the persisted cursor redelivers
    // nothing new.
    assert_eq!(distributor.tick().unwrap(), 0);

    let mut delivered = Vec::new();
    while let Ok(sig) = rx.try_recv() {
        delivered.push(sig);
    }
    assert_eq!(delivered.len(), 2);
    assert!(delivered[0].signal_id < delivered[1].signal_id);

    for sig in &delivered {
        let decision = fx.executor.handle_signal(sig).await.unwrap();
        assert!(matches!(
            decision,
            ExecutionDecision::Placed(_) | ExecutionDecision::Simulated(_)
        ));
    }
    assert_eq!(fx.exec_store.orders_for_signal(&a.signal_id).unwrap().len(), 1);
    assert_eq!(fx.exec_store.orders_for_signal(&b.signal_id).unwrap().len(), 1);
    assert!(fx.exec_store.orders_for_signal(&low.signal_id).unwrap().is_empty());
}

#[tokio::test]
async fn close_only_executor_noops_sell_without_position() {
    let fx = fixture(ExecutorKind::Standard);

    // Rebuild with a close-only policy.
    let mut cfg = executor_config(ExecutorKind::Standard);
    cfg.sell_policy = SellPolicy::CloseOnly;
    let monitor = Arc::new(AccountMonitor::new(
        cfg.executor_id.clone(),
        fx.broker.clone(),
        fx.exec_store.clone(),
        100_000.0,
        Duration::from_secs(15),
    ));
    let executor = Executor::new(
        cfg.clone(),
        fx.broker.clone(),
        fx.exec_store.clone(),
        RiskGate::new(cfg, monitor),
        fx.pause.clone(),
        1.0,
        true,
    );

    let mut sell = signal(1, 0.90);
    sell.action = Action::Sell;
    sell.fingerprint = fingerprint::compute(&sell);

    match executor.handle_signal(&sell).await.unwrap() {
        ExecutionDecision::Rejected { code, .. } => {
            assert_eq!(code, RejectionCode::SellWithoutPosition);
        }
        other => panic!("expected sell-without-position rejection, got {:?}", other),
    }
}
