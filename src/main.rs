//! AlphaPilot - Consensus Trading Signal Engine
//! Mission: Adapters in, exactly-once signals out, risk-gated execution

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alphapilot_backend::{
    adapters::{
        AdapterHealth, NewsSentimentAdapter, PriceBook, QuoteVendorAdapter, SourceAdapter,
        TrendAdapter, TrendConfig,
    },
    api::{build_router, AppState, VERSION},
    auth::JwtHandler,
    backtest::{Backtester, CostModel},
    config::{secret_from_env, AppConfig},
    consensus::{CalibratorHandle, ConsensusEngine, TrackWeights},
    distributor::{ExecutorEndpoint, SignalDistributor},
    executor::{
        broker::{BrokerClient, PaperBroker, RestBroker},
        Executor, OutcomeReconciler,
    },
    generation::SignalGenerationService,
    models::{AssetClass, Bar, SymbolSpec},
    regime::{RegimeConfig, RegimeDetector},
    risk::{AccountMonitor, GuardedExecutor, PauseFlag, RiskGate, RiskGuard},
    store::{ExecutionStore, SignalStore},
};

#[derive(Parser, Debug)]
#[command(name = "alphapilot", version, about = "Consensus trading signal engine")]
struct Args {
    /// Path to the TOML configuration document.
    #[arg(short, long, env = "ALPHAPILOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signal service (default).
    Serve,
    /// Replay a symbol's bar history through the full pipeline and persist
    /// the run in the signal store.
    Backtest {
        /// Uppercase symbol, e.g. AAPL or BTC-USD.
        #[arg(long)]
        symbol: String,
        /// Asset class: stock or crypto.
        #[arg(long, default_value = "stock")]
        class: String,
        /// JSON file holding the bar array (ts/open/high/low/close/volume).
        #[arg(long)]
        bars: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,alphapilot_backend=debug,hyper=warn,reqwest=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = Arc::new(AppConfig::load(args.config.as_deref()).context("configuration error")?);

    if let Some(Command::Backtest { symbol, class, bars }) = args.command {
        return run_backtest(&config, &symbol, &class, &bars);
    }

    info!(version = VERSION, "alphapilot starting");
    info!(
        symbols = config.watchlist.len(),
        executors = config.executors.len(),
        auto_execute = config.features.auto_execute,
        simulation_fallback = config.features.simulation_fallback,
        "configuration loaded"
    );

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    // Stores: signals are the system-of-record, executor state is its own
    // single-writer ledger.
    let signal_store = Arc::new(SignalStore::new(&config.database.signals_path)?);
    let exec_store = Arc::new(ExecutionStore::new(&config.database.execution_path)?);

    // Shared market-data plumbing.
    let price_book = Arc::new(PriceBook::new(60, 20));
    let regime = Arc::new(RegimeDetector::new(RegimeConfig::default()));

    let adapters = build_adapters(&config, &http_client, &price_book);
    info!(adapters = adapters.len(), "data source adapters ready");

    // Consensus with an identity calibrator; backtest runs install fits.
    let calibrator = Arc::new(CalibratorHandle::identity());
    let consensus = Arc::new(ConsensusEngine::new(
        config.consensus.clone(),
        TrackWeights {
            stock: config.sources.stock_weights.clone(),
            crypto: config.sources.crypto_weights.clone(),
        },
        calibrator,
    ));

    let broker = build_broker(&config, &http_client);

    // Executors with their pause flags, monitors, and queues.
    let mut executors = Vec::new();
    let mut monitors = HashMap::new();
    let mut guarded = Vec::new();
    let mut endpoints = Vec::new();
    let mut receivers = Vec::new();

    for exec_cfg in &config.executors {
        exec_store.ensure_executor(&exec_cfg.executor_id)?;
        let (persisted_paused, _, persisted_latched) =
            exec_store.pause_state(&exec_cfg.executor_id)?;
        let pause = Arc::new(PauseFlag::new(persisted_paused, persisted_latched));

        let monitor = Arc::new(AccountMonitor::new(
            exec_cfg.executor_id.clone(),
            broker.clone(),
            exec_store.clone(),
            config.broker.paper_equity,
            Duration::from_secs(config.risk.snapshot_ttl_secs),
        ));

        let executor = Arc::new(Executor::new(
            exec_cfg.clone(),
            broker.clone(),
            exec_store.clone(),
            RiskGate::new(exec_cfg.clone(), monitor.clone()),
            pause.clone(),
            config.broker.min_notional,
            config.features.simulation_fallback,
        ));

        let (tx, rx) = mpsc::channel(256);
        endpoints.push(ExecutorEndpoint {
            executor_id: exec_cfg.executor_id.clone(),
            min_confidence: exec_cfg.min_confidence,
            symbols: exec_cfg.symbols.clone(),
            pause: pause.clone(),
            tx,
        });
        receivers.push((executor.clone(), rx));

        guarded.push(GuardedExecutor {
            cfg: exec_cfg.clone(),
            monitor: monitor.clone(),
            pause,
        });
        monitors.insert(exec_cfg.executor_id.clone(), monitor);
        executors.push(executor);
    }

    // Risk guard: the authoritative periodic path.
    let guard = Arc::new(RiskGuard::new(guarded, exec_store.clone(), config.risk.clone()));
    tokio::spawn(guard.clone().run());

    // Generation loops: produce, never execute.
    let generation = Arc::new(SignalGenerationService::new(
        config.watchlist.iter().map(|w| w.spec()).collect(),
        adapters,
        consensus,
        regime,
        price_book.clone(),
        signal_store.clone(),
        Duration::from_secs(config.generation.cadence_secs),
        Duration::from_millis(config.generation.cycle_deadline_ms),
        config.features.force_24_7_mode,
    ));
    generation.spawn_all();

    // Distribution + execution, gated by the auto_execute flag.
    if config.features.auto_execute {
        for (executor, rx) in receivers {
            tokio::spawn(executor.run(rx));
        }
        let distributor = Arc::new(SignalDistributor::new(
            signal_store.clone(),
            exec_store.clone(),
            endpoints,
            Duration::from_secs(1),
        ));
        tokio::spawn(distributor.run());
        info!("distributor wired to executors");
    } else {
        warn!("auto_execute disabled; running as a signal-only service");
    }

    // Outcome reconciliation and expiry.
    let reconciler = Arc::new(OutcomeReconciler::new(
        config.executors.iter().map(|e| e.executor_id.clone()).collect(),
        exec_store.clone(),
        signal_store.clone(),
        price_book,
        config.reconciler.clone(),
    ));
    tokio::spawn(reconciler.run());

    // Store maintenance, daily cadence.
    {
        let store = signal_store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.optimize() {
                    warn!(error = %e, "store maintenance failed");
                }
            }
        });
    }

    let state = AppState {
        jwt: Arc::new(JwtHandler::new(config.auth.jwt_secret.clone())),
        config: config.clone(),
        signal_store,
        exec_store,
        executors,
        monitors,
        guard,
        broker,
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.http.bind, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    Ok(())
}

fn run_backtest(
    config: &AppConfig,
    symbol: &str,
    class: &str,
    bars_path: &PathBuf,
) -> Result<()> {
    let class = match class.to_ascii_lowercase().as_str() {
        "stock" => AssetClass::Stock,
        "crypto" => AssetClass::Crypto,
        other => anyhow::bail!("unknown asset class {:?} (expected stock or crypto)", other),
    };
    let spec = SymbolSpec::new(symbol, class);

    let raw = std::fs::read_to_string(bars_path)
        .with_context(|| format!("failed to read bars file {}", bars_path.display()))?;
    let bars: Vec<Bar> =
        serde_json::from_str(&raw).context("bars file must hold a JSON array of bars")?;
    info!(symbol = %spec.symbol, bars = bars.len(), "starting backtest");

    let backtester = Backtester::new(
        config.consensus.clone(),
        TrackWeights {
            stock: config.sources.stock_weights.clone(),
            crypto: config.sources.crypto_weights.clone(),
        },
        CostModel::from_config(&config.backtest),
        config.backtest.bootstrap_seed,
    );

    let run_id = format!("bt-{}", uuid::Uuid::new_v4().simple());
    let report = backtester.run(&spec, &bars, &run_id)?;

    let store = SignalStore::new(&config.database.signals_path)?;
    store.record_backtest_run(&report.run)?;
    info!(run_id = %report.run.run_id, "backtest run persisted");

    println!("{}", serde_json::to_string_pretty(&report.run)?);
    Ok(())
}

fn build_adapters(
    config: &AppConfig,
    http_client: &reqwest::Client,
    price_book: &Arc<PriceBook>,
) -> Vec<Arc<dyn SourceAdapter>> {
    let sources = &config.sources;
    let cooldown = Duration::from_secs(sources.trip_cooldown_secs);

    let trend: Arc<dyn SourceAdapter> = Arc::new(TrendAdapter::new(
        TrendConfig::default(),
        Duration::from_millis(sources.timeout_ms("trend")),
        price_book.clone(),
    ));

    let quote_vendor: Arc<dyn SourceAdapter> = Arc::new(QuoteVendorAdapter::new(
        http_client.clone(),
        sources.quote_vendor_url.clone(),
        secret_from_env("QUOTE_VENDOR_API_KEY"),
        Duration::from_millis(sources.timeout_ms("quote_vendor")),
        sources
            .rate_limits_per_min
            .get("quote_vendor")
            .copied()
            .unwrap_or(120),
        Arc::new(AdapterHealth::new(
            "quote_vendor",
            sources.trip_threshold,
            cooldown,
        )),
        price_book.clone(),
    ));

    let sentiment: Arc<dyn SourceAdapter> = Arc::new(NewsSentimentAdapter::new(
        http_client.clone(),
        sources.news_vendor_url.clone(),
        secret_from_env("NEWS_VENDOR_API_KEY"),
        Duration::from_millis(sources.timeout_ms("news_sentiment")),
        sources
            .rate_limits_per_min
            .get("news_sentiment")
            .copied()
            .unwrap_or(30),
        config.features.force_24_7_mode,
        Arc::new(AdapterHealth::new(
            "news_sentiment",
            sources.trip_threshold,
            cooldown,
        )),
    ));

    vec![trend, quote_vendor, sentiment]
}

fn build_broker(config: &AppConfig, http_client: &reqwest::Client) -> Arc<dyn BrokerClient> {
    let key_id = secret_from_env(&config.broker.key_id_env);
    let secret = secret_from_env(&config.broker.secret_env);

    match (key_id, secret) {
        (Some(key_id), Some(secret)) => {
            info!(base_url = %config.broker.base_url, "live broker credentials resolved");
            Arc::new(RestBroker::new(
                http_client.clone(),
                config.broker.base_url.clone(),
                key_id,
                secret,
                Duration::from_millis(config.broker.request_timeout_ms),
            ))
        }
        _ => {
            warn!("no broker credentials; paper broker active");
            Arc::new(PaperBroker::new(config.broker.paper_equity))
        }
    }
}
