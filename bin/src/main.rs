//! execd — spot-trading execution core entry point.
//!
//! Parses CLI arguments, loads configuration, wires the exchange and
//! collaborator stubs, and runs the engine until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use engine_core::coid::CoidManager;
use engine_core::collaborators::{AlwaysPassGuard, NeverSignalEvaluator, StaticMarketDataFeed};
use engine_core::config::Config;
use engine_core::engine::{Engine, EngineConfig};
use engine_core::exchange::simulated::SimulatedExchange;
use engine_core::exchange::ExchangeWrapper;
use engine_core::fsm::exit_engine::ExitConfig;
use engine_core::fsm::snapshot::SnapshotManager;
use engine_core::fsm::timeouts::TimeoutConfig;
use engine_core::fsm::FsmConfig;
use engine_core::ledger::Ledger;
use engine_core::portfolio::Portfolio;
use engine_core::router::RouterConfig;
use engine_core::telemetry::Telemetry;
use engine_core::utils::logger::init_logger;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Startup exit codes (§6): 0 normal, non-zero on unrecoverable failure.
mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const SNAPSHOT_DIR: i32 = 2;
    pub const COID_RECONCILE: i32 = 3;
}

#[derive(Parser, Debug)]
#[command(author, version, about = "execution core for a spot-trading engine")]
struct Args {
    /// Path to a TOML config file (optional; env/defaults still apply).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated watchlist, overrides nothing in config — this is the
    /// one piece of operational state the config loader doesn't carry.
    #[arg(short, long, default_value = "BTC/USDT")]
    watchlist: String,

    /// Starting USDT budget for the in-tree simulated exchange.
    #[arg(long, default_value_t = 10_000.0)]
    budget: f64,

    /// State/log directory root.
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(exit_code::CONFIG);
        }
    };

    init_logger(&config.log_level, config.json_logs);
    info!("execd starting");

    if let Err(e) = std::fs::create_dir_all(&args.state_dir) {
        error!(error = %e, path = ?args.state_dir, "snapshot_dir_not_writable");
        std::process::exit(exit_code::SNAPSHOT_DIR);
    }

    let watchlist: Vec<String> = args
        .watchlist
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    // The real exchange, market-data, signal, and guard collaborators are
    // external to this crate (§1's Non-goals); the simulated exchange and
    // pass-through stubs below stand in so execd runs end to end on its own.
    let exchange: Arc<dyn ExchangeWrapper> = Arc::new(SimulatedExchange::new(Decimal::from(5)));
    let ledger = Arc::new(Ledger::new(args.state_dir.join("ledger.jsonl")));
    let budget = Decimal::from_f64(args.budget).context("invalid --budget")?;
    let portfolio = Arc::new(Portfolio::new(budget, ledger));
    let coid_manager = Arc::new(CoidManager::new(args.state_dir.join(&config.coid_store_path))?);
    let snapshots = Arc::new(SnapshotManager::new(args.state_dir.join(&config.fsm_snapshot_dir)));
    let telemetry = Arc::new(Telemetry::new(args.state_dir.join(&config.telemetry_dir))?);

    let engine_config = EngineConfig {
        watchlist,
        tick: Duration::from_millis(config.tick_ms),
        fsm: FsmConfig {
            max_trades: config.max_trades,
            position_size_usdt: Decimal::from_f64(config.position_size_usdt).unwrap_or_default(),
            min_slot_usdt: Decimal::from_f64(config.min_slot_usdt).unwrap_or_default(),
            trailing_distance: Decimal::from_f64(config.exit.trailing_pct).unwrap_or_default(),
            symbol_cooldown_minutes: config.symbol_cooldown_minutes,
            position_eval_every_n_ticks: 1,
        },
        router: RouterConfig {
            max_retries: config.router.max_retries,
            retry_backoff: Duration::from_millis(config.router.backoff_ms),
            tif: match config.router.tif.as_str() {
                "FOK" => engine_core::exchange::TimeInForce::Fok,
                "GTC" => engine_core::exchange::TimeInForce::Gtc,
                _ => engine_core::exchange::TimeInForce::Ioc,
            },
            slippage_bps: Decimal::from_f64(config.router.slippage_bps).unwrap_or_default(),
            fill_wait_timeout: Duration::from_secs(config.buy_fill_timeout_secs),
        },
        exit: ExitConfig {
            sl_pct: Decimal::from_f64(config.exit.hard_sl_pct).unwrap_or_default(),
            tp_pct: Decimal::from_f64(config.exit.hard_tp_pct).unwrap_or_default(),
            trailing_enabled: config.exit.trailing_enable,
            trail_pct: Decimal::from_f64(config.exit.trailing_pct).unwrap_or_default(),
            max_hold_secs: config.exit.max_hold_s,
        },
        timeouts: TimeoutConfig {
            buy_fill_timeout_secs: config.buy_fill_timeout_secs,
            sell_fill_timeout_secs: config.sell_fill_timeout_secs,
            cooldown_secs: config.symbol_cooldown_minutes * 60,
            trade_ttl_min: config.trade_ttl_min,
            ..TimeoutConfig::default()
        },
    };

    let mut engine = match Engine::bootstrap(
        engine_config,
        exchange,
        portfolio,
        coid_manager,
        snapshots,
        telemetry,
        Arc::new(StaticMarketDataFeed::new()),
        Arc::new(AlwaysPassGuard),
        Box::new(NeverSignalEvaluator),
    )
    .await
    {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "coid_reconciliation_failed");
            std::process::exit(exit_code::COID_RECONCILE);
        }
    };

    let running = engine.running_handle();
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        running.store(false, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    engine.run().await;
    info!("execd exited cleanly");
    std::process::exit(exit_code::OK);
}
