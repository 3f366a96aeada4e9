//! Engine (C10, §4.10): the tick loop driving one `SymbolFSM` per watched
//! symbol, startup reconciliation ordering (AS.8), and the in-process event
//! bus that decouples the router from its subscribers.

use crate::coid::CoidManager;
use crate::collaborators::{EntryGuard, MarketDataFeed, SignalEvaluator};
use crate::errors::{CoidError, SnapshotError};
use crate::exchange::ExchangeWrapper;
use crate::fsm::exit_engine::{ExitConfig, ExitEngine};
use crate::fsm::snapshot::SnapshotManager;
use crate::fsm::timeouts::{TimeoutConfig, TimeoutManager};
use crate::fsm::transitions::TransitionTable;
use crate::fsm::{FsmConfig, SymbolFSM};
use crate::portfolio::Portfolio;
use crate::reconciler::Reconciler;
use crate::router::{OrderRouter, RouterConfig};
use crate::telemetry::Telemetry;
use crate::types::CoinState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("coid reconciliation failed: {0}")]
    CoidReconcile(#[from] CoidError),
    #[error("snapshot recovery failed: {0}")]
    SnapshotRecover(#[from] SnapshotError),
}

/// Fire-and-forget publish/subscribe bus (§5). Publish runs subscribers
/// synchronously; a subscriber panic is caught and logged rather than
/// propagated, matching §4.10's "exceptions in subscribers swallowed and
/// logged".
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Box<dyn Fn(&serde_json::Value) + Send + Sync>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        event: impl Into<String>,
        handler: impl Fn(&serde_json::Value) + Send + Sync + 'static,
    ) {
        self.subscribers
            .write()
            .entry(event.into())
            .or_default()
            .push(Box::new(handler));
    }

    pub fn publish(&self, event: &str, payload: serde_json::Value) {
        let subscribers = self.subscribers.read();
        let Some(handlers) = subscribers.get(event) else {
            return;
        };
        for handler in handlers {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&payload)));
            if outcome.is_err() {
                tracing::warn!(event, "event_bus_subscriber_panicked");
            }
        }
    }
}

/// Everything needed to size and schedule the per-symbol FSMs, gathered so
/// `Engine::bootstrap` doesn't take a dozen positional arguments.
pub struct EngineConfig {
    pub watchlist: Vec<String>,
    pub tick: Duration,
    pub fsm: FsmConfig,
    pub router: RouterConfig,
    pub exit: ExitConfig,
    pub timeouts: TimeoutConfig,
}

/// Drives the watchlist's `SymbolFSM`s on a fixed tick. Owns no network
/// state directly — everything network-facing lives behind `ExchangeWrapper`
/// and is shared (via `Arc`) across every symbol's router and reconciler.
pub struct Engine {
    symbols: HashMap<String, SymbolFSM>,
    watchlist: Vec<String>,
    market: Arc<dyn MarketDataFeed>,
    guard: Arc<dyn EntryGuard>,
    signal: Box<dyn SignalEvaluator>,
    bus: Arc<EventBus>,
    telemetry: Arc<Telemetry>,
    tick: Duration,
    running: Arc<AtomicBool>,
    tick_counter: u64,
}

impl Engine {
    /// Performs the AS.8 startup sequence — `CoidManager::reconcile_with_exchange`
    /// then `SnapshotManager::recover_all_states` — before any FSM is built,
    /// then constructs one `SymbolFSM` per watchlist entry (restored from its
    /// snapshot when one exists, fresh in WARMUP otherwise).
    pub async fn bootstrap(
        config: EngineConfig,
        exchange: Arc<dyn ExchangeWrapper>,
        portfolio: Arc<Portfolio>,
        coid_manager: Arc<CoidManager>,
        snapshots: Arc<SnapshotManager>,
        telemetry: Arc<Telemetry>,
        market: Arc<dyn MarketDataFeed>,
        guard: Arc<dyn EntryGuard>,
        signal: Box<dyn SignalEvaluator>,
    ) -> Result<Self, EngineError> {
        let reconciled = coid_manager.reconcile_with_exchange(exchange.as_ref()).await?;
        info!(reconciled, "coid_reconciliation_complete");

        let mut recovered: HashMap<String, CoinState> = snapshots
            .recover_all_states()?
            .into_iter()
            .map(|s| (s.symbol.clone(), s))
            .collect();
        info!(count = recovered.len(), "snapshot_recovery_complete");

        let bus = Arc::new(EventBus::new());
        let table = Arc::new(
            TransitionTable::build().expect("transition table is built once from a static literal and has no duplicates"),
        );
        let timeouts = Arc::new(TimeoutManager::new(config.timeouts));

        let bus_for_router = bus.clone();
        let router = Arc::new(OrderRouter::new(
            exchange.clone(),
            portfolio.clone(),
            config.router,
            move |symbol, order_id| {
                bus_for_router.publish(
                    "order.filled",
                    serde_json::json!({"symbol": symbol, "order_id": order_id}),
                );
            },
        ));
        let reconciler = Arc::new(Reconciler::new(exchange, portfolio.clone()));

        let mut symbols = HashMap::with_capacity(config.watchlist.len());
        for symbol in &config.watchlist {
            let state = recovered
                .remove(symbol)
                .unwrap_or_else(|| CoinState::new(symbol.clone()));
            let fsm = SymbolFSM::new(
                symbol.clone(),
                state,
                config.fsm,
                table.clone(),
                ExitEngine::new(config.exit),
                timeouts.clone(),
                router.clone(),
                reconciler.clone(),
                coid_manager.clone(),
                snapshots.clone(),
                portfolio.clone(),
            );
            symbols.insert(symbol.clone(), fsm);
        }

        Ok(Self {
            symbols,
            watchlist: config.watchlist,
            market,
            guard,
            signal,
            bus,
            telemetry,
            tick: config.tick,
            running: Arc::new(AtomicBool::new(true)),
            tick_counter: 0,
        })
    }

    /// A clone of the shutdown flag, for a signal handler to clear.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    fn active_positions(&self) -> usize {
        self.symbols
            .values()
            .filter(|fsm| fsm.state.phase.requires_position())
            .count()
    }

    /// Runs until `running` is cleared. Each iteration: process every
    /// watchlist symbol once, then sleep out the remainder of the tick
    /// period. Shutdown takes effect after the in-flight tick finishes —
    /// every router/reconciler call a tick makes is already awaited inline,
    /// so there is no separate drain step.
    pub async fn run(&mut self) {
        info!(tick_ms = self.tick.as_millis(), watchlist = ?self.watchlist, "engine_started");
        while self.running.load(Ordering::SeqCst) {
            let t0 = Instant::now();
            self.tick_once().await;
            let elapsed = t0.elapsed();
            if elapsed < self.tick {
                tokio::time::sleep(self.tick - elapsed).await;
            }
        }
        info!("engine_shutdown_complete");
        self.telemetry
            .health("engine", "shutdown", "tick loop exited", serde_json::json!({}));
    }

    async fn tick_once(&mut self) {
        let n = self.tick_counter;
        self.tick_counter = self.tick_counter.wrapping_add(1);
        let active = self.active_positions();

        for symbol in &self.watchlist {
            if let Some(fsm) = self.symbols.get_mut(symbol) {
                fsm.process(self.market.as_ref(), self.guard.as_ref(), self.signal.as_mut(), active)
                    .await;
            }
        }

        if n % 120 == 0 {
            self.telemetry.health(
                "engine",
                "heartbeat",
                "tick",
                serde_json::json!({
                    "tick": n,
                    "active_positions": active,
                    "watchlist_size": self.watchlist.len(),
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coid::CoidManager;
    use crate::collaborators::{AlwaysPassGuard, NeverSignalEvaluator, StaticMarketDataFeed};
    use crate::exchange::simulated::SimulatedExchange;
    use crate::ledger::Ledger;
    use crate::types::Phase;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    async fn make_engine(dir: &std::path::Path, watchlist: Vec<&str>) -> Engine {
        let exchange: Arc<dyn ExchangeWrapper> =
            Arc::new(SimulatedExchange::new(dec!(0)).with_fixed_fill_price(dec!(100)));
        let ledger = Arc::new(Ledger::new(dir.join("ledger.jsonl")));
        let portfolio = Arc::new(Portfolio::new(dec!(10_000), ledger));
        let coid_manager = Arc::new(CoidManager::new(dir.join("coid_kv.json")).unwrap());
        let snapshots = Arc::new(SnapshotManager::new(dir.join("snapshots")));
        let telemetry = Arc::new(Telemetry::new(dir.join("logs")).unwrap());

        let config = EngineConfig {
            watchlist: watchlist.into_iter().map(String::from).collect(),
            tick: Duration::from_millis(10),
            fsm: FsmConfig::default(),
            router: RouterConfig::default(),
            exit: ExitConfig {
                sl_pct: dec!(0.02),
                tp_pct: dec!(0.03),
                trailing_enabled: true,
                trail_pct: dec!(0.01),
                max_hold_secs: 3600,
            },
            timeouts: TimeoutConfig::default(),
        };

        Engine::bootstrap(
            config,
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
        .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_builds_one_fsm_per_watchlist_symbol() {
        let dir = tempdir().unwrap();
        let engine = make_engine(dir.path(), vec!["BTC/USDT", "ETH/USDT"]).await;
        assert_eq!(engine.symbols.len(), 2);
        assert_eq!(engine.symbols["BTC/USDT"].state.phase, Phase::Warmup);
    }

    #[tokio::test]
    async fn tick_advances_warmup_to_idle() {
        let dir = tempdir().unwrap();
        let mut engine = make_engine(dir.path(), vec!["BTC/USDT"]).await;
        engine.tick_once().await;
        assert_eq!(engine.symbols["BTC/USDT"].state.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn bootstrap_resumes_from_an_existing_snapshot() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotManager::new(dir.path().join("snapshots"));
        let mut state = CoinState::new("BTC/USDT");
        state.phase = Phase::Idle;
        snapshots.save_snapshot(&state).unwrap();

        let engine = make_engine(dir.path(), vec!["BTC/USDT"]).await;
        assert_eq!(engine.symbols["BTC/USDT"].state.phase, Phase::Idle);
    }

    #[test]
    fn event_bus_delivers_and_swallows_subscriber_panics() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe("order.filled", move |_payload| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe("order.filled", |_payload| panic!("subscriber exploded"));

        bus.publish("order.filled", serde_json::json!({"symbol": "BTC/USDT"}));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
