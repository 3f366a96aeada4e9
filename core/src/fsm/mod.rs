//! SymbolFSM (C6, §4.6): the per-symbol phase machine covering entry, hold,
//! exit, cooldown, and error. `process` is the single entry point the
//! engine calls once per tick per symbol.

pub mod actions;
pub mod exit_engine;
pub mod snapshot;
pub mod timeouts;
pub mod transitions;

use crate::coid::{CoidManager, CoidStatus};
use crate::collaborators::{EntryGuard, MarketDataFeed, SignalEvaluator};
use crate::portfolio::{Portfolio, Position};
use crate::reconciler::Reconciler;
use crate::router::{OrderRouter, RouterOutcome};
use crate::types::{now_ms, CoinState, EventContext, FSMEvent, Intent, Phase, Side};
use actions::Action;
use exit_engine::ExitEngine;
use rust_decimal::Decimal;
use snapshot::SnapshotManager;
use std::sync::Arc;
use timeouts::TimeoutManager;
use tracing::{info, warn};
use transitions::TransitionTable;

#[derive(Debug, Clone, Copy)]
pub struct FsmConfig {
    pub max_trades: usize,
    pub position_size_usdt: Decimal,
    pub min_slot_usdt: Decimal,
    pub trailing_distance: Decimal,
    pub symbol_cooldown_minutes: u64,
    pub position_eval_every_n_ticks: u32,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            max_trades: 5,
            position_size_usdt: Decimal::from(100),
            min_slot_usdt: Decimal::from(10),
            trailing_distance: Decimal::new(5, 3), // 0.5%
            symbol_cooldown_minutes: 15,
            position_eval_every_n_ticks: 1,
        }
    }
}

/// Two-phase boundary around the buy-fill commit (§9): captures the
/// pre-images of `CoinState` and the symbol's `Portfolio` position before
/// the fill is applied, so a failed commit (snapshot write failure) can
/// restore both rather than leave them diverged.
struct BuyFillTransaction {
    symbol: String,
    prior_state: CoinState,
    prior_position: Position,
}

impl BuyFillTransaction {
    fn capture(symbol: &str, state: &CoinState, portfolio: &Portfolio) -> Self {
        Self {
            symbol: symbol.to_string(),
            prior_state: state.clone(),
            prior_position: portfolio.position(symbol),
        }
    }

    /// Commit is implicit: dropping the transaction with no call to
    /// `rollback` leaves the already-applied mutation in place.
    fn commit(self) {}

    fn rollback(self, state: &mut CoinState, portfolio: &Portfolio) {
        portfolio.restore_position(&self.symbol, self.prior_position);
        *state = self.prior_state;
    }
}

pub struct SymbolFSM {
    pub symbol: String,
    pub state: CoinState,
    config: FsmConfig,
    table: Arc<TransitionTable>,
    exit_engine: ExitEngine,
    timeouts: Arc<TimeoutManager>,
    router: Arc<OrderRouter>,
    reconciler: Arc<Reconciler>,
    coid_manager: Arc<CoidManager>,
    snapshots: Arc<SnapshotManager>,
    portfolio: Arc<Portfolio>,
    tick_counter: u32,
}

impl SymbolFSM {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        state: CoinState,
        config: FsmConfig,
        table: Arc<TransitionTable>,
        exit_engine: ExitEngine,
        timeouts: Arc<TimeoutManager>,
        router: Arc<OrderRouter>,
        reconciler: Arc<Reconciler>,
        coid_manager: Arc<CoidManager>,
        snapshots: Arc<SnapshotManager>,
        portfolio: Arc<Portfolio>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            state,
            config,
            table,
            exit_engine,
            timeouts,
            router,
            reconciler,
            coid_manager,
            snapshots,
            portfolio,
            tick_counter: 0,
        }
    }

    /// Looks up `(phase, event)` in the transition table. A missing pair is
    /// logged as `fsm_invalid_transition` and leaves the phase unchanged
    /// (§7). A hit advances the phase, applies the bookkeeping action, and
    /// persists a snapshot.
    fn apply_event(&mut self, event: FSMEvent, ctx: &EventContext) {
        self.apply_event_checked(event, ctx);
    }

    /// Same transition as `apply_event`, but reports whether the snapshot
    /// write that follows it succeeded. `finish_buy`'s two-phase commit is
    /// the only caller that needs to know — every other call site treats a
    /// snapshot failure as already handled by the warning it logs.
    fn apply_event_checked(&mut self, event: FSMEvent, ctx: &EventContext) -> bool {
        let Some((next_phase, action)) = self.table.lookup(self.state.phase, event) else {
            warn!(symbol = %self.symbol, phase = ?self.state.phase, ?event, "fsm_invalid_transition");
            return true;
        };
        let from = self.state.phase;
        self.state.phase = next_phase;
        self.state.phase_entered_ts = now_ms();
        self.state.push_history(from, next_phase, event);
        actions::apply(action, &mut self.state, ctx, self.config.symbol_cooldown_minutes);

        let committed = match self.snapshots.save_snapshot(&self.state) {
            Ok(()) => true,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "snapshot_write_failed");
                false
            }
        };
        info!(symbol = %self.symbol, ?from, to = ?next_phase, ?event, "fsm_transition");
        committed
    }

    /// Advances this symbol's FSM one tick. `active_positions` is the count
    /// of symbols currently holding a position, across the whole engine
    /// (used by the IDLE phase's slot-admission check).
    pub async fn process(
        &mut self,
        market: &dyn MarketDataFeed,
        guard: &dyn EntryGuard,
        signal: &mut dyn SignalEvaluator,
        active_positions: usize,
    ) {
        for event in self.timeouts.check_all_timeouts(&self.state) {
            let ctx = EventContext::new(self.symbol.clone());
            self.apply_event(event, &ctx);
        }

        let Some(snap) = market.snapshot(&self.symbol) else {
            return;
        };
        self.state.current_price = snap.last;
        if snap.last > self.state.peak_price {
            self.state.peak_price = snap.last;
        }

        match self.state.phase {
            Phase::Warmup => self.process_warmup(),
            Phase::Idle => self.process_idle(active_positions),
            Phase::EntryEval => self.process_entry_eval(&snap, guard, signal),
            Phase::PlaceBuy => self.process_place_buy(snap.last).await,
            Phase::Position => self.process_position(),
            Phase::ExitEval => self.process_exit_eval(),
            Phase::PlaceSell => self.process_place_sell(snap.last).await,
            Phase::PostTrade => self.process_post_trade(),
            // WaitFill/WaitSellFill/Cooldown/Error advance purely via
            // timeouts or the order-submission phases above; nothing else
            // to do here on a plain tick.
            Phase::WaitFill | Phase::WaitSellFill | Phase::Cooldown | Phase::Error => {}
        }
    }

    fn process_warmup(&mut self) {
        let ctx = EventContext::new(self.symbol.clone());
        self.apply_event(FSMEvent::WarmupCompleted, &ctx);
    }

    fn process_idle(&mut self, active_positions: usize) {
        if self.state.cooldown_until > now_ms() {
            return;
        }
        if active_positions >= self.config.max_trades {
            return;
        }
        self.state.decision_id = Some(format!("dec-{}-{}", self.symbol.replace('/', ""), now_ms()));
        let ctx = EventContext::new(self.symbol.clone());
        self.apply_event(FSMEvent::SlotAvailable, &ctx);
    }

    fn process_entry_eval(
        &mut self,
        snap: &crate::types::Snapshot,
        guard: &dyn EntryGuard,
        signal: &mut dyn SignalEvaluator,
    ) {
        let (passes, reasons) = guard.passes(&self.symbol, snap);
        if !passes {
            let mut ctx = EventContext::new(self.symbol.clone());
            ctx.data.insert("reasons".into(), serde_json::json!(reasons));
            self.apply_event(FSMEvent::GuardsBlocked, &ctx);
            return;
        }
        signal.update(&self.symbol, snap.last);
        let (triggered, rationale) = signal.evaluate(&self.symbol, snap.last);
        let mut ctx = EventContext::new(self.symbol.clone());
        ctx.data.insert("rationale".into(), rationale);
        if triggered {
            self.apply_event(FSMEvent::SignalDetected, &ctx);
        } else {
            self.apply_event(FSMEvent::NoSignal, &ctx);
        }
    }

    async fn process_place_buy(&mut self, price: Decimal) {
        let quote_budget = (self.portfolio.free_cash() / Decimal::from(self.config.max_trades.max(1)))
            .min(self.config.position_size_usdt);
        if quote_budget < self.config.min_slot_usdt || price <= Decimal::ZERO {
            let ctx = EventContext::new(self.symbol.clone());
            self.apply_event(FSMEvent::OrderPlacementFailed, &ctx);
            return;
        }
        let qty = quote_budget / price;
        let Some(decision_id) = self.state.decision_id.clone() else {
            let ctx = EventContext::new(self.symbol.clone());
            self.apply_event(FSMEvent::OrderPlacementFailed, &ctx);
            return;
        };

        let coid = match self
            .coid_manager
            .next_client_order_id(&decision_id, 0, Side::Buy, &self.symbol, false)
        {
            Ok(c) => c,
            Err(e) => {
                let mut ctx = EventContext::new(self.symbol.clone());
                ctx.error = Some(e.to_string());
                self.apply_event(FSMEvent::ErrorOccurred, &ctx);
                return;
            }
        };

        let intent = Intent {
            intent_id: Intent::entry_id(&decision_id, 0, Side::Buy, now_ms()),
            symbol: self.symbol.clone(),
            side: Side::Buy,
            qty,
            limit_price: Some(price),
            reason: "entry_signal".into(),
            rule_code: "ENTRY".into(),
            inputs_hash: coid.clone(),
        };

        self.state.client_order_id = Some(coid.clone());
        self.state.order_placed_ts = now_ms();

        let result = self.router.handle_intent(&intent, Some(price)).await;
        let Some(order_id) = result.order_id.clone() else {
            let mut ctx = EventContext::new(self.symbol.clone());
            ctx.error = Some("no order_id returned".into());
            self.apply_event(FSMEvent::OrderPlacementFailed, &ctx);
            return;
        };
        self.state.order_id = Some(order_id.clone());
        let _ = self.coid_manager.update_status(&coid, CoidStatus::Pending, Some(order_id.clone()), None);

        let mut ctx = EventContext::new(self.symbol.clone());
        ctx.order_id = Some(order_id.clone());
        ctx.decision_id = Some(decision_id);
        self.apply_event(FSMEvent::BuyOrderPlaced, &ctx);

        self.finish_buy(&order_id, result.outcome).await;
    }

    async fn finish_buy(&mut self, order_id: &str, outcome: RouterOutcome) {
        match outcome {
            RouterOutcome::Success | RouterOutcome::PartialSuccess => {
                let pre_image = BuyFillTransaction::capture(&self.symbol, &self.state, &self.portfolio);

                let summary = self.reconciler.reconcile_order(&self.symbol, order_id).await;
                let Some(summary) = summary else {
                    let ctx = EventContext::new(self.symbol.clone());
                    self.apply_event(FSMEvent::BuyOrderTimeout, &ctx);
                    return;
                };
                self.state.amount = summary.qty_delta;
                self.state.entry_price = if summary.qty_delta > Decimal::ZERO {
                    summary.notional / summary.qty_delta
                } else {
                    self.state.current_price
                };
                self.state.entry_ts = now_ms();
                self.state.entry_fee_per_unit = if summary.qty_delta > Decimal::ZERO {
                    summary.fees / summary.qty_delta
                } else {
                    Decimal::ZERO
                };
                self.state.peak_price = self.state.entry_price;

                let mut ctx = EventContext::new(self.symbol.clone());
                ctx.order_id = Some(order_id.to_string());
                ctx.filled_qty = Some(summary.qty_delta);
                let event = if matches!(outcome, RouterOutcome::Success) {
                    FSMEvent::BuyOrderFilled
                } else {
                    FSMEvent::BuyOrderPartial
                };

                if self.apply_event_checked(event, &ctx) {
                    pre_image.commit();
                } else {
                    warn!(symbol = %self.symbol, order_id, "buy_fill_commit_failed_rolling_back");
                    pre_image.rollback(&mut self.state, &self.portfolio);
                }
            }
            RouterOutcome::FailedFinal(reason) => {
                let mut ctx = EventContext::new(self.symbol.clone());
                ctx.error = Some(reason);
                self.apply_event(FSMEvent::BuyAborted, &ctx);
            }
        }
    }

    fn process_position(&mut self) {
        self.tick_counter = self.tick_counter.wrapping_add(1);
        if self.tick_counter % self.config.position_eval_every_n_ticks.max(1) != 0 {
            return;
        }
        let trigger = self.state.peak_price * (Decimal::ONE - self.config.trailing_distance);
        self.state.trailing_trigger = Some(trigger);
        let ctx = EventContext::new(self.symbol.clone());
        self.apply_event(FSMEvent::TickReceived, &ctx);
    }

    fn process_exit_eval(&mut self) {
        let position = crate::portfolio::Position {
            symbol: self.symbol.clone(),
            qty: self.state.amount,
            avg_price: self.state.entry_price,
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            opened_ts: self.state.entry_ts,
            state: crate::portfolio::PositionState::Open,
        };
        let signal = self.exit_engine.evaluate(
            &position,
            self.state.current_price,
            self.state.peak_price,
            self.state.entry_ts,
            now_ms(),
        );
        let mut ctx = EventContext::new(self.symbol.clone());
        match signal {
            Some(sig) => {
                self.state.exit_reason = Some(format!("{:?}", sig.rule));
                self.apply_event(sig.rule.event(), &ctx);
            }
            None => {
                ctx.data.insert("phase".into(), serde_json::json!("no_exit"));
                self.apply_event(FSMEvent::NoExitSignal, &ctx);
            }
        }
    }

    async fn process_place_sell(&mut self, price: Decimal) {
        let Some(decision_id) = self.state.decision_id.clone() else {
            let ctx = EventContext::new(self.symbol.clone());
            self.apply_event(FSMEvent::OrderPlacementFailed, &ctx);
            return;
        };

        let coid = match self
            .coid_manager
            .next_client_order_id(&decision_id, 1, Side::Sell, &self.symbol, false)
        {
            Ok(c) => c,
            Err(e) => {
                let mut ctx = EventContext::new(self.symbol.clone());
                ctx.error = Some(e.to_string());
                self.apply_event(FSMEvent::ErrorOccurred, &ctx);
                return;
            }
        };

        let intent = Intent {
            intent_id: Intent::entry_id(&decision_id, 1, Side::Sell, now_ms()),
            symbol: self.symbol.clone(),
            side: Side::Sell,
            qty: self.state.amount,
            limit_price: Some(price),
            reason: self.state.exit_reason.clone().unwrap_or_default(),
            rule_code: "EXIT".into(),
            inputs_hash: coid.clone(),
        };

        self.state.client_order_id = Some(coid.clone());
        self.state.order_placed_ts = now_ms();

        let result = self.router.handle_intent(&intent, Some(price)).await;
        let Some(order_id) = result.order_id.clone() else {
            let mut ctx = EventContext::new(self.symbol.clone());
            ctx.error = Some("no order_id returned".into());
            self.apply_event(FSMEvent::OrderPlacementFailed, &ctx);
            return;
        };
        self.state.order_id = Some(order_id.clone());

        let mut ctx = EventContext::new(self.symbol.clone());
        ctx.order_id = Some(order_id.clone());
        self.apply_event(FSMEvent::SellOrderPlaced, &ctx);

        self.finish_sell(&order_id, result.outcome).await;
    }

    async fn finish_sell(&mut self, order_id: &str, outcome: RouterOutcome) {
        match outcome {
            RouterOutcome::Success | RouterOutcome::PartialSuccess => {
                let summary = self.reconciler.reconcile_order(&self.symbol, order_id).await;
                let Some(summary) = summary else {
                    let ctx = EventContext::new(self.symbol.clone());
                    self.apply_event(FSMEvent::SellOrderTimeout, &ctx);
                    return;
                };
                let mut ctx = EventContext::new(self.symbol.clone());
                ctx.order_id = Some(order_id.to_string());
                ctx.filled_qty = Some(summary.qty_delta);
                let event = if matches!(outcome, RouterOutcome::Success) {
                    FSMEvent::SellOrderFilled
                } else {
                    FSMEvent::SellOrderPartial
                };
                self.apply_event(event, &ctx);
            }
            RouterOutcome::FailedFinal(reason) => {
                let mut ctx = EventContext::new(self.symbol.clone());
                ctx.error = Some(reason);
                self.apply_event(FSMEvent::SellAborted, &ctx);
            }
        }
    }

    fn process_post_trade(&mut self) {
        self.state.clear_position();
        let ctx = EventContext::new(self.symbol.clone());
        self.apply_event(FSMEvent::TradeComplete, &ctx);
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coid::CoidManager;
    use crate::collaborators::{AlwaysPassGuard, NeverSignalEvaluator, StaticMarketDataFeed};
    use crate::exchange::simulated::SimulatedExchange;
    use crate::ledger::Ledger;
    use crate::portfolio::Portfolio;
    use crate::types::Snapshot;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn make_fsm(dir: &std::path::Path) -> SymbolFSM {
        let exchange = Arc::new(SimulatedExchange::new(dec!(0)).with_fixed_fill_price(dec!(100)));
        let ledger = Arc::new(Ledger::new(dir.join("ledger.jsonl")));
        let portfolio = Arc::new(Portfolio::new(dec!(10_000), ledger));
        let router = Arc::new(OrderRouter::new(
            exchange.clone(),
            portfolio.clone(),
            crate::router::RouterConfig::default(),
            |_, _| {},
        ));
        let reconciler = Arc::new(Reconciler::new(exchange, portfolio));
        let coid_manager = Arc::new(CoidManager::new(dir.join("coid_kv.json")).unwrap());
        let snapshots = Arc::new(SnapshotManager::new(dir.join("snapshots")));
        let table = Arc::new(TransitionTable::build().unwrap());
        let timeouts = Arc::new(TimeoutManager::new(timeouts::TimeoutConfig::default()));
        let exit_engine = ExitEngine::new(exit_engine::ExitConfig {
            sl_pct: dec!(0.02),
            tp_pct: dec!(0.03),
            trailing_enabled: true,
            trail_pct: dec!(0.01),
            max_hold_secs: 3600,
        });

        let mut state = CoinState::new("BTC/USDT");
        state.phase = Phase::Warmup;
        SymbolFSM::new(
            "BTC/USDT",
            state,
            FsmConfig::default(),
            table,
            exit_engine,
            timeouts,
            router,
            reconciler,
            coid_manager,
            snapshots,
            portfolio,
        )
    }

    #[tokio::test]
    async fn warmup_moves_to_idle_on_first_tick() {
        let dir = tempdir().unwrap();
        let mut fsm = make_fsm(dir.path());
        let market = StaticMarketDataFeed::new();
        let guard = AlwaysPassGuard;
        let mut signal = NeverSignalEvaluator;
        fsm.process(&market, &guard, &mut signal, 0).await;
        assert_eq!(fsm.state.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn idle_does_nothing_without_market_data() {
        let dir = tempdir().unwrap();
        let mut fsm = make_fsm(dir.path());
        fsm.state.phase = Phase::Idle;
        let market = StaticMarketDataFeed::new();
        let guard = AlwaysPassGuard;
        let mut signal = NeverSignalEvaluator;
        fsm.process(&market, &guard, &mut signal, 0).await;
        assert_eq!(fsm.state.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn idle_enters_entry_eval_when_slot_available() {
        let dir = tempdir().unwrap();
        let mut fsm = make_fsm(dir.path());
        fsm.state.phase = Phase::Idle;
        let mut market = StaticMarketDataFeed::new();
        market.set(
            "BTC/USDT",
            Snapshot {
                last: dec!(100),
                bid: dec!(99.9),
                ask: dec!(100.1),
                volume: dec!(1),
                ts: now_ms(),
            },
        );
        let guard = AlwaysPassGuard;
        let mut signal = NeverSignalEvaluator;
        fsm.process(&market, &guard, &mut signal, 0).await;
        assert_eq!(fsm.state.phase, Phase::EntryEval);
        assert!(fsm.state.decision_id.is_some());
    }

    #[tokio::test]
    async fn entry_eval_with_no_signal_returns_to_idle_with_cooldown() {
        let dir = tempdir().unwrap();
        let mut fsm = make_fsm(dir.path());
        fsm.state.phase = Phase::EntryEval;
        let mut market = StaticMarketDataFeed::new();
        market.set(
            "BTC/USDT",
            Snapshot {
                last: dec!(100),
                bid: dec!(99.9),
                ask: dec!(100.1),
                volume: dec!(1),
                ts: now_ms(),
            },
        );
        let guard = AlwaysPassGuard;
        let mut signal = NeverSignalEvaluator;
        fsm.process(&market, &guard, &mut signal, 0).await;
        assert_eq!(fsm.state.phase, Phase::Idle);
        assert!(fsm.state.cooldown_until > now_ms());
    }
}
