//! Shared domain types: phases, events, per-symbol state, intents.
//!
//! `CoinState` is the mutable record the FSM advances; `FSMEvent` is the sum
//! type the transition table dispatches on; `Intent` is the immutable order
//! request handed to the router.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A market snapshot produced by the market-data collaborator (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Snapshot {
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: Decimal,
    pub ts: u64,
}

/// Exchange-supplied filters for a symbol, cached process-wide once loaded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
    pub min_qty: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// The 12 phases of the per-symbol FSM (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Warmup,
    Idle,
    EntryEval,
    PlaceBuy,
    WaitFill,
    Position,
    ExitEval,
    PlaceSell,
    WaitSellFill,
    PostTrade,
    Cooldown,
    Error,
}

impl Phase {
    pub const ALL: [Phase; 12] = [
        Phase::Warmup,
        Phase::Idle,
        Phase::EntryEval,
        Phase::PlaceBuy,
        Phase::WaitFill,
        Phase::Position,
        Phase::ExitEval,
        Phase::PlaceSell,
        Phase::WaitSellFill,
        Phase::PostTrade,
        Phase::Cooldown,
        Phase::Error,
    ];

    /// Phases in which `CoinState.amount > 0` is required (I-1).
    pub fn requires_position(self) -> bool {
        matches!(
            self,
            Phase::Position | Phase::ExitEval | Phase::PlaceSell | Phase::WaitSellFill | Phase::PostTrade
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Sum type of FSM event kinds (§3). Grouped by the phase area that emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FSMEvent {
    // market
    TickReceived,
    WarmupCompleted,
    // entry
    SignalDetected,
    GuardsPassed,
    GuardsBlocked,
    NoSignal,
    SlotAvailable,
    // buy-order
    BuyOrderPlaced,
    BuyOrderAck,
    BuyOrderFilled,
    BuyOrderPartial,
    BuyOrderTimeout,
    BuyOrderRejected,
    BuyAborted,
    OrderPlacementFailed,
    // position
    PositionOpened,
    PositionUpdated,
    // exit
    ExitSignalTp,
    ExitSignalSl,
    ExitSignalTimeout,
    ExitSignalTrailing,
    NoExitSignal,
    // sell-order (mirrors buy)
    SellOrderPlaced,
    SellOrderAck,
    SellOrderFilled,
    SellOrderPartial,
    SellOrderTimeout,
    SellOrderRejected,
    SellAborted,
    // system
    CooldownExpired,
    ErrorOccurred,
    ManualHalt,
    TradeComplete,
    OrderCanceled,
    ErrorBackoffExpired,
}

impl FSMEvent {
    pub const ALL: [FSMEvent; 35] = [
        FSMEvent::TickReceived,
        FSMEvent::WarmupCompleted,
        FSMEvent::SignalDetected,
        FSMEvent::GuardsPassed,
        FSMEvent::GuardsBlocked,
        FSMEvent::NoSignal,
        FSMEvent::SlotAvailable,
        FSMEvent::BuyOrderPlaced,
        FSMEvent::BuyOrderAck,
        FSMEvent::BuyOrderFilled,
        FSMEvent::BuyOrderPartial,
        FSMEvent::BuyOrderTimeout,
        FSMEvent::BuyOrderRejected,
        FSMEvent::BuyAborted,
        FSMEvent::OrderPlacementFailed,
        FSMEvent::PositionOpened,
        FSMEvent::PositionUpdated,
        FSMEvent::ExitSignalTp,
        FSMEvent::ExitSignalSl,
        FSMEvent::ExitSignalTimeout,
        FSMEvent::ExitSignalTrailing,
        FSMEvent::NoExitSignal,
        FSMEvent::SellOrderPlaced,
        FSMEvent::SellOrderAck,
        FSMEvent::SellOrderFilled,
        FSMEvent::SellOrderPartial,
        FSMEvent::SellOrderTimeout,
        FSMEvent::SellOrderRejected,
        FSMEvent::SellAborted,
        FSMEvent::CooldownExpired,
        FSMEvent::ErrorOccurred,
        FSMEvent::ManualHalt,
        FSMEvent::TradeComplete,
        FSMEvent::OrderCanceled,
        FSMEvent::ErrorBackoffExpired,
    ];
}

/// Immutable context carried by every event (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContext {
    pub symbol: String,
    pub timestamp: u64,
    pub order_id: Option<String>,
    pub decision_id: Option<String>,
    pub filled_qty: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub error: Option<String>,
    pub data: HashMap<String, serde_json::Value>,
}

impl EventContext {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp: now_ms(),
            ..Default::default()
        }
    }
}

/// One entry in a symbol's bounded transition history (last 100, FIFO).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    pub event: FSMEvent,
    pub ts: u64,
}

const TRANSITION_HISTORY_CAP: usize = 100;

/// Per-symbol mutable FSM record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinState {
    pub symbol: String,
    pub phase: Phase,
    pub phase_entered_ts: u64,
    pub decision_id: Option<String>,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,

    // position fields
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub entry_ts: u64,
    pub entry_fee_per_unit: Decimal,
    pub current_price: Decimal,
    pub peak_price: Decimal,
    pub trailing_trigger: Option<Decimal>,
    pub sl_px: Option<Decimal>,
    pub tp_px: Option<Decimal>,

    // counters / timestamps
    pub error_count: u32,
    pub retry_count: u32,
    pub cooldown_until: u64,
    pub order_placed_ts: u64,

    pub note: Option<String>,
    pub exit_reason: Option<String>,
    pub last_error: Option<String>,

    pub history: VecDeque<TransitionRecord>,
}

impl CoinState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            phase: Phase::Warmup,
            phase_entered_ts: now_ms(),
            decision_id: None,
            order_id: None,
            client_order_id: None,
            amount: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            entry_ts: 0,
            entry_fee_per_unit: Decimal::ZERO,
            current_price: Decimal::ZERO,
            peak_price: Decimal::ZERO,
            trailing_trigger: None,
            sl_px: None,
            tp_px: None,
            error_count: 0,
            retry_count: 0,
            cooldown_until: 0,
            order_placed_ts: 0,
            note: None,
            exit_reason: None,
            last_error: None,
            history: VecDeque::with_capacity(TRANSITION_HISTORY_CAP),
        }
    }

    /// Records a transition into the bounded history, evicting the oldest entry.
    pub fn push_history(&mut self, from: Phase, to: Phase, event: FSMEvent) {
        if self.history.len() == TRANSITION_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to,
            event,
            ts: now_ms(),
        });
    }

    /// I-1: `amount > 0 ⇔ phase ∈ {POSITION, EXIT_EVAL, PLACE_SELL, WAIT_SELL_FILL, POST_TRADE}`.
    pub fn invariant_amount_matches_phase(&self) -> bool {
        (self.amount > Decimal::ZERO) == self.phase.requires_position()
    }

    /// Resets position bookkeeping, used on POST_TRADE completion and on ERROR recovery.
    pub fn clear_position(&mut self) {
        self.amount = Decimal::ZERO;
        self.entry_price = Decimal::ZERO;
        self.entry_ts = 0;
        self.entry_fee_per_unit = Decimal::ZERO;
        self.peak_price = Decimal::ZERO;
        self.trailing_trigger = None;
        self.sl_px = None;
        self.tp_px = None;
        self.order_id = None;
        self.client_order_id = None;
    }
}

/// Immutable order request at the decision/execution boundary (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub reason: String,
    pub rule_code: String,
    pub inputs_hash: String,
}

impl Intent {
    /// Deterministic ID for an entry leg: `<decision_id>_<leg>_<side>_<ts_ms>`.
    pub fn entry_id(decision_id: &str, leg: u32, side: Side, ts_ms: u64) -> String {
        format!("{decision_id}_{leg}_{side}_{ts_ms}")
    }

    /// Deterministic ID for an exit: `EXIT-<ts_ms>-<SYMBOL>-<hash>`.
    pub fn exit_id(ts_ms: u64, symbol: &str, inputs_hash: &str) -> String {
        format!("EXIT-{ts_ms}-{symbol}-{inputs_hash}")
    }
}
