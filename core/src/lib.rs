//! execd core — execution engine for a cryptocurrency spot-trading bot.
//!
//! A per-symbol finite state machine (`fsm`) orchestrates entry and matched
//! exit against an exchange (`exchange`), routed through an idempotent
//! order router (`router`) backed by a reservation-aware portfolio
//! (`portfolio`) and a double-entry ledger (`ledger`). `engine` ties the
//! per-symbol machines to a tick loop; `telemetry` and `config` are the
//! ambient observability and configuration layers.

pub mod coid;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod fsm;
pub mod ledger;
pub mod portfolio;
pub mod reconciler;
pub mod resilience;
pub mod router;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use config::Config;
pub use engine::{Engine, EngineConfig};
pub use errors::{CoidError, ErrorClass, ExchangeError, LedgerError, PortfolioError, SnapshotError};
pub use exchange::{ExchangeWrapper, OrderStatus};
pub use fsm::SymbolFSM;
pub use ledger::Ledger;
pub use portfolio::Portfolio;
pub use router::OrderRouter;
pub use types::{CoinState, FSMEvent, Intent, Phase, Side};

/// Application-facing result/error alias; library code returns its own
/// typed errors (`errors.rs`) and the binary composes them here.
pub use anyhow::{Error, Result};
