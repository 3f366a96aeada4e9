//! External collaborator contracts (AS.10). These are out of scope as
//! implementations (market-data feeds, signal research, risk guards), but
//! the engine depends on them only through these traits, with simple
//! in-tree stubs for tests and paper trading.

use crate::types::Snapshot;
use rust_decimal::Decimal;

pub trait MarketDataFeed: Send + Sync {
    fn snapshot(&self, symbol: &str) -> Option<Snapshot>;
}

pub trait SignalEvaluator: Send + Sync {
    fn update(&mut self, symbol: &str, last: Decimal);
    fn evaluate(&mut self, symbol: &str, last: Decimal) -> (bool, serde_json::Value);
}

pub trait EntryGuard: Send + Sync {
    fn passes(&self, symbol: &str, last: &Snapshot) -> (bool, Vec<String>);
}

/// A fixed-price feed useful for tests and a degenerate paper-trading mode.
pub struct StaticMarketDataFeed {
    prices: std::collections::HashMap<String, Snapshot>,
}

impl StaticMarketDataFeed {
    pub fn new() -> Self {
        Self {
            prices: std::collections::HashMap::new(),
        }
    }

    pub fn set(&mut self, symbol: impl Into<String>, snapshot: Snapshot) {
        self.prices.insert(symbol.into(), snapshot);
    }
}

impl Default for StaticMarketDataFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDataFeed for StaticMarketDataFeed {
    fn snapshot(&self, symbol: &str) -> Option<Snapshot> {
        self.prices.get(symbol).copied()
    }
}

/// An always-pass guard, useful as the default when no risk guard is wired.
pub struct AlwaysPassGuard;

impl EntryGuard for AlwaysPassGuard {
    fn passes(&self, _symbol: &str, _last: &Snapshot) -> (bool, Vec<String>) {
        (true, Vec::new())
    }
}

/// A never-trigger evaluator, useful as a safe default in tests that drive
/// the FSM through phases manually without a live signal-research stack.
pub struct NeverSignalEvaluator;

impl SignalEvaluator for NeverSignalEvaluator {
    fn update(&mut self, _symbol: &str, _last: Decimal) {}

    fn evaluate(&mut self, _symbol: &str, _last: Decimal) -> (bool, serde_json::Value) {
        (false, serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;
    use rust_decimal_macros::dec;

    #[test]
    fn static_feed_returns_what_was_set() {
        let mut feed = StaticMarketDataFeed::new();
        feed.set(
            "BTC/USDT",
            Snapshot {
                last: dec!(100),
                bid: dec!(99.9),
                ask: dec!(100.1),
                volume: dec!(10),
                ts: now_ms(),
            },
        );
        assert_eq!(feed.snapshot("BTC/USDT").unwrap().last, dec!(100));
        assert!(feed.snapshot("ETH/USDT").is_none());
    }

    #[test]
    fn always_pass_guard_never_blocks() {
        let guard = AlwaysPassGuard;
        let snap = Snapshot {
            last: dec!(1),
            bid: dec!(1),
            ask: dec!(1),
            volume: dec!(1),
            ts: 0,
        };
        assert_eq!(guard.passes("BTC/USDT", &snap), (true, Vec::new()));
    }
}
