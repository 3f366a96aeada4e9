//! Portfolio (C3, §4.3): positions, reservation budget ledger,
//! symbol-scoped locks.
//!
//! Grounded on the teacher's `execution::types::{Order, Fill}` for the
//! weighted-average-cost accounting shape, generalized to the reservation
//! discipline this spec requires and keyed by symbol rather than by order.

use crate::errors::PortfolioError;
use crate::exchange::Trade;
use crate::ledger::{Ledger, Transaction};
use crate::types::{Side, SymbolFilters};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    New,
    Open,
    PartialExit,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub opened_ts: u64,
    pub state: PositionState,
}

impl Position {
    fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            opened_ts: 0,
            state: PositionState::New,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    side: Side,
    notional: Decimal,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FillSummary {
    pub qty_delta: Decimal,
    pub notional: Decimal,
    pub fees: Decimal,
    pub state: Option<PositionState>,
}

/// Per-symbol mutable book plus a process-wide budget ledger.
///
/// Each symbol gets its own lock, created on demand (§4.3); a separate lock
/// protects `total_budget`/`reserved_budget`. `parking_lot::Mutex` is not
/// reentrant, so no code path may call `positions_notional()` (which locks
/// every symbol's book) while already holding one of those same books'
/// locks — `reserve()` computes `free_cash()` before taking its own
/// symbol's lock for exactly this reason.
struct SymbolBook {
    position: Position,
    reservations: HashMap<String, Reservation>,
}

pub struct Portfolio {
    total_budget: Mutex<Decimal>,
    reserved_budget: Mutex<Decimal>,
    books: RwLock<HashMap<String, Arc<Mutex<SymbolBook>>>>,
    filters: RwLock<HashMap<String, SymbolFilters>>,
    last_price: RwLock<HashMap<String, Decimal>>,
    ledger: Arc<Ledger>,
}

impl Portfolio {
    pub fn new(total_budget: Decimal, ledger: Arc<Ledger>) -> Self {
        Self {
            total_budget: Mutex::new(total_budget),
            reserved_budget: Mutex::new(Decimal::ZERO),
            books: RwLock::new(HashMap::new()),
            filters: RwLock::new(HashMap::new()),
            last_price: RwLock::new(HashMap::new()),
            ledger,
        }
    }

    pub fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.filters.write().insert(symbol.to_string(), filters);
    }

    fn book(&self, symbol: &str) -> Arc<Mutex<SymbolBook>> {
        if let Some(book) = self.books.read().get(symbol) {
            return book.clone();
        }
        self.books
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SymbolBook {
                    position: Position::flat(symbol),
                    reservations: HashMap::new(),
                }))
            })
            .clone()
    }

    /// Sum of open positions' notional at their average cost, for longs.
    fn positions_notional(&self) -> Decimal {
        self.books
            .read()
            .values()
            .map(|b| {
                let b = b.lock();
                b.position.qty * b.position.avg_price
            })
            .sum()
    }

    pub fn free_cash(&self) -> Decimal {
        *self.total_budget.lock() - *self.reserved_budget.lock() - self.positions_notional()
    }

    /// Reserves budget for an intent. Idempotent per `reservation_key`
    /// (typically the intent_id): a second reserve for the same key is a
    /// no-op that returns `Ok(true)`.
    pub fn reserve(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        reservation_key: &str,
    ) -> Result<bool, PortfolioError> {
        let notional = qty * price;
        let min_notional = self
            .filters
            .read()
            .get(symbol)
            .map(|f| f.min_notional)
            .unwrap_or(Decimal::ZERO);
        if notional < min_notional {
            return Err(PortfolioError::BelowMinNotional {
                symbol: symbol.to_string(),
                notional,
                min_notional,
            });
        }

        // Computed before taking the symbol's own book lock: `free_cash`
        // sums every book's notional, including this one, so holding this
        // symbol's lock across that call would self-deadlock.
        let available = (side == Side::Buy).then(|| self.free_cash());

        let book = self.book(symbol);
        let mut book = book.lock();
        if book.reservations.contains_key(reservation_key) {
            return Ok(true);
        }

        if side == Side::Buy {
            let available = available.unwrap();
            if available < notional {
                return Err(PortfolioError::InsufficientBudget {
                    symbol: symbol.to_string(),
                    needed: notional,
                    available,
                });
            }
            *self.reserved_budget.lock() += notional;
        }

        book.reservations
            .insert(reservation_key.to_string(), Reservation { side, notional });
        Ok(true)
    }

    /// Releases a prior reservation (order failure, cancel, or unfilled
    /// remainder after a partial fill).
    pub fn release(&self, symbol: &str, reservation_key: &str) -> Result<(), PortfolioError> {
        let book = self.book(symbol);
        let mut book = book.lock();
        let Some(reservation) = book.reservations.remove(reservation_key) else {
            return Err(PortfolioError::NoMatchingReservation {
                symbol: symbol.to_string(),
            });
        };
        if reservation.side == Side::Buy {
            let mut reserved = self.reserved_budget.lock();
            *reserved -= reservation.notional;
            if *reserved < Decimal::ZERO {
                *reserved = Decimal::ZERO;
            }
        }
        Ok(())
    }

    /// Applies executed trades to the symbol's position under its lock
    /// (§4.3). Releases the named reservation afterward and records each
    /// trade in the ledger.
    pub fn apply_fills(
        &self,
        symbol: &str,
        trades: &[Trade],
        reservation_key: Option<&str>,
        transaction_id_prefix: &str,
    ) -> Result<FillSummary, PortfolioError> {
        let book = self.book(symbol);
        let mut guard = book.lock();
        let mut summary = FillSummary::default();

        for (idx, trade) in trades.iter().enumerate() {
            let pos = &mut guard.position;
            match trade.side {
                Side::Buy => {
                    let new_qty = pos.qty + trade.amount;
                    let new_avg = if new_qty > Decimal::ZERO {
                        (pos.qty * pos.avg_price + trade.amount * trade.price) / new_qty
                    } else {
                        Decimal::ZERO
                    };
                    pos.qty = new_qty;
                    pos.avg_price = new_avg;
                    pos.fees_paid += trade.fee.cost;
                    if pos.state == PositionState::New {
                        pos.state = PositionState::Open;
                        pos.opened_ts = trade.timestamp;
                    }
                }
                Side::Sell => {
                    if trade.amount > pos.qty {
                        return Err(PortfolioError::SellExceedsPosition {
                            symbol: symbol.to_string(),
                            qty: trade.amount,
                            held: pos.qty,
                        });
                    }
                    pos.realized_pnl += (trade.price - pos.avg_price) * trade.amount;
                    pos.fees_paid += trade.fee.cost;
                    pos.qty -= trade.amount;
                    pos.state = if pos.qty == Decimal::ZERO {
                        PositionState::Closed
                    } else {
                        PositionState::PartialExit
                    };
                }
            }

            summary.qty_delta += trade.amount;
            summary.notional += trade.amount * trade.price;
            summary.fees += trade.fee.cost;
            summary.state = Some(pos.state);

            let tx = Transaction::for_trade(
                format!("{transaction_id_prefix}-{idx}"),
                symbol,
                trade.side,
                trade.amount * trade.price,
                trade.fee.cost,
            );
            self.ledger
                .record(tx)
                .map_err(|_| PortfolioError::NoMatchingReservation {
                    symbol: symbol.to_string(),
                })?;
        }

        if let Some(key) = reservation_key {
            if guard.reservations.contains_key(key) {
                let reservation = guard.reservations.remove(key).unwrap();
                if reservation.side == Side::Buy {
                    let mut reserved = self.reserved_budget.lock();
                    *reserved -= reservation.notional;
                    if *reserved < Decimal::ZERO {
                        *reserved = Decimal::ZERO;
                    }
                }
            }
        }

        Ok(summary)
    }

    pub fn mark_price(&self, symbol: &str, last_price: Decimal) {
        self.last_price.write().insert(symbol.to_string(), last_price);
    }

    pub fn position(&self, symbol: &str) -> Position {
        self.book(symbol).lock().position.clone()
    }

    /// Restores a symbol's position to a captured pre-image. The buy-fill
    /// commit path's two-phase rollback (§9) is the only caller.
    pub fn restore_position(&self, symbol: &str, position: Position) {
        self.book(symbol).lock().position = position;
    }

    pub fn positions(&self) -> Vec<Position> {
        self.books.read().values().map(|b| b.lock().position.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::TradeFee;
    use crate::types::now_ms;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn ledger() -> Arc<Ledger> {
        let dir = tempdir().unwrap();
        Arc::new(Ledger::new(dir.path().join("ledger.jsonl")))
    }

    fn trade(side: Side, price: Decimal, amount: Decimal, fee: Decimal) -> Trade {
        Trade {
            price,
            amount,
            cost: price * amount,
            fee: TradeFee {
                cost: fee,
                currency: "USDT".into(),
            },
            timestamp: now_ms(),
            side,
        }
    }

    #[test]
    fn reserve_fails_below_min_notional() {
        let p = Portfolio::new(dec!(1000), ledger());
        p.set_filters(
            "BTC/USDT",
            SymbolFilters {
                tick_size: dec!(0.01),
                step_size: dec!(0.0001),
                min_notional: dec!(10),
                min_qty: dec!(0.0001),
            },
        );
        let res = p.reserve("BTC/USDT", Side::Buy, dec!(0.0001), dec!(50), "i1");
        assert!(res.is_err());
    }

    #[test]
    fn reserve_is_idempotent_per_key() {
        let p = Portfolio::new(dec!(1000), ledger());
        p.reserve("BTC/USDT", Side::Buy, dec!(0.01), dec!(100), "i1").unwrap();
        p.reserve("BTC/USDT", Side::Buy, dec!(0.01), dec!(100), "i1").unwrap();
        assert_eq!(*p.reserved_budget.lock(), dec!(1));
    }

    #[test]
    fn buy_then_sell_updates_weighted_average_and_pnl() {
        let p = Portfolio::new(dec!(10_000), ledger());
        p.reserve("BTC/USDT", Side::Buy, dec!(1), dec!(100), "i1").unwrap();
        let trades = vec![trade(Side::Buy, dec!(100), dec!(1), dec!(0.1))];
        p.apply_fills("BTC/USDT", &trades, Some("i1"), "tx1").unwrap();
        let pos = p.position("BTC/USDT");
        assert_eq!(pos.qty, dec!(1));
        assert_eq!(pos.avg_price, dec!(100));
        assert_eq!(pos.state, PositionState::Open);

        let sell = vec![trade(Side::Sell, dec!(120), dec!(1), dec!(0.12))];
        let summary = p.apply_fills("BTC/USDT", &sell, None, "tx2").unwrap();
        assert_eq!(summary.qty_delta, dec!(1));
        let pos = p.position("BTC/USDT");
        assert_eq!(pos.qty, Decimal::ZERO);
        assert_eq!(pos.realized_pnl, dec!(20));
        assert_eq!(pos.state, PositionState::Closed);
    }

    #[test]
    fn sell_exceeding_position_is_rejected() {
        let p = Portfolio::new(dec!(10_000), ledger());
        let trades = vec![trade(Side::Sell, dec!(100), dec!(1), dec!(0.1))];
        let res = p.apply_fills("BTC/USDT", &trades, None, "tx1");
        assert!(res.is_err());
    }

    #[test]
    fn release_frees_reserved_budget() {
        let p = Portfolio::new(dec!(1000), ledger());
        p.reserve("BTC/USDT", Side::Buy, dec!(1), dec!(100), "i1").unwrap();
        assert_eq!(p.free_cash(), dec!(900));
        p.release("BTC/USDT", "i1").unwrap();
        assert_eq!(p.free_cash(), dec!(1000));
    }

    /// A buy's realized P&L in cash terms matches the float-arithmetic
    /// expectation within a small tolerance — the two should only diverge
    /// by `Decimal` vs. `f64` rounding, never by a wrong formula.
    #[test]
    fn realized_pnl_matches_float_expectation_within_tolerance() {
        let p = Portfolio::new(dec!(10_000), ledger());
        p.reserve("BTC/USDT", Side::Buy, dec!(2), dec!(100), "i1").unwrap();
        p.apply_fills(
            "BTC/USDT",
            &[trade(Side::Buy, dec!(100), dec!(2), dec!(0))],
            Some("i1"),
            "tx1",
        )
        .unwrap();
        let summary = p
            .apply_fills(
                "BTC/USDT",
                &[trade(Side::Sell, dec!(115), dec!(2), dec!(0))],
                None,
                "tx2",
            )
            .unwrap();
        let _ = summary;

        let realized_pnl = rust_decimal::prelude::ToPrimitive::to_f64(&p.position("BTC/USDT").realized_pnl).unwrap();
        let expected = (115.0 - 100.0) * 2.0;
        approx::assert_relative_eq!(realized_pnl, expected, max_relative = 1e-9);
    }

    use proptest::prelude::*;

    /// Two same-side buys always land `avg_price` between the two trade
    /// prices (the weighted average can never fall outside its inputs'
    /// range) and `qty` always sums exactly.
    #[test]
    fn prop_two_buys_weighted_average_stays_within_trade_price_bounds() {
        proptest!(|(p1_cents in 1i64..100_000, q1_hundredths in 1i64..100_000,
                     p2_cents in 1i64..100_000, q2_hundredths in 1i64..100_000)| {
            let price1 = Decimal::new(p1_cents, 2);
            let qty1 = Decimal::new(q1_hundredths, 2);
            let price2 = Decimal::new(p2_cents, 2);
            let qty2 = Decimal::new(q2_hundredths, 2);

            let p = Portfolio::new(Decimal::new(1_000_000_000, 2), ledger());
            p.apply_fills("BTC/USDT", &[trade(Side::Buy, price1, qty1, Decimal::ZERO)], None, "tx1").unwrap();
            p.apply_fills("BTC/USDT", &[trade(Side::Buy, price2, qty2, Decimal::ZERO)], None, "tx2").unwrap();

            let pos = p.position("BTC/USDT");
            prop_assert_eq!(pos.qty, qty1 + qty2);
            let (lo, hi) = if price1 <= price2 { (price1, price2) } else { (price2, price1) };
            prop_assert!(pos.avg_price >= lo && pos.avg_price <= hi);
        });
    }
}
