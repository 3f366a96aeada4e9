//! Reconciler (C5, §4.5): the only code path that mutates positions from
//! exchange facts, triggered by the router's `order.filled` event.

use crate::exchange::ExchangeWrapper;
use crate::portfolio::{FillSummary, Portfolio};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Reconciler {
    exchange: Arc<dyn ExchangeWrapper>,
    portfolio: Arc<Portfolio>,
}

impl Reconciler {
    pub fn new(exchange: Arc<dyn ExchangeWrapper>, portfolio: Arc<Portfolio>) -> Self {
        Self { exchange, portfolio }
    }

    /// Fetches trades for `order_id` and delegates to `Portfolio.apply_fills`.
    /// Returns `None` when the exchange reports no trades yet.
    pub async fn reconcile_order(&self, symbol: &str, order_id: &str) -> Option<FillSummary> {
        let trades = match self.exchange.fetch_order_trades(symbol, order_id).await {
            Ok(trades) => trades,
            Err(e) => {
                warn!(symbol, order_id, error = %e, "fetch_order_trades_failed");
                return None;
            }
        };

        if trades.is_empty() {
            info!(symbol, order_id, "reconcile_no_trades");
            return None;
        }

        let tx_prefix = format!("{order_id}-fill");
        match self.portfolio.apply_fills(symbol, &trades, Some(order_id), &tx_prefix) {
            Ok(summary) => {
                info!(
                    symbol,
                    order_id,
                    fills_count = trades.len(),
                    qty_delta = %summary.qty_delta,
                    "order_reconciled"
                );
                Some(summary)
            }
            Err(e) => {
                warn!(symbol, order_id, error = %e, "apply_fills_failed");
                None
            }
        }
    }
}
