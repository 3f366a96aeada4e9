//! OrderRouter (C4, §4.4): drives one intent to completion against the
//! exchange — reserve, place, wait, release.
//!
//! Grounded on the teacher's retry-with-backoff idiom in
//! `resilience::backoff`, generalized here to wrap `ExchangeWrapper` calls
//! and classify failures per the error taxonomy (§7).

use crate::errors::ErrorClass;
use crate::exchange::{ExchangeWrapper, OrderParams, OrderStatus, TimeInForce};
use crate::portfolio::Portfolio;
use crate::resilience::BackoffConfig;
use crate::types::{Intent, Side};
use dashmap::DashSet;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_retries: usize,
    pub retry_backoff: Duration,
    pub tif: TimeInForce,
    pub slippage_bps: Decimal,
    pub fill_wait_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            tif: TimeInForce::Ioc,
            slippage_bps: Decimal::from(50),
            fill_wait_timeout: Duration::from_millis(2500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterOutcome {
    Success,
    PartialSuccess,
    FailedFinal(String),
}

#[derive(Debug, Clone)]
pub struct RouterResult {
    pub outcome: RouterOutcome,
    pub filled_qty: Decimal,
    pub order_id: Option<String>,
}

/// Executes intents end to end. Holds an in-memory idempotency set keyed by
/// `intent_id`; duplicate intents (retried after a crash, or re-submitted by
/// an upstream collaborator) are silently ignored.
pub struct OrderRouter {
    exchange: Arc<dyn ExchangeWrapper>,
    portfolio: Arc<Portfolio>,
    config: RouterConfig,
    seen_intents: DashSet<String>,
    on_filled: Box<dyn Fn(&str, &str) + Send + Sync>,
}

impl OrderRouter {
    pub fn new(
        exchange: Arc<dyn ExchangeWrapper>,
        portfolio: Arc<Portfolio>,
        config: RouterConfig,
        on_filled: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            exchange,
            portfolio,
            config,
            seen_intents: DashSet::new(),
            on_filled: Box::new(on_filled),
        }
    }

    fn effective_limit(&self, side: Side, reference_price: Decimal, limit_price: Option<Decimal>) -> Decimal {
        let cap_fraction = self.config.slippage_bps / Decimal::from(10_000);
        match side {
            Side::Buy => {
                let cap = reference_price * (Decimal::ONE + cap_fraction);
                limit_price.map(|p| p.min(cap)).unwrap_or(cap)
            }
            Side::Sell => {
                let floor = reference_price * (Decimal::ONE - cap_fraction);
                limit_price.map(|p| p.max(floor)).unwrap_or(floor)
            }
        }
    }

    /// Runs `intent` to completion. `reference_price` is the last known
    /// price for the symbol (fallback `intent.limit_price`).
    pub async fn handle_intent(&self, intent: &Intent, reference_price: Option<Decimal>) -> RouterResult {
        if !self.seen_intents.insert(intent.intent_id.clone()) {
            return RouterResult {
                outcome: RouterOutcome::FailedFinal("duplicate intent_id".into()),
                filled_qty: Decimal::ZERO,
                order_id: None,
            };
        }

        let reference_price = reference_price.or(intent.limit_price).unwrap_or(Decimal::ZERO);
        if reference_price <= Decimal::ZERO {
            return RouterResult {
                outcome: RouterOutcome::FailedFinal("no reference price".into()),
                filled_qty: Decimal::ZERO,
                order_id: None,
            };
        }

        let reservation_key = intent.intent_id.clone();
        if let Err(e) = self.portfolio.reserve(
            &intent.symbol,
            intent.side,
            intent.qty,
            reference_price,
            &reservation_key,
        ) {
            warn!(symbol = %intent.symbol, error = %e, "reserve_failed");
            return RouterResult {
                outcome: RouterOutcome::FailedFinal(format!("reserve_failed: {e}")),
                filled_qty: Decimal::ZERO,
                order_id: None,
            };
        }

        let effective_limit = self.effective_limit(intent.side, reference_price, intent.limit_price);

        let mut cumulative_filled = Decimal::ZERO;
        let mut last_order_id: Option<String> = None;
        let mut backoff = crate::resilience::ExponentialBackoff::with_config(BackoffConfig {
            initial_delay: self.config.retry_backoff,
            max_delay: self.config.retry_backoff * 16,
            multiplier: 2.0,
            max_retries: Some(self.config.max_retries),
            jitter_factor: 0.0,
        });

        for _attempt in 0..=self.config.max_retries {
            let remaining = intent.qty - cumulative_filled;
            if remaining <= Decimal::ZERO {
                break;
            }

            let coid = format!("TBP-{}", intent.intent_id);
            let params = OrderParams {
                client_order_id: Some(coid),
                time_in_force: Some(self.config.tif),
            };

            let placed = self
                .exchange
                .create_limit_order(&intent.symbol, intent.side, remaining, effective_limit, params)
                .await;

            let order = match placed {
                Ok(order) => order,
                Err(e) => {
                    match e.classify() {
                        ErrorClass::Fatal => {
                            let _ = self.portfolio.release(&intent.symbol, &reservation_key);
                            return RouterResult {
                                outcome: RouterOutcome::FailedFinal(e.to_string()),
                                filled_qty: cumulative_filled,
                                order_id: last_order_id,
                            };
                        }
                        ErrorClass::Transient | ErrorClass::RateLimited | ErrorClass::Unknown => {
                            if let Some(delay) = backoff.next_delay() {
                                warn!(symbol = %intent.symbol, error = %e, "order_placement_retry");
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                            let _ = self.portfolio.release(&intent.symbol, &reservation_key);
                            return RouterResult {
                                outcome: RouterOutcome::FailedFinal(e.to_string()),
                                filled_qty: cumulative_filled,
                                order_id: last_order_id,
                            };
                        }
                    }
                }
            };

            last_order_id = Some(order.order_id.clone());
            info!(symbol = %intent.symbol, order_id = %order.order_id, "order_sent");

            let status = self
                .exchange
                .wait_for_fill(&intent.symbol, &order.order_id, self.config.fill_wait_timeout)
                .await;

            match status.status {
                OrderStatus::Closed => {
                    cumulative_filled += status.filled;
                    (self.on_filled)(&intent.symbol, &order.order_id);
                    break;
                }
                OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected => {
                    break;
                }
                OrderStatus::Open => {
                    cumulative_filled += status.filled;
                    if let Some(delay) = backoff.next_delay() {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break;
                }
            }
        }

        let unfilled = intent.qty - cumulative_filled;
        if unfilled > Decimal::ZERO {
            let _ = self.portfolio.release(&intent.symbol, &reservation_key);
        }

        let outcome = if cumulative_filled >= intent.qty {
            RouterOutcome::Success
        } else if cumulative_filled > Decimal::ZERO {
            RouterOutcome::PartialSuccess
        } else {
            RouterOutcome::FailedFinal("no fill".into())
        };

        RouterResult {
            outcome,
            filled_qty: cumulative_filled,
            order_id: last_order_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::simulated::SimulatedExchange;
    use crate::ledger::Ledger;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn portfolio() -> Arc<Portfolio> {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(Ledger::new(dir.path().join("ledger.jsonl")));
        Arc::new(Portfolio::new(dec!(10_000), ledger))
    }

    #[tokio::test]
    async fn successful_intent_fills_and_reports_success() {
        let exchange = Arc::new(SimulatedExchange::new(dec!(1)).with_fixed_fill_price(dec!(100)));
        let filled_calls = Arc::new(Mutex::new(Vec::new()));
        let filled_calls_clone = filled_calls.clone();
        let router = OrderRouter::new(
            exchange,
            portfolio(),
            RouterConfig::default(),
            move |symbol, order_id| {
                filled_calls_clone.lock().push((symbol.to_string(), order_id.to_string()));
            },
        );

        let intent = Intent {
            intent_id: "dec1_0_buy_1".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            qty: dec!(1),
            limit_price: Some(dec!(100)),
            reason: "test".into(),
            rule_code: "r1".into(),
            inputs_hash: "h1".into(),
        };

        let result = router.handle_intent(&intent, Some(dec!(100))).await;
        assert_eq!(result.outcome, RouterOutcome::Success);
        assert_eq!(result.filled_qty, dec!(1));
        assert_eq!(filled_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_intent_is_a_noop() {
        let exchange = Arc::new(SimulatedExchange::new(dec!(1)).with_fixed_fill_price(dec!(100)));
        let router = OrderRouter::new(exchange, portfolio(), RouterConfig::default(), |_, _| {});

        let intent = Intent {
            intent_id: "dup1".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            qty: dec!(1),
            limit_price: Some(dec!(100)),
            reason: "test".into(),
            rule_code: "r1".into(),
            inputs_hash: "h1".into(),
        };
        router.handle_intent(&intent, Some(dec!(100))).await;
        let second = router.handle_intent(&intent, Some(dec!(100))).await;
        assert_eq!(second.outcome, RouterOutcome::FailedFinal("duplicate intent_id".into()));
    }

    #[tokio::test]
    async fn zero_reference_price_fails_fast() {
        let exchange = Arc::new(SimulatedExchange::new(dec!(1)));
        let router = OrderRouter::new(exchange, portfolio(), RouterConfig::default(), |_, _| {});
        let intent = Intent {
            intent_id: "noprice".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            qty: dec!(1),
            limit_price: None,
            reason: "test".into(),
            rule_code: "r1".into(),
            inputs_hash: "h1".into(),
        };
        let result = router.handle_intent(&intent, None).await;
        assert!(matches!(result.outcome, RouterOutcome::FailedFinal(_)));
    }
}
