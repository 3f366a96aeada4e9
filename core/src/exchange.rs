//! ExchangeWrapper contract (C1, §4.1) and its order/fill/trade types.
//!
//! The wrapper is a thin, honest pass-through: it requires `client_order_id`
//! on placement, never retries itself, and does not classify errors — that
//! is the router's job (§7). `wait_for_fill` polls at a fixed cadence and
//! swallows poll errors, returning the last observed status at the deadline.

use crate::errors::ExchangeError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Ioc,
    Fok,
    Gtc,
}

/// Order status vocabulary as returned by the exchange (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Expired,
    Rejected,
}

#[derive(Debug, Clone, Default)]
pub struct OrderParams {
    pub client_order_id: Option<String>,
    pub time_in_force: Option<TimeInForce>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillStatus {
    pub status: OrderStatus,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub average: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFee {
    pub cost: Decimal,
    pub currency: String,
}

/// An executed trade, as returned by `fetch_order_trades` (§3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub price: Decimal,
    pub amount: Decimal,
    pub cost: Decimal,
    pub fee: TradeFee,
    pub timestamp: u64,
    pub side: crate::types::Side,
}

/// Minimal exchange contract consumed exclusively by C1 (§4.1, §6).
#[async_trait]
pub trait ExchangeWrapper: Send + Sync {
    async fn create_market_order(
        &self,
        symbol: &str,
        side: crate::types::Side,
        qty: Decimal,
        params: OrderParams,
    ) -> Result<ExchangeOrder, ExchangeError>;

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: crate::types::Side,
        qty: Decimal,
        price: Decimal,
        params: OrderParams,
    ) -> Result<ExchangeOrder, ExchangeError>;

    /// Polls at `200ms` cadence until terminal or `timeout` elapses. Poll
    /// errors are retried silently; the last observed status is returned at
    /// the deadline (possibly still `open`).
    async fn wait_for_fill(
        &self,
        symbol: &str,
        order_id: &str,
        timeout: Duration,
    ) -> FillStatus {
        let poll_interval = Duration::from_millis(200);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last = FillStatus {
            status: OrderStatus::Open,
            filled: Decimal::ZERO,
            remaining: Decimal::ZERO,
            average: None,
        };
        loop {
            match self.fetch_order(symbol, order_id).await {
                Ok(status) => {
                    let terminal = matches!(
                        status.status,
                        OrderStatus::Closed | OrderStatus::Canceled | OrderStatus::Expired
                    );
                    last = status;
                    if terminal {
                        return last;
                    }
                }
                Err(_) => {
                    // poll errors are swallowed, retried at the same cadence
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return last;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn fetch_order_trades(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Vec<Trade>, ExchangeError>;

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Result<FillStatus, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;
}

pub mod simulated {
    //! A deterministic in-memory exchange for tests and paper trading.
    //!
    //! Orders fill immediately at the requested price, grounded on the
    //! teacher's `SimulatedExecutor` (instant-fill, pessimistic simulation)
    //! adapted to the async trait and trade-fetching contract this spec
    //! requires.
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct SimOrder {
        symbol: String,
        client_order_id: String,
        status: OrderStatus,
        trades: Vec<Trade>,
    }

    /// Fills every order immediately at the requested (or a fixed) price.
    pub struct SimulatedExchange {
        fee_bps: Decimal,
        fixed_fill_price: Option<Decimal>,
        orders: Mutex<HashMap<String, SimOrder>>,
        next_id: Mutex<u64>,
    }

    impl SimulatedExchange {
        pub fn new(fee_bps: Decimal) -> Self {
            Self {
                fee_bps,
                fixed_fill_price: None,
                orders: Mutex::new(HashMap::new()),
                next_id: Mutex::new(1),
            }
        }

        pub fn with_fixed_fill_price(mut self, price: Decimal) -> Self {
            self.fixed_fill_price = Some(price);
            self
        }

        fn next_order_id(&self) -> String {
            let mut n = self.next_id.lock();
            let id = *n;
            *n += 1;
            format!("sim-{id}")
        }

        fn fill(&self, symbol: &str, side: crate::types::Side, qty: Decimal, price: Decimal, coid: String) -> ExchangeOrder {
            let order_id = self.next_order_id();
            let fee = (qty * price * self.fee_bps) / Decimal::from(10_000);
            let trade = Trade {
                price,
                amount: qty,
                cost: qty * price,
                fee: TradeFee {
                    cost: fee,
                    currency: "USDT".to_string(),
                },
                timestamp: crate::types::now_ms(),
                side,
            };
            let order = SimOrder {
                symbol: symbol.to_string(),
                client_order_id: coid.clone(),
                status: OrderStatus::Closed,
                trades: vec![trade],
            };
            self.orders.lock().insert(order_id.clone(), order);
            ExchangeOrder {
                order_id,
                client_order_id: coid,
                symbol: symbol.to_string(),
                status: OrderStatus::Closed,
            }
        }
    }

    #[async_trait]
    impl ExchangeWrapper for SimulatedExchange {
        async fn create_market_order(
            &self,
            symbol: &str,
            side: crate::types::Side,
            qty: Decimal,
            params: OrderParams,
        ) -> Result<ExchangeOrder, ExchangeError> {
            let coid = params
                .client_order_id
                .ok_or_else(|| ExchangeError::InvalidOrder("client_order_id required".into()))?;
            let price = self.fixed_fill_price.unwrap_or(Decimal::ZERO);
            Ok(self.fill(symbol, side, qty, price, coid))
        }

        async fn create_limit_order(
            &self,
            symbol: &str,
            side: crate::types::Side,
            qty: Decimal,
            price: Decimal,
            params: OrderParams,
        ) -> Result<ExchangeOrder, ExchangeError> {
            let coid = params
                .client_order_id
                .ok_or_else(|| ExchangeError::InvalidOrder("client_order_id required".into()))?;
            let fill_price = self.fixed_fill_price.unwrap_or(price);
            Ok(self.fill(symbol, side, qty, fill_price, coid))
        }

        async fn fetch_order_trades(
            &self,
            _symbol: &str,
            order_id: &str,
        ) -> Result<Vec<Trade>, ExchangeError> {
            let orders = self.orders.lock();
            Ok(orders
                .get(order_id)
                .map(|o| o.trades.clone())
                .unwrap_or_default())
        }

        async fn fetch_order(&self, _symbol: &str, order_id: &str) -> Result<FillStatus, ExchangeError> {
            let orders = self.orders.lock();
            let o = orders
                .get(order_id)
                .ok_or_else(|| ExchangeError::Unknown(format!("unknown order {order_id}")))?;
            let filled: Decimal = o.trades.iter().map(|t| t.amount).sum();
            Ok(FillStatus {
                status: o.status,
                filled,
                remaining: Decimal::ZERO,
                average: o.trades.first().map(|t| t.price),
            })
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
            let mut orders = self.orders.lock();
            match orders.get_mut(order_id) {
                Some(o) => {
                    o.status = OrderStatus::Canceled;
                    Ok(())
                }
                None => Err(ExchangeError::Unknown(format!("unknown order {order_id}"))),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use rust_decimal_macros::dec;

        #[tokio::test]
        async fn market_order_fills_immediately() {
            let ex = SimulatedExchange::new(dec!(5)).with_fixed_fill_price(dec!(50_000));
            let order = ex
                .create_market_order(
                    "BTC/USDT",
                    crate::types::Side::Buy,
                    dec!(0.01),
                    OrderParams {
                        client_order_id: Some("c1".into()),
                        time_in_force: None,
                    },
                )
                .await
                .unwrap();
            assert_eq!(order.status, OrderStatus::Closed);

            let trades = ex.fetch_order_trades("BTC/USDT", &order.order_id).await.unwrap();
            assert_eq!(trades.len(), 1);
            assert_eq!(trades[0].amount, dec!(0.01));
        }

        #[tokio::test]
        async fn placement_without_coid_is_rejected() {
            let ex = SimulatedExchange::new(dec!(5));
            let res = ex
                .create_market_order(
                    "BTC/USDT",
                    crate::types::Side::Buy,
                    dec!(0.01),
                    OrderParams::default(),
                )
                .await;
            assert!(res.is_err());
        }

        #[tokio::test]
        async fn wait_for_fill_returns_closed_immediately() {
            let ex = SimulatedExchange::new(dec!(5)).with_fixed_fill_price(dec!(100));
            let order = ex
                .create_limit_order(
                    "BTC/USDT",
                    crate::types::Side::Buy,
                    dec!(1),
                    dec!(100),
                    OrderParams {
                        client_order_id: Some("c2".into()),
                        time_in_force: Some(TimeInForce::Ioc),
                    },
                )
                .await
                .unwrap();
            let status = ex
                .wait_for_fill("BTC/USDT", &order.order_id, Duration::from_millis(500))
                .await;
            assert_eq!(status.status, OrderStatus::Closed);
        }
    }
}
