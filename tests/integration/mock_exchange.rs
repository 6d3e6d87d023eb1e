//! Mock exchange for integration testing.
//!
//! Provides deterministic `TradingClient` and `MarketFeed` implementations
//! that keep books, orders and balances in memory. Tests move prices,
//! fill orders and inject failures directly.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

use polyarb::platforms::{MarketFeed, RawMarket, TradingClient};
use polyarb::types::*;

#[derive(Debug, Clone)]
pub struct MockOrder {
    pub spec: OrderSpec,
    pub status: OrderStatus,
}

#[derive(Default)]
struct Inner {
    books: HashMap<String, OrderBook>,
    orders: HashMap<String, MockOrder>,
    /// Submission order, for assertions.
    posted: Vec<String>,
    balances: HashMap<String, Decimal>,
    next_id: u64,
    fail_cancels: bool,
    reject_sells: bool,
}

/// An in-memory exchange.
///
/// Post-only buys that would cross are rejected, sells that cross the
/// best bid fill immediately, everything else rests until a test fills
/// it with `fill`.
#[derive(Default)]
pub struct MockExchange {
    inner: Mutex<Inner>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two deep bid levels under `bid` and one ask above it.
    pub fn set_bid(&self, token_id: &str, bid: Decimal) {
        let step = Decimal::new(1, 2);
        let book = OrderBook::new(
            token_id,
            vec![
                PriceLevel::new(bid, Decimal::from(1000)),
                PriceLevel::new(bid - step, Decimal::from(1000)),
            ],
            vec![PriceLevel::new(bid + step + step, Decimal::from(1000))],
        );
        self.inner.lock().unwrap().books.insert(token_id.to_string(), book);
    }

    /// Make the token's book unavailable, as after resolution.
    pub fn remove_book(&self, token_id: &str) {
        self.inner.lock().unwrap().books.remove(token_id);
    }

    pub fn set_balance(&self, token_id: &str, amount: Decimal) {
        self.inner.lock().unwrap().balances.insert(token_id.to_string(), amount);
    }

    pub fn balance(&self, token_id: &str) -> Decimal {
        self.inner
            .lock()
            .unwrap()
            .balances
            .get(token_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.inner.lock().unwrap().fail_cancels = fail;
    }

    /// Reject every sell at post time, as during a venue outage.
    pub fn reject_sells(&self, reject: bool) {
        self.inner.lock().unwrap().reject_sells = reject;
    }

    /// Fill a resting order in full and settle the balance.
    pub fn fill(&self, order_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(order) = inner.orders.get_mut(order_id) else {
            panic!("unknown order {order_id}");
        };
        order.status = OrderStatus::Filled;
        let spec = order.spec.clone();
        let bal = inner.balances.entry(spec.token_id.clone()).or_default();
        match spec.side {
            OrderSide::Buy => *bal += spec.size,
            OrderSide::Sell => *bal -= spec.size,
        }
    }

    pub fn order(&self, order_id: &str) -> MockOrder {
        self.inner.lock().unwrap().orders[order_id].clone()
    }

    /// All orders in submission order.
    pub fn posted(&self) -> Vec<(String, MockOrder)> {
        let inner = self.inner.lock().unwrap();
        inner
            .posted
            .iter()
            .map(|id| (id.clone(), inner.orders[id].clone()))
            .collect()
    }

    pub fn sells_at(&self, price: Decimal) -> usize {
        self.posted()
            .iter()
            .filter(|(_, o)| o.spec.side == OrderSide::Sell && o.spec.price == price)
            .count()
    }

    pub fn buys(&self) -> Vec<(String, MockOrder)> {
        self.posted()
            .into_iter()
            .filter(|(_, o)| o.spec.side == OrderSide::Buy)
            .collect()
    }
}

#[async_trait]
impl TradingClient for MockExchange {
    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook> {
        self.inner
            .lock()
            .unwrap()
            .books
            .get(token_id)
            .cloned()
            .ok_or_else(|| anyhow!("no orderbook for {token_id}"))
    }

    fn create_order(&self, spec: &OrderSpec) -> Result<SignedOrder> {
        Ok(SignedOrder {
            spec: spec.clone(),
            signature: "mock".into(),
        })
    }

    async fn post_order(&self, order: &SignedOrder) -> Result<PostOrderResponse> {
        let mut inner = self.inner.lock().unwrap();
        let spec = order.spec.clone();
        let book = inner.books.get(&spec.token_id).cloned().unwrap_or_default();

        let mut status = OrderStatus::Live;
        match spec.side {
            OrderSide::Buy => {
                if spec.order_type == OrderType::GtcPostOnly
                    && book.best_ask().is_some_and(|a| a <= spec.price)
                {
                    return Ok(PostOrderResponse::rejected("post-only order would cross"));
                }
            }
            OrderSide::Sell => {
                if inner.reject_sells {
                    return Ok(PostOrderResponse::rejected("matching engine unavailable"));
                }
                let held = inner.balances.get(&spec.token_id).copied().unwrap_or_default();
                if held < spec.size {
                    return Ok(PostOrderResponse::rejected("not enough balance"));
                }
                if book.best_bid().is_some_and(|b| b >= spec.price) {
                    status = OrderStatus::Filled;
                    if let Some(bal) = inner.balances.get_mut(&spec.token_id) {
                        *bal -= spec.size;
                    }
                }
            }
        }

        inner.next_id += 1;
        let id = format!("mock-{}", inner.next_id);
        inner.orders.insert(id.clone(), MockOrder { spec, status });
        inner.posted.push(id.clone());
        Ok(PostOrderResponse::accepted(id))
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderState> {
        let inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get(order_id)
            .ok_or_else(|| anyhow!("unknown order {order_id}"))?;
        let matched = if order.status == OrderStatus::Filled {
            order.spec.size
        } else {
            Decimal::ZERO
        };
        Ok(OrderState {
            order_id: order_id.to_string(),
            token_id: order.spec.token_id.clone(),
            status: order.status,
            price: order.spec.price,
            original_size: order.spec.size,
            size_matched: matched,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_cancels {
            return Err(anyhow!("cancel endpoint unavailable"));
        }
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("unknown order {order_id}"))?;
        if order.status == OrderStatus::Filled {
            return Err(anyhow!("order {order_id} already filled"));
        }
        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn get_balance(&self, token_id: &str) -> Result<Decimal> {
        Ok(self.balance(token_id))
    }
}

/// A feed returning a fixed set of records.
pub struct MockFeed {
    markets: Mutex<Vec<RawMarket>>,
}

impl MockFeed {
    pub fn new(markets: Vec<RawMarket>) -> Self {
        Self {
            markets: Mutex::new(markets),
        }
    }

    pub fn set(&self, markets: Vec<RawMarket>) {
        *self.markets.lock().unwrap() = markets;
    }
}

#[async_trait]
impl MarketFeed for MockFeed {
    async fn fetch_active_markets(&self) -> Result<Vec<RawMarket>> {
        Ok(self.markets.lock().unwrap().clone())
    }
}
