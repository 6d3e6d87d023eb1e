//! Paper trading client.
//!
//! Reads real order books from the public CLOB `/book` endpoint but keeps
//! orders and balances in memory. A resting order fills as soon as the
//! observed book crosses its price; post-only orders that would cross on
//! arrival are rejected, as the venue would.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::VenueConfig;
use crate::platforms::TradingClient;
use crate::types::{
    OrderBook, OrderSide, OrderSpec, OrderState, OrderStatus, OrderType, PostOrderResponse,
    PriceLevel, SignedOrder,
};

// ---------------------------------------------------------------------------
// CLOB book response
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BookResponse {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

/// CLOB levels carry prices and sizes as decimal strings.
#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

impl RawLevel {
    fn parse(&self) -> Result<PriceLevel> {
        let price = Decimal::from_str(&self.price)
            .with_context(|| format!("bad level price {:?}", self.price))?;
        let size = Decimal::from_str(&self.size)
            .with_context(|| format!("bad level size {:?}", self.size))?;
        Ok(PriceLevel::new(price, size))
    }
}

fn parse_book(token_id: &str, resp: &BookResponse) -> Result<OrderBook> {
    let bids = resp.bids.iter().map(RawLevel::parse).collect::<Result<Vec<_>>>()?;
    let asks = resp.asks.iter().map(RawLevel::parse).collect::<Result<Vec<_>>>()?;
    Ok(OrderBook::new(token_id, bids, asks))
}

/// Whether an order at `spec` would match against `book` right now.
pub fn crosses(spec: &OrderSpec, book: &OrderBook) -> bool {
    match spec.side {
        OrderSide::Buy => book.best_ask().is_some_and(|ask| ask <= spec.price),
        OrderSide::Sell => book.best_bid().is_some_and(|bid| bid >= spec.price),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PaperOrder {
    spec: OrderSpec,
    status: OrderStatus,
    size_matched: Decimal,
}

impl PaperOrder {
    fn state(&self, order_id: &str) -> OrderState {
        OrderState {
            order_id: order_id.to_string(),
            token_id: self.spec.token_id.clone(),
            status: self.status,
            price: self.spec.price,
            original_size: self.spec.size,
            size_matched: self.size_matched,
        }
    }
}

pub struct PaperClient {
    http: Client,
    clob_url: String,
    orders: Mutex<HashMap<String, PaperOrder>>,
    balances: Mutex<HashMap<String, Decimal>>,
}

impl PaperClient {
    pub fn new(venue: &VenueConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(venue.request_timeout_secs))
            .build()
            .context("Failed to build CLOB HTTP client")?;

        Ok(Self {
            http,
            clob_url: venue.clob_url.trim_end_matches('/').to_string(),
            orders: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
        })
    }

    /// Register an order against an observed book, filling it at once if it
    /// crosses and is allowed to take.
    fn accept(&self, order: &SignedOrder, book: &OrderBook) -> PostOrderResponse {
        let spec = &order.spec;
        if spec.price <= Decimal::ZERO || spec.price >= Decimal::ONE || spec.size <= Decimal::ZERO {
            return PostOrderResponse::rejected(format!(
                "invalid order: price={} size={}",
                spec.price, spec.size
            ));
        }
        let would_cross = crosses(spec, book);
        if would_cross && spec.order_type == OrderType::GtcPostOnly {
            return PostOrderResponse::rejected("post-only order would cross the book");
        }
        if spec.side == OrderSide::Sell && self.balance_of(&spec.token_id) < spec.size {
            return PostOrderResponse::rejected("insufficient balance");
        }

        let order_id = format!("paper-{}", Uuid::new_v4());
        let mut paper = PaperOrder {
            spec: spec.clone(),
            status: OrderStatus::Live,
            size_matched: Decimal::ZERO,
        };
        if would_cross {
            self.fill(&mut paper);
        }
        info!(
            order_id = %order_id,
            token_id = %spec.token_id,
            side = ?spec.side,
            price = %spec.price,
            size = %spec.size,
            status = ?paper.status,
            "[PAPER] Order accepted"
        );
        self.orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(order_id.clone(), paper);
        PostOrderResponse::accepted(order_id)
    }

    /// Re-evaluate a live order against a fresh book.
    fn refresh(&self, order_id: &str, book: &OrderBook) -> Result<OrderState> {
        let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("unknown order {order_id}"))?;
        if order.status == OrderStatus::Live && crosses(&order.spec, book) {
            let mut filled = order.clone();
            self.fill(&mut filled);
            *order = filled;
            debug!(order_id, "[PAPER] Resting order filled");
        }
        Ok(order.state(order_id))
    }

    fn fill(&self, order: &mut PaperOrder) {
        order.status = OrderStatus::Filled;
        order.size_matched = order.spec.size;

        let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        let held = balances.entry(order.spec.token_id.clone()).or_insert(Decimal::ZERO);
        match order.spec.side {
            OrderSide::Buy => *held += order.spec.size,
            OrderSide::Sell => *held = (*held - order.spec.size).max(Decimal::ZERO),
        }
    }

    fn balance_of(&self, token_id: &str) -> Decimal {
        self.balances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn order_token(&self, order_id: &str) -> Result<(String, OrderStatus)> {
        let orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        orders
            .get(order_id)
            .map(|o| (o.spec.token_id.clone(), o.status))
            .ok_or_else(|| anyhow!("unknown order {order_id}"))
    }
}

#[async_trait]
impl TradingClient for PaperClient {
    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook> {
        let url = format!("{}/book", self.clob_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await
            .context("CLOB book request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("CLOB book error {status}: {body}");
        }

        let raw: BookResponse = resp.json().await.context("Failed to parse CLOB book")?;
        parse_book(token_id, &raw)
    }

    fn create_order(&self, spec: &OrderSpec) -> Result<SignedOrder> {
        Ok(SignedOrder {
            spec: spec.clone(),
            signature: format!("paper-sig-{}", Uuid::new_v4().simple()),
        })
    }

    async fn post_order(&self, order: &SignedOrder) -> Result<PostOrderResponse> {
        let book = self.get_order_book(&order.spec.token_id).await?;
        Ok(self.accept(order, &book))
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderState> {
        let (token_id, status) = self.order_token(order_id)?;
        if status != OrderStatus::Live {
            return self.refresh(order_id, &OrderBook::default());
        }
        let book = self.get_order_book(&token_id).await?;
        self.refresh(order_id, &book)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("unknown order {order_id}"))?;
        match order.status {
            OrderStatus::Live | OrderStatus::PartiallyFilled => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            OrderStatus::Cancelled => Ok(()),
            OrderStatus::Filled => bail!("order {order_id} already filled"),
        }
    }

    async fn get_balance(&self, token_id: &str) -> Result<Decimal> {
        Ok(self.balance_of(token_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
