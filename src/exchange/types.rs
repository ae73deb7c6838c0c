//! Canonical market and account types shared by every exchange integration.
//!
//! Exchange-specific payloads are converted into these shapes at the
//! connector boundary. Symbols held here are always canonical (`BASEQUOTE`).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Best bid/ask snapshot. Replaced wholesale on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticker {
    pub exchange: String,
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
    pub is_estimated: bool,
}

impl Ticker {
    pub fn new(exchange: &str, symbol: &str, bid: Decimal, ask: Decimal) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            time: Utc::now(),
            bid,
            ask,
            is_estimated: false,
        }
    }
}

/// OHLCV candle from a kline stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candle {
    pub exchange: String,
    pub symbol: String,
    pub period: String,
    /// Candle open time (unix seconds)
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

/// Open position. `amount` is signed: negative for shorts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub amount: Decimal,
    pub entry: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub profit_percent: Option<Decimal>,
}

impl Position {
    /// Build a position from a signed amount.
    pub fn from_signed(symbol: &str, amount: Decimal, entry: Option<Decimal>) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: if amount < Decimal::ZERO {
                PositionSide::Short
            } else {
                PositionSide::Long
            },
            amount,
            entry,
            opened_at: Utc::now(),
            profit_percent: None,
        }
    }

    /// Copy of this position annotated with a profit percentage.
    pub fn with_profit(&self, profit_percent: Decimal) -> Self {
        Self {
            profit_percent: Some(profit_percent),
            ..self.clone()
        }
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side implied by a signed amount (positive buys).
    pub fn from_amount(amount: Decimal) -> Self {
        if amount < Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    /// Apply this side's sign to an unsigned quantity.
    pub fn signed(&self, qty: Decimal) -> Decimal {
        match self {
            OrderSide::Buy => qty.abs(),
            OrderSide::Sell => -qty.abs(),
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Canonical order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    New,
    Open,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Whether the order can still trade.
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::Open)
    }
}

/// Order as tracked by a connector. `amount` is unsigned; `side` carries direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_amount: Decimal,
    pub average_price: Option<Decimal>,
    /// Round-trip duration of the submitting request
    pub exec_duration_ms: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Filled quantity with the side's sign applied.
    pub fn signed_filled(&self) -> Decimal {
        self.side.signed(self.filled_amount)
    }
}

/// Order request. `amount` is signed: positive buys, negative sells.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewOrder {
    pub symbol: String,
    pub amount: Decimal,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
}

impl NewOrder {
    /// Market order for a signed amount.
    pub fn market(symbol: &str, amount: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            amount,
            order_type: OrderType::Market,
            price: None,
            reduce_only: false,
        }
    }

    /// Limit order for a signed amount.
    pub fn limit(symbol: &str, amount: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            amount,
            order_type: OrderType::Limit,
            price: Some(price),
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn side(&self) -> OrderSide {
        OrderSide::from_amount(self.amount)
    }

    /// Unsigned quantity sent to the exchange.
    pub fn quantity(&self) -> Decimal {
        self.amount.abs()
    }
}

/// Amendment of an open order. At least one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderAmendment {
    pub amount: Option<Decimal>,
    pub price: Option<Decimal>,
}

impl OrderAmendment {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.price.is_none()
    }
}

/// Single execution report for an order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub qty: Decimal,
}

/// Which stream of an exchange a session serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Public,
    Private,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Public => write!(f, "public"),
            StreamKind::Private => write!(f, "private"),
        }
    }
}

/// Market data published by public sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Ticker(Ticker),
    Candle(Candle),
}

/// Account data published by private sessions to their connector.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountEvent {
    Order(Order),
    Trade(Trade),
    /// Balances or positions changed; positions must be re-synced.
    PositionsChanged,
}
