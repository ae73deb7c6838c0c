//! Binance USDⓈ-M futures wire payloads.

use crate::exchange::types::{Order, OrderSide, OrderStatus, OrderType, Position, Trade};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub server_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKey {
    pub listen_key: String,
}

/// Order as returned by `/fapi/v1/order` and `/fapi/v1/openOrders`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub update_time: i64,
}

impl From<OrderResponse> for Order {
    fn from(r: OrderResponse) -> Self {
        Order {
            id: r.order_id.to_string(),
            symbol: r.symbol,
            side: parse_side(&r.side),
            order_type: parse_order_type(&r.order_type),
            amount: r.orig_qty,
            price: non_zero(r.price),
            status: parse_status(&r.status),
            filled_amount: r.executed_qty,
            average_price: r.avg_price.and_then(non_zero),
            exec_duration_ms: None,
            updated_at: millis_to_datetime(r.update_time),
        }
    }
}

/// Entry of `/fapi/v2/positionRisk`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(rename = "positionAmt", with = "rust_decimal::serde::str")]
    pub position_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
}

impl PositionRisk {
    /// Only entries with a positive entry price are open positions.
    pub fn into_position(self) -> Option<Position> {
        if self.entry_price <= Decimal::ZERO || self.position_amount == Decimal::ZERO {
            return None;
        }
        Some(Position::from_signed(
            &self.symbol,
            self.position_amount,
            Some(self.entry_price),
        ))
    }
}

/// Entry of `/fapi/v1/userTrades`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTrade {
    pub id: i64,
    pub order_id: i64,
    pub symbol: String,
    pub side: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
}

impl From<UserTrade> for Trade {
    fn from(t: UserTrade) -> Self {
        Trade {
            trade_id: t.id.to_string(),
            order_id: t.order_id.to_string(),
            symbol: t.symbol,
            side: parse_side(&t.side),
            price: t.price,
            qty: t.qty,
        }
    }
}

// ==================== Websocket frames ====================

/// Combined-stream envelope: `{"stream": "...", "data": {...}}`.
#[derive(Debug, Deserialize)]
pub struct StreamEnvelope {
    pub stream: String,
    pub data: serde_json::Value,
}

/// Response to a request frame (`SUBSCRIBE`, `GET_PROPERTY`).
#[derive(Debug, Deserialize)]
pub struct RequestResponse {
    pub id: u64,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b", with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(rename = "a", with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlineData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: Kline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Kline {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o", with = "rust_decimal::serde::str")]
    pub open: Decimal,
    #[serde(rename = "h", with = "rust_decimal::serde::str")]
    pub high: Decimal,
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    pub close: Decimal,
    #[serde(rename = "v", with = "rust_decimal::serde::str")]
    pub volume: Decimal,
}

/// User-stream event, tagged by `e`.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
pub enum UserEvent {
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate {
        #[serde(rename = "o")]
        order: OrderTradeUpdate,
    },
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate,
    #[serde(rename = "listenKeyExpired")]
    ListenKeyExpired,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderTradeUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(rename = "ap", with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    /// Execution type: NEW, TRADE, CANCELED, ...
    #[serde(rename = "x")]
    pub execution_type: String,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub last_filled_qty: Decimal,
    #[serde(rename = "z", with = "rust_decimal::serde::str")]
    pub cumulative_filled_qty: Decimal,
    #[serde(rename = "L", with = "rust_decimal::serde::str")]
    pub last_filled_price: Decimal,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "t")]
    pub trade_id: i64,
}

impl OrderTradeUpdate {
    pub fn to_order(&self) -> Order {
        Order {
            id: self.order_id.to_string(),
            symbol: self.symbol.clone(),
            side: parse_side(&self.side),
            order_type: parse_order_type(&self.order_type),
            amount: self.orig_qty,
            price: non_zero(self.price),
            status: parse_status(&self.status),
            filled_amount: self.cumulative_filled_qty,
            average_price: non_zero(self.avg_price),
            exec_duration_ms: None,
            updated_at: millis_to_datetime(self.trade_time),
        }
    }

    /// The execution carried by this update, if it reports one.
    pub fn to_trade(&self) -> Option<Trade> {
        if self.execution_type != "TRADE" || self.last_filled_qty == Decimal::ZERO {
            return None;
        }
        Some(Trade {
            trade_id: self.trade_id.to_string(),
            order_id: self.order_id.to_string(),
            symbol: self.symbol.clone(),
            side: parse_side(&self.side),
            price: self.last_filled_price,
            qty: self.last_filled_qty,
        })
    }
}

// ==================== Conversions ====================

pub fn parse_side(side: &str) -> OrderSide {
    if side.eq_ignore_ascii_case("SELL") {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

pub fn parse_order_type(order_type: &str) -> OrderType {
    if order_type.eq_ignore_ascii_case("LIMIT") {
        OrderType::Limit
    } else {
        OrderType::Market
    }
}

pub fn parse_status(status: &str) -> OrderStatus {
    match status {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::Open,
        "FILLED" => OrderStatus::Filled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Canceled,
    }
}

fn non_zero(value: Decimal) -> Option<Decimal> {
    (value != Decimal::ZERO).then_some(value)
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
