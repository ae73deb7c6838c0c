//! FTX wire payloads.

use crate::exchange::types::{Order, OrderSide, OrderStatus, OrderType, Position, Trade};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// REST envelope: `{"success": bool, "result": ..., "error": ...}`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest<'a> {
    pub market: &'a str,
    pub side: &'a str,
    pub price: Option<Decimal>,
    #[serde(rename = "type")]
    pub order_type: &'a str,
    pub size: Decimal,
    pub reduce_only: bool,
}

#[derive(Debug, Serialize)]
pub struct ModifyOrderRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

/// Order as returned by REST and pushed on the `orders` channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtxOrder {
    pub id: i64,
    pub market: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    pub price: Option<Decimal>,
    pub size: Decimal,
    #[serde(default)]
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<FtxOrder> for Order {
    fn from(o: FtxOrder) -> Self {
        let status = match o.status.as_str() {
            "new" => OrderStatus::New,
            "open" => OrderStatus::Open,
            "closed" if o.filled_size >= o.size && o.size > Decimal::ZERO => OrderStatus::Filled,
            _ => OrderStatus::Canceled,
        };
        Order {
            id: o.id.to_string(),
            symbol: o.market,
            side: parse_side(&o.side),
            order_type: if o.order_type == "limit" {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            amount: o.size,
            price: o.price,
            status,
            filled_amount: o.filled_size,
            average_price: o.avg_fill_price,
            exec_duration_ms: None,
            updated_at: o.created_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtxPosition {
    pub future: String,
    pub side: String,
    pub size: Decimal,
    #[serde(default)]
    pub recent_average_open_price: Option<Decimal>,
}

impl FtxPosition {
    pub fn into_position(self) -> Option<Position> {
        if self.size <= Decimal::ZERO {
            return None;
        }
        let amount = match parse_side(&self.side) {
            OrderSide::Sell => -self.size,
            OrderSide::Buy => self.size,
        };
        Some(Position::from_signed(
            &self.future,
            amount,
            self.recent_average_open_price,
        ))
    }
}

/// Fill as returned by `/fills` and pushed on the `fills` channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtxFill {
    pub id: i64,
    pub market: String,
    pub order_id: i64,
    pub side: String,
    pub price: Decimal,
    pub size: Decimal,
}

impl From<FtxFill> for Trade {
    fn from(f: FtxFill) -> Self {
        Trade {
            trade_id: f.id.to_string(),
            order_id: f.order_id.to_string(),
            symbol: f.market,
            side: parse_side(&f.side),
            price: f.price,
            qty: f.size,
        }
    }
}

// ==================== Websocket frames ====================

#[derive(Debug, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct TickerData {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
}

pub fn parse_side(side: &str) -> OrderSide {
    if side.eq_ignore_ascii_case("sell") {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_closed_order_status_depends_on_fill() {
        let json = |filled: &str| {
            format!(
                r#"{{"id":9,"market":"BTC-PERP","type":"market","side":"sell","price":null,
                    "size":10,"filledSize":{},"avgFillPrice":100.5,"status":"closed",
                    "createdAt":"2021-01-01T00:00:00.000000+00:00"}}"#,
                filled
            )
        };
        let filled: Order = serde_json::from_str::<FtxOrder>(&json("10")).unwrap().into();
        assert_eq!(filled.status, OrderStatus::Filled);
        let partial: Order = serde_json::from_str::<FtxOrder>(&json("7")).unwrap().into();
        assert_eq!(partial.status, OrderStatus::Canceled);
        assert_eq!(partial.signed_filled(), dec!(-7));
    }

    #[test]
    fn test_short_position_is_negative() {
        let json = r#"{"future":"ETH-PERP","side":"sell","size":2.5,"recentAverageOpenPrice":2000}"#;
        let p = serde_json::from_str::<FtxPosition>(json)
            .unwrap()
            .into_position()
            .unwrap();
        assert_eq!(p.amount, dec!(-2.5));
        assert_eq!(p.entry, Some(dec!(2000)));
    }
}
