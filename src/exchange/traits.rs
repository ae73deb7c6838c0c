//! Exchange-agnostic seams.
//!
//! Every exchange integration supplies:
//! - an [`ExchangeAdapter`] for REST order/position/trade calls
//! - one [`StreamProtocol`] per websocket stream it maintains
//!
//! Both speak the exchange's native symbol notation; the connector and the
//! session dispatcher translate to canonical symbols.

use crate::error::{ExchangeResult, ProtocolError};
use crate::exchange::types::{
    Candle, NewOrder, Order, OrderAmendment, Position, StreamKind, Trade,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

/// Decoded content of one inbound websocket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Best bid/ask for a native symbol
    Ticker {
        symbol: String,
        bid: Decimal,
        ask: Decimal,
    },
    Candle(Candle),
    Order(Order),
    Trade(Trade),
    /// Balances/positions changed
    AccountUpdate,
    Control(ControlFrame),
}

/// Session-level frames that are consumed by the session itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Subscribed(String),
    Error(String),
    /// Answer to a liveness probe, correlated when the protocol allows it
    Pong(Option<u64>),
    /// Acknowledgement of a request id (subscribe responses)
    Ack(u64),
    /// The exchange invalidated the stream; reconnect immediately
    Reconnect(String),
}

/// Wire dialect of one websocket stream.
#[async_trait]
pub trait StreamProtocol: Send + Sync {
    fn kind(&self) -> StreamKind;

    /// Resolve the URL to connect to. Private streams may authenticate here.
    async fn endpoint(&self) -> ExchangeResult<String>;

    /// Frames sent right after connecting (login and subscriptions).
    ///
    /// Called on every connect, so subscriptions are replayed after a reconnect.
    fn subscription_frames(&self) -> Vec<String>;

    /// Whether the session runs ping/pong probes on this stream.
    fn probes_liveness(&self) -> bool {
        true
    }

    /// Liveness probe carrying `ping_id`.
    fn ping_frame(&self, ping_id: u64) -> String;

    /// Decode one text frame. A frame may carry several events.
    fn parse(&self, text: &str) -> Result<Vec<Inbound>, ProtocolError>;

    /// Interval of the out-of-band keepalive, if the stream needs one.
    fn keepalive_interval(&self) -> Option<Duration> {
        None
    }

    async fn keepalive(&self) -> ExchangeResult<()> {
        Ok(())
    }
}

/// REST capabilities of one exchange.
///
/// Signed calls receive the connector's current clock offset
/// (`server_time - local_time`, milliseconds).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn has_credentials(&self) -> bool;

    /// Exchange server time in unix milliseconds.
    async fn server_time_ms(&self) -> ExchangeResult<i64>;

    async fn create_order(&self, order: &NewOrder, time_offset_ms: i64) -> ExchangeResult<Order>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        time_offset_ms: i64,
    ) -> ExchangeResult<()>;

    async fn amend_order(
        &self,
        order: &Order,
        amendment: &OrderAmendment,
        time_offset_ms: i64,
    ) -> ExchangeResult<Order>;

    async fn fetch_open_orders(&self, time_offset_ms: i64) -> ExchangeResult<Vec<Order>>;

    /// Currently open positions only (non-zero amount).
    async fn fetch_positions(&self, time_offset_ms: i64) -> ExchangeResult<Vec<Position>>;

    /// Trade history of one order.
    async fn fetch_trades(
        &self,
        symbol: &str,
        order_id: &str,
        time_offset_ms: i64,
    ) -> ExchangeResult<Vec<Trade>>;
}
