//! Binance futures websocket dialects.
//!
//! Market data uses the combined stream with `SUBSCRIBE` requests; liveness
//! is probed with `GET_PROPERTY` requests whose response echoes the id.
//! Account data uses a listen-key user stream.

use super::rest::BinanceRest;
use super::types::{
    BookTickerData, KlineData, RequestResponse, StreamEnvelope, UserEvent,
};
use crate::error::{ExchangeResult, ProtocolError};
use crate::exchange::traits::{ControlFrame, Inbound, StreamProtocol};
use crate::exchange::types::{Candle, StreamKind};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Request ids at or above this value are liveness probes.
const PING_ID_BASE: u64 = 1_000_000;

/// Market-stream subscription for one native symbol.
#[derive(Debug, Clone)]
pub struct SymbolSubscription {
    pub symbol: String,
    /// Kline periods, e.g. `1m`, `15m`
    pub periods: Vec<String>,
}

/// Public book-ticker and kline stream.
pub struct BinanceMarketStream {
    ws_url: String,
    subscriptions: Vec<SymbolSubscription>,
}

impl BinanceMarketStream {
    pub fn new(ws_url: &str, subscriptions: Vec<SymbolSubscription>) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            subscriptions,
        }
    }

    fn parse_stream(envelope: StreamEnvelope) -> Result<Vec<Inbound>, ProtocolError> {
        let stream = envelope.stream.to_lowercase();
        if stream.ends_with("@bookticker") {
            let data: BookTickerData = serde_json::from_value(envelope.data)?;
            return Ok(vec![Inbound::Ticker {
                symbol: data.symbol,
                bid: data.bid_price,
                ask: data.ask_price,
            }]);
        }
        if stream.contains("@kline") {
            let data: KlineData = serde_json::from_value(envelope.data)?;
            let k = data.kline;
            return Ok(vec![Inbound::Candle(Candle {
                exchange: String::new(),
                symbol: data.symbol,
                period: k.interval,
                time: k.open_time / 1000,
                open: k.open,
                high: k.high,
                low: k.low,
                close: k.close,
                volume: k.volume,
            })]);
        }
        debug!(%stream, "Ignoring unsubscribed stream");
        Ok(Vec::new())
    }

    fn parse_response(response: RequestResponse) -> Inbound {
        if let Some(error) = response.error {
            return Inbound::Control(ControlFrame::Error(format!(
                "request {} failed: {} ({})",
                response.id, error.msg, error.code
            )));
        }
        if response.id >= PING_ID_BASE {
            Inbound::Control(ControlFrame::Pong(Some(response.id - PING_ID_BASE)))
        } else {
            Inbound::Control(ControlFrame::Ack(response.id))
        }
    }
}

#[async_trait]
impl StreamProtocol for BinanceMarketStream {
    fn kind(&self) -> StreamKind {
        StreamKind::Public
    }

    async fn endpoint(&self) -> ExchangeResult<String> {
        Ok(format!("{}/stream", self.ws_url))
    }

    fn subscription_frames(&self) -> Vec<String> {
        self.subscriptions
            .iter()
            .enumerate()
            .map(|(i, sub)| {
                let lower = sub.symbol.to_lowercase();
                let mut params = vec![format!("{}@bookTicker", lower)];
                params.extend(sub.periods.iter().map(|p| format!("{}@kline_{}", lower, p)));
                json!({ "method": "SUBSCRIBE", "params": params, "id": i as u64 + 1 }).to_string()
            })
            .collect()
    }

    fn ping_frame(&self, ping_id: u64) -> String {
        json!({
            "method": "GET_PROPERTY",
            "params": ["combined"],
            "id": PING_ID_BASE + ping_id,
        })
        .to_string()
    }

    fn parse(&self, text: &str) -> Result<Vec<Inbound>, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("stream").is_some() {
            return Self::parse_stream(serde_json::from_value(value)?);
        }
        if value.get("id").is_some() {
            return Ok(vec![Self::parse_response(serde_json::from_value(value)?)]);
        }
        Err(ProtocolError::Unexpected(text.chars().take(200).collect()))
    }
}

/// Private user-data stream authenticated by a listen key.
pub struct BinanceUserStream {
    ws_url: String,
    rest: Arc<BinanceRest>,
    keepalive: Duration,
}

impl BinanceUserStream {
    pub fn new(ws_url: &str, rest: Arc<BinanceRest>, keepalive: Duration) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            rest,
            keepalive,
        }
    }
}

/// Decode one user-stream frame.
pub fn parse_user_event(text: &str) -> Result<Vec<Inbound>, ProtocolError> {
    let event: UserEvent = serde_json::from_str(text)?;
    Ok(match event {
        UserEvent::OrderTradeUpdate { order } => {
            let mut events = vec![Inbound::Order(order.to_order())];
            if let Some(trade) = order.to_trade() {
                events.push(Inbound::Trade(trade));
            }
            events
        }
        UserEvent::AccountUpdate => vec![Inbound::AccountUpdate],
        UserEvent::ListenKeyExpired => vec![Inbound::Control(ControlFrame::Reconnect(
            "listen key expired".to_string(),
        ))],
        UserEvent::Other => Vec::new(),
    })
}

#[async_trait]
impl StreamProtocol for BinanceUserStream {
    fn kind(&self) -> StreamKind {
        StreamKind::Private
    }

    async fn endpoint(&self) -> ExchangeResult<String> {
        let listen_key = self.rest.create_listen_key().await?;
        info!("Binance user stream listen key acquired");
        Ok(format!("{}/ws/{}", self.ws_url, listen_key))
    }

    fn subscription_frames(&self) -> Vec<String> {
        Vec::new()
    }

    fn probes_liveness(&self) -> bool {
        false
    }

    fn ping_frame(&self, ping_id: u64) -> String {
        json!({ "method": "LIST_SUBSCRIPTIONS", "id": PING_ID_BASE + ping_id }).to_string()
    }

    fn parse(&self, text: &str) -> Result<Vec<Inbound>, ProtocolError> {
        parse_user_event(text)
    }

    fn keepalive_interval(&self) -> Option<Duration> {
        Some(self.keepalive)
    }

    async fn keepalive(&self) -> ExchangeResult<()> {
        self.rest.keepalive_listen_key().await?;
        debug!("Binance user stream keepalive done");
        Ok(())
    }
}
