//! FTX op-dialect websocket.
//!
//! One socket carries public `ticker` channels and, after login, the private
//! `orders` and `fills` channels. Pongs carry no correlation id.

use super::rest::sign;
use super::types::{FtxFill, FtxOrder, TickerData, WsFrame};
use crate::error::{ExchangeResult, ProtocolError};
use crate::exchange::traits::{ControlFrame, Inbound, StreamProtocol};
use crate::exchange::types::{Order, StreamKind, Trade};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Server asks clients to reconnect.
const INFO_RECONNECT: i64 = 20001;

pub struct FtxStream {
    ws_url: String,
    /// Native market names, e.g. `BTC-PERP`
    markets: Vec<String>,
    credentials: Option<(String, String)>,
    /// `server_time - local_time` in milliseconds, kept fresh by the connector
    clock_offset: Arc<AtomicI64>,
}

impl FtxStream {
    pub fn new(ws_url: &str, markets: Vec<String>, credentials: Option<(String, String)>) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            markets,
            credentials,
            clock_offset: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Sign the login with the connector's clock offset.
    pub fn with_clock_offset(mut self, offset: Arc<AtomicI64>) -> Self {
        self.clock_offset = offset;
        self
    }

    fn login_frame(key: &str, secret: &str, time_ms: i64) -> String {
        let signature = sign(secret, &format!("{}websocket_login", time_ms));
        json!({
            "op": "login",
            "args": { "key": key, "sign": signature, "time": time_ms },
        })
        .to_string()
    }

    fn parse_update(frame: WsFrame) -> Result<Vec<Inbound>, ProtocolError> {
        let channel = frame.channel.unwrap_or_default();
        let data = frame
            .data
            .ok_or_else(|| ProtocolError::Malformed(format!("{} update without data", channel)))?;

        match channel.as_str() {
            "ticker" => {
                let market = frame
                    .market
                    .ok_or_else(|| ProtocolError::Malformed("ticker without market".into()))?;
                let ticker: TickerData = serde_json::from_value(data)?;
                match (ticker.bid, ticker.ask) {
                    (Some(bid), Some(ask)) => Ok(vec![Inbound::Ticker {
                        symbol: market,
                        bid,
                        ask,
                    }]),
                    _ => Ok(Vec::new()),
                }
            }
            "orders" => {
                let order: FtxOrder = serde_json::from_value(data)?;
                Ok(vec![Inbound::Order(Order::from(order))])
            }
            "fills" => {
                let fill: FtxFill = serde_json::from_value(data)?;
                Ok(vec![Inbound::Trade(Trade::from(fill))])
            }
            other => {
                debug!(channel = %other, "Ignoring update");
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl StreamProtocol for FtxStream {
    fn kind(&self) -> StreamKind {
        StreamKind::Public
    }

    async fn endpoint(&self) -> ExchangeResult<String> {
        Ok(self.ws_url.clone())
    }

    fn subscription_frames(&self) -> Vec<String> {
        let mut frames: Vec<String> = self
            .markets
            .iter()
            .map(|m| json!({ "op": "subscribe", "channel": "ticker", "market": m }).to_string())
            .collect();

        if let Some((key, secret)) = &self.credentials {
            let time_ms = Utc::now().timestamp_millis() + self.clock_offset.load(Ordering::Relaxed);
            frames.push(Self::login_frame(key, secret, time_ms));
            for channel in ["fills", "orders"] {
                frames.push(json!({ "op": "subscribe", "channel": channel }).to_string());
            }
        }
        frames
    }

    fn ping_frame(&self, _ping_id: u64) -> String {
        json!({ "op": "ping" }).to_string()
    }

    fn parse(&self, text: &str) -> Result<Vec<Inbound>, ProtocolError> {
        let frame: WsFrame = serde_json::from_str(text)?;
        match frame.frame_type.as_str() {
            "pong" => Ok(vec![Inbound::Control(ControlFrame::Pong(None))]),
            "subscribed" => Ok(vec![Inbound::Control(ControlFrame::Subscribed(format!(
                "{} {}",
                frame.channel.unwrap_or_default(),
                frame.market.unwrap_or_default()
            )))]),
            "unsubscribed" | "partial" => Ok(Vec::new()),
            "error" => Ok(vec![Inbound::Control(ControlFrame::Error(format!(
                "{} ({})",
                frame.msg.unwrap_or_default(),
                frame.code.unwrap_or_default()
            )))]),
            "info" if frame.code == Some(INFO_RECONNECT) => Ok(vec![Inbound::Control(
                ControlFrame::Reconnect(frame.msg.unwrap_or_else(|| "server restart".into())),
            )]),
            "info" => Ok(Vec::new()),
            "update" => Self::parse_update(frame),
            other => Err(ProtocolError::Unexpected(format!("frame type {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::{OrderSide, OrderStatus};
    use rust_decimal_macros::dec;
    use serde_json::Value;

    fn stream(credentials: bool) -> FtxStream {
        FtxStream::new(
            "wss://ftx.com/ws/",
            vec!["BTC-PERP".into()],
            credentials.then(|| ("key".to_string(), "secret".to_string())),
        )
    }

    #[test]
    fn test_public_only_subscriptions() {
        let frames = stream(false).subscription_frames();
        assert_eq!(frames.len(), 1);
        let v: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["channel"], "ticker");
        assert_eq!(v["market"], "BTC-PERP");
    }

    #[test]
    fn test_login_and_private_channels() {
        let frames = stream(true).subscription_frames();
        assert_eq!(frames.len(), 4);
        let login: Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(login["op"], "login");
        assert_eq!(login["args"]["key"], "key");
        assert_eq!(login["args"]["sign"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_login_signature_covers_time() {
        let a = FtxStream::login_frame("k", "s", 1);
        let b = FtxStream::login_frame("k", "s", 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_login_time_follows_clock_offset() {
        let offset = Arc::new(AtomicI64::new(3_600_000));
        let s = stream(true).with_clock_offset(offset.clone());

        let before = Utc::now().timestamp_millis();
        let frames = s.subscription_frames();
        let after = Utc::now().timestamp_millis();
        let login: Value = serde_json::from_str(&frames[1]).unwrap();
        let time = login["args"]["time"].as_i64().unwrap();
        assert!(time >= before + 3_600_000 && time <= after + 3_600_000);

        // Offset refreshed by the connector applies to the next login
        offset.store(-5_000, Ordering::Relaxed);
        let frames = s.subscription_frames();
        let login: Value = serde_json::from_str(&frames[1]).unwrap();
        assert!(login["args"]["time"].as_i64().unwrap() < Utc::now().timestamp_millis());
    }

    #[test]
    fn test_pong_is_uncorrelated() {
        let s = stream(false);
        assert_eq!(
            s.parse(r#"{"type":"pong"}"#).unwrap(),
            vec![Inbound::Control(ControlFrame::Pong(None))]
        );
        assert_eq!(s.ping_frame(3), r#"{"op":"ping"}"#);
    }

    #[test]
    fn test_ticker_update() {
        let events = stream(false)
            .parse(r#"{"channel":"ticker","market":"BTC-PERP","type":"update","data":{"bid":100.5,"ask":101,"bidSize":1,"askSize":2,"last":100.7,"time":1609459200.1}}"#)
            .unwrap();
        assert_eq!(
            events,
            vec![Inbound::Ticker {
                symbol: "BTC-PERP".into(),
                bid: dec!(100.5),
                ask: dec!(101)
            }]
        );
    }

    #[test]
    fn test_fills_and_orders() {
        let s = stream(true);
        let fill = s
            .parse(r#"{"channel":"fills","type":"update","data":{"id":5,"market":"BTC-PERP","orderId":9,"side":"sell","price":100,"size":3,"fee":0.1}}"#)
            .unwrap();
        match &fill[0] {
            Inbound::Trade(t) => {
                assert_eq!(t.order_id, "9");
                assert_eq!(t.side, OrderSide::Sell);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let order = s
            .parse(r#"{"channel":"orders","type":"update","data":{"id":9,"market":"BTC-PERP","type":"market","side":"sell","price":null,"size":3,"filledSize":3,"avgFillPrice":100,"status":"closed"}}"#)
            .unwrap();
        match &order[0] {
            Inbound::Order(o) => assert_eq!(o.status, OrderStatus::Filled),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_info_reconnect_and_errors() {
        let s = stream(false);
        assert!(matches!(
            s.parse(r#"{"type":"info","code":20001,"msg":"restart"}"#).unwrap()[0],
            Inbound::Control(ControlFrame::Reconnect(_))
        ));
        assert!(matches!(
            s.parse(r#"{"type":"error","code":400,"msg":"Invalid login credentials"}"#).unwrap()[0],
            Inbound::Control(ControlFrame::Error(_))
        ));
        assert!(s.parse(r#"{"type":"weird"}"#).is_err());
        assert!(s.parse("{").is_err());
    }
}
