//! FTX REST adapter.

use super::types::{
    Envelope, FtxFill, FtxOrder, FtxPosition, ModifyOrderRequest, PlaceOrderRequest,
};
use super::FtxEndpoints;
use crate::error::{ExchangeError, ExchangeResult, ProtocolError};
use crate::exchange::traits::ExchangeAdapter;
use crate::exchange::types::{NewOrder, Order, OrderAmendment, OrderSide, OrderType, Position, Trade};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument};

pub(super) fn sign(secret: &str, payload: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Signed REST client. Requests are signed over `ts + method + path + body`.
pub struct FtxRest {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl FtxRest {
    pub fn new(
        endpoints: &FtxEndpoints,
        api_key: &str,
        secret_key: &str,
        timeout: Duration,
    ) -> ExchangeResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
            base_url: endpoints.rest_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        time_offset_ms: i64,
    ) -> ExchangeResult<T> {
        let mut request = self
            .http
            .request(method.clone(), format!("{}{}", self.base_url, path));

        if self.has_credentials() {
            let ts = (Utc::now().timestamp_millis() + time_offset_ms).to_string();
            let payload = format!(
                "{}{}/api{}{}",
                ts,
                method.as_str(),
                path,
                body.as_deref().unwrap_or("")
            );
            request = request
                .header("FTX-KEY", &self.api_key)
                .header("FTX-TS", ts)
                .header("FTX-SIGN", sign(&self.secret_key, &payload));
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_server_error() {
            return Err(ExchangeError::Server {
                status: status.as_u16(),
                body: text,
            });
        }

        let envelope: Envelope<T> = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Protocol(ProtocolError::Json(e)))?;
        match (envelope.success, envelope.result) {
            (true, Some(result)) => Ok(result),
            (_, _) => Err(ExchangeError::Api {
                status: status.as_u16(),
                message: envelope.error.unwrap_or_else(|| "empty result".to_string()),
            }),
        }
    }

    fn require_credentials(&self) -> ExchangeResult<()> {
        if self.has_credentials() {
            Ok(())
        } else {
            Err(ExchangeError::Unauthenticated("ftx".to_string()))
        }
    }

    fn encode_body<T: serde::Serialize>(body: &T) -> ExchangeResult<String> {
        serde_json::to_string(body).map_err(|e| ExchangeError::Protocol(ProtocolError::Json(e)))
    }
}

#[async_trait]
impl ExchangeAdapter for FtxRest {
    fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }

    #[instrument(skip(self))]
    async fn server_time_ms(&self) -> ExchangeResult<i64> {
        let time: DateTime<Utc> = self.request(Method::GET, "/time", None, 0).await?;
        Ok(time.timestamp_millis())
    }

    #[instrument(skip(self))]
    async fn create_order(&self, order: &NewOrder, time_offset_ms: i64) -> ExchangeResult<Order> {
        self.require_credentials()?;
        let (order_type, price) = match order.order_type {
            OrderType::Market => ("market", None),
            OrderType::Limit => ("limit", order.price),
        };
        if order.order_type == OrderType::Limit && price.is_none() {
            return Err(ExchangeError::InvalidParameters(
                "limit order without price".to_string(),
            ));
        }
        let body = Self::encode_body(&PlaceOrderRequest {
            market: &order.symbol,
            side: match order.side() {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            price,
            order_type,
            size: order.quantity(),
            reduce_only: order.reduce_only,
        })?;

        debug!(market = %order.symbol, amount = %order.amount, "Placing order");

        let placed: ExchangeResult<FtxOrder> = self
            .request(Method::POST, "/orders", Some(body), time_offset_ms)
            .await;
        match placed {
            Ok(o) => Ok(o.into()),
            Err(ExchangeError::Api { message, .. }) => {
                Err(ExchangeError::OrderRejected { reason: message })
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: &str,
        time_offset_ms: i64,
    ) -> ExchangeResult<()> {
        self.require_credentials()?;
        let _: serde_json::Value = self
            .request(
                Method::DELETE,
                &format!("/orders/{}", order_id),
                None,
                time_offset_ms,
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn amend_order(
        &self,
        order: &Order,
        amendment: &OrderAmendment,
        time_offset_ms: i64,
    ) -> ExchangeResult<Order> {
        self.require_credentials()?;
        let body = Self::encode_body(&ModifyOrderRequest {
            size: amendment.amount.map(|a| a.abs()),
            price: amendment.price,
        })?;
        let modified: FtxOrder = self
            .request(
                Method::POST,
                &format!("/orders/{}/modify", order.id),
                Some(body),
                time_offset_ms,
            )
            .await?;
        Ok(modified.into())
    }

    #[instrument(skip(self))]
    async fn fetch_open_orders(&self, time_offset_ms: i64) -> ExchangeResult<Vec<Order>> {
        self.require_credentials()?;
        let orders: Vec<FtxOrder> = self
            .request(Method::GET, "/orders", None, time_offset_ms)
            .await?;
        Ok(orders.into_iter().map(Order::from).collect())
    }

    #[instrument(skip(self))]
    async fn fetch_positions(&self, time_offset_ms: i64) -> ExchangeResult<Vec<Position>> {
        self.require_credentials()?;
        let positions: Vec<FtxPosition> = self
            .request(Method::GET, "/positions?showAvgPrice=true", None, time_offset_ms)
            .await?;
        Ok(positions
            .into_iter()
            .filter_map(FtxPosition::into_position)
            .collect())
    }

    #[instrument(skip(self))]
    async fn fetch_trades(
        &self,
        symbol: &str,
        order_id: &str,
        time_offset_ms: i64,
    ) -> ExchangeResult<Vec<Trade>> {
        self.require_credentials()?;
        let path = format!(
            "/fills?market={}&orderId={}",
            urlencoding::encode(symbol),
            urlencoding::encode(order_id)
        );
        let fills: Vec<FtxFill> = self.request(Method::GET, &path, None, time_offset_ms).await?;
        Ok(fills
            .into_iter()
            .filter(|f| f.order_id.to_string() == order_id)
            .map(Trade::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::OrderStatus;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> FtxRest {
        let endpoints = FtxEndpoints {
            rest_url: server.uri(),
            ws_url: String::new(),
        };
        FtxRest::new(&endpoints, "key", "secret", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_place_order_sends_signed_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header_exists("FTX-SIGN"))
            .and(header_exists("FTX-TS"))
            .and(body_partial_json(serde_json::json!({
                "market": "BTC-PERP",
                "side": "sell",
                "type": "market",
                "reduceOnly": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"success":true,"result":{"id":11,"market":"BTC-PERP","type":"market",
                    "side":"sell","price":null,"size":2,"filledSize":0,"avgFillPrice":null,
                    "status":"new","createdAt":"2021-01-01T00:00:00+00:00"}}"#,
            ))
            .mount(&server)
            .await;

        let order = client(&server)
            .create_order(&NewOrder::market("BTC-PERP", dec!(-2)).reduce_only(), 0)
            .await
            .unwrap();
        assert_eq!(order.id, "11");
        assert_eq!(order.status, OrderStatus::New);
    }

    #[tokio::test]
    async fn test_unsuccessful_order_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"success":false,"error":"Not enough balances"}"#),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .create_order(&NewOrder::market("BTC-PERP", dec!(1)), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::OrderRejected { .. }));
    }

    #[tokio::test]
    async fn test_server_time_parses_iso() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/time"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"success":true,"result":"2021-01-01T00:00:01.500000+00:00"}"#,
            ))
            .mount(&server)
            .await;

        assert_eq!(
            client(&server).server_time_ms().await.unwrap(),
            1_609_459_201_500
        );
    }

    #[tokio::test]
    async fn test_positions_keep_open_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"success":true,"result":[
                    {"future":"BTC-PERP","side":"buy","size":1,"recentAverageOpenPrice":100},
                    {"future":"ETH-PERP","side":"buy","size":0,"recentAverageOpenPrice":null}
                ]}"#,
            ))
            .mount(&server)
            .await;

        let positions = client(&server).fetch_positions(0).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTC-PERP");
    }
}
