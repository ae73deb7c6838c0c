//! Binance futures REST adapter.

use super::types::{
    ApiErrorBody, ListenKey, OrderResponse, PositionRisk, ServerTime, UserTrade,
};
use super::BinanceEndpoints;
use crate::error::{ExchangeError, ExchangeResult, ProtocolError};
use crate::exchange::traits::ExchangeAdapter;
use crate::exchange::types::{NewOrder, Order, OrderAmendment, OrderType, Position, Trade};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument};

/// Signed REST client for USDⓈ-M futures.
pub struct BinanceRest {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BinanceRest {
    pub fn new(
        endpoints: &BinanceEndpoints,
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
            base_url: endpoints.rest_url.clone(),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
        time_offset_ms: i64,
    ) -> ExchangeResult<T> {
        if !self.has_credentials() {
            return Err(ExchangeError::Unauthenticated("binance_futures".to_string()));
        }
        let timestamp = Utc::now().timestamp_millis() + time_offset_ms;
        params.push(("timestamp", timestamp.to_string()));

        let query = Self::encode(&params);
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Requests that only need the API key header (listen-key management).
    async fn keyed<T: DeserializeOwned>(&self, method: Method, path: &str) -> ExchangeResult<T> {
        if !self.has_credentials() {
            return Err(ExchangeError::Unauthenticated("binance_futures".to_string()));
        }
        let response = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> ExchangeResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_server_error() {
            return Err(ExchangeError::Server {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|e| format!("{} ({})", e.msg, e.code))
                .unwrap_or(body);
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::Protocol(ProtocolError::Json(e)))
    }

    /// Open a user-data stream and return its listen key.
    #[instrument(skip(self))]
    pub async fn create_listen_key(&self) -> ExchangeResult<String> {
        let key: ListenKey = self.keyed(Method::POST, "/fapi/v1/listenKey").await?;
        Ok(key.listen_key)
    }

    /// Extend the validity of the current listen key.
    #[instrument(skip(self))]
    pub async fn keepalive_listen_key(&self) -> ExchangeResult<()> {
        let _: serde_json::Value = self.keyed(Method::PUT, "/fapi/v1/listenKey").await?;
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceRest {
    fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }

    #[instrument(skip(self))]
    async fn server_time_ms(&self) -> ExchangeResult<i64> {
        let response = self
            .http
            .get(format!("{}/fapi/v1/time", self.base_url))
            .send()
            .await?;
        let time: ServerTime = Self::decode(response).await?;
        Ok(time.server_time)
    }

    #[instrument(skip(self))]
    async fn create_order(&self, order: &NewOrder, time_offset_ms: i64) -> ExchangeResult<Order> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side().to_string()),
            ("quantity", order.quantity().to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        match (order.order_type, order.price) {
            (OrderType::Limit, Some(price)) => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("price", price.to_string()));
                params.push(("timeInForce", "GTC".to_string()));
            }
            (OrderType::Limit, None) => {
                return Err(ExchangeError::InvalidParameters(
                    "limit order without price".to_string(),
                ));
            }
            (OrderType::Market, _) => params.push(("type", "MARKET".to_string())),
        }
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        debug!(symbol = %order.symbol, amount = %order.amount, "Placing futures order");

        let response: ExchangeResult<OrderResponse> = self
            .signed(Method::POST, "/fapi/v1/order", params, time_offset_ms)
            .await;
        match response {
            Ok(r) => Ok(r.into()),
            Err(ExchangeError::Api { message, .. }) => {
                Err(ExchangeError::OrderRejected { reason: message })
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        time_offset_ms: i64,
    ) -> ExchangeResult<()> {
        let params = vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let _: OrderResponse = self
            .signed(Method::DELETE, "/fapi/v1/order", params, time_offset_ms)
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
        let price = amendment.price.or(order.price).ok_or_else(|| {
            ExchangeError::InvalidParameters("only limit orders can be amended".to_string())
        })?;
        let quantity = amendment.amount.map(|a| a.abs()).unwrap_or(order.amount);

        let params = vec![
            ("symbol", order.symbol.clone()),
            ("orderId", order.id.clone()),
            ("side", order.side.to_string()),
            ("quantity", quantity.to_string()),
            ("price", price.to_string()),
        ];
        let response: OrderResponse = self
            .signed(Method::PUT, "/fapi/v1/order", params, time_offset_ms)
            .await?;
        Ok(response.into())
    }

    #[instrument(skip(self))]
    async fn fetch_open_orders(&self, time_offset_ms: i64) -> ExchangeResult<Vec<Order>> {
        let orders: Vec<OrderResponse> = self
            .signed(Method::GET, "/fapi/v1/openOrders", Vec::new(), time_offset_ms)
            .await?;
        Ok(orders.into_iter().map(Order::from).collect())
    }

    #[instrument(skip(self))]
    async fn fetch_positions(&self, time_offset_ms: i64) -> ExchangeResult<Vec<Position>> {
        let entries: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", Vec::new(), time_offset_ms)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(PositionRisk::into_position)
            .collect())
    }

    #[instrument(skip(self))]
    async fn fetch_trades(
        &self,
        symbol: &str,
        order_id: &str,
        time_offset_ms: i64,
    ) -> ExchangeResult<Vec<Trade>> {
        let params = vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let trades: Vec<UserTrade> = self
            .signed(Method::GET, "/fapi/v1/userTrades", params, time_offset_ms)
            .await?;
        Ok(trades
            .into_iter()
            .filter(|t| t.order_id.to_string() == order_id)
            .map(Trade::from)
            .collect())
    }
}
