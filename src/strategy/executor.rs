//! Single-order intents.

use crate::error::{ExchangeError, HedgeError};
use crate::exchange::{ExchangeConnector, ExchangeRegistry, NewOrder, Order, OrderAmendment};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Order to place on a named exchange. The symbol is canonical.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub exchange: String,
    pub order: NewOrder,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Retries after the first try when the exchange rejects the order
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1500),
        }
    }
}

/// Places single orders, reusing a working order in the same direction.
pub struct OrderExecutor {
    exchanges: Arc<ExchangeRegistry>,
    config: ExecutorConfig,
}

impl OrderExecutor {
    pub fn new(exchanges: Arc<ExchangeRegistry>, config: ExecutorConfig) -> Self {
        Self { exchanges, config }
    }

    /// Amend the open order for the same symbol and side when one exists,
    /// otherwise create a new one.
    pub async fn on_order(&self, intent: &OrderIntent) -> Result<Order> {
        let connector = self
            .exchanges
            .get(&intent.exchange)
            .ok_or_else(|| HedgeError::UnknownExchange(intent.exchange.clone()))?;
        let order = &intent.order;

        let existing = connector
            .get_orders_for_symbol(&order.symbol)
            .into_iter()
            .find(|o| o.side == order.side());

        let Some(current) = existing else {
            return self.create_with_retry(&connector, order).await;
        };

        let amendment = OrderAmendment {
            amount: (current.amount != order.quantity()).then(|| order.quantity()),
            price: order.price.filter(|p| current.price != Some(*p)),
        };
        if amendment.is_empty() {
            debug!(exchange = %intent.exchange, order_id = %current.id, "Order unchanged");
            return Ok(current);
        }

        info!(
            exchange = %intent.exchange,
            order_id = %current.id,
            symbol = %order.symbol,
            amount = ?amendment.amount,
            price = ?amendment.price,
            "Updating open order"
        );
        connector
            .update_order(&current.id, amendment)
            .await
            .with_context(|| format!("failed to update order {} on {}", current.id, intent.exchange))
    }

    async fn create_with_retry(
        &self,
        connector: &ExchangeConnector,
        order: &NewOrder,
    ) -> Result<Order> {
        let exchange = connector.name();
        let max_retries = self.config.max_retries;
        let mut retry = 0;

        loop {
            match connector.submit_order(order.clone()).await {
                Ok(placed) => return Ok(placed),
                Err(ExchangeError::OrderRejected { reason }) if retry < max_retries => {
                    retry += 1;
                    warn!(
                        %exchange,
                        symbol = %order.symbol,
                        retry,
                        max_retries,
                        %reason,
                        "Order rejected, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to place {} order on {}", order.symbol, exchange)
                    })
                }
            }
        }
    }
}
