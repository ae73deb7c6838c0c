//! Simulated exchange for dry runs and coordinator tests.

use super::traits::ExchangeAdapter;
use super::types::*;
use crate::error::{ExchangeError, ExchangeResult};
use crate::utils::decimal::fee_for;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// How the simulated matching engine treats new orders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillBehavior {
    /// Fill completely at the current price.
    Immediate,
    /// Fill this fraction of the quantity, cancel the rest.
    Partial(Decimal),
    /// Accept and rest forever without trading.
    Never,
    /// Refuse the order.
    Reject,
}

/// Simulated account state.
#[derive(Debug, Default)]
pub struct SimulatedState {
    pub orders: HashMap<String, Order>,
    pub trades: Vec<Trade>,
    /// Signed amount and entry price per symbol
    pub positions: HashMap<String, (Decimal, Decimal)>,
    pub total_fees: Decimal,
}

/// In-process exchange implementing [`ExchangeAdapter`].
pub struct SimulatedExchange {
    name: String,
    state: Arc<RwLock<SimulatedState>>,
    behavior: RwLock<FillBehavior>,
    prices: RwLock<HashMap<String, Decimal>>,
    /// Taker fee in percent
    fee_percent: Decimal,
    order_id_counter: AtomicU64,
    trade_id_counter: AtomicU64,
    fetch_trades_calls: AtomicUsize,
    fail_positions: AtomicBool,
    account_tx: Option<mpsc::Sender<AccountEvent>>,
}

impl SimulatedExchange {
    pub fn new(name: &str, behavior: FillBehavior) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(RwLock::new(SimulatedState::default())),
            behavior: RwLock::new(behavior),
            prices: RwLock::new(HashMap::new()),
            fee_percent: dec!(0.04),
            order_id_counter: AtomicU64::new(1),
            trade_id_counter: AtomicU64::new(1),
            fetch_trades_calls: AtomicUsize::new(0),
            fail_positions: AtomicBool::new(false),
            account_tx: None,
        }
    }

    pub fn with_fee_percent(mut self, fee_percent: Decimal) -> Self {
        self.fee_percent = fee_percent;
        self
    }

    /// Push order and trade updates like a private stream would.
    pub fn with_account_stream(mut self, tx: mpsc::Sender<AccountEvent>) -> Self {
        self.account_tx = Some(tx);
        self
    }

    pub async fn set_behavior(&self, behavior: FillBehavior) {
        *self.behavior.write().await = behavior;
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    /// Make position queries fail until reset.
    pub fn set_fail_positions(&self, fail: bool) {
        self.fail_positions.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_trades_calls(&self) -> usize {
        self.fetch_trades_calls.load(Ordering::SeqCst)
    }

    pub async fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.state.read().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id.parse::<u64>().unwrap_or_default());
        orders
    }

    pub async fn total_fees(&self) -> Decimal {
        self.state.read().await.total_fees
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn push(&self, event: AccountEvent) {
        if let Some(tx) = &self.account_tx {
            if let Err(e) = tx.try_send(event) {
                debug!(exchange = %self.name, error = %e, "Simulated push dropped");
            }
        }
    }

    /// Execute `qty` (signed) against the simulated book.
    fn execute(state: &mut SimulatedState, trade: Trade, fee_percent: Decimal) {
        let signed = trade.side.signed(trade.qty);
        let entry = state
            .positions
            .entry(trade.symbol.clone())
            .or_insert((Decimal::ZERO, Decimal::ZERO));

        let (amount, entry_price) = *entry;
        let next = amount + signed;
        let next_entry = if next == Decimal::ZERO {
            Decimal::ZERO
        } else if amount == Decimal::ZERO || (amount > Decimal::ZERO) != (next > Decimal::ZERO) {
            trade.price
        } else if (signed > Decimal::ZERO) == (amount > Decimal::ZERO) {
            (amount * entry_price + signed * trade.price) / next
        } else {
            entry_price
        };
        *entry = (next, next_entry);
        if next == Decimal::ZERO {
            state.positions.remove(&trade.symbol);
        }

        state.total_fees += fee_for(trade.price * trade.qty, fee_percent);
        state.trades.push(trade);
    }
}

#[async_trait]
impl ExchangeAdapter for SimulatedExchange {
    fn has_credentials(&self) -> bool {
        true
    }

    async fn server_time_ms(&self) -> ExchangeResult<i64> {
        Ok(Utc::now().timestamp_millis())
    }

    async fn create_order(&self, order: &NewOrder, _time_offset_ms: i64) -> ExchangeResult<Order> {
        let behavior = *self.behavior.read().await;
        if behavior == FillBehavior::Reject {
            info!(exchange = %self.name, symbol = %order.symbol, "Simulated order rejected");
            return Err(ExchangeError::OrderRejected {
                reason: "simulated rejection".to_string(),
            });
        }

        let price = match (order.order_type, order.price) {
            (OrderType::Limit, Some(price)) => price,
            _ => self
                .prices
                .read()
                .await
                .get(&order.symbol)
                .copied()
                .unwrap_or(dec!(1)),
        };

        let quantity = order.quantity();
        let (status, filled) = match behavior {
            FillBehavior::Immediate => (OrderStatus::Filled, quantity),
            FillBehavior::Partial(fraction) => (OrderStatus::Canceled, quantity * fraction),
            FillBehavior::Never | FillBehavior::Reject => (OrderStatus::New, Decimal::ZERO),
        };

        let id = self.next_order_id().to_string();
        let placed = Order {
            id: id.clone(),
            symbol: order.symbol.clone(),
            side: order.side(),
            order_type: order.order_type,
            amount: quantity,
            price: order.price,
            status,
            filled_amount: filled,
            average_price: (filled > Decimal::ZERO).then_some(price),
            exec_duration_ms: None,
            updated_at: Utc::now(),
        };

        let mut state = self.state.write().await;
        state.orders.insert(id.clone(), placed.clone());
        if filled > Decimal::ZERO {
            let trade = Trade {
                trade_id: self.trade_id_counter.fetch_add(1, Ordering::SeqCst).to_string(),
                order_id: id.clone(),
                symbol: order.symbol.clone(),
                side: order.side(),
                price,
                qty: filled,
            };
            Self::execute(&mut state, trade.clone(), self.fee_percent);
            self.push(AccountEvent::Trade(trade));
        }
        drop(state);
        self.push(AccountEvent::Order(placed.clone()));

        info!(
            exchange = %self.name,
            order_id = %id,
            symbol = %order.symbol,
            side = %order.side(),
            quantity = %quantity,
            filled = %filled,
            price = %price,
            "Simulated order executed"
        );
        Ok(placed)
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: &str,
        _time_offset_ms: i64,
    ) -> ExchangeResult<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        if order.status.is_active() {
            order.status = OrderStatus::Canceled;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn amend_order(
        &self,
        order: &Order,
        amendment: &OrderAmendment,
        _time_offset_ms: i64,
    ) -> ExchangeResult<Order> {
        let mut state = self.state.write().await;
        let stored = state
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order.id.clone()))?;
        if !stored.status.is_active() {
            return Err(ExchangeError::InvalidParameters(format!(
                "order {} is no longer open",
                order.id
            )));
        }
        if let Some(amount) = amendment.amount {
            stored.amount = amount.abs();
        }
        if let Some(price) = amendment.price {
            stored.price = Some(price);
        }
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn fetch_open_orders(&self, _time_offset_ms: i64) -> ExchangeResult<Vec<Order>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .cloned()
            .collect())
    }

    async fn fetch_positions(&self, _time_offset_ms: i64) -> ExchangeResult<Vec<Position>> {
        if self.fail_positions.load(Ordering::SeqCst) {
            return Err(ExchangeError::Server {
                status: 503,
                body: "simulated outage".to_string(),
            });
        }
        Ok(self
            .state
            .read()
            .await
            .positions
            .iter()
            .map(|(symbol, (amount, entry))| Position::from_signed(symbol, *amount, Some(*entry)))
            .collect())
    }

    async fn fetch_trades(
        &self,
        _symbol: &str,
        order_id: &str,
        _time_offset_ms: i64,
    ) -> ExchangeResult<Vec<Trade>> {
        self.fetch_trades_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .read()
            .await
            .trades
            .iter()
            .filter(|t| t.order_id == order_id)
            .cloned()
            .collect())
    }
}
