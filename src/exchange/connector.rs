//! Uniform per-exchange trading surface.
//!
//! One [`ExchangeConnector`] per configured exchange. Exchange specifics are
//! injected: an [`ExchangeAdapter`] for REST and a [`SymbolMapper`] for
//! notation. The connector owns the order and position tables, which are fed
//! by private-stream pushes and periodic REST polls.

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::fills::{FillAggregate, OrderFillTracker};
use crate::exchange::health::{ConnectionHealth, HealthReader};
use crate::exchange::symbols::SymbolMapper;
use crate::exchange::tickers::TickerRegistry;
use crate::exchange::traits::ExchangeAdapter;
use crate::exchange::types::{
    AccountEvent, NewOrder, Order, OrderAmendment, OrderStatus, Position, Trade,
};
use crate::utils::decimal::profit_percent;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Polling and request parameters of a connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub order_sync_interval: Duration,
    pub position_sync_interval: Duration,
    pub time_sync_interval: Duration,
    /// Delay before the first REST polls after start
    pub initial_sync_delay: Duration,
    /// Total attempts for retryable REST failures
    pub rest_retry_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * rest_retry_backoff`
    pub rest_retry_backoff: Duration,
    /// Budget for one order submission round trip
    pub order_timeout: Duration,
    /// Closed orders kept for lookups by id
    pub closed_order_retention: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            order_sync_interval: Duration::from_secs(30),
            position_sync_interval: Duration::from_secs(30),
            time_sync_interval: Duration::from_secs(120),
            initial_sync_delay: Duration::from_secs(1),
            rest_retry_attempts: 3,
            rest_retry_backoff: Duration::from_millis(500),
            order_timeout: Duration::from_secs(10),
            closed_order_retention: 500,
        }
    }
}

#[derive(Debug, Default)]
struct OrderTable {
    orders: HashMap<String, Order>,
    /// Ids of closed orders, oldest first
    closed: VecDeque<String>,
}

impl OrderTable {
    /// Insert or merge an order update. A terminal status is never
    /// downgraded by a late active update.
    ///
    /// Returns the ids of closed orders evicted past `retention`.
    fn upsert(&mut self, mut order: Order, retention: usize) -> Vec<String> {
        if let Some(existing) = self.orders.get(&order.id) {
            if !existing.status.is_active() && order.status.is_active() {
                return Vec::new();
            }
            if order.exec_duration_ms.is_none() {
                order.exec_duration_ms = existing.exec_duration_ms;
            }
            if order.filled_amount < existing.filled_amount {
                order.filled_amount = existing.filled_amount;
                order.average_price = order.average_price.or(existing.average_price);
            }
        }

        let closed = !order.status.is_active();
        let id = order.id.clone();
        if self.orders.insert(id.clone(), order).is_some_and(|o| !o.status.is_active()) {
            return Vec::new();
        }
        let mut evicted = Vec::new();
        if closed {
            self.closed.push_back(id);
            while self.closed.len() > retention {
                if let Some(old) = self.closed.pop_front() {
                    self.orders.remove(&old);
                    evicted.push(old);
                }
            }
        }
        evicted
    }
}

#[derive(Debug, Clone, Copy)]
enum SyncKind {
    Orders,
    Positions,
    Time,
}

/// Trading surface of one exchange.
pub struct ExchangeConnector {
    name: String,
    adapter: Arc<dyn ExchangeAdapter>,
    symbols: SymbolMapper,
    tickers: Arc<TickerRegistry>,
    health: HealthReader,
    orders: RwLock<OrderTable>,
    positions: RwLock<HashMap<String, Position>>,
    fills: OrderFillTracker,
    /// `server_time - local_time` in milliseconds
    time_offset_ms: Arc<AtomicI64>,
    config: ConnectorConfig,
}

impl ExchangeConnector {
    pub fn new(
        name: &str,
        adapter: Arc<dyn ExchangeAdapter>,
        symbols: SymbolMapper,
        tickers: Arc<TickerRegistry>,
        health: HealthReader,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            adapter,
            symbols,
            tickers,
            health,
            orders: RwLock::new(OrderTable::default()),
            positions: RwLock::new(HashMap::new()),
            fills: OrderFillTracker::new(),
            time_offset_ms: Arc::new(AtomicI64::new(0)),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        self.health.health()
    }

    /// Latest ping round trip of the market stream.
    pub fn latency_ms(&self) -> Option<u64> {
        self.health.latency_ms()
    }

    /// Share the clock offset with components signing outside REST, such as
    /// a websocket login.
    pub fn with_clock_offset(mut self, offset: Arc<AtomicI64>) -> Self {
        offset.store(self.time_offset_ms(), Ordering::Relaxed);
        self.time_offset_ms = offset;
        self
    }

    pub fn time_offset_ms(&self) -> i64 {
        self.time_offset_ms.load(Ordering::Relaxed)
    }

    pub fn fills(&self) -> &OrderFillTracker {
        &self.fills
    }

    fn require_credentials(&self) -> ExchangeResult<()> {
        if self.adapter.has_credentials() {
            Ok(())
        } else {
            Err(ExchangeError::Unauthenticated(self.name.clone()))
        }
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> ExchangeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt < self.config.rest_retry_attempts => {
                    let delay = self.config.rest_retry_backoff * attempt;
                    warn!(
                        exchange = %self.name,
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn canonical_order(&self, mut order: Order) -> Order {
        order.symbol = self.symbols.to_canonical(&order.symbol);
        order
    }

    fn store_order(&self, order: Order) {
        let evicted = self
            .orders
            .write()
            .upsert(order, self.config.closed_order_retention);
        for id in &evicted {
            self.fills.remove(id);
        }
    }

    // ==================== Orders ====================

    /// Submit an order. `order.symbol` is canonical; `order.amount` is signed.
    ///
    /// The returned order carries the submission round trip in
    /// `exec_duration_ms`.
    #[instrument(skip(self), fields(exchange = %self.name))]
    pub async fn submit_order(&self, order: NewOrder) -> ExchangeResult<Order> {
        self.require_credentials()?;
        if order.amount == Decimal::ZERO {
            return Err(ExchangeError::InvalidParameters(
                "order amount must not be zero".to_string(),
            ));
        }

        let native = NewOrder {
            symbol: self.symbols.to_native(&order.symbol),
            ..order
        };
        let offset = self.time_offset_ms();
        let timeout = self.config.order_timeout;
        let adapter = &self.adapter;
        let request = &native;

        let started = Instant::now();
        let result = self
            .with_retry("create_order", || async move {
                match tokio::time::timeout(timeout, adapter.create_order(request, offset)).await {
                    Ok(result) => result,
                    Err(_) => Err(ExchangeError::OrderTimeout {
                        elapsed_ms: timeout.as_millis() as u64,
                    }),
                }
            })
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut placed = self.canonical_order(result?);
        placed.exec_duration_ms = Some(elapsed_ms);

        if placed.status == OrderStatus::Rejected {
            self.store_order(placed.clone());
            return Err(ExchangeError::OrderRejected {
                reason: format!("order {} rejected by {}", placed.id, self.name),
            });
        }

        info!(
            exchange = %self.name,
            order_id = %placed.id,
            symbol = %placed.symbol,
            side = %placed.side,
            amount = %placed.amount,
            elapsed_ms,
            "Order placed"
        );
        self.store_order(placed.clone());
        Ok(placed)
    }

    #[instrument(skip(self), fields(exchange = %self.name))]
    pub async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
        self.require_credentials()?;
        let order = self
            .find_order_by_id(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;

        let native_symbol = self.symbols.to_native(&order.symbol);
        let offset = self.time_offset_ms();
        let adapter = &self.adapter;
        self.with_retry("cancel_order", || {
            adapter.cancel_order(&native_symbol, order_id, offset)
        })
        .await?;

        let mut canceled = order;
        canceled.status = OrderStatus::Canceled;
        canceled.updated_at = Utc::now();
        self.store_order(canceled);
        info!(exchange = %self.name, %order_id, "Order canceled");
        Ok(())
    }

    /// Cancel every open order of `symbol`. Returns the number canceled.
    pub async fn cancel_all(&self, symbol: &str) -> ExchangeResult<usize> {
        let mut canceled = 0;
        let mut first_error = None;
        for order in self.get_orders_for_symbol(symbol) {
            match self.cancel_order(&order.id).await {
                Ok(()) => canceled += 1,
                Err(e) => {
                    warn!(exchange = %self.name, order_id = %order.id, error = %e, "Cancel failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(canceled),
        }
    }

    /// Amend an open order's amount and/or price.
    #[instrument(skip(self), fields(exchange = %self.name))]
    pub async fn update_order(
        &self,
        order_id: &str,
        amendment: OrderAmendment,
    ) -> ExchangeResult<Order> {
        if amendment.is_empty() {
            return Err(ExchangeError::InvalidParameters(
                "update requires an amount or a price".to_string(),
            ));
        }
        self.require_credentials()?;

        let order = self
            .find_order_by_id(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        let native = Order {
            symbol: self.symbols.to_native(&order.symbol),
            ..order
        };

        let offset = self.time_offset_ms();
        let adapter = &self.adapter;
        let (native, amendment) = (&native, &amendment);
        let amended = self
            .with_retry("amend_order", || adapter.amend_order(native, amendment, offset))
            .await?;

        let amended = self.canonical_order(amended);
        info!(exchange = %self.name, %order_id, new_id = %amended.id, "Order amended");
        self.store_order(amended.clone());
        Ok(amended)
    }

    pub fn get_open_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .cloned()
            .collect()
    }

    /// Open orders of one canonical symbol.
    pub fn get_orders_for_symbol(&self, symbol: &str) -> Vec<Order> {
        self.orders
            .read()
            .orders
            .values()
            .filter(|o| o.status.is_active() && o.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Open or recently closed order by id.
    pub fn find_order_by_id(&self, order_id: &str) -> Option<Order> {
        self.orders.read().orders.get(order_id).cloned()
    }

    // ==================== Positions ====================

    /// Open positions annotated with profit against the latest ticker.
    pub fn get_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .map(|p| self.annotate(p))
            .collect()
    }

    pub fn get_position_for_symbol(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).map(|p| self.annotate(p))
    }

    fn annotate(&self, position: &Position) -> Position {
        let profit = position.entry.and_then(|entry| {
            let ticker = self.tickers.get(&self.name, &position.symbol)?;
            profit_percent(position.side, entry, ticker.bid, ticker.ask)
        });
        match profit {
            Some(p) => position.with_profit(p),
            None => position.clone(),
        }
    }

    // ==================== Fills ====================

    pub fn record_trade(&self, trade: &Trade) -> bool {
        self.fills.record_trade(trade)
    }

    /// Settled fill of an order, or `None` while it may still trade.
    ///
    /// Checks streamed trades first, then the order table, then the REST
    /// trade history.
    pub async fn confirm_fill(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> ExchangeResult<Option<FillAggregate>> {
        if let Some(fill) = self.settled_fill(order_id) {
            return Ok(Some(fill));
        }
        if self
            .find_order_by_id(order_id)
            .is_some_and(|o| o.status.is_active())
        {
            return Ok(None);
        }

        self.fold_trade_history(order_id, symbol).await?;
        Ok(self.settled_fill(order_id))
    }

    /// Fill of an order according to the exchange's trade history, whatever
    /// the local order status says.
    pub async fn fetch_fill(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> ExchangeResult<Option<FillAggregate>> {
        self.fold_trade_history(order_id, symbol).await?;
        Ok(self
            .fills
            .get_aggregate(order_id)
            .filter(|agg| agg.net_amount != Decimal::ZERO))
    }

    async fn fold_trade_history(&self, order_id: &str, symbol: &str) -> ExchangeResult<()> {
        let native_symbol = self.symbols.to_native(symbol);
        let offset = self.time_offset_ms();
        let adapter = &self.adapter;
        let trades = self
            .with_retry("fetch_trades", || {
                adapter.fetch_trades(&native_symbol, order_id, offset)
            })
            .await?;

        for mut trade in trades {
            trade.symbol = symbol.to_string();
            self.fills.record_trade(&trade);
        }
        debug!(exchange = %self.name, %order_id, "Trade history folded");
        Ok(())
    }

    fn settled_fill(&self, order_id: &str) -> Option<FillAggregate> {
        let order = self.find_order_by_id(order_id);
        if order.as_ref().is_some_and(|o| o.status.is_active()) {
            return None;
        }

        if let Some(agg) = self.fills.get_aggregate(order_id) {
            if agg.net_amount != Decimal::ZERO {
                return Some(agg);
            }
        }

        let order = order?;
        if order.filled_amount == Decimal::ZERO {
            return None;
        }
        Some(FillAggregate {
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            average_price: order.average_price,
            net_amount: order.signed_filled(),
            trade_count: 0,
        })
    }

    // ==================== Reconciliation ====================

    /// Replace the open-order set with the exchange's view.
    pub async fn sync_orders(&self) -> ExchangeResult<()> {
        self.require_credentials()?;
        let offset = self.time_offset_ms();
        let adapter = &self.adapter;
        let open = self
            .with_retry("fetch_open_orders", || adapter.fetch_open_orders(offset))
            .await
            .map_err(|e| {
                warn!(exchange = %self.name, error = %e, "Order sync failed, keeping previous state");
                ExchangeError::Sync(e.to_string())
            })?;

        let open: Vec<Order> = open.into_iter().map(|o| self.canonical_order(o)).collect();
        let mut table = self.orders.write();
        // Active orders missing from the snapshot are gone; terminal records
        // stay so a snapshot older than a push cannot revive them.
        table
            .orders
            .retain(|id, o| !o.status.is_active() || open.iter().any(|n| &n.id == id));
        for order in open {
            table.upsert(order, self.config.closed_order_retention);
        }
        debug!(exchange = %self.name, open = table.orders.len(), "Orders synced");
        Ok(())
    }

    /// Replace the position table with the exchange's view.
    ///
    /// Symbols absent from the response are closed and removed. On failure
    /// the previous table is kept.
    pub async fn sync_positions(&self) -> ExchangeResult<()> {
        self.require_credentials()?;
        let offset = self.time_offset_ms();
        let adapter = &self.adapter;
        let fetched = self
            .with_retry("fetch_positions", || adapter.fetch_positions(offset))
            .await
            .map_err(|e| {
                warn!(exchange = %self.name, error = %e, "Position sync failed, keeping previous state");
                ExchangeError::Sync(e.to_string())
            })?;

        let mut positions = self.positions.write();
        let mut next = HashMap::with_capacity(fetched.len());
        for mut position in fetched.into_iter().filter(|p| p.amount != Decimal::ZERO) {
            position.symbol = self.symbols.to_canonical(&position.symbol);
            if let Some(prev) = positions.get(&position.symbol) {
                if prev.side == position.side {
                    position.opened_at = prev.opened_at;
                }
            }
            next.insert(position.symbol.clone(), position);
        }

        for symbol in positions.keys().filter(|s| !next.contains_key(*s)) {
            info!(exchange = %self.name, %symbol, "Position closed");
        }
        *positions = next;
        debug!(exchange = %self.name, count = positions.len(), "Positions synced");
        Ok(())
    }

    /// Refresh the clock offset used for signed requests.
    pub async fn sync_time(&self) -> ExchangeResult<()> {
        let adapter = &self.adapter;
        let server_ms = self
            .with_retry("server_time", || adapter.server_time_ms())
            .await?;
        let offset = server_ms - Utc::now().timestamp_millis();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(exchange = %self.name, offset_ms = offset, "Clock offset updated");
        Ok(())
    }

    async fn sync(&self, kind: SyncKind) -> ExchangeResult<()> {
        match kind {
            SyncKind::Orders => self.sync_orders().await,
            SyncKind::Positions => self.sync_positions().await,
            SyncKind::Time => self.sync_time().await,
        }
    }

    /// Apply a private-stream push.
    pub async fn apply_account_event(&self, event: AccountEvent) {
        match event {
            AccountEvent::Order(order) => {
                debug!(
                    exchange = %self.name,
                    order_id = %order.id,
                    status = ?order.status,
                    filled = %order.filled_amount,
                    "Order update"
                );
                self.store_order(order);
            }
            AccountEvent::Trade(trade) => {
                if self.fills.record_trade(&trade) {
                    if let Err(e) = self.sync_positions().await {
                        debug!(exchange = %self.name, error = %e, "Position sync after fill failed");
                    }
                }
            }
            AccountEvent::PositionsChanged => {
                if let Err(e) = self.sync_positions().await {
                    debug!(exchange = %self.name, error = %e, "Position sync after account update failed");
                }
            }
        }
    }

    /// Spawn the REST poll loops and, when given, the account-event pump.
    pub fn start(
        self: &Arc<Self>,
        account_rx: Option<mpsc::Receiver<AccountEvent>>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let mut loops = vec![(SyncKind::Time, self.config.time_sync_interval)];
        if self.adapter.has_credentials() {
            loops.push((SyncKind::Orders, self.config.order_sync_interval));
            loops.push((SyncKind::Positions, self.config.position_sync_interval));
        } else {
            info!(exchange = %self.name, "No credentials, running public-only");
        }

        for (kind, every) in loops {
            let this = Arc::clone(self);
            let token = shutdown.clone();
            let initial = self.config.initial_sync_delay;
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(initial) => {}
                    () = token.cancelled() => return,
                }
                let mut ticker = tokio::time::interval(every);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = this.sync(kind).await {
                                debug!(exchange = %this.name, ?kind, error = %e, "Poll failed");
                            }
                        }
                        () = token.cancelled() => break,
                    }
                }
            }));
        }

        if let Some(mut rx) = account_rx {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Some(event) => this.apply_account_event(event).await,
                            None => break,
                        },
                        () = shutdown.cancelled() => break,
                    }
                }
            }));
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::health::{ConnectionHealthMonitor, HealthConfig};
    use crate::exchange::traits::MockExchangeAdapter;
    use crate::exchange::types::{OrderSide, OrderType, PositionSide, Ticker};
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    fn good_health() -> HealthReader {
        let monitor = Arc::new(ConnectionHealthMonitor::new(HealthConfig::default()));
        let t0 = Instant::now();
        let id = monitor.record_ping(t0);
        monitor.record_pong(Some(id), t0 + Duration::from_millis(10));
        HealthReader::new(monitor)
    }

    fn connector(mock: MockExchangeAdapter) -> ExchangeConnector {
        connector_with(mock, Arc::new(TickerRegistry::new()))
    }

    fn connector_with(mock: MockExchangeAdapter, tickers: Arc<TickerRegistry>) -> ExchangeConnector {
        ExchangeConnector::new(
            "ftx",
            Arc::new(mock),
            SymbolMapper::perpetual_suffix("-PERP", "USD"),
            tickers,
            good_health(),
            ConnectorConfig::default(),
        )
    }

    fn order(id: &str, symbol: &str, status: OrderStatus, filled: Decimal) -> Order {
        Order {
            id: id.to_string(),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            amount: dec!(10),
            price: None,
            status,
            filled_amount: filled,
            average_price: None,
            exec_duration_ms: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_position_sync_is_full_replace() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        mock.expect_fetch_positions().returning(move |_| {
            let x = Position::from_signed("BTC-PERP", dec!(1), Some(dec!(100)));
            let y = Position::from_signed("ETH-PERP", dec!(-2), Some(dec!(10)));
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![x, y])
            } else {
                Ok(vec![x])
            }
        });

        let conn = connector(mock);
        conn.sync_positions().await.unwrap();
        assert_eq!(conn.get_positions().len(), 2);
        assert_eq!(
            conn.get_position_for_symbol("ETHUSD").unwrap().side,
            PositionSide::Short
        );

        conn.sync_positions().await.unwrap();
        assert!(conn.get_position_for_symbol("ETHUSD").is_none());
        assert!(conn.get_position_for_symbol("BTCUSD").is_some());
    }

    #[tokio::test]
    async fn test_failed_position_sync_keeps_state() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        mock.expect_fetch_positions().returning(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![Position::from_signed("BTC-PERP", dec!(1), None)])
            } else {
                Err(ExchangeError::Api {
                    status: 401,
                    message: "invalid key".into(),
                })
            }
        });

        let conn = connector(mock);
        conn.sync_positions().await.unwrap();
        let err = conn.sync_positions().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Sync(_)));
        assert_eq!(conn.get_positions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_are_retried() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        mock.expect_fetch_open_orders().returning(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ExchangeError::Server {
                    status: 502,
                    body: "bad gateway".into(),
                })
            } else {
                Ok(vec![order("1", "BTC-PERP", OrderStatus::Open, Decimal::ZERO)])
            }
        });

        let conn = connector(mock);
        conn.sync_orders().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(conn.get_orders_for_symbol("BTCUSD").len(), 1);
    }

    #[tokio::test]
    async fn test_submit_translates_symbols_both_ways() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(true);
        mock.expect_create_order()
            .withf(|o, _| o.symbol == "BTC-PERP" && o.amount == dec!(-3))
            .returning(|o, _| {
                let mut placed = order("9", &o.symbol, OrderStatus::New, Decimal::ZERO);
                placed.side = o.side();
                placed.amount = o.quantity();
                Ok(placed)
            });

        let conn = connector(mock);
        let placed = conn
            .submit_order(NewOrder::market("BTCUSD", dec!(-3)))
            .await
            .unwrap();
        assert_eq!(placed.symbol, "BTCUSD");
        assert_eq!(placed.side, OrderSide::Sell);
        assert!(placed.exec_duration_ms.is_some());
        assert_eq!(conn.find_order_by_id("9").unwrap().symbol, "BTCUSD");
    }

    #[tokio::test]
    async fn test_rejected_order_is_an_error() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(true);
        mock.expect_create_order()
            .returning(|o, _| Ok(order("5", &o.symbol, OrderStatus::Rejected, Decimal::ZERO)));

        let conn = connector(mock);
        let err = conn
            .submit_order(NewOrder::market("BTCUSD", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::OrderRejected { .. }));
    }

    #[tokio::test]
    async fn test_update_without_fields_is_invalid() {
        let conn = connector(MockExchangeAdapter::new());
        let err = conn
            .update_order("1", OrderAmendment::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_missing_credentials_refuse_trading() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(false);
        let conn = connector(mock);
        let err = conn
            .submit_order(NewOrder::market("BTCUSD", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Unauthenticated(_)));
    }

    #[test]
    fn test_positions_are_profit_annotated() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(true);
        let tickers = Arc::new(TickerRegistry::new());
        tickers.set(Ticker::new("ftx", "BTCUSD", dec!(110), dec!(111)));
        let conn = connector_with(mock, tickers);
        conn.positions.write().insert(
            "BTCUSD".into(),
            Position::from_signed("BTCUSD", dec!(1), Some(dec!(100))),
        );

        let p = conn.get_position_for_symbol("BTCUSD").unwrap();
        assert_eq!(p.profit_percent, Some(dec!(10)));
    }

    #[tokio::test]
    async fn test_terminal_status_is_not_downgraded() {
        let conn = connector(MockExchangeAdapter::new());
        conn.apply_account_event(AccountEvent::Order(order(
            "1",
            "BTCUSD",
            OrderStatus::Filled,
            dec!(10),
        )))
        .await;
        conn.apply_account_event(AccountEvent::Order(order(
            "1",
            "BTCUSD",
            OrderStatus::New,
            Decimal::ZERO,
        )))
        .await;

        let o = conn.find_order_by_id("1").unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert!(conn.get_open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_partial_fill_on_active_order_is_not_settled() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_fetch_trades().never();
        let conn = connector(mock);
        conn.store_order(order("1", "BTCUSD", OrderStatus::Open, dec!(4)));

        assert_eq!(conn.confirm_fill("1", "BTCUSD").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_confirm_fill_falls_back_to_trade_history() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_fetch_trades()
            .withf(|symbol, id, _| symbol == "BTC-PERP" && id == "1")
            .times(1)
            .returning(|symbol, id, _| {
                Ok(vec![Trade {
                    trade_id: "t1".into(),
                    order_id: id.to_string(),
                    symbol: symbol.to_string(),
                    side: OrderSide::Buy,
                    price: dec!(100),
                    qty: dec!(7),
                }])
            });
        let conn = connector(mock);
        conn.store_order(order("1", "BTCUSD", OrderStatus::Canceled, Decimal::ZERO));

        let fill = conn.confirm_fill("1", "BTCUSD").await.unwrap().unwrap();
        assert_eq!(fill.net_amount, dec!(7));
        assert_eq!(fill.symbol, "BTCUSD");
    }

    #[tokio::test]
    async fn test_filled_order_settles_without_trades() {
        let conn = connector(MockExchangeAdapter::new());
        let mut filled = order("1", "BTCUSD", OrderStatus::Filled, dec!(10));
        filled.side = OrderSide::Sell;
        filled.average_price = Some(dec!(99));
        conn.store_order(filled);

        let fill = conn.confirm_fill("1", "BTCUSD").await.unwrap().unwrap();
        assert_eq!(fill.net_amount, dec!(-10));
        assert_eq!(fill.average_price, Some(dec!(99)));
    }

    fn trade(id: &str, order_id: &str, qty: Decimal) -> Trade {
        Trade {
            trade_id: id.to_string(),
            order_id: order_id.to_string(),
            symbol: "BTCUSD".to_string(),
            side: OrderSide::Buy,
            price: dec!(100),
            qty,
        }
    }

    #[tokio::test]
    async fn test_stale_order_snapshot_does_not_revive_filled_order() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(true);
        mock.expect_fetch_trades().never();
        mock.expect_fetch_open_orders().returning(|_| {
            Ok(vec![
                order("1", "BTC-PERP", OrderStatus::New, Decimal::ZERO),
                order("2", "BTC-PERP", OrderStatus::Open, Decimal::ZERO),
            ])
        });
        let conn = connector(mock);
        conn.apply_account_event(AccountEvent::Order(order(
            "1",
            "BTCUSD",
            OrderStatus::Filled,
            dec!(10),
        )))
        .await;
        let mut gone = order("3", "BTCUSD", OrderStatus::Open, Decimal::ZERO);
        gone.exec_duration_ms = Some(12);
        conn.store_order(gone);
        let mut working = order("2", "BTCUSD", OrderStatus::New, Decimal::ZERO);
        working.exec_duration_ms = Some(40);
        conn.store_order(working);

        conn.sync_orders().await.unwrap();

        assert_eq!(conn.find_order_by_id("1").unwrap().status, OrderStatus::Filled);
        let fill = conn.confirm_fill("1", "BTCUSD").await.unwrap().unwrap();
        assert_eq!(fill.net_amount, dec!(10));

        let working = conn.find_order_by_id("2").unwrap();
        assert_eq!(working.status, OrderStatus::Open);
        assert_eq!(working.exec_duration_ms, Some(40));
        assert!(conn.find_order_by_id("3").is_none());
    }

    #[tokio::test]
    async fn test_fetch_fill_reads_history_of_active_order() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_fetch_trades()
            .times(1)
            .returning(|_, id, _| Ok(vec![trade("t1", id, dec!(3))]));
        let conn = connector(mock);
        conn.store_order(order("1", "BTCUSD", OrderStatus::New, Decimal::ZERO));

        let fill = conn.fetch_fill("1", "BTCUSD").await.unwrap().unwrap();
        assert_eq!(fill.net_amount, dec!(3));
    }

    #[tokio::test]
    async fn test_evicted_orders_release_their_fills() {
        let conn = ExchangeConnector::new(
            "ftx",
            Arc::new(MockExchangeAdapter::new()),
            SymbolMapper::perpetual_suffix("-PERP", "USD"),
            Arc::new(TickerRegistry::new()),
            good_health(),
            ConnectorConfig {
                closed_order_retention: 2,
                ..ConnectorConfig::default()
            },
        );

        for id in ["1", "2", "3"] {
            conn.record_trade(&trade(&format!("t{id}"), id, dec!(1)));
            conn.store_order(order(id, "BTCUSD", OrderStatus::Filled, dec!(1)));
        }

        assert!(conn.find_order_by_id("1").is_none());
        assert_eq!(conn.fills().len(), 2);
        assert!(conn.fills().get_aggregate("1").is_none());
        assert!(conn.fills().get_aggregate("3").is_some());
    }

    #[tokio::test]
    async fn test_time_sync_refreshes_shared_clock_offset() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_server_time_ms()
            .returning(|| Ok(Utc::now().timestamp_millis() + 60_000));
        let shared = Arc::new(AtomicI64::new(0));
        let conn = connector(mock).with_clock_offset(shared.clone());

        conn.sync_time().await.unwrap();
        let offset = shared.load(Ordering::Relaxed);
        assert!((59_000..=60_000).contains(&offset));
        assert_eq!(conn.time_offset_ms(), offset);
    }

    #[tokio::test]
    async fn test_account_update_sync_failure_is_contained() {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(false);
        mock.expect_fetch_positions().never();
        let conn = connector(mock);

        conn.apply_account_event(AccountEvent::PositionsChanged).await;
        assert!(conn.record_trade(&trade("t1", "1", dec!(2))));
        conn.apply_account_event(AccountEvent::Trade(trade("t2", "1", dec!(1))))
            .await;

        assert!(conn.get_positions().is_empty());
        assert_eq!(conn.fills().get_aggregate("1").unwrap().net_amount, dec!(3));
    }
}
