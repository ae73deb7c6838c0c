//! Cross-exchange hedge coordination.
//!
//! Opens and closes both legs of a [`HedgeOpportunity`] concurrently, then
//! polls the connectors until both fills are confirmed or the check budget is
//! spent. Each call drives one opportunity; failures are recorded on the
//! record and never leak into other opportunities.

use crate::error::HedgeError;
use crate::exchange::{
    ConnectionHealth, ExchangeConnector, ExchangeRegistry, FillAggregate, NewOrder, Order,
};
use crate::strategy::opportunity::{
    HedgeFailure, HedgeState, LegRole, LegStatus, OpportunityHandle, PairRef, Signal,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Fill polling and failure handling parameters.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Wait before the first fill check
    pub fill_poll_delay: Duration,
    /// Wait between subsequent checks
    pub fill_poll_interval: Duration,
    pub fill_poll_attempts: u32,
    /// Delay before a skipped opportunity's signal is cleared
    pub signal_reset_delay: Duration,
    /// Unwind the placed leg when the other leg cannot be placed
    pub compensate: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fill_poll_delay: Duration::from_millis(1000),
            fill_poll_interval: Duration::from_millis(4000),
            fill_poll_attempts: 5,
            signal_reset_delay: Duration::from_secs(5),
            compensate: true,
        }
    }
}

/// Result of driving an opportunity once.
#[derive(Debug, Clone, PartialEq)]
pub enum HedgeOutcome {
    /// Both legs settled.
    Completed,
    /// Connectivity gate refused the attempt; no orders were sent.
    Skipped,
    /// Attempt accepted but ended in a failed state.
    Failed(HedgeFailure),
}

/// A leg resolved to its connector.
struct ResolvedLeg {
    role: LegRole,
    connector: Arc<ExchangeConnector>,
    symbol: String,
}

pub struct HedgeOrderCoordinator {
    exchanges: Arc<ExchangeRegistry>,
    config: CoordinatorConfig,
}

impl HedgeOrderCoordinator {
    pub fn new(exchanges: Arc<ExchangeRegistry>, config: CoordinatorConfig) -> Self {
        Self { exchanges, config }
    }

    fn resolve(&self, role: LegRole, pair: &PairRef) -> Result<ResolvedLeg, HedgeError> {
        let connector = self
            .exchanges
            .get(&pair.exchange)
            .ok_or_else(|| HedgeError::UnknownExchange(pair.exchange.clone()))?;
        Ok(ResolvedLeg {
            role,
            connector,
            symbol: pair.symbol.clone(),
        })
    }

    fn resolve_both(
        &self,
        handle: &OpportunityHandle,
    ) -> Result<(ResolvedLeg, ResolvedLeg), HedgeError> {
        let snapshot = handle.snapshot();
        Ok((
            self.resolve(LegRole::Long, &snapshot.long.pair)?,
            self.resolve(LegRole::Short, &snapshot.short.pair)?,
        ))
    }

    /// Clear the signal after the configured delay so the strategy can
    /// re-issue it once connectivity recovers.
    fn schedule_signal_reset(&self, handle: &Arc<OpportunityHandle>) {
        let handle = Arc::clone(handle);
        let delay = self.config.signal_reset_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.set_signal(Signal::None);
            debug!(opportunity = %handle.id(), "Signal reset");
        });
    }

    fn log_refusal(action: &str, id: &str, long: &ResolvedLeg, short: &ResolvedLeg) {
        warn!(
            opportunity = %id,
            long_exchange = %long.connector.name(),
            long_health = %long.connector.connection_health(),
            long_latency_ms = ?long.connector.latency_ms(),
            short_exchange = %short.connector.name(),
            short_health = %short.connector.connection_health(),
            short_latency_ms = ?short.connector.latency_ms(),
            "Bad exchange connectivity, skipping {}",
            action
        );
    }

    /// Open both legs. Requires both connectors to be healthy.
    pub async fn open(&self, handle: &Arc<OpportunityHandle>) -> Result<HedgeOutcome, HedgeError> {
        let _guard = handle
            .try_drive()
            .ok_or_else(|| HedgeError::AlreadyInFlight(handle.id().to_string()))?;

        let state = handle.state();
        if state != HedgeState::Idle {
            return Err(HedgeError::InvalidState {
                id: handle.id().to_string(),
                action: "open",
                state: state.to_string(),
            });
        }
        let (long, short) = self.resolve_both(handle)?;

        if long.connector.connection_health() != ConnectionHealth::Good
            || short.connector.connection_health() != ConnectionHealth::Good
        {
            Self::log_refusal("open", handle.id(), &long, &short);
            self.schedule_signal_reset(handle);
            return Ok(HedgeOutcome::Skipped);
        }

        let (long_amount, short_amount) = handle.update(|o| {
            o.state = HedgeState::Opening;
            o.failure = None;
            for leg in [&long, &short] {
                let record = o.leg_mut(leg.role);
                record.status = LegStatus::Opening;
                record.latency_create = leg.connector.latency_ms();
            }
            o.open_amounts()
        });

        info!(
            opportunity = %handle.id(),
            long = %format!("{}#{}", long.connector.name(), long.symbol),
            short = %format!("{}#{}", short.connector.name(), short.symbol),
            %long_amount,
            %short_amount,
            "Creating hedged orders"
        );

        let (long_result, short_result) = tokio::join!(
            long.connector
                .submit_order(NewOrder::market(&long.symbol, long_amount)),
            short
                .connector
                .submit_order(NewOrder::market(&short.symbol, short_amount)),
        );

        handle.update(|o| {
            for (role, result) in [(LegRole::Long, &long_result), (LegRole::Short, &short_result)] {
                if let Ok(order) = result {
                    let leg = o.leg_mut(role);
                    leg.id_create = Some(order.id.clone());
                    leg.exec_duration_create = order.exec_duration_ms;
                }
            }
        });

        let (Ok(long_order), Ok(short_order)) = (&long_result, &short_result) else {
            let failure = [(LegRole::Long, &long_result), (LegRole::Short, &short_result)]
                .into_iter()
                .find_map(|(role, result)| {
                    result.as_ref().err().map(|e| HedgeFailure::Submit {
                        role,
                        reason: e.to_string(),
                    })
                });
            if let Some(failure) = &failure {
                error!(opportunity = %handle.id(), %failure, "Hedge leg rejected");
            }

            if let Ok(order) = &long_result {
                self.compensate(&long, order).await;
            }
            if let Ok(order) = &short_result {
                self.compensate(&short, order).await;
            }

            let failure = failure.unwrap_or(HedgeFailure::Submit {
                role: LegRole::Long,
                reason: "order not placed".to_string(),
            });
            handle.update(|o| {
                o.state = HedgeState::OpenFailed;
                o.long.status = LegStatus::OpenFailed;
                o.short.status = LegStatus::OpenFailed;
                o.failure = Some(failure.clone());
            });
            return Ok(HedgeOutcome::Failed(failure));
        };

        handle.update(|o| o.state = HedgeState::AwaitingFill);
        debug!(opportunity = %handle.id(), "Both hedged order creations fired");

        match self
            .await_fills(handle.id(), [(&long, &long_order.id), (&short, &short_order.id)])
            .await
        {
            Ok([long_fill, short_fill]) => {
                handle.update(|o| {
                    for (role, fill) in [(LegRole::Long, &long_fill), (LegRole::Short, &short_fill)] {
                        let leg = o.leg_mut(role);
                        leg.status = LegStatus::Open;
                        leg.filled_amount = fill.net_amount;
                        leg.average_price = fill.average_price;
                    }
                    o.state = HedgeState::Completed;
                    o.signal = Signal::None;
                });
                info!(
                    opportunity = %handle.id(),
                    long_filled = %long_fill.net_amount,
                    short_filled = %short_fill.net_amount,
                    "Hedged orders completed"
                );
                Ok(HedgeOutcome::Completed)
            }
            Err(checks) => {
                let failure = HedgeFailure::FillTimeout { checks };
                handle.update(|o| {
                    o.state = HedgeState::OpenFailed;
                    o.failure = Some(failure.clone());
                });
                error!(opportunity = %handle.id(), checks, "Hedged orders did not fill in time");
                Ok(HedgeOutcome::Failed(failure))
            }
        }
    }

    /// Close both legs by unwinding their filled amounts. Proceeds while at
    /// least one connector is healthy.
    pub async fn close(&self, handle: &Arc<OpportunityHandle>) -> Result<HedgeOutcome, HedgeError> {
        let _guard = handle
            .try_drive()
            .ok_or_else(|| HedgeError::AlreadyInFlight(handle.id().to_string()))?;

        let state = handle.state();
        if state != HedgeState::Completed {
            return Err(HedgeError::InvalidState {
                id: handle.id().to_string(),
                action: "close",
                state: state.to_string(),
            });
        }
        let (long, short) = self.resolve_both(handle)?;

        if long.connector.connection_health() != ConnectionHealth::Good
            && short.connector.connection_health() != ConnectionHealth::Good
        {
            Self::log_refusal("close", handle.id(), &long, &short);
            self.schedule_signal_reset(handle);
            return Ok(HedgeOutcome::Skipped);
        }

        let (long_amount, short_amount) = handle.update(|o| {
            o.state = HedgeState::Closing;
            o.failure = None;
            for leg in [&long, &short] {
                let record = o.leg_mut(leg.role);
                record.status = LegStatus::Closing;
                record.latency_close = leg.connector.latency_ms();
            }
            o.close_amounts()
        });

        info!(
            opportunity = %handle.id(),
            %long_amount,
            %short_amount,
            "Closing hedged orders"
        );

        let (long_result, short_result) = tokio::join!(
            long.connector
                .submit_order(NewOrder::market(&long.symbol, long_amount).reduce_only()),
            short
                .connector
                .submit_order(NewOrder::market(&short.symbol, short_amount).reduce_only()),
        );

        let mut placed = Vec::with_capacity(2);
        let mut failure = None;
        handle.update(|o| {
            for (leg, result) in [(&long, long_result), (&short, short_result)] {
                match result {
                    Ok(order) => {
                        let record = o.leg_mut(leg.role);
                        record.id_close = Some(order.id.clone());
                        record.exec_duration_close = order.exec_duration_ms;
                        placed.push((leg, order.id));
                    }
                    Err(e) => {
                        o.leg_mut(leg.role).status = LegStatus::CloseFailed;
                        failure.get_or_insert(HedgeFailure::Submit {
                            role: leg.role,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        });

        if let Some(failure) = failure {
            error!(opportunity = %handle.id(), %failure, "Closing hedged orders failed");
            handle.update(|o| {
                o.state = HedgeState::CloseFailed;
                o.failure = Some(failure.clone());
            });
            return Ok(HedgeOutcome::Failed(failure));
        }

        handle.update(|o| o.state = HedgeState::AwaitingClose);
        let legs = [(placed[0].0, &placed[0].1), (placed[1].0, &placed[1].1)];

        match self.await_fills(handle.id(), legs).await {
            Ok([long_fill, short_fill]) => {
                handle.update(|o| {
                    for (role, fill) in [(LegRole::Long, &long_fill), (LegRole::Short, &short_fill)] {
                        let leg = o.leg_mut(role);
                        leg.status = LegStatus::Closed;
                        leg.close_filled_amount = fill.net_amount;
                    }
                    o.state = HedgeState::Closed;
                    o.signal = Signal::None;
                });
                info!(opportunity = %handle.id(), "Hedged orders closed");
                Ok(HedgeOutcome::Completed)
            }
            Err(checks) => {
                let failure = HedgeFailure::FillTimeout { checks };
                handle.update(|o| {
                    o.state = HedgeState::CloseFailed;
                    o.failure = Some(failure.clone());
                });
                error!(opportunity = %handle.id(), checks, "Hedged orders did not close in time");
                Ok(HedgeOutcome::Failed(failure))
            }
        }
    }

    /// Poll both legs until settled. Returns the number of checks made when
    /// the budget runs out.
    async fn await_fills(
        &self,
        opportunity: &str,
        legs: [(&ResolvedLeg, &String); 2],
    ) -> Result<[FillAggregate; 2], u32> {
        tokio::time::sleep(self.config.fill_poll_delay).await;

        let mut fills: [Option<FillAggregate>; 2] = [None, None];
        let attempts = self.config.fill_poll_attempts;
        for check in 1..=attempts {
            for (slot, (leg, order_id)) in fills.iter_mut().zip(legs.iter()) {
                if slot.is_some() {
                    continue;
                }
                match leg.connector.confirm_fill(order_id, &leg.symbol).await {
                    Ok(fill) => *slot = fill,
                    Err(e) => {
                        warn!(%opportunity, leg = %leg.role, %order_id, error = %e, "Fill check failed")
                    }
                }
            }

            if let [Some(a), Some(b)] = &fills {
                return Ok([a.clone(), b.clone()]);
            }
            debug!(%opportunity, check, "Hedge legs not settled yet");
            if check < attempts {
                tokio::time::sleep(self.config.fill_poll_interval).await;
            }
        }
        Err(attempts)
    }

    /// Neutralize a placed leg whose partner failed: cancel what is still
    /// working and reverse what already filled.
    async fn compensate(&self, leg: &ResolvedLeg, order: &Order) {
        if !self.config.compensate {
            warn!(leg = %leg.role, order_id = %order.id, "Leg left unhedged, compensation disabled");
            return;
        }

        let mut cancel_failed = false;
        if order.status.is_active() {
            if let Err(e) = leg.connector.cancel_order(&order.id).await {
                warn!(leg = %leg.role, order_id = %order.id, error = %e, "Compensating cancel failed");
                cancel_failed = true;
            }
        }

        // A failed cancel usually means the order already traded, and the
        // local record may not know yet. Ask the exchange.
        let local = leg.connector.find_order_by_id(&order.id);
        let unsure = cancel_failed || local.as_ref().is_some_and(|o| o.status.is_active());
        let lookup = if unsure {
            leg.connector.fetch_fill(&order.id, &leg.symbol).await
        } else {
            leg.connector.confirm_fill(&order.id, &leg.symbol).await
        };
        let known = local.as_ref().unwrap_or(order).signed_filled();
        let filled = match lookup {
            Ok(Some(fill)) => fill.net_amount,
            Ok(None) => known,
            Err(e) => {
                warn!(leg = %leg.role, order_id = %order.id, error = %e, "Fill lookup failed");
                known
            }
        };
        if filled == Decimal::ZERO {
            info!(leg = %leg.role, order_id = %order.id, "Nothing filled, no compensation needed");
            return;
        }

        match leg
            .connector
            .submit_order(NewOrder::market(&leg.symbol, -filled).reduce_only())
            .await
        {
            Ok(reverse) => info!(
                leg = %leg.role,
                order_id = %order.id,
                reverse_id = %reverse.id,
                amount = %-filled,
                "Compensated unhedged leg"
            ),
            Err(e) => error!(
                leg = %leg.role,
                order_id = %order.id,
                amount = %-filled,
                error = %e,
                "CRITICAL: failed to compensate unhedged leg"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::exchange::{
        ConnectionHealthMonitor, ConnectorConfig, ExchangeAdapter, FillBehavior, HealthConfig,
        HealthReader, MockExchangeAdapter, OrderSide, OrderStatus, OrderType, SimulatedExchange,
        SymbolMapper, TickerRegistry, Trade,
    };
    use crate::strategy::opportunity::HedgeOpportunity;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::time::Instant;

    fn health(good: bool) -> HealthReader {
        let monitor = Arc::new(ConnectionHealthMonitor::new(HealthConfig::default()));
        if good {
            let t0 = Instant::now();
            let id = monitor.record_ping(t0);
            monitor.record_pong(Some(id), t0 + Duration::from_millis(20));
        }
        HealthReader::new(monitor)
    }

    fn connector(name: &str, adapter: Arc<dyn ExchangeAdapter>, good: bool) -> Arc<ExchangeConnector> {
        Arc::new(ExchangeConnector::new(
            name,
            adapter,
            SymbolMapper::identity(),
            Arc::new(TickerRegistry::new()),
            health(good),
            ConnectorConfig::default(),
        ))
    }

    struct Fixture {
        coordinator: HedgeOrderCoordinator,
        a: Arc<SimulatedExchange>,
        b: Arc<SimulatedExchange>,
    }

    fn fixture(behavior: FillBehavior, a_good: bool, b_good: bool) -> Fixture {
        let a = Arc::new(SimulatedExchange::new("a", behavior));
        let b = Arc::new(SimulatedExchange::new("b", behavior));
        let mut registry = ExchangeRegistry::new();
        registry.insert(connector("a", a.clone(), a_good));
        registry.insert(connector("b", b.clone(), b_good));
        Fixture {
            coordinator: HedgeOrderCoordinator::new(Arc::new(registry), CoordinatorConfig::default()),
            a,
            b,
        }
    }

    fn opportunity(amount: Decimal) -> Arc<OpportunityHandle> {
        Arc::new(OpportunityHandle::new(
            HedgeOpportunity::new("opp-1", "a#BTCUSDT", "b#BTCUSDT", amount)
                .unwrap()
                .with_signal(Signal::Open),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_refused_on_bad_health() {
        let f = fixture(FillBehavior::Immediate, true, false);
        let handle = opportunity(dec!(1));

        let outcome = f.coordinator.open(&handle).await.unwrap();
        assert_eq!(outcome, HedgeOutcome::Skipped);
        assert!(f.a.orders().await.is_empty());
        assert!(f.b.orders().await.is_empty());
        assert_eq!(handle.state(), HedgeState::Idle);
        assert_eq!(handle.signal(), Signal::Open);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(handle.signal(), Signal::Open);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.signal(), Signal::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_completes_with_opposite_legs() {
        let f = fixture(FillBehavior::Immediate, true, true);
        let handle = opportunity(dec!(2));

        assert_eq!(f.coordinator.open(&handle).await.unwrap(), HedgeOutcome::Completed);

        let opp = handle.snapshot();
        assert_eq!(opp.state, HedgeState::Completed);
        assert_eq!(opp.signal, Signal::None);
        assert_eq!(opp.long.filled_amount, dec!(2));
        assert_eq!(opp.short.filled_amount, dec!(-2));
        assert_eq!(opp.long.status, LegStatus::Open);
        assert!(opp.long.id_create.is_some());
        assert!(opp.long.exec_duration_create.is_some());
        assert_eq!(opp.long.latency_create, Some(20));

        assert_eq!(f.a.orders().await[0].side, OrderSide::Buy);
        assert_eq!(f.b.orders().await[0].side, OrderSide::Sell);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inverse_swaps_sides() {
        let f = fixture(FillBehavior::Immediate, true, true);
        let handle = Arc::new(OpportunityHandle::new(
            HedgeOpportunity::new("opp-2", "a#BTCUSDT", "b#BTCUSDT", dec!(1))
                .unwrap()
                .inverse(),
        ));

        assert_eq!(f.coordinator.open(&handle).await.unwrap(), HedgeOutcome::Completed);
        assert_eq!(f.a.orders().await[0].side, OrderSide::Sell);
        assert_eq!(f.b.orders().await[0].side, OrderSide::Buy);
        assert_eq!(handle.snapshot().long.filled_amount, dec!(-1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_uses_filled_amount() {
        let f = fixture(FillBehavior::Partial(dec!(0.7)), true, true);
        let handle = opportunity(dec!(10));

        assert_eq!(f.coordinator.open(&handle).await.unwrap(), HedgeOutcome::Completed);
        assert_eq!(handle.snapshot().long.filled_amount, dec!(7));

        f.a.set_behavior(FillBehavior::Immediate).await;
        f.b.set_behavior(FillBehavior::Immediate).await;
        assert_eq!(f.coordinator.close(&handle).await.unwrap(), HedgeOutcome::Completed);

        let long_close = f.a.orders().await.pop().unwrap();
        assert_eq!(long_close.side, OrderSide::Sell);
        assert_eq!(long_close.amount, dec!(7));
        let short_close = f.b.orders().await.pop().unwrap();
        assert_eq!(short_close.side, OrderSide::Buy);
        assert_eq!(short_close.amount, dec!(7));

        let opp = handle.snapshot();
        assert_eq!(opp.state, HedgeState::Closed);
        assert_eq!(opp.long.close_filled_amount, dec!(-7));
        assert!(opp.short.id_close.is_some());
        assert!(f.a.fetch_positions(0).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_proceeds_with_one_healthy_connector() {
        let f = fixture(FillBehavior::Immediate, true, true);
        let handle = opportunity(dec!(1));
        f.coordinator.open(&handle).await.unwrap();

        let mut registry = ExchangeRegistry::new();
        registry.insert(connector("a", f.a.clone(), false));
        registry.insert(connector("b", f.b.clone(), true));
        let degraded = HedgeOrderCoordinator::new(Arc::new(registry), CoordinatorConfig::default());

        assert_eq!(degraded.close(&handle).await.unwrap(), HedgeOutcome::Completed);
        assert_eq!(handle.state(), HedgeState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_refused_when_both_bad() {
        let f = fixture(FillBehavior::Immediate, true, true);
        let handle = opportunity(dec!(1));
        f.coordinator.open(&handle).await.unwrap();
        handle.set_signal(Signal::Close);

        let mut registry = ExchangeRegistry::new();
        registry.insert(connector("a", f.a.clone(), false));
        registry.insert(connector("b", f.b.clone(), false));
        let down = HedgeOrderCoordinator::new(Arc::new(registry), CoordinatorConfig::default());

        assert_eq!(down.close(&handle).await.unwrap(), HedgeOutcome::Skipped);
        assert_eq!(handle.state(), HedgeState::Completed);
        assert_eq!(f.a.orders().await.len(), 1);
    }

    fn unfilled_order(id: &str, side: OrderSide) -> Order {
        Order {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Market,
            amount: dec!(1),
            price: None,
            status: OrderStatus::Canceled,
            filled_amount: Decimal::ZERO,
            average_price: None,
            exec_duration_ms: None,
            updated_at: Utc::now(),
        }
    }

    fn never_filling(id: &'static str) -> MockExchangeAdapter {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_has_credentials().return_const(true);
        mock.expect_create_order().times(1).returning(move |order, _| {
            Ok(unfilled_order(id, order.side()))
        });
        mock.expect_fetch_trades()
            .times(5)
            .returning(|_, _, _| Ok(Vec::new()));
        mock
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_five_checks_then_failure() {
        let mut registry = ExchangeRegistry::new();
        registry.insert(connector("a", Arc::new(never_filling("1")), true));
        registry.insert(connector("b", Arc::new(never_filling("2")), true));
        let coordinator = HedgeOrderCoordinator::new(Arc::new(registry), CoordinatorConfig::default());
        let handle = opportunity(dec!(1));

        let started = Instant::now();
        let outcome = coordinator.open(&handle).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(
            outcome,
            HedgeOutcome::Failed(HedgeFailure::FillTimeout { checks: 5 })
        );
        assert_eq!(handle.state(), HedgeState::OpenFailed);
        // 1000 ms initial delay plus four 4000 ms intervals
        assert!(elapsed >= Duration::from_millis(17_000));
        assert!(elapsed < Duration::from_millis(18_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_leg_is_compensated() {
        let filled = Arc::new(SimulatedExchange::new("a", FillBehavior::Immediate));
        let mut rejecting = MockExchangeAdapter::new();
        rejecting.expect_has_credentials().return_const(true);
        rejecting.expect_create_order().returning(|_, _| {
            Err(ExchangeError::OrderRejected {
                reason: "insufficient margin".into(),
            })
        });

        let mut registry = ExchangeRegistry::new();
        registry.insert(connector("a", filled.clone(), true));
        registry.insert(connector("b", Arc::new(rejecting), true));
        let coordinator = HedgeOrderCoordinator::new(Arc::new(registry), CoordinatorConfig::default());
        let handle = opportunity(dec!(3));

        let outcome = coordinator.open(&handle).await.unwrap();
        assert!(matches!(
            outcome,
            HedgeOutcome::Failed(HedgeFailure::Submit { role: LegRole::Short, .. })
        ));
        assert_eq!(handle.state(), HedgeState::OpenFailed);

        let orders = filled.orders().await;
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert_eq!(orders[1].amount, dec!(3));
        assert!(filled.fetch_positions(0).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leg_filled_behind_failed_cancel_is_compensated() {
        let mut late = MockExchangeAdapter::new();
        late.expect_has_credentials().return_const(true);
        late.expect_create_order()
            .withf(|order, _| !order.reduce_only)
            .times(1)
            .returning(|order, _| {
                let mut acked = unfilled_order("1", order.side());
                acked.status = OrderStatus::New;
                Ok(acked)
            });
        late.expect_cancel_order().times(1).returning(|_, _, _| {
            Err(ExchangeError::OrderRejected {
                reason: "Order already closed".into(),
            })
        });
        late.expect_fetch_trades().returning(|symbol, id, _| {
            Ok(vec![Trade {
                trade_id: "t1".into(),
                order_id: id.to_string(),
                symbol: symbol.to_string(),
                side: OrderSide::Buy,
                price: dec!(100),
                qty: dec!(3),
            }])
        });
        late.expect_create_order()
            .withf(|order, _| order.reduce_only && order.amount == dec!(-3))
            .times(1)
            .returning(|order, _| {
                let mut reverse = unfilled_order("2", order.side());
                reverse.status = OrderStatus::Filled;
                reverse.filled_amount = dec!(3);
                Ok(reverse)
            });

        let mut rejecting = MockExchangeAdapter::new();
        rejecting.expect_has_credentials().return_const(true);
        rejecting.expect_create_order().returning(|_, _| {
            Err(ExchangeError::OrderRejected {
                reason: "insufficient margin".into(),
            })
        });

        let mut registry = ExchangeRegistry::new();
        registry.insert(connector("a", Arc::new(late), true));
        registry.insert(connector("b", Arc::new(rejecting), true));
        let coordinator = HedgeOrderCoordinator::new(Arc::new(registry), CoordinatorConfig::default());
        let handle = opportunity(dec!(3));

        let outcome = coordinator.open(&handle).await.unwrap();
        assert!(matches!(
            outcome,
            HedgeOutcome::Failed(HedgeFailure::Submit { role: LegRole::Short, .. })
        ));
        assert_eq!(handle.state(), HedgeState::OpenFailed);
    }

    #[tokio::test]
    async fn test_rejects_concurrent_driver_and_bad_state() {
        let f = fixture(FillBehavior::Immediate, true, true);
        let handle = opportunity(dec!(1));

        let guard = handle.try_drive();
        assert!(matches!(
            f.coordinator.open(&handle).await,
            Err(HedgeError::AlreadyInFlight(_))
        ));
        drop(guard);

        assert!(matches!(
            f.coordinator.close(&handle).await,
            Err(HedgeError::InvalidState { action: "close", .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_exchange() {
        let f = fixture(FillBehavior::Immediate, true, true);
        let handle = Arc::new(OpportunityHandle::new(
            HedgeOpportunity::new("opp-3", "a#BTCUSDT", "kraken#BTCUSD", dec!(1)).unwrap(),
        ));
        assert!(matches!(
            f.coordinator.open(&handle).await,
            Err(HedgeError::UnknownExchange(name)) if name == "kraken"
        ));
    }
}
