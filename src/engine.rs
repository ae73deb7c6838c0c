//! Engine wiring and periodic ticks.
//!
//! Builds sessions and connectors from configuration, receives strategy
//! intents over a channel and hands them to the coordinator or the order
//! executor. After a warmup it runs two ticks:
//!
//! - `tick_ordering` drives opportunities with a pending signal
//! - `watchdog` logs connectivity and reconciles positions
//!
//! Shutdown first drains in-flight hedge tasks, then cancels sessions.

use crate::config::{Config, ExchangeConfig, ExchangeKind};
use crate::error::HedgeError;
use crate::exchange::binance::{
    self, BinanceEndpoints, BinanceMarketStream, BinanceRest, BinanceUserStream, SymbolSubscription,
};
use crate::exchange::ftx::{self, FtxEndpoints, FtxRest, FtxStream};
use crate::exchange::{
    AccountEvent, ConnectionHealthMonitor, Dispatcher, ExchangeAdapter, ExchangeConnector,
    ExchangeRegistry, ExchangeSession, FillBehavior, HealthReader, MarketEvent, SimulatedExchange,
    SymbolMapper, TickerRegistry,
};
use crate::strategy::{
    HedgeOrderCoordinator, HedgeState, OpportunityHandle, OrderExecutor, OrderIntent, Signal,
};
use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Instruction from a strategy.
#[derive(Debug)]
pub enum Intent {
    CreateHedge(Arc<OpportunityHandle>),
    CloseHedge(Arc<OpportunityHandle>),
    Order(OrderIntent),
}

/// Keeps periodic runs from overlapping unless the previous run stalled.
#[derive(Debug)]
pub struct TickGuard {
    stall: Duration,
    /// (run id, started_at) of the run in progress
    running: Mutex<Option<(u64, Instant)>>,
    next_id: Mutex<u64>,
}

impl TickGuard {
    pub fn new(stall: Duration) -> Self {
        Self {
            stall,
            running: Mutex::new(None),
            next_id: Mutex::new(1),
        }
    }

    /// Start a run. `None` while a run younger than the stall limit is active.
    pub fn try_begin(&self) -> Option<u64> {
        let mut running = self.running.lock();
        if let Some((_, started)) = *running {
            if started.elapsed() < self.stall {
                return None;
            }
        }
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        *running = Some((id, Instant::now()));
        Some(id)
    }

    /// Mark run `id` finished. Stale ids are ignored.
    pub fn finish(&self, id: u64) {
        let mut running = self.running.lock();
        if matches!(*running, Some((current, _)) if current == id) {
            *running = None;
        }
    }
}

/// Opportunities known to the engine.
#[derive(Debug, Default)]
pub struct OpportunityBook {
    entries: RwLock<Vec<Arc<OpportunityHandle>>>,
}

impl OpportunityBook {
    pub fn insert(&self, handle: Arc<OpportunityHandle>) {
        let mut entries = self.entries.write();
        if !entries.iter().any(|h| h.id() == handle.id()) {
            entries.push(handle);
        }
    }

    pub fn all(&self) -> Vec<Arc<OpportunityHandle>> {
        self.entries.read().clone()
    }

    /// Forget opportunities that closed cleanly.
    pub fn prune_closed(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|h| h.state() != HedgeState::Closed);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Components built for one configured exchange.
struct ExchangeParts {
    connector: Arc<ExchangeConnector>,
    account_rx: Option<mpsc::Receiver<AccountEvent>>,
    streams: Vec<(Arc<ExchangeSession>, Dispatcher)>,
    simulated: Option<Arc<SimulatedExchange>>,
}

/// Shared state of the running engine.
struct Shared {
    config: Config,
    exchanges: Arc<ExchangeRegistry>,
    coordinator: HedgeOrderCoordinator,
    executor: OrderExecutor,
    book: OpportunityBook,
    ordering_guard: TickGuard,
    hedge_tasks: Mutex<JoinSet<()>>,
}

pub struct Engine {
    shared: Arc<Shared>,
    tickers: Arc<TickerRegistry>,
    simulated: HashMap<String, Arc<SimulatedExchange>>,
    streams: Vec<(Arc<ExchangeSession>, Dispatcher)>,
    sessions: Vec<Arc<ExchangeSession>>,
    account_rxs: Vec<(Arc<ExchangeConnector>, Option<mpsc::Receiver<AccountEvent>>)>,
    market_rx: Option<mpsc::Receiver<MarketEvent>>,
    intent_tx: mpsc::Sender<Intent>,
    intent_rx: Option<mpsc::Receiver<Intent>>,
    /// Stops ticks and intent intake
    engine_token: CancellationToken,
    /// Stops sessions and connector polls
    session_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build every configured exchange. Nothing connects until [`Engine::start`].
    pub fn new(config: Config) -> Result<Self> {
        let tickers = Arc::new(TickerRegistry::new());
        let session_token = CancellationToken::new();
        let capacity = config.session.channel_capacity;
        let (market_tx, market_rx) = mpsc::channel(capacity);

        let mut parts = Vec::with_capacity(config.exchanges.len());
        for exchange in &config.exchanges {
            let built = build_exchange(&config, exchange, &tickers, &market_tx, &session_token)
                .with_context(|| format!("Failed to build exchange '{}'", exchange.name))?;
            parts.push(built);
        }

        let mut registry = ExchangeRegistry::new();
        let mut streams = Vec::new();
        let mut account_rxs = Vec::new();
        let mut simulated = HashMap::new();
        for part in parts {
            registry.insert(part.connector.clone());
            streams.extend(part.streams);
            if let Some(sim) = part.simulated {
                simulated.insert(part.connector.name().to_string(), sim);
            }
            account_rxs.push((part.connector, part.account_rx));
        }
        let exchanges = Arc::new(registry);

        let (intent_tx, intent_rx) = mpsc::channel(capacity);
        let shared = Arc::new(Shared {
            coordinator: HedgeOrderCoordinator::new(
                exchanges.clone(),
                config.hedge.to_coordinator_config(),
            ),
            executor: OrderExecutor::new(exchanges.clone(), config.hedge.to_executor_config()),
            ordering_guard: TickGuard::new(Duration::from_millis(config.ticks.stall_guard_ms)),
            book: OpportunityBook::default(),
            hedge_tasks: Mutex::new(JoinSet::new()),
            exchanges,
            config,
        });

        Ok(Self {
            shared,
            tickers,
            simulated,
            streams,
            sessions: Vec::new(),
            account_rxs,
            market_rx: Some(market_rx),
            intent_tx,
            intent_rx: Some(intent_rx),
            engine_token: CancellationToken::new(),
            session_token,
            handles: Vec::new(),
        })
    }

    pub fn tickers(&self) -> Arc<TickerRegistry> {
        self.tickers.clone()
    }

    pub fn exchanges(&self) -> Arc<ExchangeRegistry> {
        self.shared.exchanges.clone()
    }

    pub fn book(&self) -> &OpportunityBook {
        &self.shared.book
    }

    /// Sender for strategy intents.
    pub fn intents(&self) -> mpsc::Sender<Intent> {
        self.intent_tx.clone()
    }

    /// Market events for an external consumer. Available once.
    pub fn take_market_events(&mut self) -> Option<mpsc::Receiver<MarketEvent>> {
        self.market_rx.take()
    }

    /// Simulated exchange by name, for dry runs.
    pub fn simulated(&self, name: &str) -> Option<Arc<SimulatedExchange>> {
        self.simulated.get(name).cloned()
    }

    /// Spawn sessions, connector polls, the intent loop and the ticks.
    pub fn start(&mut self) {
        for (session, dispatcher) in self.streams.drain(..) {
            self.sessions.push(session.clone());
            self.handles.push(session.spawn(dispatcher));
        }

        for (connector, account_rx) in self.account_rxs.drain(..) {
            self.handles
                .extend(connector.start(account_rx, self.session_token.clone()));
        }

        if let Some(mut market_rx) = self.market_rx.take() {
            // Nobody subscribed; keep the channel flowing.
            let token = self.session_token.clone();
            self.handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = market_rx.recv() => match event {
                            Some(MarketEvent::Candle(candle)) => {
                                debug!(exchange = %candle.exchange, symbol = %candle.symbol, period = %candle.period, "Candle");
                            }
                            Some(MarketEvent::Ticker(_)) => {}
                            None => break,
                        },
                        () = token.cancelled() => break,
                    }
                }
            }));
        }

        if let Some(intent_rx) = self.intent_rx.take() {
            self.handles.push(tokio::spawn(intent_loop(
                self.shared.clone(),
                intent_rx,
                self.engine_token.clone(),
            )));
        }

        self.handles.push(tokio::spawn(tick_loop(
            self.shared.clone(),
            self.engine_token.clone(),
        )));

        info!(
            exchanges = ?self.shared.exchanges.names(),
            sessions = self.sessions.len(),
            "Engine started"
        );
    }

    /// One `tick_ordering` pass.
    pub async fn run_ordering(&self) {
        run_ordering(&self.shared).await;
    }

    /// One `watchdog` pass.
    pub async fn run_watchdog(&self) {
        run_watchdog(&self.shared).await;
    }

    /// Stop intake and ticks, wait up to `grace` for hedge tasks, then stop
    /// sessions and polls.
    pub async fn shutdown(mut self, grace: Duration) {
        info!(grace_ms = grace.as_millis() as u64, "Shutting down engine");
        self.engine_token.cancel();

        let mut tasks = std::mem::take(&mut *self.shared.hedge_tasks.lock());
        let in_flight = tasks.len();
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Hedge task failed");
                }
            }
        })
        .await;
        match drained {
            Ok(()) => info!(in_flight, "Hedge tasks drained"),
            Err(_) => {
                warn!(remaining = tasks.len(), "Grace period elapsed, aborting hedge tasks");
                tasks.shutdown().await;
            }
        }

        self.session_token.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Engine task failed");
                }
            }
        }
        info!("Engine stopped");
    }
}

/// Spawn onto the tasks drained at shutdown, reaping finished ones first.
fn track<F>(shared: &Shared, task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let mut tasks = shared.hedge_tasks.lock();
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            error!(error = %e, "Hedge task failed");
        }
    }
    tasks.spawn(task);
}

/// Spawn a coordinator run for `handle` onto the tracked hedge tasks.
fn spawn_drive(shared: &Arc<Shared>, handle: Arc<OpportunityHandle>, signal: Signal) {
    let this = shared.clone();
    track(shared, async move {
        drive(&this, &handle, signal).await;
    });
}

async fn drive(shared: &Shared, handle: &Arc<OpportunityHandle>, signal: Signal) {
    let result = match signal {
        Signal::Open => shared.coordinator.open(handle).await,
        Signal::Close => shared.coordinator.close(handle).await,
        Signal::None => return,
    };
    match result {
        Ok(outcome) => info!(opportunity = %handle.id(), ?signal, ?outcome, "Hedge run finished"),
        Err(HedgeError::AlreadyInFlight(id)) => {
            debug!(opportunity = %id, "Hedge already being driven")
        }
        Err(e) => warn!(opportunity = %handle.id(), ?signal, error = %e, "Hedge run refused"),
    }
}

async fn intent_loop(
    shared: Arc<Shared>,
    mut intents: mpsc::Receiver<Intent>,
    shutdown: CancellationToken,
) {
    loop {
        let intent = tokio::select! {
            intent = intents.recv() => match intent {
                Some(intent) => intent,
                None => break,
            },
            () = shutdown.cancelled() => break,
        };

        match intent {
            Intent::CreateHedge(handle) => {
                handle.set_signal(Signal::Open);
                shared.book.insert(handle.clone());
                spawn_drive(&shared, handle, Signal::Open);
            }
            Intent::CloseHedge(handle) => {
                handle.set_signal(Signal::Close);
                shared.book.insert(handle.clone());
                spawn_drive(&shared, handle, Signal::Close);
            }
            Intent::Order(order) => {
                let this = shared.clone();
                track(&shared, async move {
                    match this.executor.on_order(&order).await {
                        Ok(placed) => {
                            info!(exchange = %order.exchange, order_id = %placed.id, "Order intent executed")
                        }
                        Err(e) => {
                            error!(exchange = %order.exchange, symbol = %order.order.symbol, error = %e, "Order intent failed")
                        }
                    }
                });
            }
        }
    }
    debug!("Intent loop stopped");
}

async fn tick_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let ticks = shared.config.ticks.clone();

    tokio::select! {
        () = tokio::time::sleep(Duration::from_millis(ticks.warmup_ms)) => {}
        () = shutdown.cancelled() => return,
    }
    info!("Warmup done, starting ticks");

    let ordering_every = Duration::from_millis(ticks.ordering_ms);
    let watchdog_every = Duration::from_millis(ticks.watchdog_ms);
    let mut ordering = tokio::time::interval_at(Instant::now() + ordering_every, ordering_every);
    let mut watchdog = tokio::time::interval_at(Instant::now() + watchdog_every, watchdog_every);

    loop {
        tokio::select! {
            _ = ordering.tick() => {
                let this = shared.clone();
                track(&shared, async move { run_ordering(&this).await });
            }
            _ = watchdog.tick() => {
                let this = shared.clone();
                tokio::spawn(async move { run_watchdog(&this).await });
            }
            () = shutdown.cancelled() => break,
        }
    }
}

/// Drive every opportunity whose signal is pending, waiting for the runs.
async fn run_ordering(shared: &Arc<Shared>) {
    let Some(run) = shared.ordering_guard.try_begin() else {
        debug!("tick_ordering still running");
        return;
    };

    let pruned = shared.book.prune_closed();
    if pruned > 0 {
        debug!(pruned, "Closed opportunities pruned");
    }

    let mut runs = Vec::new();
    for handle in shared.book.all() {
        if handle.is_driving() {
            continue;
        }
        let signal = match (handle.signal(), handle.state()) {
            (Signal::Open, HedgeState::Idle) => Signal::Open,
            (Signal::Close, HedgeState::Completed) => Signal::Close,
            _ => continue,
        };
        runs.push(async move { drive(shared, &handle, signal).await });
    }
    futures_util::future::join_all(runs).await;

    shared.ordering_guard.finish(run);
}

/// Log connectivity per exchange and reconcile positions.
async fn run_watchdog(shared: &Arc<Shared>) {
    for connector in shared.exchanges.all() {
        info!(
            exchange = %connector.name(),
            health = %connector.connection_health(),
            latency_ms = ?connector.latency_ms(),
            open_orders = connector.get_open_orders().len(),
            positions = connector.get_positions().len(),
            "Watchdog"
        );
        if let Err(e) = connector.sync_positions().await {
            debug!(exchange = %connector.name(), error = %e, "Watchdog position sync failed");
        }
    }
}

/// Health reader of a link without network latency.
fn local_health() -> HealthReader {
    let monitor = Arc::new(ConnectionHealthMonitor::new(Default::default()));
    let now = Instant::now();
    let id = monitor.record_ping(now);
    monitor.record_pong(Some(id), now);
    HealthReader::new(monitor)
}

fn build_exchange(
    config: &Config,
    exchange: &ExchangeConfig,
    tickers: &Arc<TickerRegistry>,
    market_tx: &mpsc::Sender<MarketEvent>,
    session_token: &CancellationToken,
) -> Result<ExchangeParts> {
    let session_config = config.session.to_session_config();
    let connector_config = config.sync.to_connector_config();
    let capacity = config.session.channel_capacity;
    let name = exchange.name.as_str();

    match exchange.kind {
        ExchangeKind::BinanceFutures => {
            let mut endpoints = BinanceEndpoints::new(exchange.testnet);
            if let Some(url) = &exchange.rest_url {
                endpoints.rest_url = url.clone();
            }
            if let Some(url) = &exchange.ws_url {
                endpoints.ws_url = url.clone();
            }
            let mapper = binance::symbol_mapper();
            let rest = Arc::new(BinanceRest::new(
                &endpoints,
                &exchange.api_key,
                &exchange.secret_key,
                config.sync.rest_timeout(),
            )?);

            let subscriptions = exchange
                .symbols
                .iter()
                .map(|s| SymbolSubscription {
                    symbol: mapper.to_native(&s.symbol),
                    periods: s.periods.clone(),
                })
                .collect();
            let market = Arc::new(ExchangeSession::new(
                name,
                Arc::new(BinanceMarketStream::new(&endpoints.ws_url, subscriptions)),
                session_config,
                session_token.child_token(),
            ));
            let mut streams = vec![(
                market.clone(),
                Dispatcher::new(name, mapper.clone(), tickers.clone()).with_market(market_tx.clone()),
            )];

            let mut account_rx = None;
            if exchange.has_credentials() {
                let (tx, rx) = mpsc::channel(capacity);
                let user = Arc::new(ExchangeSession::new(
                    name,
                    Arc::new(BinanceUserStream::new(
                        &endpoints.ws_url,
                        rest.clone(),
                        config.session.listen_key_keepalive(),
                    )),
                    session_config,
                    session_token.child_token(),
                ));
                streams.push((
                    user,
                    Dispatcher::new(name, mapper.clone(), tickers.clone()).with_account(tx),
                ));
                account_rx = Some(rx);
            }

            let connector = Arc::new(ExchangeConnector::new(
                name,
                rest,
                mapper,
                tickers.clone(),
                market.health_reader(),
                connector_config,
            ));
            Ok(ExchangeParts {
                connector,
                account_rx,
                streams,
                simulated: None,
            })
        }
        ExchangeKind::Ftx => {
            let mut endpoints = FtxEndpoints::default();
            if let Some(url) = &exchange.rest_url {
                endpoints.rest_url = url.clone();
            }
            if let Some(url) = &exchange.ws_url {
                endpoints.ws_url = url.clone();
            }
            if exchange.testnet {
                warn!(exchange = %name, "No FTX testnet, use url overrides instead");
            }
            let mapper = ftx::symbol_mapper();
            let rest = Arc::new(FtxRest::new(
                &endpoints,
                &exchange.api_key,
                &exchange.secret_key,
                config.sync.rest_timeout(),
            )?);

            let markets = exchange
                .symbols
                .iter()
                .map(|s| mapper.to_native(&s.symbol))
                .collect();
            let credentials = exchange
                .has_credentials()
                .then(|| (exchange.api_key.clone(), exchange.secret_key.clone()));
            let clock_offset = Arc::new(AtomicI64::new(0));
            let session = Arc::new(ExchangeSession::new(
                name,
                Arc::new(
                    FtxStream::new(&endpoints.ws_url, markets, credentials)
                        .with_clock_offset(clock_offset.clone()),
                ),
                session_config,
                session_token.child_token(),
            ));

            let mut dispatcher =
                Dispatcher::new(name, mapper.clone(), tickers.clone()).with_market(market_tx.clone());
            let mut account_rx = None;
            if exchange.has_credentials() {
                let (tx, rx) = mpsc::channel(capacity);
                dispatcher = dispatcher.with_account(tx);
                account_rx = Some(rx);
            }

            let connector = Arc::new(ExchangeConnector::new(
                name,
                rest,
                mapper,
                tickers.clone(),
                session.health_reader(),
                connector_config,
            )
            .with_clock_offset(clock_offset));
            Ok(ExchangeParts {
                connector,
                account_rx,
                streams: vec![(session, dispatcher)],
                simulated: None,
            })
        }
        ExchangeKind::Simulated => {
            let (tx, rx) = mpsc::channel(capacity);
            let sim = Arc::new(
                SimulatedExchange::new(name, FillBehavior::Immediate)
                    .with_fee_percent(config.fee_percent(name))
                    .with_account_stream(tx),
            );
            let adapter: Arc<dyn ExchangeAdapter> = sim.clone();
            let connector = Arc::new(ExchangeConnector::new(
                name,
                adapter,
                SymbolMapper::identity(),
                tickers.clone(),
                local_health(),
                connector_config,
            ));
            Ok(ExchangeParts {
                connector,
                account_rx: Some(rx),
                streams: Vec::new(),
                simulated: Some(sim),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::HedgeOpportunity;
    use rust_decimal_macros::dec;

    fn simulated(name: &str) -> ExchangeConfig {
        ExchangeConfig {
            name: name.to_string(),
            kind: ExchangeKind::Simulated,
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            rest_url: None,
            ws_url: None,
            symbols: Vec::new(),
        }
    }

    fn engine() -> Engine {
        let mut config = Config::default();
        config.exchanges = vec![simulated("sim_a"), simulated("sim_b")];
        Engine::new(config).unwrap()
    }

    fn opportunity(id: &str) -> Arc<OpportunityHandle> {
        Arc::new(OpportunityHandle::new(
            HedgeOpportunity::new(id, "sim_a#BTCUSDT", "sim_b#BTCUSDT", dec!(1)).unwrap(),
        ))
    }

    async fn wait_for(handle: &OpportunityHandle, state: HedgeState) {
        for _ in 0..100 {
            if handle.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("opportunity stuck in {:?}", handle.state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_guard_skips_young_runs() {
        let guard = TickGuard::new(Duration::from_secs(20));
        let first = guard.try_begin().unwrap();
        assert!(guard.try_begin().is_none());

        tokio::time::advance(Duration::from_secs(21)).await;
        let second = guard.try_begin().unwrap();
        // The stalled run finishing late must not clear the new run
        guard.finish(first);
        assert!(guard.try_begin().is_none());

        guard.finish(second);
        assert!(guard.try_begin().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_intents_open_and_close_hedge() {
        let mut engine = engine();
        engine.start();
        let intents = engine.intents();
        let handle = opportunity("opp-1");

        intents.send(Intent::CreateHedge(handle.clone())).await.unwrap();
        wait_for(&handle, HedgeState::Completed).await;
        assert_eq!(engine.book().len(), 1);

        intents.send(Intent::CloseHedge(handle.clone())).await.unwrap();
        wait_for(&handle, HedgeState::Closed).await;

        let sim = engine.simulated("sim_a").unwrap();
        assert_eq!(sim.orders().await.len(), 2);
        assert!(sim.total_fees().await > dec!(0));
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordering_tick_drives_pending_signals() {
        let engine = engine();
        let pending = opportunity("opp-2");
        pending.set_signal(Signal::Open);
        let quiet = opportunity("opp-3");
        engine.book().insert(pending.clone());
        engine.book().insert(quiet.clone());

        engine.run_ordering().await;

        assert_eq!(pending.state(), HedgeState::Completed);
        assert_eq!(pending.signal(), Signal::None);
        assert_eq!(quiet.state(), HedgeState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordering_prunes_closed() {
        let engine = engine();
        let handle = opportunity("opp-4");
        handle.update(|o| o.state = HedgeState::Closed);
        engine.book().insert(handle);

        engine.run_ordering().await;
        assert!(engine.book().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_in_flight_hedges() {
        let mut engine = engine();
        engine.start();
        engine
            .simulated("sim_a")
            .unwrap()
            .set_behavior(FillBehavior::Never)
            .await;
        let handle = opportunity("opp-5");
        engine
            .intents()
            .send(Intent::CreateHedge(handle.clone()))
            .await
            .unwrap();
        wait_for(&handle, HedgeState::AwaitingFill).await;

        // The fill budget (17 s) fits in the grace period, so the run ends
        // in its terminal state instead of being aborted.
        engine.shutdown(Duration::from_secs(30)).await;
        assert_eq!(handle.state(), HedgeState::OpenFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_after_grace() {
        let mut engine = engine();
        engine.start();
        engine
            .simulated("sim_a")
            .unwrap()
            .set_behavior(FillBehavior::Never)
            .await;
        let handle = opportunity("opp-6");
        engine
            .intents()
            .send(Intent::CreateHedge(handle.clone()))
            .await
            .unwrap();
        wait_for(&handle, HedgeState::AwaitingFill).await;

        engine.shutdown(Duration::from_secs(2)).await;
        assert_eq!(handle.state(), HedgeState::AwaitingFill);
        assert!(!handle.is_driving());
    }
}
