//! Persistent websocket session with liveness probing and reconnection.
//!
//! One session per stream (public market data or private account data). The
//! session owns the socket, its [`ConnectionHealthMonitor`] and a
//! [`Dispatcher`] that turns decoded frames into typed channel events.

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::health::{ConnectionHealthMonitor, HealthConfig, HealthReader};
use crate::exchange::symbols::SymbolMapper;
use crate::exchange::tickers::TickerRegistry;
use crate::exchange::traits::{ControlFrame, Inbound, StreamProtocol};
use crate::exchange::types::{AccountEvent, MarketEvent, Ticker};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribing,
    Live,
    Closing,
}

/// Session timing parameters.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub health: HealthConfig,
    /// Delay before reconnecting after the socket closed
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Routes decoded frames of one session to the registry and channels.
///
/// Market events are published without waiting: a full market channel drops
/// the event rather than stalling the socket. Account events are delivered.
pub struct Dispatcher {
    exchange: String,
    symbols: SymbolMapper,
    tickers: Arc<TickerRegistry>,
    market_tx: Option<mpsc::Sender<MarketEvent>>,
    account_tx: Option<mpsc::Sender<AccountEvent>>,
    /// Last emitted (bid, ask) per canonical symbol
    last_quotes: HashMap<String, (Decimal, Decimal)>,
}

impl Dispatcher {
    pub fn new(exchange: &str, symbols: SymbolMapper, tickers: Arc<TickerRegistry>) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbols,
            tickers,
            market_tx: None,
            account_tx: None,
            last_quotes: HashMap::new(),
        }
    }

    pub fn with_market(mut self, tx: mpsc::Sender<MarketEvent>) -> Self {
        self.market_tx = Some(tx);
        self
    }

    pub fn with_account(mut self, tx: mpsc::Sender<AccountEvent>) -> Self {
        self.account_tx = Some(tx);
        self
    }

    /// Handle one data event. Control frames are returned to the session.
    pub async fn dispatch(&mut self, event: Inbound) -> Option<ControlFrame> {
        match event {
            Inbound::Ticker { symbol, bid, ask } => {
                let symbol = self.symbols.to_canonical(&symbol);
                if self.last_quotes.get(&symbol) == Some(&(bid, ask)) {
                    return None;
                }
                self.last_quotes.insert(symbol.clone(), (bid, ask));

                let ticker = Ticker::new(&self.exchange, &symbol, bid, ask);
                self.tickers.set(ticker.clone());
                self.publish_market(MarketEvent::Ticker(ticker));
            }
            Inbound::Candle(mut candle) => {
                candle.symbol = self.symbols.to_canonical(&candle.symbol);
                candle.exchange = self.exchange.clone();
                self.publish_market(MarketEvent::Candle(candle));
            }
            Inbound::Order(mut order) => {
                order.symbol = self.symbols.to_canonical(&order.symbol);
                self.publish_account(AccountEvent::Order(order)).await;
            }
            Inbound::Trade(mut trade) => {
                trade.symbol = self.symbols.to_canonical(&trade.symbol);
                self.publish_account(AccountEvent::Trade(trade)).await;
            }
            Inbound::AccountUpdate => {
                self.publish_account(AccountEvent::PositionsChanged).await;
            }
            Inbound::Control(control) => return Some(control),
        }
        None
    }

    fn publish_market(&self, event: MarketEvent) {
        if let Some(tx) = &self.market_tx {
            if let Err(e) = tx.try_send(event) {
                debug!(exchange = %self.exchange, error = %e, "Market event dropped");
            }
        }
    }

    async fn publish_account(&self, event: AccountEvent) {
        if let Some(tx) = &self.account_tx {
            if tx.send(event).await.is_err() {
                warn!(exchange = %self.exchange, "Account event receiver dropped");
            }
        }
    }
}

/// Websocket session for one stream of one exchange.
pub struct ExchangeSession {
    exchange: String,
    protocol: Arc<dyn StreamProtocol>,
    health: Arc<ConnectionHealthMonitor>,
    state: RwLock<SessionState>,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl ExchangeSession {
    pub fn new(
        exchange: &str,
        protocol: Arc<dyn StreamProtocol>,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            protocol,
            health: Arc::new(ConnectionHealthMonitor::new(config.health)),
            state: RwLock::new(SessionState::Disconnected),
            config,
            shutdown,
        }
    }

    pub fn health_reader(&self) -> HealthReader {
        HealthReader::new(self.health.clone())
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Spawn the connect/reconnect loop on the runtime.
    pub fn spawn(self: Arc<Self>, dispatcher: Dispatcher) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(dispatcher).await })
    }

    /// Connect, serve and reconnect until the shutdown token is cancelled.
    pub async fn run(&self, mut dispatcher: Dispatcher) {
        let kind = self.protocol.kind();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // The serve loop handles shutdown itself once live; the outer
            // branch only interrupts a stalled connect or handshake.
            let result = tokio::select! {
                biased;
                result = self.connect_and_serve(&mut dispatcher) => result,
                () = self.shutdown.cancelled() => Ok(()),
            };

            match result {
                Ok(()) => info!(exchange = %self.exchange, %kind, "Websocket session closed"),
                Err(e) => warn!(exchange = %self.exchange, %kind, error = %e, "Websocket session failed"),
            }

            self.set_state(SessionState::Closing);
            self.health.reset();

            if self.shutdown.is_cancelled() {
                break;
            }

            info!(
                exchange = %self.exchange,
                %kind,
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Reconnecting"
            );
            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
                () = self.shutdown.cancelled() => break,
            }
        }
        self.set_state(SessionState::Disconnected);
        info!(exchange = %self.exchange, %kind, "Websocket session stopped");
    }

    async fn connect_and_serve(&self, dispatcher: &mut Dispatcher) -> ExchangeResult<()> {
        self.set_state(SessionState::Connecting);
        let url = self.protocol.endpoint().await?;
        debug!(exchange = %self.exchange, %url, "Connecting to websocket");

        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        self.set_state(SessionState::Subscribing);
        for frame in self.protocol.subscription_frames() {
            debug!(exchange = %self.exchange, %frame, "Sending subscription");
            write.send(Message::Text(frame.into())).await?;
        }

        self.set_state(SessionState::Live);
        info!(exchange = %self.exchange, kind = %self.protocol.kind(), "Websocket session live");

        let probes = self.protocol.probes_liveness();
        let mut ping = tokio::time::interval(self.config.health.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let keepalive_every = self.protocol.keepalive_interval();
        let mut keepalive =
            tokio::time::interval(keepalive_every.unwrap_or(Duration::from_secs(3600)));
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        keepalive.tick().await;

        loop {
            let pong_deadline = self.health.pong_deadline();

            tokio::select! {
                () = self.shutdown.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(error = %e, "Failed to send close frame");
                    }
                    return Ok(());
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, dispatcher).await?,
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(frame))) => {
                        info!(exchange = %self.exchange, ?frame, "Websocket closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },

                _ = ping.tick(), if probes => {
                    let ping_id = self.health.record_ping(Instant::now());
                    write.send(Message::Text(self.protocol.ping_frame(ping_id).into())).await?;
                }

                () = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)),
                    if pong_deadline.is_some() =>
                {
                    if let Some(ping_id) = self.health.outstanding() {
                        if self.health.on_timeout(ping_id) {
                            return Err(ExchangeError::Transport(format!(
                                "pong {} not received within {}ms",
                                ping_id,
                                self.config.health.pong_timeout.as_millis()
                            )));
                        }
                    }
                }

                _ = keepalive.tick(), if keepalive_every.is_some() => {
                    if let Err(e) = self.protocol.keepalive().await {
                        warn!(exchange = %self.exchange, error = %e, "Stream keepalive failed");
                    }
                }
            }
        }
    }

    /// Decode and route one text frame. Malformed frames are dropped.
    async fn handle_text(&self, text: &str, dispatcher: &mut Dispatcher) -> ExchangeResult<()> {
        let events = match self.protocol.parse(text) {
            Ok(events) => events,
            Err(e) => {
                warn!(exchange = %self.exchange, error = %e, "Dropping malformed frame");
                return Ok(());
            }
        };

        for event in events {
            let Some(control) = dispatcher.dispatch(event).await else {
                continue;
            };
            match control {
                ControlFrame::Pong(ping_id) => {
                    self.health.record_pong(ping_id, Instant::now());
                }
                ControlFrame::Subscribed(channel) => {
                    info!(exchange = %self.exchange, %channel, "Subscribed");
                }
                ControlFrame::Ack(id) => debug!(exchange = %self.exchange, id, "Request acknowledged"),
                ControlFrame::Error(message) => {
                    error!(exchange = %self.exchange, %message, "Stream error");
                }
                ControlFrame::Reconnect(reason) => {
                    return Err(ExchangeError::Transport(reason));
                }
            }
        }
        Ok(())
    }
}
