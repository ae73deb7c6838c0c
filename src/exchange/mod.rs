//! Exchange integrations for cross-exchange hedging.
//!
//! ## Sessions
//! One [`ExchangeSession`] per websocket stream. Sessions own the socket,
//! replay subscriptions after every reconnect, probe liveness with pings and
//! publish typed events through a [`Dispatcher`].
//!
//! ## Connectors
//! One [`ExchangeConnector`] per exchange: orders, positions and fills behind
//! canonical symbols, backed by an [`ExchangeAdapter`] for REST.
//!
//! ## Integrations
//! - Binance USDⓈ-M futures (`binance`)
//! - FTX perpetuals (`ftx`)
//! - In-process simulation (`mock`)

pub mod binance;
mod connector;
mod fills;
pub mod ftx;
mod health;
pub mod mock;
mod registry;
mod session;
mod symbols;
mod tickers;
mod traits;
mod types;

pub use connector::{ConnectorConfig, ExchangeConnector};
pub use fills::{FillAggregate, OrderFillTracker};
pub use health::{ConnectionHealth, ConnectionHealthMonitor, HealthConfig, HealthReader};
pub use mock::{FillBehavior, SimulatedExchange};
pub use registry::ExchangeRegistry;
pub use session::{Dispatcher, ExchangeSession, SessionConfig, SessionState};
pub use symbols::SymbolMapper;
pub use tickers::TickerRegistry;
pub use traits::{ControlFrame, ExchangeAdapter, Inbound, StreamProtocol};
#[cfg(test)]
pub use traits::MockExchangeAdapter;
pub use types::*;
