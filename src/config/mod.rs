//! Configuration management for the hedge engine.
//!
//! Loads settings from an optional `config.{toml,json,yaml}` file and
//! environment variables (`HEDGE__SECTION__FIELD`). Durations are given in
//! milliseconds.

use crate::exchange::{ConnectorConfig, HealthConfig, SessionConfig};
use crate::strategy::{CoordinatorConfig, ExecutorConfig};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchanges to connect
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
    /// Websocket session and liveness probing
    #[serde(default)]
    pub session: SessionSettings,
    /// REST polling and request parameters
    #[serde(default)]
    pub sync: SyncConfig,
    /// Hedge coordination parameters
    #[serde(default)]
    pub hedge: HedgeConfig,
    /// Periodic engine ticks
    #[serde(default)]
    pub ticks: TickConfig,
    /// Taker fee in percent per exchange name (0.04 means 0.04%)
    #[serde(default = "default_fees")]
    pub fees: HashMap<String, Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    BinanceFutures,
    Ftx,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Name used in `exchange#symbol` pairs
    pub name: String,
    pub kind: ExchangeKind,
    /// API key for authentication (empty for public-only operation)
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// Override of the REST base URL
    #[serde(default)]
    pub rest_url: Option<String>,
    /// Override of the websocket base URL
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
}

impl ExchangeConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    /// Canonical symbol, e.g. `BTCUSDT`
    pub symbol: String,
    /// Candle periods to subscribe, e.g. `1m`, `15m`
    #[serde(default)]
    pub periods: Vec<String>,
    /// Default trade amount for strategies
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    /// Round trips below this classify the link as good
    #[serde(default = "default_satisfaction_ms")]
    pub satisfaction_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Refresh period of the Binance listen key
    #[serde(default = "default_listen_key_keepalive_ms")]
    pub listen_key_keepalive_ms: u64,
    /// Capacity of the market and account event channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_order_sync_ms")]
    pub order_sync_ms: u64,
    #[serde(default = "default_position_sync_ms")]
    pub position_sync_ms: u64,
    #[serde(default = "default_time_sync_ms")]
    pub time_sync_ms: u64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_rest_retry_attempts")]
    pub rest_retry_attempts: u32,
    #[serde(default = "default_rest_retry_backoff_ms")]
    pub rest_retry_backoff_ms: u64,
    /// HTTP client timeout
    #[serde(default = "default_rest_timeout_ms")]
    pub rest_timeout_ms: u64,
    #[serde(default = "default_order_timeout_ms")]
    pub order_timeout_ms: u64,
    #[serde(default = "default_closed_order_retention")]
    pub closed_order_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    #[serde(default = "default_fill_poll_delay_ms")]
    pub fill_poll_delay_ms: u64,
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,
    #[serde(default = "default_fill_poll_attempts")]
    pub fill_poll_attempts: u32,
    #[serde(default = "default_signal_reset_delay_ms")]
    pub signal_reset_delay_ms: u64,
    /// Unwind a placed leg when its partner is rejected
    #[serde(default = "default_compensate")]
    pub compensate: bool,
    /// Retries after the first try for single-order intents rejected by
    /// the exchange
    #[serde(default = "default_order_max_retries")]
    pub order_max_retries: u32,
    #[serde(default = "default_order_retry_delay_ms")]
    pub order_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickConfig {
    /// Delay before periodic ticks start
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    #[serde(default = "default_ordering_ms")]
    pub ordering_ms: u64,
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
    /// An ordering run younger than this is not overlapped
    #[serde(default = "default_stall_guard_ms")]
    pub stall_guard_ms: u64,
    /// Budget for draining hedge tasks on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

// Default value functions
fn default_fees() -> HashMap<String, Decimal> {
    HashMap::from([
        ("binance_futures".to_string(), Decimal::new(4, 2)), // 0.04%
        ("ftx".to_string(), Decimal::new(7, 2)),             // 0.07%
    ])
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

fn default_pong_timeout_ms() -> u64 {
    1_000
}

fn default_satisfaction_ms() -> u64 {
    150
}

fn default_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_listen_key_keepalive_ms() -> u64 {
    600_000 // 10 minutes, keys expire after 60
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_order_sync_ms() -> u64 {
    30_000
}

fn default_position_sync_ms() -> u64 {
    30_000
}

fn default_time_sync_ms() -> u64 {
    120_000
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_rest_retry_attempts() -> u32 {
    3
}

fn default_rest_retry_backoff_ms() -> u64 {
    500
}

fn default_rest_timeout_ms() -> u64 {
    10_000
}

fn default_order_timeout_ms() -> u64 {
    10_000
}

fn default_closed_order_retention() -> usize {
    500
}

fn default_fill_poll_delay_ms() -> u64 {
    1_000
}

fn default_fill_poll_interval_ms() -> u64 {
    4_000
}

fn default_fill_poll_attempts() -> u32 {
    5
}

fn default_signal_reset_delay_ms() -> u64 {
    5_000
}

fn default_compensate() -> bool {
    true
}

fn default_order_max_retries() -> u32 {
    3
}

fn default_order_retry_delay_ms() -> u64 {
    1_500
}

fn default_warmup_ms() -> u64 {
    30_000 // let sessions fill tickers and candles first
}

fn default_ordering_ms() -> u64 {
    10_800
}

fn default_watchdog_ms() -> u64 {
    30_800
}

fn default_stall_guard_ms() -> u64 {
    20_000
}

fn default_shutdown_grace_ms() -> u64 {
    7_500
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("HEDGE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for exchange in &self.exchanges {
            anyhow::ensure!(!exchange.name.is_empty(), "exchange name must not be empty");
            anyhow::ensure!(
                !exchange.name.contains('#'),
                "exchange name '{}' must not contain '#'",
                exchange.name
            );
            anyhow::ensure!(
                names.insert(exchange.name.as_str()),
                "duplicate exchange name '{}'",
                exchange.name
            );
            anyhow::ensure!(
                exchange.api_key.is_empty() == exchange.secret_key.is_empty(),
                "exchange '{}' needs both api_key and secret_key or neither",
                exchange.name
            );
        }

        anyhow::ensure!(
            self.session.pong_timeout_ms > 0
                && self.session.pong_timeout_ms < self.session.ping_interval_ms,
            "pong_timeout_ms must be positive and below ping_interval_ms"
        );

        anyhow::ensure!(
            self.session.satisfaction_ms <= self.session.pong_timeout_ms,
            "satisfaction_ms must not exceed pong_timeout_ms"
        );

        anyhow::ensure!(
            self.session.channel_capacity > 0,
            "channel_capacity must be positive"
        );

        anyhow::ensure!(
            self.sync.rest_retry_attempts >= 1,
            "rest_retry_attempts must be >= 1"
        );

        anyhow::ensure!(
            self.hedge.fill_poll_attempts >= 1,
            "fill_poll_attempts must be >= 1"
        );

        anyhow::ensure!(
            self.fees.values().all(|fee| *fee >= Decimal::ZERO),
            "fees must not be negative"
        );

        Ok(())
    }

    /// Taker fee of an exchange in percent; zero when not configured.
    pub fn fee_percent(&self, exchange: &str) -> Decimal {
        self.fees.get(exchange).copied().unwrap_or(Decimal::ZERO)
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            health: HealthConfig {
                ping_interval: Duration::from_millis(self.ping_interval_ms),
                pong_timeout: Duration::from_millis(self.pong_timeout_ms),
                satisfaction: Duration::from_millis(self.satisfaction_ms),
            },
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn listen_key_keepalive(&self) -> Duration {
        Duration::from_millis(self.listen_key_keepalive_ms)
    }
}

impl SyncConfig {
    pub fn to_connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            order_sync_interval: Duration::from_millis(self.order_sync_ms),
            position_sync_interval: Duration::from_millis(self.position_sync_ms),
            time_sync_interval: Duration::from_millis(self.time_sync_ms),
            initial_sync_delay: Duration::from_millis(self.initial_delay_ms),
            rest_retry_attempts: self.rest_retry_attempts,
            rest_retry_backoff: Duration::from_millis(self.rest_retry_backoff_ms),
            order_timeout: Duration::from_millis(self.order_timeout_ms),
            closed_order_retention: self.closed_order_retention,
        }
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_millis(self.rest_timeout_ms)
    }
}

impl HedgeConfig {
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            fill_poll_delay: Duration::from_millis(self.fill_poll_delay_ms),
            fill_poll_interval: Duration::from_millis(self.fill_poll_interval_ms),
            fill_poll_attempts: self.fill_poll_attempts,
            signal_reset_delay: Duration::from_millis(self.signal_reset_delay_ms),
            compensate: self.compensate,
        }
    }

    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_retries: self.order_max_retries,
            retry_delay: Duration::from_millis(self.order_retry_delay_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchanges: Vec::new(),
            session: SessionSettings::default(),
            sync: SyncConfig::default(),
            hedge: HedgeConfig::default(),
            ticks: TickConfig::default(),
            fees: default_fees(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            satisfaction_ms: default_satisfaction_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            listen_key_keepalive_ms: default_listen_key_keepalive_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            order_sync_ms: default_order_sync_ms(),
            position_sync_ms: default_position_sync_ms(),
            time_sync_ms: default_time_sync_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            rest_retry_attempts: default_rest_retry_attempts(),
            rest_retry_backoff_ms: default_rest_retry_backoff_ms(),
            rest_timeout_ms: default_rest_timeout_ms(),
            order_timeout_ms: default_order_timeout_ms(),
            closed_order_retention: default_closed_order_retention(),
        }
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            fill_poll_delay_ms: default_fill_poll_delay_ms(),
            fill_poll_interval_ms: default_fill_poll_interval_ms(),
            fill_poll_attempts: default_fill_poll_attempts(),
            signal_reset_delay_ms: default_signal_reset_delay_ms(),
            compensate: default_compensate(),
            order_max_retries: default_order_max_retries(),
            order_retry_delay_ms: default_order_retry_delay_ms(),
        }
    }
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            warmup_ms: default_warmup_ms(),
            ordering_ms: default_ordering_ms(),
            watchdog_ms: default_watchdog_ms(),
            stall_guard_ms: default_stall_guard_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}
