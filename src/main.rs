//! Hedge Engine - Main Entry Point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hedge_engine::config::{Config, ExchangeConfig, ExchangeKind};
use hedge_engine::engine::{Engine, Intent};
use hedge_engine::strategy::{HedgeOpportunity, HedgeState, OpportunityHandle};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Hedge Engine CLI
#[derive(Parser)]
#[command(name = "hedge-engine")]
#[command(version, about = "Cross-exchange hedged order execution")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured exchanges and run until interrupted
    Run,

    /// Open and close one hedge between two simulated exchanges
    Simulate {
        /// Canonical symbol to hedge
        #[arg(short, long, default_value = "BTCUSDT")]
        symbol: String,

        /// Hedge amount in base units
        #[arg(short, long, default_value = "0.01")]
        amount: Decimal,

        /// Price on the long exchange
        #[arg(long, default_value = "30000")]
        long_price: Decimal,

        /// Price on the short exchange
        #[arg(long, default_value = "30050")]
        short_price: Decimal,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(Config::load()?).await,
        Commands::Simulate {
            symbol,
            amount,
            long_price,
            short_price,
        } => simulate(&symbol, amount, long_price, short_price).await,
        Commands::CheckConfig => {
            let config = Config::load()?;
            log_config(&config);
            info!("Configuration is valid");
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Hedge Engine v{} starting", env!("CARGO_PKG_VERSION"));
    if config.exchanges.is_empty() {
        bail!("No exchanges configured");
    }
    log_config(&config);

    let grace = Duration::from_millis(config.ticks.shutdown_grace_ms);
    let mut engine = Engine::new(config)?;
    engine.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    engine.shutdown(grace).await;
    Ok(())
}

async fn simulate(
    symbol: &str,
    amount: Decimal,
    long_price: Decimal,
    short_price: Decimal,
) -> Result<()> {
    let mut config = Config::default();
    config.exchanges = ["sim_long", "sim_short"]
        .into_iter()
        .map(|name| ExchangeConfig {
            name: name.to_string(),
            kind: ExchangeKind::Simulated,
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            rest_url: None,
            ws_url: None,
            symbols: Vec::new(),
        })
        .collect();
    config.validate()?;
    let grace = Duration::from_millis(config.ticks.shutdown_grace_ms);

    let mut engine = Engine::new(config)?;
    let long = engine.simulated("sim_long").context("sim_long missing")?;
    let short = engine.simulated("sim_short").context("sim_short missing")?;
    long.set_price(symbol, long_price).await;
    short.set_price(symbol, short_price).await;
    engine.start();

    let opportunity = HedgeOpportunity::new(
        "simulated",
        &format!("sim_long#{symbol}"),
        &format!("sim_short#{symbol}"),
        amount,
    )?
    .with_found_prices(long_price, short_price);
    let handle = Arc::new(OpportunityHandle::new(opportunity));
    let intents = engine.intents();

    intents
        .send(Intent::CreateHedge(handle.clone()))
        .await
        .context("Engine stopped")?;
    let opened = wait_for_terminal(&handle).await;
    info!(state = %opened, "Open finished");

    if opened == HedgeState::Completed {
        intents
            .send(Intent::CloseHedge(handle.clone()))
            .await
            .context("Engine stopped")?;
        let closed = wait_for_terminal(&handle).await;
        info!(state = %closed, "Close finished");
    } else {
        warn!(failure = ?handle.snapshot().failure, "Hedge did not open");
    }

    let record = handle.snapshot();
    info!(
        long_filled = %record.long.filled_amount,
        short_filled = %record.short.filled_amount,
        long_avg = ?record.long.average_price,
        short_avg = ?record.short.average_price,
        long_fees = %long.total_fees().await,
        short_fees = %short.total_fees().await,
        "Simulation summary"
    );

    engine.shutdown(grace).await;
    Ok(())
}

/// Poll until the opportunity leaves its in-flight states.
async fn wait_for_terminal(handle: &OpportunityHandle) -> HedgeState {
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let state = handle.state();
        let in_flight = matches!(
            state,
            HedgeState::Opening
                | HedgeState::AwaitingFill
                | HedgeState::Closing
                | HedgeState::AwaitingClose
        );
        if !in_flight && !handle.is_driving() {
            return state;
        }
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "hedge-engine.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hedge_engine=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("Configuration:");
    for exchange in &config.exchanges {
        info!(
            "   {} ({:?}): {} symbols, testnet={}, credentials={}",
            exchange.name,
            exchange.kind,
            exchange.symbols.len(),
            exchange.testnet,
            exchange.has_credentials()
        );
    }
    info!(
        "   Ping every {}ms, pong timeout {}ms, satisfaction {}ms",
        config.session.ping_interval_ms,
        config.session.pong_timeout_ms,
        config.session.satisfaction_ms
    );
    info!(
        "   Fill checks: {} every {}ms after {}ms",
        config.hedge.fill_poll_attempts,
        config.hedge.fill_poll_interval_ms,
        config.hedge.fill_poll_delay_ms
    );
    info!(
        "   Ticks: ordering {}ms, watchdog {}ms, warmup {}ms",
        config.ticks.ordering_ms, config.ticks.watchdog_ms, config.ticks.warmup_ms
    );
}
