//! Binance USDⓈ-M futures integration.
//!
//! - REST: signed order, position and trade endpoints ([`BinanceRest`])
//! - Market stream: book tickers and klines ([`BinanceMarketStream`])
//! - User stream: order/trade and account updates ([`BinanceUserStream`])
//!
//! Binance already uses canonical `BASEQUOTE` symbols.

mod rest;
mod stream;
mod types;

pub use rest::BinanceRest;
pub use stream::{parse_user_event, BinanceMarketStream, BinanceUserStream, SymbolSubscription};

use crate::exchange::symbols::SymbolMapper;

pub const EXCHANGE_NAME: &str = "binance_futures";

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const FUTURES_WS_URL: &str = "wss://fstream.binance.com";
const FUTURES_TESTNET_WS_URL: &str = "wss://stream.binancefuture.com";

/// REST and websocket base URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct BinanceEndpoints {
    pub rest_url: String,
    pub ws_url: String,
}

impl BinanceEndpoints {
    pub fn mainnet() -> Self {
        Self {
            rest_url: FUTURES_BASE_URL.to_string(),
            ws_url: FUTURES_WS_URL.to_string(),
        }
    }

    pub fn testnet() -> Self {
        Self {
            rest_url: FUTURES_TESTNET_URL.to_string(),
            ws_url: FUTURES_TESTNET_WS_URL.to_string(),
        }
    }

    pub fn new(testnet: bool) -> Self {
        if testnet {
            Self::testnet()
        } else {
            Self::mainnet()
        }
    }
}

pub fn symbol_mapper() -> SymbolMapper {
    SymbolMapper::identity()
}
