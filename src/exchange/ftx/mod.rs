//! FTX integration (op-dialect websocket, header-signed REST).
//!
//! Perpetual markets are named `BASE-PERP` natively and quoted in USD, so the
//! canonical form of `BTC-PERP` is `BTCUSD`.

mod rest;
mod stream;
mod types;

pub use rest::FtxRest;
pub use stream::FtxStream;

use crate::exchange::symbols::SymbolMapper;

pub const EXCHANGE_NAME: &str = "ftx";

const BASE_URL: &str = "https://ftx.com/api";
const WS_URL: &str = "wss://ftx.com/ws/";

/// REST and websocket base URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct FtxEndpoints {
    pub rest_url: String,
    pub ws_url: String,
}

impl Default for FtxEndpoints {
    fn default() -> Self {
        Self {
            rest_url: BASE_URL.to_string(),
            ws_url: WS_URL.to_string(),
        }
    }
}

pub fn symbol_mapper() -> SymbolMapper {
    SymbolMapper::perpetual_suffix("-PERP", "USD")
}
