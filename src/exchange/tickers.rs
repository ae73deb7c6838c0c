//! Process-wide latest-ticker table.
//!
//! Created once at startup and passed explicitly to every session and
//! connector. Each `(exchange, symbol)` key is written only by the dispatcher
//! of the session that owns that exchange's market stream.

use crate::exchange::types::Ticker;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct TickerRegistry {
    tickers: RwLock<HashMap<(String, String), Ticker>>,
}

impl TickerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot for the ticker's `(exchange, symbol)`.
    pub fn set(&self, ticker: Ticker) {
        let key = (ticker.exchange.clone(), ticker.symbol.clone());
        self.tickers.write().insert(key, ticker);
    }

    pub fn get(&self, exchange: &str, symbol: &str) -> Option<Ticker> {
        self.tickers
            .read()
            .get(&(exchange.to_string(), symbol.to_string()))
            .cloned()
    }

    /// All snapshots of one exchange.
    pub fn for_exchange(&self, exchange: &str) -> Vec<Ticker> {
        self.tickers
            .read()
            .values()
            .filter(|t| t.exchange == exchange)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tickers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_set_replaces_snapshot() {
        let registry = TickerRegistry::new();
        registry.set(Ticker::new("binance_futures", "BTCUSDT", dec!(100), dec!(101)));
        registry.set(Ticker::new("binance_futures", "BTCUSDT", dec!(102), dec!(103)));
        registry.set(Ticker::new("ftx", "BTCUSD", dec!(99), dec!(100)));

        let t = registry.get("binance_futures", "BTCUSDT").unwrap();
        assert_eq!(t.bid, dec!(102));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.for_exchange("ftx").len(), 1);
        assert!(registry.get("ftx", "ETHUSD").is_none());
    }
}
