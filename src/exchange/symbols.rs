//! Symbol notation translation between exchange-native and canonical form.
//!
//! Canonical symbols are `BASEQUOTE` (e.g. `BTCUSDT`). Each exchange supplies
//! its translation functions at connector construction; the connector and the
//! session dispatchers apply them on every write and read path.

use std::fmt;
use std::sync::Arc;

type Translate = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Pair of translation functions for one exchange.
#[derive(Clone)]
pub struct SymbolMapper {
    to_native: Translate,
    to_canonical: Translate,
}

impl SymbolMapper {
    pub fn new<N, C>(to_native: N, to_canonical: C) -> Self
    where
        N: Fn(&str) -> String + Send + Sync + 'static,
        C: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self {
            to_native: Arc::new(to_native),
            to_canonical: Arc::new(to_canonical),
        }
    }

    /// Exchange already uses canonical notation.
    pub fn identity() -> Self {
        Self::new(|s| s.to_string(), |s| s.to_string())
    }

    /// Perpetual markets named `BASE<suffix>` and quoted in `quote`,
    /// e.g. `BTC-PERP` ↔ `BTCUSD`.
    pub fn perpetual_suffix(suffix: &'static str, quote: &'static str) -> Self {
        Self::new(
            move |canonical| match canonical.strip_suffix(quote) {
                Some(base) if !base.is_empty() => format!("{}{}", base, suffix),
                _ => canonical.to_string(),
            },
            move |native| match native.strip_suffix(suffix) {
                Some(base) if !base.is_empty() => format!("{}{}", base, quote),
                _ => native.replace(['-', '/'], ""),
            },
        )
    }

    pub fn to_native(&self, canonical: &str) -> String {
        (self.to_native)(canonical)
    }

    pub fn to_canonical(&self, native: &str) -> String {
        (self.to_canonical)(native)
    }
}

impl fmt::Debug for SymbolMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolMapper").finish_non_exhaustive()
    }
}
