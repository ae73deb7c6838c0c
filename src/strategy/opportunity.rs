//! Hedge opportunity records.
//!
//! An opportunity pairs a long leg on one exchange with a short leg on
//! another. The record is shared between the strategy that produced it and
//! the coordinator that drives it; [`OpportunityHandle`] guarantees that only
//! one driver mutates it at a time.

use crate::error::HedgeError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/// `exchange#symbol` reference to a market on a named exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PairRef {
    pub exchange: String,
    /// Canonical symbol
    pub symbol: String,
}

impl FromStr for PairRef {
    type Err = HedgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('#') {
            Some((exchange, symbol))
                if !exchange.is_empty() && !symbol.is_empty() && !symbol.contains('#') =>
            {
                Ok(Self {
                    exchange: exchange.to_string(),
                    symbol: symbol.to_string(),
                })
            }
            _ => Err(HedgeError::InvalidPair(s.to_string())),
        }
    }
}

impl fmt::Display for PairRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.exchange, self.symbol)
    }
}

/// Pending instruction from the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    None,
    Open,
    Close,
}

/// Which side of the hedge a leg carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LegRole {
    Long,
    Short,
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegRole::Long => write!(f, "long"),
            LegRole::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LegStatus {
    Idle,
    Opening,
    Open,
    OpenFailed,
    Closing,
    Closed,
    CloseFailed,
}

/// One side of a hedge with its execution metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Leg {
    pub pair: PairRef,
    /// Price the strategy saw when it found the opportunity
    pub found_price: Option<Decimal>,
    pub status: LegStatus,
    pub id_create: Option<String>,
    pub id_close: Option<String>,
    pub exec_duration_create: Option<u64>,
    pub exec_duration_close: Option<u64>,
    /// Ping round trip of the exchange when the opening order was sent
    pub latency_create: Option<u64>,
    pub latency_close: Option<u64>,
    /// Signed amount filled by the opening order
    pub filled_amount: Decimal,
    pub average_price: Option<Decimal>,
    /// Signed amount filled by the closing order
    pub close_filled_amount: Decimal,
}

impl Leg {
    fn new(pair: PairRef) -> Self {
        Self {
            pair,
            found_price: None,
            status: LegStatus::Idle,
            id_create: None,
            id_close: None,
            exec_duration_create: None,
            exec_duration_close: None,
            latency_create: None,
            latency_close: None,
            filled_amount: Decimal::ZERO,
            average_price: None,
            close_filled_amount: Decimal::ZERO,
        }
    }
}

/// Lifecycle of a hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HedgeState {
    Idle,
    Opening,
    AwaitingFill,
    Completed,
    OpenFailed,
    Closing,
    AwaitingClose,
    Closed,
    CloseFailed,
}

impl fmt::Display for HedgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why an accepted hedge attempt ended in a failed state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HedgeFailure {
    /// An order could not be placed.
    Submit { role: LegRole, reason: String },
    /// Legs did not settle within the allotted checks.
    FillTimeout { checks: u32 },
}

impl fmt::Display for HedgeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HedgeFailure::Submit { role, reason } => {
                write!(f, "{} leg submission failed: {}", role, reason)
            }
            HedgeFailure::FillTimeout { checks } => {
                write!(f, "legs not filled after {} checks", checks)
            }
        }
    }
}

/// Two-leg hedge across exchanges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HedgeOpportunity {
    pub id: String,
    pub long: Leg,
    pub short: Leg,
    /// Unsigned quantity per leg
    pub amount: Decimal,
    /// Swap the signs: the long pair sells and the short pair buys
    pub inverse: bool,
    pub signal: Signal,
    pub state: HedgeState,
    pub failure: Option<HedgeFailure>,
    pub updated_at: DateTime<Utc>,
}

impl HedgeOpportunity {
    /// New idle opportunity. Pairs are `exchange#symbol`.
    pub fn new(
        id: &str,
        long_pair: &str,
        short_pair: &str,
        amount: Decimal,
    ) -> Result<Self, HedgeError> {
        Ok(Self {
            id: id.to_string(),
            long: Leg::new(long_pair.parse()?),
            short: Leg::new(short_pair.parse()?),
            amount: amount.abs(),
            inverse: false,
            signal: Signal::None,
            state: HedgeState::Idle,
            failure: None,
            updated_at: Utc::now(),
        })
    }

    pub fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }

    pub fn with_found_prices(mut self, long: Decimal, short: Decimal) -> Self {
        self.long.found_price = Some(long);
        self.short.found_price = Some(short);
        self
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    /// Signed opening amounts for the (long, short) legs.
    pub fn open_amounts(&self) -> (Decimal, Decimal) {
        if self.inverse {
            (-self.amount, self.amount)
        } else {
            (self.amount, -self.amount)
        }
    }

    /// Signed closing amounts: each leg unwinds what it actually filled.
    pub fn close_amounts(&self) -> (Decimal, Decimal) {
        (-self.long.filled_amount, -self.short.filled_amount)
    }

    pub fn leg(&self, role: LegRole) -> &Leg {
        match role {
            LegRole::Long => &self.long,
            LegRole::Short => &self.short,
        }
    }

    pub fn leg_mut(&mut self, role: LegRole) -> &mut Leg {
        match role {
            LegRole::Long => &mut self.long,
            LegRole::Short => &mut self.short,
        }
    }
}

/// Shared opportunity record with a single-driver guard.
#[derive(Debug)]
pub struct OpportunityHandle {
    id: String,
    record: Mutex<HedgeOpportunity>,
    driving: AtomicBool,
}

/// Held while a coordinator drives the opportunity.
pub struct DriveGuard<'a> {
    handle: &'a OpportunityHandle,
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.handle.driving.store(false, Ordering::Release);
    }
}

impl OpportunityHandle {
    pub fn new(opportunity: HedgeOpportunity) -> Self {
        Self {
            id: opportunity.id.clone(),
            record: Mutex::new(opportunity),
            driving: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> HedgeOpportunity {
        self.record.lock().clone()
    }

    pub fn state(&self) -> HedgeState {
        self.record.lock().state
    }

    pub fn signal(&self) -> Signal {
        self.record.lock().signal
    }

    pub fn set_signal(&self, signal: Signal) {
        self.update(|o| o.signal = signal);
    }

    /// Mutate the record in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut HedgeOpportunity) -> R) -> R {
        let mut record = self.record.lock();
        let result = f(&mut record);
        record.updated_at = Utc::now();
        result
    }

    /// Claim the driver role. `None` when another driver holds it.
    pub fn try_drive(&self) -> Option<DriveGuard<'_>> {
        self.driving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DriveGuard { handle: self })
    }

    pub fn is_driving(&self) -> bool {
        self.driving.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_parsing() {
        let pair: PairRef = "binance_futures#BTCUSDT".parse().unwrap();
        assert_eq!(pair.exchange, "binance_futures");
        assert_eq!(pair.symbol, "BTCUSDT");
        assert_eq!(pair.to_string(), "binance_futures#BTCUSDT");

        for bad in ["BTCUSDT", "#BTCUSDT", "ftx#", "a#b#c", "ftx.BTCUSD"] {
            assert!(bad.parse::<PairRef>().is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_open_amounts_follow_inverse() {
        let opp = HedgeOpportunity::new("1", "a#BTCUSDT", "b#BTCUSD", dec!(2)).unwrap();
        assert_eq!(opp.open_amounts(), (dec!(2), dec!(-2)));
        assert_eq!(opp.inverse().open_amounts(), (dec!(-2), dec!(2)));
    }

    #[test]
    fn test_close_amounts_use_filled() {
        let mut opp = HedgeOpportunity::new("1", "a#BTCUSDT", "b#BTCUSD", dec!(10)).unwrap();
        opp.long.filled_amount = dec!(7);
        opp.short.filled_amount = dec!(-7);
        assert_eq!(opp.close_amounts(), (dec!(-7), dec!(7)));
    }

    #[test]
    fn test_single_driver() {
        let handle = OpportunityHandle::new(
            HedgeOpportunity::new("1", "a#BTCUSDT", "b#BTCUSD", dec!(1)).unwrap(),
        );
        let guard = handle.try_drive();
        assert!(guard.is_some());
        assert!(handle.try_drive().is_none());
        drop(guard);
        assert!(!handle.is_driving());
        assert!(handle.try_drive().is_some());
    }
}
