//! Decimal arithmetic utilities for position and fee calculations.

use crate::exchange::PositionSide;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Unrealized profit of a position in percent, marked against the side of
/// the book it would close into.
///
/// Long: `(bid / entry - 1) * 100`. Short: `(entry / ask - 1) * 100`.
/// `None` when the reference price is zero.
pub fn profit_percent(
    side: PositionSide,
    entry: Decimal,
    bid: Decimal,
    ask: Decimal,
) -> Option<Decimal> {
    let ratio = match side {
        PositionSide::Long if entry > Decimal::ZERO => bid / entry,
        PositionSide::Short if ask > Decimal::ZERO => entry / ask,
        _ => return None,
    };
    Some(((ratio - Decimal::ONE) * dec!(100)).round_dp(4))
}

/// Fee paid on a notional at a percent rate (0.04 means 0.04%).
pub fn fee_for(notional: Decimal, fee_percent: Decimal) -> Decimal {
    notional.abs() * fee_percent / dec!(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profit_percent_long_uses_bid() {
        let p = profit_percent(PositionSide::Long, dec!(100), dec!(105), dec!(106));
        assert_eq!(p, Some(dec!(5)));
    }

    #[test]
    fn test_profit_percent_short_uses_ask() {
        let p = profit_percent(PositionSide::Short, dec!(100), dec!(79), dec!(80));
        assert_eq!(p, Some(dec!(25)));
    }

    #[test]
    fn test_profit_percent_zero_reference() {
        assert_eq!(
            profit_percent(PositionSide::Long, Decimal::ZERO, dec!(1), dec!(1)),
            None
        );
        assert_eq!(
            profit_percent(PositionSide::Short, dec!(1), dec!(1), Decimal::ZERO),
            None
        );
    }

    #[test]
    fn test_fee_for() {
        assert_eq!(fee_for(dec!(-10000), dec!(0.04)), dec!(4));
    }
}
