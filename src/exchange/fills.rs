//! Partial-fill aggregation per order id.
//!
//! Trade reports may arrive from the private stream and from the REST trade
//! history for the same order. Reports are folded by trade id so redelivery
//! never double counts.

use crate::exchange::types::{OrderSide, Trade};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Folded fill state for one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillAggregate {
    pub order_id: String,
    pub symbol: String,
    /// Direction of the net amount (side of the last trade when fully netted)
    pub side: OrderSide,
    /// Quantity-weighted average price. `None` when `net_amount` is zero.
    pub average_price: Option<Decimal>,
    /// Signed sum of trade quantities (buys positive)
    pub net_amount: Decimal,
    pub trade_count: usize,
}

#[derive(Debug, Default)]
struct Accumulator {
    symbol: String,
    last_side: Option<OrderSide>,
    /// Σ price × signed qty
    notional: Decimal,
    net: Decimal,
    seen: HashSet<String>,
}

/// Deduplicating fill aggregator.
#[derive(Debug, Default)]
pub struct OrderFillTracker {
    orders: Mutex<HashMap<String, Accumulator>>,
}

impl OrderFillTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a trade into its order's aggregate.
    ///
    /// Returns false when this trade id was already recorded for the order.
    pub fn record_trade(&self, trade: &Trade) -> bool {
        let mut orders = self.orders.lock();
        let acc = orders.entry(trade.order_id.clone()).or_default();

        if !acc.seen.insert(trade.trade_id.clone()) {
            debug!(
                order_id = %trade.order_id,
                trade_id = %trade.trade_id,
                "Duplicate trade report ignored"
            );
            return false;
        }

        let signed_qty = trade.side.signed(trade.qty);
        acc.symbol = trade.symbol.clone();
        acc.last_side = Some(trade.side);
        acc.notional += trade.price * signed_qty;
        acc.net += signed_qty;
        true
    }

    /// Current aggregate for an order, if any trade was recorded.
    pub fn get_aggregate(&self, order_id: &str) -> Option<FillAggregate> {
        let orders = self.orders.lock();
        let acc = orders.get(order_id)?;
        let last_side = acc.last_side?;

        let (side, average_price) = if acc.net == Decimal::ZERO {
            (last_side, None)
        } else {
            (OrderSide::from_amount(acc.net), Some(acc.notional / acc.net))
        };

        Some(FillAggregate {
            order_id: order_id.to_string(),
            symbol: acc.symbol.clone(),
            side,
            average_price,
            net_amount: acc.net,
            trade_count: acc.seen.len(),
        })
    }

    /// Forget an order once it is fully reconciled.
    pub fn remove(&self, order_id: &str) {
        self.orders.lock().remove(order_id);
    }

    pub fn len(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(trade_id: &str, side: OrderSide, price: Decimal, qty: Decimal) -> Trade {
        Trade {
            trade_id: trade_id.to_string(),
            order_id: "42".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            price,
            qty,
        }
    }

    #[test]
    fn test_unknown_order_has_no_aggregate() {
        let tracker = OrderFillTracker::new();
        assert!(tracker.get_aggregate("42").is_none());
    }

    #[test]
    fn test_weighted_average_of_partial_fills() {
        let tracker = OrderFillTracker::new();
        tracker.record_trade(&trade("1", OrderSide::Buy, dec!(100), dec!(1)));
        tracker.record_trade(&trade("2", OrderSide::Buy, dec!(103), dec!(2)));

        let agg = tracker.get_aggregate("42").unwrap();
        assert_eq!(agg.net_amount, dec!(3));
        assert_eq!(agg.average_price, Some(dec!(102)));
        assert_eq!(agg.side, OrderSide::Buy);
        assert_eq!(agg.trade_count, 2);
    }

    #[test]
    fn test_sell_fills_are_negative() {
        let tracker = OrderFillTracker::new();
        tracker.record_trade(&trade("1", OrderSide::Sell, dec!(200), dec!(0.5)));
        tracker.record_trade(&trade("2", OrderSide::Sell, dec!(210), dec!(0.5)));

        let agg = tracker.get_aggregate("42").unwrap();
        assert_eq!(agg.net_amount, dec!(-1));
        assert_eq!(agg.average_price, Some(dec!(205)));
        assert_eq!(agg.side, OrderSide::Sell);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let tracker = OrderFillTracker::new();
        let t = trade("7", OrderSide::Buy, dec!(100), dec!(1));

        assert!(tracker.record_trade(&t));
        let once = tracker.get_aggregate("42").unwrap();
        assert!(!tracker.record_trade(&t));
        let twice = tracker.get_aggregate("42").unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.net_amount, dec!(1));
    }

    #[test]
    fn test_fully_netted_trades_do_not_divide_by_zero() {
        let tracker = OrderFillTracker::new();
        tracker.record_trade(&trade("1", OrderSide::Buy, dec!(100), dec!(1)));
        tracker.record_trade(&trade("2", OrderSide::Sell, dec!(110), dec!(1)));

        let agg = tracker.get_aggregate("42").unwrap();
        assert_eq!(agg.net_amount, Decimal::ZERO);
        assert_eq!(agg.average_price, None);
        assert_eq!(agg.side, OrderSide::Sell);
    }

    #[test]
    fn test_remove_forgets_order() {
        let tracker = OrderFillTracker::new();
        tracker.record_trade(&trade("1", OrderSide::Buy, dec!(100), dec!(1)));
        assert_eq!(tracker.len(), 1);
        tracker.remove("42");
        assert!(tracker.is_empty());
    }
}
