//! Leveraged PnL and fee arithmetic shared by closes and mark-to-market updates.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Side;

/// Result of the PnL formula for one quantity at one execution price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlBreakdown {
    /// (exec - entry) * quantity * direction * leverage
    pub raw_pnl: Decimal,

    /// Entry and exit fees on un-levered notional
    pub fees: Decimal,

    /// raw_pnl - fees
    pub net_pnl: Decimal,
}

impl PnlBreakdown {
    /// Pure function of its inputs; identical inputs give identical output.
    pub fn compute(
        side: Side,
        entry_price: Decimal,
        exec_price: Decimal,
        quantity: Decimal,
        leverage: u32,
        fee_rate: Decimal,
    ) -> Self {
        let raw_pnl =
            (exec_price - entry_price) * quantity * side.direction() * Decimal::from(leverage);
        let fees = entry_price * quantity * fee_rate + exec_price * quantity * fee_rate;

        Self {
            raw_pnl,
            fees,
            net_pnl: raw_pnl - fees,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_long_pnl_with_fees() {
        let pnl = PnlBreakdown::compute(
            Side::Long,
            dec!(50000),
            dec!(51500),
            dec!(0.1),
            10,
            dec!(0.0004),
        );

        // 1500 * 0.1 * 10
        assert_eq!(pnl.raw_pnl, dec!(1500));
        // 5000 * 0.0004 + 5150 * 0.0004
        assert_eq!(pnl.fees, dec!(4.06));
        assert_eq!(pnl.net_pnl, dec!(1495.94));
    }

    #[test]
    fn test_short_pnl_is_mirrored() {
        let win = PnlBreakdown::compute(Side::Short, dec!(100), dec!(90), dec!(2), 5, Decimal::ZERO);
        assert_eq!(win.net_pnl, dec!(100));

        let loss = PnlBreakdown::compute(Side::Short, dec!(100), dec!(110), dec!(2), 5, Decimal::ZERO);
        assert_eq!(loss.net_pnl, dec!(-100));
    }

    #[test]
    fn test_flat_exit_costs_only_fees() {
        let pnl = PnlBreakdown::compute(Side::Long, dec!(200), dec!(200), dec!(3), 20, dec!(0.001));
        assert_eq!(pnl.raw_pnl, Decimal::ZERO);
        assert_eq!(pnl.net_pnl, dec!(-1.2));
    }
}
