//! Simulated leveraged position with pyramiding levels and a trailing stop.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::pnl::PnlBreakdown;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// +1 for LONG, -1 for SHORT.
    pub fn direction(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Parse a side label (case-insensitive, accepts BUY/SELL aliases).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => Some(Side::Long),
            "SHORT" | "SELL" => Some(Side::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(PositionStatus::Open),
            "CLOSED" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// One partial take-profit milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidLevel {
    /// Profit percentage (e.g. 3 = +3%) at which this level fires
    pub trigger_pct: Decimal,

    /// Fraction of the live quantity to close; 1.0 closes what is left
    pub close_ratio: Decimal,

    /// Whether this level already fired
    #[serde(default)]
    pub executed: bool,
}

impl PyramidLevel {
    pub fn new(trigger_pct: Decimal, close_ratio: Decimal) -> Self {
        Self {
            trigger_pct,
            close_ratio,
            executed: false,
        }
    }

    /// A level that closes the whole remaining quantity.
    pub fn is_final(&self) -> bool {
        self.close_ratio >= Decimal::ONE
    }
}

/// Trailing stop state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingStop {
    pub enabled: bool,

    /// Pullback from the best price, in percent
    pub callback_pct: Decimal,

    /// Best price seen since entry: highest for LONG, lowest for SHORT
    pub highest_price_since_entry: Option<Decimal>,
}

impl TrailingStop {
    pub fn new(enabled: bool, callback_pct: Decimal) -> Self {
        Self {
            enabled,
            callback_pct,
            highest_price_since_entry: None,
        }
    }

    /// Move the extreme favourably; never backwards.
    pub fn observe(&mut self, side: Side, entry_price: Decimal, price: Decimal) {
        let current = self.highest_price_since_entry.unwrap_or(entry_price);
        let next = match side {
            Side::Long => current.max(price),
            Side::Short => current.min(price),
        };
        self.highest_price_since_entry = Some(next);
    }

    /// Price at which the trailing stop fires, if armed.
    pub fn trigger_price(&self, side: Side) -> Option<Decimal> {
        if !self.enabled {
            return None;
        }
        let extreme = self.highest_price_since_entry?;
        let callback = self.callback_pct / Decimal::ONE_HUNDRED;
        Some(match side {
            Side::Long => extreme * (Decimal::ONE - callback),
            Side::Short => extreme * (Decimal::ONE + callback),
        })
    }
}

/// One open or closed leveraged exposure held by a virtual trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedPosition {
    pub id: String,
    pub trader_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,

    /// Live quantity; reduced by partial closes, frozen once closed
    pub quantity: Decimal,

    /// Copied from the trader when opened
    pub leverage: u32,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub unrealized_pnl: Decimal,
    pub current_price: Decimal,
    pub last_updated: DateTime<Utc>,
    pub pyramid_levels: Vec<PyramidLevel>,
    pub trailing_stop: TrailingStop,
    pub closed_at: Option<DateTime<Utc>>,
}

impl SimulatedPosition {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Signed profit percentage of `price` relative to entry (positive = favourable).
    pub fn profit_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED * self.side.direction()
    }

    /// PnL of the full live quantity if exited at `price`.
    pub fn pnl_at(&self, price: Decimal, fee_rate: Decimal) -> PnlBreakdown {
        PnlBreakdown::compute(
            self.side,
            self.entry_price,
            price,
            self.quantity,
            self.leverage,
            fee_rate,
        )
    }

    /// Margin reserved by the live quantity.
    pub fn margin(&self) -> Decimal {
        self.entry_price * self.quantity / Decimal::from(self.leverage.max(1))
    }

    /// Whether the stop loss is hit at `price`.
    pub fn stop_loss_hit(&self, price: Decimal) -> bool {
        match self.side {
            Side::Long => price <= self.stop_loss,
            Side::Short => price >= self.stop_loss,
        }
    }

    /// Whether the primary take profit is hit at `price`.
    pub fn take_profit_hit(&self, price: Decimal) -> bool {
        match self.side {
            Side::Long => price >= self.take_profit,
            Side::Short => price <= self.take_profit,
        }
    }

    /// Whether the trailing stop is hit at `price`.
    pub fn trailing_stop_hit(&self, price: Decimal) -> bool {
        match self.trailing_stop.trigger_price(self.side) {
            Some(trigger) => match self.side {
                Side::Long => price <= trigger,
                Side::Short => price >= trigger,
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(side: Side) -> SimulatedPosition {
        SimulatedPosition {
            id: "p1".to_string(),
            trader_id: "t1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: dec!(50000),
            quantity: dec!(0.2),
            leverage: 10,
            take_profit: dec!(55000),
            stop_loss: dec!(47500),
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            unrealized_pnl: Decimal::ZERO,
            current_price: dec!(50000),
            last_updated: Utc::now(),
            pyramid_levels: vec![],
            trailing_stop: TrailingStop::new(true, dec!(1.5)),
            closed_at: None,
        }
    }

    #[test]
    fn test_profit_pct_is_directional() {
        let long = position(Side::Long);
        assert_eq!(long.profit_pct(dec!(51500)), dec!(3));

        let short = position(Side::Short);
        assert_eq!(short.profit_pct(dec!(51500)), dec!(-3));
        assert_eq!(short.profit_pct(dec!(48500)), dec!(3));
    }

    #[test]
    fn test_trailing_extreme_only_moves_favourably() {
        let mut stop = TrailingStop::new(true, dec!(1.5));
        stop.observe(Side::Long, dec!(100), dec!(105));
        stop.observe(Side::Long, dec!(100), dec!(102));
        assert_eq!(stop.highest_price_since_entry, Some(dec!(105)));

        let mut stop = TrailingStop::new(true, dec!(1.5));
        stop.observe(Side::Short, dec!(100), dec!(103));
        assert_eq!(stop.highest_price_since_entry, Some(dec!(100)));
        stop.observe(Side::Short, dec!(100), dec!(95));
        stop.observe(Side::Short, dec!(100), dec!(97));
        assert_eq!(stop.highest_price_since_entry, Some(dec!(95)));
    }

    #[test]
    fn test_trailing_trigger_price() {
        let mut pos = position(Side::Long);
        assert!(!pos.trailing_stop_hit(dec!(1)));

        pos.trailing_stop.observe(Side::Long, pos.entry_price, dec!(52000));
        assert_eq!(pos.trailing_stop.trigger_price(Side::Long), Some(dec!(51220.000)));
        assert!(pos.trailing_stop_hit(dec!(51220)));
        assert!(!pos.trailing_stop_hit(dec!(51221)));

        pos.trailing_stop.enabled = false;
        assert!(!pos.trailing_stop_hit(dec!(40000)));
    }

    #[test]
    fn test_stop_and_target_are_mirrored_for_short() {
        let mut pos = position(Side::Short);
        pos.take_profit = dec!(45000);
        pos.stop_loss = dec!(52500);

        assert!(pos.stop_loss_hit(dec!(52500)));
        assert!(!pos.stop_loss_hit(dec!(52499)));
        assert!(pos.take_profit_hit(dec!(45000)));
        assert!(!pos.take_profit_hit(dec!(45001)));
    }

    #[test]
    fn test_margin() {
        let pos = position(Side::Long);
        assert_eq!(pos.margin(), dec!(1000));
    }
}
