//! Per-trader performance metrics, rankings and time-range filters.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Performance statistics over a set of closed trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderMetrics {
    // === Basic Statistics ===
    /// Number of closed-trade records (partials included)
    pub total_trades: u32,

    /// Sum of realized PnL
    pub total_pnl: Decimal,

    /// Sum of fees paid
    pub total_fees: Decimal,

    // === Win/Loss Metrics ===
    /// Trades with realized PnL > 0
    pub winning_trades: u32,

    /// Trades with realized PnL <= 0
    pub losing_trades: u32,

    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    /// Average profit on winning trades
    pub avg_win: Decimal,

    /// Average loss on losing trades (absolute value)
    pub avg_loss: Decimal,

    pub largest_win: Decimal,
    pub largest_loss: Decimal,

    /// Gross profit / gross loss; infinite when there are wins and no losses
    pub profit_factor: f64,

    /// Average PnL per trade
    pub expectancy: Decimal,

    // === Risk Metrics ===
    /// Largest peak-to-trough fall of the realized equity curve
    pub max_drawdown: Decimal,

    /// Per-trade Sharpe ratio (mean / std-dev of realized PnL)
    pub sharpe_ratio: f64,

    // === Time-Based Metrics ===
    /// Average holding time in seconds
    pub avg_duration_secs: f64,
}

impl TraderMetrics {
    /// Zeroed metrics for an empty trade history.
    pub fn empty() -> Self {
        Self {
            total_trades: 0,
            total_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            largest_win: Decimal::ZERO,
            largest_loss: Decimal::ZERO,
            profit_factor: 0.0,
            expectancy: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            sharpe_ratio: 0.0,
            avg_duration_secs: 0.0,
        }
    }
}

impl Default for TraderMetrics {
    fn default() -> Self {
        Self::empty()
    }
}

/// One entry of the cross-trader leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ranking {
    /// 1-based position after sorting by total PnL
    pub rank: u32,
    pub trader_id: String,
    pub trader_name: String,
    pub current_balance: Decimal,
    pub return_pct: Decimal,
    pub metrics: TraderMetrics,
}

/// Look-back window for trade queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[default]
    #[serde(rename = "all")]
    All,
}

impl TimeRange {
    /// Parse a range label; unknown labels fall back to `All` with a warning.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "24h" => TimeRange::Day,
            "7d" => TimeRange::Week,
            "30d" => TimeRange::Month,
            "all" | "" => TimeRange::All,
            other => {
                warn!(range = %other, "Unrecognized time range, using all");
                TimeRange::All
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Day => "24h",
            TimeRange::Week => "7d",
            TimeRange::Month => "30d",
            TimeRange::All => "all",
        }
    }

    /// Inclusive lower bound on close time, `None` for `All`.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TimeRange::Day => Some(now - Duration::hours(24)),
            TimeRange::Week => Some(now - Duration::days(7)),
            TimeRange::Month => Some(now - Duration::days(30)),
            TimeRange::All => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(TimeRange::parse("24h"), TimeRange::Day);
        assert_eq!(TimeRange::parse("7D"), TimeRange::Week);
        assert_eq!(TimeRange::parse("30d"), TimeRange::Month);
        assert_eq!(TimeRange::parse("all"), TimeRange::All);
        assert_eq!(TimeRange::parse("90d"), TimeRange::All);
    }

    #[test]
    fn test_since() {
        let now = Utc::now();
        assert_eq!(TimeRange::Day.since(now), Some(now - Duration::hours(24)));
        assert_eq!(TimeRange::All.since(now), None);
    }
}
