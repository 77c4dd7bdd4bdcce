//! Closed-trade records produced by full and partial closes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Side;

/// Why (part of) a position was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    Manual,
    FomoIntensifyRisk,
    /// Pyramiding milestone, carrying its trigger percentage
    PyramidingTakeProfit(Decimal),
}

impl ExitReason {
    /// Label stored on full closes.
    pub fn label(&self) -> String {
        match self {
            ExitReason::TakeProfit => "TP".to_string(),
            ExitReason::StopLoss => "SL".to_string(),
            ExitReason::TrailingStop => "TRAILING_STOP".to_string(),
            ExitReason::Manual => "MANUAL".to_string(),
            ExitReason::FomoIntensifyRisk => "FOMO_INTENSIFY_RISK".to_string(),
            ExitReason::PyramidingTakeProfit(pct) => {
                format!("PYRAMIDING_TP_{}PCT", pct.normalize())
            }
        }
    }

    /// Label stored on partial closes, e.g. `PARTIAL_PYRAMIDING_TP_3PCT_50PCT`.
    pub fn partial_label(&self, close_ratio: Decimal) -> String {
        format!(
            "PARTIAL_{}_{}PCT",
            self.label(),
            (close_ratio * Decimal::ONE_HUNDRED).normalize()
        )
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Immutable record of one full or partial close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperTrade {
    pub id: String,
    pub trader_id: String,
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,

    /// Portion of the position closed by this trade
    pub quantity: Decimal,
    pub leverage: u32,
    pub realized_pnl: Decimal,
    pub fees: Decimal,

    /// Seconds between open and close
    pub duration_secs: i64,
    pub exit_reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl PaperTrade {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }

    pub fn is_partial(&self) -> bool {
        self.exit_reason.starts_with("PARTIAL_")
    }
}
