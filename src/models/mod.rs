//! Data models for traders, positions, trades, signals and metrics.

mod metrics;
mod pnl;
mod position;
mod signal;
mod trade;
mod trader;

pub use metrics::{Ranking, TimeRange, TraderMetrics};
pub use pnl::PnlBreakdown;
pub use position::{PositionStatus, PyramidLevel, SimulatedPosition, Side, TrailingStop};
pub use signal::{normalize_symbol, Signal, QUOTE_ASSET};
pub use trade::{ExitReason, PaperTrade};
pub use trader::{DecisionParams, NewTrader, RiskParams, TraderUpdate, VirtualTrader};
