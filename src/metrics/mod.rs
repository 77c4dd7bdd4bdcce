//! Performance metrics and rankings over closed trades.

mod calculator;

pub use calculator::MetricsCalculator;
