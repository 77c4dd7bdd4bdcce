//! Wire types for the ticker endpoint and price quotes handed to callers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// `/api/v3/ticker/price` entry. Prices arrive as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: String,
}

/// Last known price for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: Decimal,

    /// When the price was fetched from upstream
    pub fetched_at: DateTime<Utc>,

    /// Older than the configured TTL (still usable)
    pub stale: bool,
}
