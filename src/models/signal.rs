//! Inbound trading signals and symbol normalisation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Side;

/// Quote asset appended to bare base-asset symbols.
pub const QUOTE_ASSET: &str = "USDT";

/// Ephemeral trading signal pushed by an upstream aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,

    /// Aggregator confidence (0.0 to 1.0)
    pub confidence: f64,

    /// Indicator name -> score (0.0 to 1.0)
    #[serde(default)]
    pub indicator_scores: HashMap<String, f64>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(symbol: &str, side: Side, price: Decimal, confidence: f64) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            side,
            price,
            confidence,
            indicator_scores: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_score(mut self, indicator: &str, score: f64) -> Self {
        self.indicator_scores.insert(indicator.to_string(), score);
        self
    }
}

/// Upper-case a symbol and append the quote asset to bare base assets (`btc` -> `BTCUSDT`).
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    if upper.ends_with(QUOTE_ASSET) {
        upper
    } else {
        format!("{}{}", upper, QUOTE_ASSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("BTC"), "BTCUSDT");
        assert_eq!(normalize_symbol(" eth "), "ETHUSDT");
        assert_eq!(normalize_symbol("BTCUSDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("solusdt"), "SOLUSDT");
    }
}
