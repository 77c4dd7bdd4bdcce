//! Market data: ticker client, price tracker and the source trait between them.

mod price_tracker;
mod ticker_client;
mod types;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

pub use price_tracker::PriceTracker;
pub use ticker_client::TickerClient;
pub use types::*;

/// Upstream provider of spot prices.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Price for one symbol.
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal>;

    /// Prices for many symbols in one request. May omit unknown symbols.
    async fn fetch_prices(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>>;
}
