//! Price tracker: retrying upstream lookups with a last-known-price cache.
//!
//! Lookups never block the simulation on network availability. When every
//! attempt fails the last cached price is returned, however old, and flagged
//! stale in the logs once it is past the configured TTL.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::PricingConfig;

use super::types::PriceQuote;
use super::MarketDataSource;

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: Decimal,
    fetched_at: DateTime<Utc>,
}

/// Cached, failure-tolerant price lookups.
pub struct PriceTracker {
    source: Arc<dyn MarketDataSource>,
    cache: RwLock<HashMap<String, CachedPrice>>,
    config: PricingConfig,
}

impl PriceTracker {
    pub fn new(source: Arc<dyn MarketDataSource>, config: PricingConfig) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Current price for `symbol`, falling back to the cache. `None` only when
    /// upstream failed and nothing was ever cached.
    pub async fn get_price(&self, symbol: &str) -> Option<Decimal> {
        match self.fetch_with_retry(symbol).await {
            Ok(price) => {
                self.store(symbol, price).await;
                Some(price)
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Price fetch failed, using cache");
                self.cached(symbol).await
            }
        }
    }

    /// Prices for many symbols: one bulk call, then per-symbol lookups for
    /// whatever the bulk call did not return. Missing symbols are omitted.
    pub async fn get_prices(&self, symbols: &[String]) -> HashMap<String, Decimal> {
        let unique: Vec<String> = {
            let mut seen = HashSet::new();
            symbols
                .iter()
                .filter(|s| seen.insert(s.as_str()))
                .cloned()
                .collect()
        };
        if unique.is_empty() {
            return HashMap::new();
        }

        let mut prices: HashMap<String, Decimal> = match self.with_timeout(self.source.fetch_prices(&unique)).await {
            Ok(bulk) => bulk
                .into_iter()
                .filter(|(symbol, _)| unique.contains(symbol))
                .collect(),
            Err(e) => {
                warn!(symbols = unique.len(), error = %e, "Bulk price fetch failed, falling back to single lookups");
                HashMap::new()
            }
        };

        let now = Utc::now();
        {
            let mut cache = self.cache.write().await;
            for (symbol, price) in &prices {
                cache.insert(
                    symbol.clone(),
                    CachedPrice {
                        price: *price,
                        fetched_at: now,
                    },
                );
            }
        }

        let missing: Vec<&String> = unique.iter().filter(|s| !prices.contains_key(*s)).collect();
        if !missing.is_empty() {
            let lookups = missing.iter().map(|symbol| async move {
                (symbol.to_string(), self.get_price(symbol).await)
            });
            for (symbol, price) in join_all(lookups).await {
                if let Some(price) = price {
                    prices.insert(symbol, price);
                }
            }
        }

        debug!(requested = unique.len(), resolved = prices.len(), "Resolved prices");
        prices
    }

    /// Last known price with its age, without touching upstream.
    pub async fn quote(&self, symbol: &str) -> Option<PriceQuote> {
        let cache = self.cache.read().await;
        cache.get(symbol).map(|entry| PriceQuote {
            symbol: symbol.to_string(),
            price: entry.price,
            fetched_at: entry.fetched_at,
            stale: self.is_stale(entry, Utc::now()),
        })
    }

    /// Fetch (falling back to the cache) and return the resulting quote.
    pub async fn refresh_quote(&self, symbol: &str) -> Option<PriceQuote> {
        self.get_price(symbol).await?;
        self.quote(symbol).await
    }

    async fn fetch_with_retry(&self, symbol: &str) -> Result<Decimal> {
        let max_attempts = self.config.max_retries.max(1);
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.config.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.with_timeout(self.source.fetch_price(symbol)).await {
                Ok(price) => {
                    if attempt > 1 {
                        info!(symbol = %symbol, attempts = attempt, "Price fetch recovered");
                    }
                    return Ok(price);
                }
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.config.max_backoff_ms));
                    debug!(
                        symbol = %symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying price fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn with_timeout<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.call_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("Price request timed out after {}s", limit.as_secs()),
        }
    }

    async fn store(&self, symbol: &str, price: Decimal) {
        self.cache.write().await.insert(
            symbol.to_string(),
            CachedPrice {
                price,
                fetched_at: Utc::now(),
            },
        );
    }

    async fn cached(&self, symbol: &str) -> Option<Decimal> {
        let cache = self.cache.read().await;
        let entry = cache.get(symbol)?;

        if self.is_stale(entry, Utc::now()) {
            warn!(
                symbol = %symbol,
                age_secs = (Utc::now() - entry.fetched_at).num_seconds(),
                "Serving stale cached price"
            );
        }
        Some(entry.price)
    }

    fn is_stale(&self, entry: &CachedPrice, now: DateTime<Utc>) -> bool {
        (now - entry.fetched_at).num_seconds() > self.config.stale_after_secs as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeMarket;
    use rust_decimal_macros::dec;

    fn fast_config() -> PricingConfig {
        PricingConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_price_caches_and_falls_back() {
        let market = Arc::new(FakeMarket::new());
        market.set_price("BTCUSDT", dec!(50000));
        let tracker = PriceTracker::new(market.clone(), fast_config());

        assert_eq!(tracker.get_price("BTCUSDT").await, Some(dec!(50000)));

        market.fail_symbol("BTCUSDT");
        assert_eq!(tracker.get_price("BTCUSDT").await, Some(dec!(50000)));
        assert_eq!(market.single_calls(), 1 + 3);

        assert_eq!(tracker.get_price("ETHUSDT").await, None);
    }

    #[tokio::test]
    async fn test_get_prices_prefers_bulk() {
        let market = Arc::new(FakeMarket::new());
        market.set_price("BTCUSDT", dec!(50000));
        market.set_price("ETHUSDT", dec!(3000));
        let tracker = PriceTracker::new(market.clone(), fast_config());

        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "BTCUSDT".to_string()];
        let prices = tracker.get_prices(&symbols).await;

        assert_eq!(prices.len(), 2);
        assert_eq!(market.bulk_calls(), 1);
        assert_eq!(market.single_calls(), 0);
        assert!(tracker.quote("ETHUSDT").await.is_some());
    }

    #[tokio::test]
    async fn test_get_prices_degrades_per_symbol() {
        let market = Arc::new(FakeMarket::new());
        market.set_price("BTCUSDT", dec!(50000));
        market.set_price("ETHUSDT", dec!(3000));
        market.fail_bulk(true);
        market.fail_symbol("ETHUSDT");
        let tracker = PriceTracker::new(market.clone(), fast_config());

        let prices = tracker
            .get_prices(&["BTCUSDT".to_string(), "ETHUSDT".to_string()])
            .await;

        assert_eq!(prices.get("BTCUSDT"), Some(&dec!(50000)));
        assert!(!prices.contains_key("ETHUSDT"));
    }

    /// Serves the ticker route; `hang` never answers.
    async fn spawn_ticker(hang: bool) -> String {
        use axum::{extract::Query, routing::get, Json, Router};

        async fn ticker(Query(q): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
            let symbol = q.get("symbol").cloned().unwrap_or_default();
            Json(serde_json::json!({"symbol": symbol, "price": "50123.5"}))
        }
        async fn stall() -> &'static str {
            std::future::pending::<()>().await;
            ""
        }

        let app = if hang {
            Router::new().route("/api/v3/ticker/price", get(stall))
        } else {
            Router::new().route("/api/v3/ticker/price", get(ticker))
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await });
        base
    }

    #[tokio::test]
    async fn test_hung_endpoint_falls_through_to_next() {
        let hung = spawn_ticker(true).await;
        let good = spawn_ticker(false).await;
        let config = PricingConfig {
            endpoints: vec![hung, good],
            request_timeout_secs: 1,
            max_retries: 1,
            ..fast_config()
        };
        let client = crate::api::TickerClient::new(&config).unwrap();
        let tracker = PriceTracker::new(Arc::new(client), config);

        assert_eq!(tracker.get_price("BTCUSDT").await, Some(dec!(50123.5)));
    }

    #[tokio::test]
    async fn test_quote_flags_stale_entries() {
        let market = Arc::new(FakeMarket::new());
        let tracker = PriceTracker::new(market, fast_config());

        tracker.cache.write().await.insert(
            "BTCUSDT".to_string(),
            CachedPrice {
                price: dec!(49000),
                fetched_at: Utc::now() - chrono::Duration::seconds(120),
            },
        );

        let quote = tracker.quote("BTCUSDT").await.unwrap();
        assert!(quote.stale);
        assert_eq!(tracker.get_price("BTCUSDT").await, Some(dec!(49000)));
    }
}
