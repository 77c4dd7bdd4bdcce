//! HTTP client for the public spot ticker endpoint, with ordered endpoint fallback.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config::PricingConfig;

use super::types::TickerPrice;
use super::MarketDataSource;

const TICKER_PATH: &str = "/api/v3/ticker/price";

/// Client for the ticker price endpoint (read-only).
pub struct TickerClient {
    client: Client,
    endpoints: Vec<String>,
}

impl TickerClient {
    /// Create a client over the configured endpoints.
    pub fn new(config: &PricingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        if config.endpoints.is_empty() {
            anyhow::bail!("No price endpoints configured");
        }

        Ok(Self {
            client,
            endpoints: config.endpoints.clone(),
        })
    }

    /// Create with a single custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let config = PricingConfig {
            endpoints: vec![base_url],
            ..Default::default()
        };
        Self::new(&config)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        base_url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", base_url, TICKER_PATH);
        debug!(url = %url, "Fetching ticker");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .context("Failed to fetch ticker")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ticker request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse ticker response")
    }

    /// Try each endpoint in order; the first success wins.
    async fn first_success<T: serde::de::DeserializeOwned>(
        &self,
        query: &[(&str, String)],
    ) -> Result<T> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            match self.get_json(endpoint, query).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Ticker endpoint failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("No price endpoints configured")))
    }
}

fn parse_price(ticker: &TickerPrice) -> Result<Decimal> {
    Decimal::from_str(&ticker.price)
        .with_context(|| format!("Invalid price for {}: {}", ticker.symbol, ticker.price))
}

#[async_trait]
impl MarketDataSource for TickerClient {
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal> {
        let ticker: TickerPrice = self
            .first_success(&[("symbol", symbol.to_string())])
            .await?;
        parse_price(&ticker)
    }

    async fn fetch_prices(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>> {
        let list = serde_json::to_string(symbols).context("Failed to encode symbol list")?;
        let tickers: Vec<TickerPrice> = self.first_success(&[("symbols", list)]).await?;

        let mut prices = HashMap::with_capacity(tickers.len());
        for ticker in &tickers {
            match parse_price(ticker) {
                Ok(price) => {
                    prices.insert(ticker.symbol.clone(), price);
                }
                Err(e) => warn!(error = %e, "Skipping unparseable ticker"),
            }
        }

        Ok(prices)
    }
}
