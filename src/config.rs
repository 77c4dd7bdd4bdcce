//! Simulator configuration: defaults, overridden by environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::PyramidLevel;

/// Market data client and cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Ticker endpoints tried in order
    pub endpoints: Vec<String>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Attempts per lookup before falling back to the cache
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Age after which cached prices are reported as stale
    pub stale_after_secs: u64,
}

impl PricingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Bound for one lookup across every endpoint, each allowed its own
    /// request timeout, plus one second of slack.
    pub fn call_timeout(&self) -> Duration {
        let endpoints = self.endpoints.len().max(1) as u32;
        self.request_timeout() * endpoints + Duration::from_secs(1)
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "https://api.binance.com".to_string(),
                "https://api1.binance.com".to_string(),
                "https://api2.binance.com".to_string(),
            ],
            request_timeout_secs: 5,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2000,
            stale_after_secs: 60,
        }
    }
}

/// Default exit policy applied to newly opened positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    /// Partial take-profit milestones, in declaration order
    pub pyramid_levels: Vec<PyramidLevel>,

    pub trailing_stop_enabled: bool,

    /// Trailing pullback in percent
    pub trailing_callback_pct: Decimal,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            pyramid_levels: vec![
                PyramidLevel::new(dec!(3), dec!(0.5)),
                PyramidLevel::new(dec!(5), dec!(0.5)),
                PyramidLevel::new(dec!(8), dec!(1.0)),
            ],
            trailing_stop_enabled: true,
            trailing_callback_pct: dec!(1.5),
        }
    }
}

/// Out-of-band risk event handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of each profitable position closed on a risk signal
    pub risk_close_ratio: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_close_ratio: dec!(0.5),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,

    /// Seconds between scheduled ticks
    pub update_interval_secs: u64,
    pub pricing: PricingConfig,
    pub position: PositionConfig,
    pub risk: RiskConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./papertrader.db?mode=rwc".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            update_interval_secs: 10,
            pricing: PricingConfig::default(),
            position: PositionConfig::default(),
            risk: RiskConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Defaults overridden by `PAPER_*` environment variables (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PAPER_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(addr) = std::env::var("PAPER_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .with_context(|| format!("Invalid PAPER_BIND_ADDR: {}", addr))?;
        }
        if let Some(secs) = env_u64("PAPER_UPDATE_INTERVAL_SECS")? {
            config.update_interval_secs = secs;
        }
        if let Ok(endpoints) = std::env::var("PAPER_PRICE_ENDPOINTS") {
            let parsed: Vec<String> = endpoints
                .split(',')
                .map(|e| e.trim().trim_end_matches('/').to_string())
                .filter(|e| !e.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.pricing.endpoints = parsed;
            }
        }
        if let Some(secs) = env_u64("PAPER_PRICE_TIMEOUT_SECS")? {
            config.pricing.request_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("PAPER_PRICE_STALE_SECS")? {
            config.pricing.stale_after_secs = secs;
        }

        Ok(config)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid {}: {}", key, value)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let config = SimulatorConfig::default();
        assert_eq!(config.update_interval(), Duration::from_secs(10));
        assert_eq!(config.position.pyramid_levels.len(), 3);
        assert!(config.position.pyramid_levels[2].is_final());
        assert_eq!(config.pricing.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.pricing.call_timeout(), Duration::from_secs(16));
    }
}
