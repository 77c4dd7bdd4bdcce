//! Multi-trader paper-trading engine.
//!
//! Virtual traders react to pushed signals by opening simulated leveraged
//! positions. A periodic updater marks them to market, fires pyramiding,
//! trailing, stop-loss and take-profit exits, and records closed trades for
//! metrics and rankings.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod server;
pub mod trading;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::{MarketDataSource, PriceTracker, TickerClient};
use crate::config::SimulatorConfig;
use crate::db::Database;
use crate::trading::{PositionManager, PriceUpdater, SimulationEngine};

/// Everything a running simulator needs, wired together once at start-up.
pub struct AppContext {
    pub config: SimulatorConfig,
    pub db: Database,
    pub engine: Arc<SimulationEngine>,
    pub updater: Arc<PriceUpdater>,
}

impl AppContext {
    /// Open the store and build the engine against the live ticker endpoints.
    pub async fn new(config: SimulatorConfig) -> Result<Self> {
        let client = TickerClient::new(&config.pricing).context("Failed to create ticker client")?;
        Self::with_source(config, Arc::new(client)).await
    }

    /// Same as [`Self::new`] with an arbitrary market data source.
    pub async fn with_source(
        config: SimulatorConfig,
        source: Arc<dyn MarketDataSource>,
    ) -> Result<Self> {
        let db = Database::new(&config.database_url)
            .await
            .with_context(|| format!("Failed to open database {}", config.database_url))?;

        let tracker = Arc::new(PriceTracker::new(source, config.pricing.clone()));
        let manager = Arc::new(PositionManager::new(
            db.traders(),
            db.positions(),
            config.position.clone(),
        ));
        let engine = Arc::new(SimulationEngine::new(
            db.traders(),
            manager,
            tracker,
            config.risk.clone(),
        ));
        let updater = Arc::new(PriceUpdater::new(
            Arc::clone(&engine),
            config.update_interval(),
        ));

        Ok(Self {
            config,
            db,
            engine,
            updater,
        })
    }
}
