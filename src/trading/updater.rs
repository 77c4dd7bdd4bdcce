//! Periodic price updater: ticks the engine on a fixed interval until stopped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::SimResult;
use crate::models::PaperTrade;

use super::SimulationEngine;

/// Updater statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdaterStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub trades_closed: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

impl std::fmt::Display for UpdaterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Updater Statistics ===")?;
        writeln!(f, "Ticks:         {} (Failed: {})", self.ticks, self.failed_ticks)?;
        writeln!(f, "Trades Closed: {}", self.trades_closed)?;
        match self.last_tick_at {
            Some(at) => writeln!(f, "Last Tick:     {}", at.format("%Y-%m-%d %H:%M:%S"))?,
            None => writeln!(f, "Last Tick:     never")?,
        }
        writeln!(f, "Status:        {}", if self.is_running { "Running" } else { "Stopped" })?;
        Ok(())
    }
}

/// Drives `update_all_positions` on a schedule.
pub struct PriceUpdater {
    engine: Arc<SimulationEngine>,
    period: Duration,
    stats: RwLock<UpdaterStats>,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl PriceUpdater {
    pub fn new(engine: Arc<SimulationEngine>, period: Duration) -> Self {
        Self {
            engine,
            period,
            stats: RwLock::new(UpdaterStats::default()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled by [`Self::stop`]; clone it to tie other tasks to the updater.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the loop on its own task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let updater = Arc::clone(self);
        tokio::spawn(async move { updater.run().await })
    }

    /// Main run loop. A tick in flight always completes; cancellation only
    /// prevents the next one from being scheduled.
    pub async fn run(&self) {
        info!(interval_secs = self.period.as_secs_f64(), "Starting price updater");
        self.running.store(true, Ordering::SeqCst);

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "Price update tick failed");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Price updater stopped");
    }

    /// One update pass, recorded in the stats.
    pub async fn tick(&self) -> SimResult<HashMap<String, Vec<PaperTrade>>> {
        debug!("Updater tick");
        let result = self.engine.update_all_positions().await;

        let mut stats = self.stats.write().await;
        stats.ticks += 1;
        stats.last_tick_at = Some(Utc::now());
        match &result {
            Ok(closed) => {
                stats.trades_closed += closed.values().map(|t| t.len() as u64).sum::<u64>();
            }
            Err(_) => stats.failed_ticks += 1,
        }

        result
    }

    /// Stop scheduling ticks.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Stopping price updater");
            self.shutdown.cancel();
        }
    }

    pub async fn stats(&self) -> UpdaterStats {
        let mut stats = self.stats.read().await.clone();
        stats.is_running = self.running.load(Ordering::SeqCst);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeMarket;
    use crate::api::PriceTracker;
    use crate::config::{PositionConfig, PricingConfig, RiskConfig};
    use crate::db::Database;
    use crate::models::{NewTrader, Side};
    use crate::trading::PositionManager;
    use rust_decimal_macros::dec;

    async fn engine() -> (Database, Arc<FakeMarket>, Arc<SimulationEngine>) {
        let db = Database::in_memory().await.unwrap();
        let market = Arc::new(FakeMarket::new());
        let tracker = Arc::new(PriceTracker::new(market.clone(), PricingConfig::default()));
        let manager = Arc::new(PositionManager::new(
            db.traders(),
            db.positions(),
            PositionConfig::default(),
        ));
        let engine = Arc::new(SimulationEngine::new(
            db.traders(),
            manager,
            tracker,
            RiskConfig::default(),
        ));
        (db, market, engine)
    }

    #[tokio::test]
    async fn test_manual_tick_records_stats() {
        let (db, market, engine) = engine().await;
        let trader = db.traders().create(NewTrader::new("alpha", dec!(10000))).await.unwrap();
        engine
            .position_manager()
            .open_position(&trader, "BTCUSDT", Side::Long, dec!(100), dec!(1), None, None)
            .await
            .unwrap();
        market.set_price("BTCUSDT", dec!(120));

        let updater = PriceUpdater::new(engine, Duration::from_secs(10));
        let closed = updater.tick().await.unwrap();
        assert_eq!(closed["BTCUSDT"][0].exit_reason, "TP");

        let stats = updater.stats().await;
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.trades_closed, 1);
        assert!(stats.last_tick_at.is_some());
        assert!(!stats.is_running);
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let (_db, _market, engine) = engine().await;
        let updater = Arc::new(PriceUpdater::new(engine, Duration::from_millis(10)));

        let handle = updater.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updater.stats().await.is_running);

        updater.stop();
        handle.await.unwrap();

        let stats = updater.stats().await;
        assert!(stats.ticks >= 1);
        assert!(!stats.is_running);
    }
}
