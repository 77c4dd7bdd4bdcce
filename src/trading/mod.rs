//! Trading logic: position lifecycle, simulation engine, periodic updater.

mod engine;
mod position_manager;
mod updater;

pub use engine::{SimulationEngine, TraderSummary};
pub use position_manager::{PositionManager, PriceUpdate, PyramidHit, TraderLocks};
pub use updater::{PriceUpdater, UpdaterStats};
