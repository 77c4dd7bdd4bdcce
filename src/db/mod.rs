//! SQLite persistence for traders, positions and closed trades.
//!
//! Money values are stored as decimal TEXT so balances and PnL round-trip
//! exactly; nested values (pyramiding levels, indicator weights) are JSON
//! columns mapped to domain types at this boundary only.

mod positions;
mod traders;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::{SimError, SimResult};

pub use positions::PositionStore;
pub use traders::TraderRepository;

/// Upper bound for waiting on a connection or a locked database.
const STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect and run migrations. Failure here is fatal for the process.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .busy_timeout(STORE_TIMEOUT)
            .foreign_keys(true);

        // Each in-memory connection is its own database, so keep exactly one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(STORE_TIMEOUT)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Fresh in-memory database (tests and dry runs).
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traders (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                initial_balance TEXT NOT NULL,
                current_balance TEXT NOT NULL,
                leverage INTEGER NOT NULL DEFAULT 1 CHECK (leverage >= 1),
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                confidence_threshold REAL NOT NULL,
                buy_threshold REAL NOT NULL,
                sell_threshold REAL NOT NULL,
                max_position_pct TEXT NOT NULL,
                stop_loss_pct TEXT NOT NULL,
                take_profit_pct TEXT NOT NULL,
                fee_rate TEXT NOT NULL,
                indicator_weights TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                trader_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                take_profit TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                unrealized_pnl TEXT NOT NULL DEFAULT '0',
                current_price TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                pyramid_levels TEXT NOT NULL DEFAULT '[]',
                trailing_enabled INTEGER NOT NULL DEFAULT 1,
                trailing_callback_pct TEXT NOT NULL,
                highest_price_since_entry TEXT,
                closed_at TEXT,
                FOREIGN KEY (trader_id) REFERENCES traders(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_trades (
                id TEXT PRIMARY KEY,
                trader_id TEXT NOT NULL,
                position_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                realized_pnl TEXT NOT NULL,
                fees TEXT NOT NULL,
                duration_secs INTEGER NOT NULL,
                exit_reason TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                FOREIGN KEY (trader_id) REFERENCES traders(id),
                FOREIGN KEY (position_id) REFERENCES positions(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_trader_status ON positions(trader_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_symbol_status ON positions(symbol, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_trader_closed ON paper_trades(trader_id, closed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_position ON paper_trades(position_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Trader repository over this pool.
    pub fn traders(&self) -> TraderRepository {
        TraderRepository::new(self.pool.clone())
    }

    /// Position store over this pool.
    pub fn positions(&self) -> PositionStore {
        PositionStore::new(self.pool.clone())
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn parse_decimal(field: &str, value: &str) -> SimResult<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| SimError::Corrupt(format!("{} = {:?}: {}", field, value, e)))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(field: &str, value: &str) -> SimResult<T> {
    serde_json::from_str(value).map_err(|e| SimError::Corrupt(format!("{}: {}", field, e)))
}

pub(crate) fn to_json<T: serde::Serialize>(field: &str, value: &T) -> SimResult<String> {
    serde_json::to_string(value).map_err(|e| SimError::Corrupt(format!("{}: {}", field, e)))
}

pub(crate) fn leverage_from_db(value: i64) -> SimResult<u32> {
    u32::try_from(value)
        .ok()
        .filter(|l| *l >= 1)
        .ok_or_else(|| SimError::Corrupt(format!("leverage = {}", value)))
}
