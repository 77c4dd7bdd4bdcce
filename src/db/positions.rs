//! Position store: positions, closed trades, and the close transaction that
//! credits a trader's balance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{SimError, SimResult};
use crate::models::{PaperTrade, PositionStatus, PyramidLevel, SimulatedPosition, Side, TrailingStop};

use super::{leverage_from_db, parse_decimal, parse_json, to_json};

#[derive(Debug, Clone, sqlx::FromRow)]
struct PositionRow {
    id: String,
    trader_id: String,
    symbol: String,
    side: String,
    entry_price: String,
    quantity: String,
    leverage: i64,
    take_profit: String,
    stop_loss: String,
    opened_at: DateTime<Utc>,
    status: String,
    unrealized_pnl: String,
    current_price: String,
    last_updated: DateTime<Utc>,
    pyramid_levels: String,
    trailing_enabled: bool,
    trailing_callback_pct: String,
    highest_price_since_entry: Option<String>,
    closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PositionRow> for SimulatedPosition {
    type Error = SimError;

    fn try_from(row: PositionRow) -> SimResult<Self> {
        let side = Side::parse(&row.side)
            .ok_or_else(|| SimError::Corrupt(format!("position {} side = {}", row.id, row.side)))?;
        let status = PositionStatus::parse(&row.status).ok_or_else(|| {
            SimError::Corrupt(format!("position {} status = {}", row.id, row.status))
        })?;
        let pyramid_levels: Vec<PyramidLevel> = parse_json("pyramid_levels", &row.pyramid_levels)?;
        let highest = row
            .highest_price_since_entry
            .as_deref()
            .map(|v| parse_decimal("highest_price_since_entry", v))
            .transpose()?;

        Ok(Self {
            side,
            status,
            entry_price: parse_decimal("entry_price", &row.entry_price)?,
            quantity: parse_decimal("quantity", &row.quantity)?,
            leverage: leverage_from_db(row.leverage)?,
            take_profit: parse_decimal("take_profit", &row.take_profit)?,
            stop_loss: parse_decimal("stop_loss", &row.stop_loss)?,
            opened_at: row.opened_at,
            unrealized_pnl: parse_decimal("unrealized_pnl", &row.unrealized_pnl)?,
            current_price: parse_decimal("current_price", &row.current_price)?,
            last_updated: row.last_updated,
            pyramid_levels,
            trailing_stop: TrailingStop {
                enabled: row.trailing_enabled,
                callback_pct: parse_decimal("trailing_callback_pct", &row.trailing_callback_pct)?,
                highest_price_since_entry: highest,
            },
            closed_at: row.closed_at,
            id: row.id,
            trader_id: row.trader_id,
            symbol: row.symbol,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeRow {
    id: String,
    trader_id: String,
    position_id: String,
    symbol: String,
    side: String,
    entry_price: String,
    exit_price: String,
    quantity: String,
    leverage: i64,
    realized_pnl: String,
    fees: String,
    duration_secs: i64,
    exit_reason: String,
    opened_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
}

impl TryFrom<TradeRow> for PaperTrade {
    type Error = SimError;

    fn try_from(row: TradeRow) -> SimResult<Self> {
        let side = Side::parse(&row.side)
            .ok_or_else(|| SimError::Corrupt(format!("trade {} side = {}", row.id, row.side)))?;

        Ok(Self {
            side,
            entry_price: parse_decimal("entry_price", &row.entry_price)?,
            exit_price: parse_decimal("exit_price", &row.exit_price)?,
            quantity: parse_decimal("quantity", &row.quantity)?,
            leverage: leverage_from_db(row.leverage)?,
            realized_pnl: parse_decimal("realized_pnl", &row.realized_pnl)?,
            fees: parse_decimal("fees", &row.fees)?,
            duration_secs: row.duration_secs,
            exit_reason: row.exit_reason,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
            id: row.id,
            trader_id: row.trader_id,
            position_id: row.position_id,
            symbol: row.symbol,
        })
    }
}

fn collect_positions(rows: Vec<PositionRow>) -> SimResult<Vec<SimulatedPosition>> {
    rows.into_iter().map(SimulatedPosition::try_from).collect()
}

fn collect_trades(rows: Vec<TradeRow>) -> SimResult<Vec<PaperTrade>> {
    rows.into_iter().map(PaperTrade::try_from).collect()
}

/// Storage for positions and their closed-trade records.
#[derive(Clone)]
pub struct PositionStore {
    pool: SqlitePool,
}

impl PositionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ==================== Positions ====================

    /// Insert a newly opened position.
    pub async fn insert(&self, position: &SimulatedPosition) -> SimResult<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, trader_id, symbol, side, entry_price, quantity, leverage,
                take_profit, stop_loss, opened_at, status, unrealized_pnl,
                current_price, last_updated, pyramid_levels, trailing_enabled,
                trailing_callback_pct, highest_price_since_entry, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.id)
        .bind(&position.trader_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.entry_price.to_string())
        .bind(position.quantity.to_string())
        .bind(i64::from(position.leverage))
        .bind(position.take_profit.to_string())
        .bind(position.stop_loss.to_string())
        .bind(position.opened_at)
        .bind(position.status.as_str())
        .bind(position.unrealized_pnl.to_string())
        .bind(position.current_price.to_string())
        .bind(position.last_updated)
        .bind(to_json("pyramid_levels", &position.pyramid_levels)?)
        .bind(position.trailing_stop.enabled)
        .bind(position.trailing_stop.callback_pct.to_string())
        .bind(position.trailing_stop.highest_price_since_entry.map(|p| p.to_string()))
        .bind(position.closed_at)
        .execute(&self.pool)
        .await?;

        debug!(position = %position.id, trader = %position.trader_id, "Inserted position");
        Ok(())
    }

    /// Persist the mutable state of a position (mark-to-market, levels, trailing extreme).
    ///
    /// Fails with [`SimError::PositionNotOpen`] when the stored row is no longer
    /// open at the same quantity.
    pub async fn save(&self, position: &SimulatedPosition) -> SimResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_position_state(&mut *conn, position, position.quantity).await
    }

    pub async fn get(&self, id: &str) -> SimResult<Option<SimulatedPosition>> {
        let row = sqlx::query_as::<_, PositionRow>("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SimulatedPosition::try_from).transpose()
    }

    pub async fn require(&self, id: &str) -> SimResult<SimulatedPosition> {
        self.get(id)
            .await?
            .ok_or_else(|| SimError::PositionNotFound(id.to_string()))
    }

    /// Open positions of one trader, oldest first.
    pub async fn open_by_trader(&self, trader_id: &str) -> SimResult<Vec<SimulatedPosition>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE trader_id = ? AND status = 'OPEN' ORDER BY opened_at, id",
        )
        .bind(trader_id)
        .fetch_all(&self.pool)
        .await?;

        collect_positions(rows)
    }

    /// Every position of one trader, open or closed, newest first.
    pub async fn all_by_trader(&self, trader_id: &str) -> SimResult<Vec<SimulatedPosition>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE trader_id = ? ORDER BY opened_at DESC, id",
        )
        .bind(trader_id)
        .fetch_all(&self.pool)
        .await?;

        collect_positions(rows)
    }

    /// Open positions on one symbol across all traders.
    pub async fn open_by_symbol(&self, symbol: &str) -> SimResult<Vec<SimulatedPosition>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE symbol = ? AND status = 'OPEN' ORDER BY opened_at, id",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        collect_positions(rows)
    }

    /// All open positions across all traders.
    pub async fn all_open(&self) -> SimResult<Vec<SimulatedPosition>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE status = 'OPEN' ORDER BY symbol, opened_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        collect_positions(rows)
    }

    // ==================== Close Transaction ====================

    /// Persist a (partial or full) close atomically: the position's new state,
    /// the trade record and the balance credit. Returns the new balance.
    ///
    /// `held` is the quantity the close was computed from. If the stored row is
    /// closed or holds a different quantity, another writer got there first:
    /// nothing is written and [`SimError::PositionNotOpen`] is returned.
    pub async fn commit_close(
        &self,
        position: &SimulatedPosition,
        held: Decimal,
        trade: &PaperTrade,
    ) -> SimResult<Decimal> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before the balance read.
        // An early return drops `tx`, which rolls it back.
        write_position_state(&mut *tx, position, held).await?;
        insert_trade(&mut *tx, trade).await?;

        let (balance,): (String,) =
            sqlx::query_as("SELECT current_balance FROM traders WHERE id = ?")
                .bind(&trade.trader_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| SimError::TraderNotFound(trade.trader_id.clone()))?;
        let new_balance = parse_decimal("current_balance", &balance)? + trade.realized_pnl;

        sqlx::query("UPDATE traders SET current_balance = ? WHERE id = ?")
            .bind(new_balance.to_string())
            .bind(&trade.trader_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            position = %position.id,
            trade = %trade.id,
            pnl = %trade.realized_pnl,
            balance = %new_balance,
            "Committed close"
        );
        Ok(new_balance)
    }

    // ==================== Trades ====================

    /// Closed trades of one trader ordered by close time.
    pub async fn trades_by_trader(&self, trader_id: &str) -> SimResult<Vec<PaperTrade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM paper_trades WHERE trader_id = ? ORDER BY closed_at, id",
        )
        .bind(trader_id)
        .fetch_all(&self.pool)
        .await?;

        collect_trades(rows)
    }

    /// Trades produced by one position (partials first, final close last).
    pub async fn trades_by_position(&self, position_id: &str) -> SimResult<Vec<PaperTrade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM paper_trades WHERE position_id = ? ORDER BY closed_at, id",
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        collect_trades(rows)
    }
}

/// Conditional update: only an OPEN row still at `held` quantity is written.
async fn write_position_state(
    conn: &mut sqlx::SqliteConnection,
    position: &SimulatedPosition,
    held: Decimal,
) -> SimResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE positions SET
            quantity = ?,
            status = ?,
            unrealized_pnl = ?,
            current_price = ?,
            last_updated = ?,
            pyramid_levels = ?,
            highest_price_since_entry = ?,
            closed_at = ?
        WHERE id = ? AND status = 'OPEN' AND quantity = ?
        "#,
    )
    .bind(position.quantity.to_string())
    .bind(position.status.as_str())
    .bind(position.unrealized_pnl.to_string())
    .bind(position.current_price.to_string())
    .bind(position.last_updated)
    .bind(to_json("pyramid_levels", &position.pyramid_levels)?)
    .bind(position.trailing_stop.highest_price_since_entry.map(|p| p.to_string()))
    .bind(position.closed_at)
    .bind(&position.id)
    .bind(held.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != 1 {
        debug!(position = %position.id, held = %held, "Stale position write rejected");
        return Err(SimError::PositionNotOpen(position.id.clone()));
    }
    Ok(())
}

async fn insert_trade(conn: &mut sqlx::SqliteConnection, trade: &PaperTrade) -> SimResult<()> {
    sqlx::query(
        r#"
        INSERT INTO paper_trades (
            id, trader_id, position_id, symbol, side, entry_price, exit_price,
            quantity, leverage, realized_pnl, fees, duration_secs, exit_reason,
            opened_at, closed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&trade.id)
    .bind(&trade.trader_id)
    .bind(&trade.position_id)
    .bind(&trade.symbol)
    .bind(trade.side.as_str())
    .bind(trade.entry_price.to_string())
    .bind(trade.exit_price.to_string())
    .bind(trade.quantity.to_string())
    .bind(i64::from(trade.leverage))
    .bind(trade.realized_pnl.to_string())
    .bind(trade.fees.to_string())
    .bind(trade.duration_secs)
    .bind(&trade.exit_reason)
    .bind(trade.opened_at)
    .bind(trade.closed_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
