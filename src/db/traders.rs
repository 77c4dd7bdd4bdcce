//! Trader repository: CRUD and listing for virtual traders.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{SimError, SimResult};
use crate::models::{DecisionParams, NewTrader, RiskParams, TraderUpdate, VirtualTrader};

use super::{leverage_from_db, parse_decimal, parse_json, to_json};

/// Stored trader row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct TraderRow {
    id: String,
    name: String,
    initial_balance: String,
    current_balance: String,
    leverage: i64,
    enabled: bool,
    created_at: DateTime<Utc>,
    confidence_threshold: f64,
    buy_threshold: f64,
    sell_threshold: f64,
    max_position_pct: String,
    stop_loss_pct: String,
    take_profit_pct: String,
    fee_rate: String,
    indicator_weights: String,
}

impl TryFrom<TraderRow> for VirtualTrader {
    type Error = SimError;

    fn try_from(row: TraderRow) -> SimResult<Self> {
        let indicator_weights: HashMap<String, f64> =
            parse_json("indicator_weights", &row.indicator_weights)?;

        Ok(Self {
            initial_balance: parse_decimal("initial_balance", &row.initial_balance)?,
            current_balance: parse_decimal("current_balance", &row.current_balance)?,
            leverage: leverage_from_db(row.leverage)?,
            enabled: row.enabled,
            created_at: row.created_at,
            decision: DecisionParams {
                confidence_threshold: row.confidence_threshold,
                buy_threshold: row.buy_threshold,
                sell_threshold: row.sell_threshold,
            },
            risk: RiskParams {
                max_position_pct: parse_decimal("max_position_pct", &row.max_position_pct)?,
                stop_loss_pct: parse_decimal("stop_loss_pct", &row.stop_loss_pct)?,
                take_profit_pct: parse_decimal("take_profit_pct", &row.take_profit_pct)?,
                fee_rate: parse_decimal("fee_rate", &row.fee_rate)?,
            },
            indicator_weights,
            id: row.id,
            name: row.name,
        })
    }
}

/// CRUD over the `traders` table. Owns trader row lifetimes.
#[derive(Clone)]
pub struct TraderRepository {
    pool: SqlitePool,
}

impl TraderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate and insert a new trader.
    pub async fn create(&self, new: NewTrader) -> SimResult<VirtualTrader> {
        let trader = VirtualTrader::from_new(new)?;
        self.insert(&trader).await?;

        info!(trader = %trader.id, name = %trader.name, balance = %trader.initial_balance, "Created trader");
        Ok(trader)
    }

    async fn insert(&self, trader: &VirtualTrader) -> SimResult<()> {
        sqlx::query(
            r#"
            INSERT INTO traders (
                id, name, initial_balance, current_balance, leverage, enabled, created_at,
                confidence_threshold, buy_threshold, sell_threshold,
                max_position_pct, stop_loss_pct, take_profit_pct, fee_rate, indicator_weights
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trader.id)
        .bind(&trader.name)
        .bind(trader.initial_balance.to_string())
        .bind(trader.current_balance.to_string())
        .bind(i64::from(trader.leverage))
        .bind(trader.enabled)
        .bind(trader.created_at)
        .bind(trader.decision.confidence_threshold)
        .bind(trader.decision.buy_threshold)
        .bind(trader.decision.sell_threshold)
        .bind(trader.risk.max_position_pct.to_string())
        .bind(trader.risk.stop_loss_pct.to_string())
        .bind(trader.risk.take_profit_pct.to_string())
        .bind(trader.risk.fee_rate.to_string())
        .bind(to_json("indicator_weights", &trader.indicator_weights)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a trader by id.
    pub async fn get(&self, id: &str) -> SimResult<Option<VirtualTrader>> {
        let row = sqlx::query_as::<_, TraderRow>("SELECT * FROM traders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(VirtualTrader::try_from).transpose()
    }

    /// Get a trader by id, failing when absent.
    pub async fn require(&self, id: &str) -> SimResult<VirtualTrader> {
        self.get(id)
            .await?
            .ok_or_else(|| SimError::TraderNotFound(id.to_string()))
    }

    /// List all traders in creation order.
    pub async fn list(&self) -> SimResult<Vec<VirtualTrader>> {
        let rows = sqlx::query_as::<_, TraderRow>("SELECT * FROM traders ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(VirtualTrader::try_from).collect()
    }

    /// List traders that take part in signal processing.
    pub async fn list_enabled(&self) -> SimResult<Vec<VirtualTrader>> {
        let rows = sqlx::query_as::<_, TraderRow>(
            "SELECT * FROM traders WHERE enabled = 1 ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(VirtualTrader::try_from).collect()
    }

    /// Update configuration. The balance columns are never written here.
    pub async fn update(&self, id: &str, update: TraderUpdate) -> SimResult<VirtualTrader> {
        let mut trader = self.require(id).await?;
        trader.apply(update)?;

        sqlx::query(
            r#"
            UPDATE traders SET
                name = ?,
                leverage = ?,
                enabled = ?,
                confidence_threshold = ?,
                buy_threshold = ?,
                sell_threshold = ?,
                max_position_pct = ?,
                stop_loss_pct = ?,
                take_profit_pct = ?,
                fee_rate = ?,
                indicator_weights = ?
            WHERE id = ?
            "#,
        )
        .bind(&trader.name)
        .bind(i64::from(trader.leverage))
        .bind(trader.enabled)
        .bind(trader.decision.confidence_threshold)
        .bind(trader.decision.buy_threshold)
        .bind(trader.decision.sell_threshold)
        .bind(trader.risk.max_position_pct.to_string())
        .bind(trader.risk.stop_loss_pct.to_string())
        .bind(trader.risk.take_profit_pct.to_string())
        .bind(trader.risk.fee_rate.to_string())
        .bind(to_json("indicator_weights", &trader.indicator_weights)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        info!(trader = %id, "Updated trader");
        Ok(trader)
    }

    /// Copy a trader's configuration under a new id with a fresh balance.
    pub async fn clone_trader(&self, id: &str, name: Option<String>) -> SimResult<VirtualTrader> {
        let source = self.require(id).await?;
        let name = name.unwrap_or_else(|| format!("{} (copy)", source.name));
        let copy = source.cloned_as(name);
        self.insert(&copy).await?;

        info!(source = %id, trader = %copy.id, "Cloned trader");
        Ok(copy)
    }

    /// Delete a trader together with all of its positions and trades.
    pub async fn delete(&self, id: &str) -> SimResult<bool> {
        let mut tx = self.pool.begin().await?;

        let trades = sqlx::query("DELETE FROM paper_trades WHERE trader_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let positions = sqlx::query("DELETE FROM positions WHERE trader_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let deleted = sqlx::query("DELETE FROM traders WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        if deleted > 0 {
            info!(trader = %id, positions, trades, "Deleted trader");
        }
        Ok(deleted > 0)
    }

    /// Wipe positions and trades and restore the initial balance.
    pub async fn reset(&self, id: &str) -> SimResult<VirtualTrader> {
        let trader = self.require(id).await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM paper_trades WHERE trader_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM positions WHERE trader_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE traders SET current_balance = initial_balance WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(trader = %id, balance = %trader.initial_balance, "Reset trader");
        Ok(VirtualTrader {
            current_balance: trader.initial_balance,
            ..trader
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_create_get_list() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.traders();

        let mut new = NewTrader::new("alpha", dec!(10000));
        new.leverage = 10;
        new.indicator_weights.insert("rsi".to_string(), 2.0);
        let created = repo.create(new).await.unwrap();

        let loaded = repo.get(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.current_balance, dec!(10000));
        assert_eq!(loaded.leverage, 10);
        assert_eq!(loaded.indicator_weights.get("rsi"), Some(&2.0));
        assert_eq!(loaded.risk, created.risk);

        repo.create(NewTrader::new("beta", dec!(500))).await.unwrap();
        assert_eq!(repo.list().await.unwrap().len(), 2);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_and_list_enabled() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.traders();
        let trader = repo.create(NewTrader::new("alpha", dec!(1000))).await.unwrap();

        let updated = repo
            .update(
                &trader.id,
                TraderUpdate {
                    enabled: Some(false),
                    leverage: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert!(repo.list_enabled().await.unwrap().is_empty());

        let bad = repo
            .update(
                &trader.id,
                TraderUpdate {
                    leverage: Some(0),
                    ..Default::default()
                },
            )
            .await;
        let err = tokio_test::assert_err!(bad);
        assert!(matches!(err, SimError::InvalidInput(_)));
        assert_eq!(repo.require(&trader.id).await.unwrap().leverage, 5);
    }

    #[tokio::test]
    async fn test_clone_and_missing_delete() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.traders();
        let trader = repo.create(NewTrader::new("alpha", dec!(1000))).await.unwrap();

        let copy = repo.clone_trader(&trader.id, None).await.unwrap();
        assert_eq!(copy.name, "alpha (copy)");
        assert_eq!(repo.list().await.unwrap().len(), 2);

        assert!(!repo.delete("missing").await.unwrap());
        assert!(repo.delete(&copy.id).await.unwrap());
        assert!(matches!(
            repo.clone_trader("missing", None).await,
            Err(SimError::TraderNotFound(_))
        ));
    }
}
