//! Position lifecycle: open, mark-to-market, pyramiding, exits and closes.
//!
//! Every mutation runs under the owning trader's lock and starts from a fresh
//! read of the position, so a signal-driven open and a tick-driven close
//! never interleave on the same trader.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::PositionConfig;
use crate::db::{PositionStore, TraderRepository};
use crate::error::{SimError, SimResult};
use crate::models::{
    ExitReason, PaperTrade, PnlBreakdown, PositionStatus, PyramidLevel, SimulatedPosition, Side,
    TrailingStop, VirtualTrader,
};

/// Per-trader async locks, created on first use.
#[derive(Default)]
pub struct TraderLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TraderLocks {
    pub async fn acquire(&self, trader_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(trader_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a removed trader.
    pub async fn forget(&self, trader_id: &str) {
        self.locks.lock().await.remove(trader_id);
    }
}

/// A pyramiding level that is due at some price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyramidHit {
    /// Index into the position's level list
    pub index: usize,
    pub trigger_pct: Decimal,
    pub close_ratio: Decimal,
}

/// Result of a mark-to-market update.
#[derive(Debug, Clone)]
pub struct PriceUpdate {
    /// Position state after the update (still OPEN)
    pub position: SimulatedPosition,

    /// Partial-close trade produced by a pyramiding level, if one fired
    pub partial_trade: Option<PaperTrade>,

    /// Full exit requested by a final pyramiding level
    pub exit: Option<ExitReason>,
}

/// Owns position state transitions and the PnL they realize.
pub struct PositionManager {
    traders: TraderRepository,
    store: PositionStore,
    policy: PositionConfig,
    locks: Arc<TraderLocks>,
}

impl PositionManager {
    pub fn new(traders: TraderRepository, store: PositionStore, policy: PositionConfig) -> Self {
        Self {
            traders,
            store,
            policy,
            locks: Arc::new(TraderLocks::default()),
        }
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn locks(&self) -> &TraderLocks {
        &self.locks
    }

    // ==================== Open ====================

    /// Open a position for `trader`. Fails without side effects when the
    /// required margin exceeds the trader's current balance.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_position(
        &self,
        trader: &VirtualTrader,
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        quantity: Decimal,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> SimResult<SimulatedPosition> {
        if quantity <= Decimal::ZERO {
            return Err(SimError::InvalidInput(format!("quantity must be positive, got {}", quantity)));
        }
        if entry_price <= Decimal::ZERO {
            return Err(SimError::InvalidInput(format!("entry price must be positive, got {}", entry_price)));
        }

        let _guard = self.locks.acquire(&trader.id).await;

        // The caller's copy may be stale; the margin check uses the stored balance.
        let trader = self.traders.require(&trader.id).await?;
        let leverage = trader.leverage.max(1);
        let required = entry_price * quantity / Decimal::from(leverage);
        if required > trader.current_balance {
            return Err(SimError::InsufficientBalance {
                required,
                available: trader.current_balance,
            });
        }

        let (default_tp, default_sl) = default_exits(&trader, side, entry_price);
        let now = Utc::now();
        let position = SimulatedPosition {
            id: uuid::Uuid::new_v4().to_string(),
            trader_id: trader.id.clone(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            quantity,
            leverage,
            take_profit: take_profit.unwrap_or(default_tp),
            stop_loss: stop_loss.unwrap_or(default_sl),
            opened_at: now,
            status: PositionStatus::Open,
            unrealized_pnl: Decimal::ZERO,
            current_price: entry_price,
            last_updated: now,
            pyramid_levels: self
                .policy
                .pyramid_levels
                .iter()
                .map(|l| PyramidLevel::new(l.trigger_pct, l.close_ratio))
                .collect(),
            trailing_stop: TrailingStop::new(
                self.policy.trailing_stop_enabled,
                self.policy.trailing_callback_pct,
            ),
            closed_at: None,
        };

        self.store.insert(&position).await?;

        info!(
            trader = %trader.id,
            position = %position.id,
            symbol = %position.symbol,
            side = %side,
            entry = %entry_price,
            quantity = %quantity,
            margin = %required,
            "Opened position"
        );
        Ok(position)
    }

    // ==================== Mark to Market ====================

    /// Re-price an open position: trailing extreme, unrealized PnL and at most
    /// one pyramiding level. Never changes the position's status; a final
    /// pyramiding level is reported through [`PriceUpdate::exit`].
    pub async fn update_position_price(
        &self,
        position: &SimulatedPosition,
        price: Decimal,
        fee_rate: Decimal,
    ) -> SimResult<PriceUpdate> {
        let _guard = self.locks.acquire(&position.trader_id).await;
        let mut position = self.reload_open(&position.id).await?;
        let held = position.quantity;
        let now = Utc::now();

        position.trailing_stop.observe(position.side, position.entry_price, price);
        position.current_price = price;
        position.last_updated = now;

        let mut partial_trade = None;
        let mut exit = None;

        if let Some(hit) = Self::check_pyramiding_levels(&position, price) {
            position.pyramid_levels[hit.index].executed = true;
            let reason = ExitReason::PyramidingTakeProfit(hit.trigger_pct);

            if hit.close_ratio >= Decimal::ONE {
                info!(position = %position.id, level = %hit.trigger_pct, "Final pyramiding level reached");
                exit = Some(reason);
            } else {
                let trade = take_slice(&mut position, hit.close_ratio, price, &reason, fee_rate, now);
                partial_trade = Some(trade);
            }
        }

        position.unrealized_pnl = position.pnl_at(price, fee_rate).net_pnl;

        match &partial_trade {
            Some(trade) => {
                let balance = self.store.commit_close(&position, held, trade).await?;
                info!(
                    position = %position.id,
                    reason = %trade.exit_reason,
                    closed = %trade.quantity,
                    remaining = %position.quantity,
                    pnl = %trade.realized_pnl,
                    balance = %balance,
                    "Pyramiding partial close"
                );
            }
            None => self.store.save(&position).await?,
        }

        debug!(
            position = %position.id,
            price = %price,
            unrealized = %position.unrealized_pnl,
            "Updated position price"
        );
        Ok(PriceUpdate {
            position,
            partial_trade,
            exit,
        })
    }

    /// Full-exit check in priority order: stop loss, trailing stop, take profit.
    /// Pyramiding is handled by [`Self::update_position_price`] instead.
    pub fn check_exit_conditions(position: &SimulatedPosition, price: Decimal) -> Option<ExitReason> {
        if position.stop_loss_hit(price) {
            Some(ExitReason::StopLoss)
        } else if position.trailing_stop_hit(price) {
            Some(ExitReason::TrailingStop)
        } else if position.take_profit_hit(price) {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }

    /// First not-yet-executed level (in list order) whose trigger is reached.
    pub fn check_pyramiding_levels(position: &SimulatedPosition, price: Decimal) -> Option<PyramidHit> {
        let profit_pct = position.profit_pct(price);

        position
            .pyramid_levels
            .iter()
            .enumerate()
            .find(|(_, level)| !level.executed && level.trigger_pct <= profit_pct)
            .map(|(index, level)| PyramidHit {
                index,
                trigger_pct: level.trigger_pct,
                close_ratio: level.close_ratio,
            })
    }

    // ==================== Close ====================

    /// Close the whole remaining quantity and credit the realized PnL.
    pub async fn close_position(
        &self,
        position: &SimulatedPosition,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> SimResult<PaperTrade> {
        let _guard = self.locks.acquire(&position.trader_id).await;
        let mut position = self.reload_open(&position.id).await?;
        let held = position.quantity;
        let trader = self.traders.require(&position.trader_id).await?;
        let now = Utc::now();

        let pnl = position.pnl_at(exit_price, trader.risk.fee_rate);
        let trade = build_trade(
            &position,
            position.quantity,
            exit_price,
            pnl.net_pnl,
            pnl.fees,
            reason.label(),
            now,
        );

        position.status = PositionStatus::Closed;
        position.current_price = exit_price;
        position.unrealized_pnl = pnl.net_pnl;
        position.last_updated = now;
        position.closed_at = Some(now);

        let balance = self.store.commit_close(&position, held, &trade).await?;

        info!(
            trader = %position.trader_id,
            position = %position.id,
            symbol = %position.symbol,
            reason = %trade.exit_reason,
            exit = %exit_price,
            pnl = %trade.realized_pnl,
            balance = %balance,
            "Closed position"
        );
        Ok(trade)
    }

    /// Close `close_ratio` of the live quantity; the position stays open.
    /// Returns `Ok(None)` when the position is no longer open.
    pub async fn partial_close_position(
        &self,
        position: &SimulatedPosition,
        close_ratio: Decimal,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> SimResult<Option<PaperTrade>> {
        if close_ratio <= Decimal::ZERO || close_ratio >= Decimal::ONE {
            warn!(position = %position.id, ratio = %close_ratio, "Rejected partial close ratio");
            return Err(SimError::InvalidRatio(close_ratio));
        }

        let _guard = self.locks.acquire(&position.trader_id).await;
        let mut position = match self.reload_open(&position.id).await {
            Ok(position) => position,
            Err(SimError::PositionNotOpen(id)) => {
                warn!(position = %id, "Skipping partial close of a closed position");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let held = position.quantity;
        let trader = self.traders.require(&position.trader_id).await?;
        let fee_rate = trader.risk.fee_rate;
        let now = Utc::now();

        let trade = take_slice(&mut position, close_ratio, exit_price, &reason, fee_rate, now);
        position.current_price = exit_price;
        position.last_updated = now;
        position.unrealized_pnl = position.pnl_at(exit_price, fee_rate).net_pnl;

        let balance = self.store.commit_close(&position, held, &trade).await?;

        info!(
            trader = %position.trader_id,
            position = %position.id,
            reason = %trade.exit_reason,
            closed = %trade.quantity,
            remaining = %position.quantity,
            pnl = %trade.realized_pnl,
            balance = %balance,
            "Partially closed position"
        );
        Ok(Some(trade))
    }

    async fn reload_open(&self, position_id: &str) -> SimResult<SimulatedPosition> {
        let position = self.store.require(position_id).await?;
        if !position.is_open() {
            return Err(SimError::PositionNotOpen(position_id.to_string()));
        }
        Ok(position)
    }
}

/// Directional default take-profit and stop-loss prices.
fn default_exits(trader: &VirtualTrader, side: Side, entry_price: Decimal) -> (Decimal, Decimal) {
    let tp = trader.risk.take_profit_pct / Decimal::ONE_HUNDRED;
    let sl = trader.risk.stop_loss_pct / Decimal::ONE_HUNDRED;

    match side {
        Side::Long => (entry_price * (Decimal::ONE + tp), entry_price * (Decimal::ONE - sl)),
        Side::Short => (entry_price * (Decimal::ONE - tp), entry_price * (Decimal::ONE + sl)),
    }
}

/// Cut `close_ratio` off the live quantity and build the trade for that slice.
fn take_slice(
    position: &mut SimulatedPosition,
    close_ratio: Decimal,
    exit_price: Decimal,
    reason: &ExitReason,
    fee_rate: Decimal,
    now: DateTime<Utc>,
) -> PaperTrade {
    let slice = position.quantity * close_ratio;
    let pnl = PnlBreakdown::compute(
        position.side,
        position.entry_price,
        exit_price,
        slice,
        position.leverage,
        fee_rate,
    );
    let trade = build_trade(
        position,
        slice,
        exit_price,
        pnl.net_pnl,
        pnl.fees,
        reason.partial_label(close_ratio),
        now,
    );

    position.quantity -= slice;
    trade
}

fn build_trade(
    position: &SimulatedPosition,
    quantity: Decimal,
    exit_price: Decimal,
    realized_pnl: Decimal,
    fees: Decimal,
    exit_reason: String,
    now: DateTime<Utc>,
) -> PaperTrade {
    PaperTrade {
        id: uuid::Uuid::new_v4().to_string(),
        trader_id: position.trader_id.clone(),
        position_id: position.id.clone(),
        symbol: position.symbol.clone(),
        side: position.side,
        entry_price: position.entry_price,
        exit_price,
        quantity,
        leverage: position.leverage,
        realized_pnl,
        fees,
        duration_secs: (now - position.opened_at).num_seconds().max(0),
        exit_reason,
        opened_at: position.opened_at,
        closed_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::NewTrader;
    use rust_decimal_macros::dec;

    async fn setup(policy: PositionConfig) -> (Database, PositionManager, VirtualTrader) {
        let db = Database::in_memory().await.unwrap();
        let mut new = NewTrader::new("alpha", dec!(10000));
        new.leverage = 10;
        let trader = db.traders().create(new).await.unwrap();
        let manager = PositionManager::new(db.traders(), db.positions(), policy);
        (db, manager, trader)
    }

    async fn open_btc(manager: &PositionManager, trader: &VirtualTrader, side: Side) -> SimulatedPosition {
        manager
            .open_position(trader, "BTCUSDT", side, dec!(50000), dec!(0.2), None, None)
            .await
            .unwrap()
    }

    fn settled_closes(results: [SimResult<PaperTrade>; 2]) -> Vec<PaperTrade> {
        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(trade) => Some(trade),
                Err(SimError::PositionNotOpen(_)) => None,
                Err(e) => panic!("unexpected close error: {e}"),
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_closes_settle_once() {
        let (db, manager, trader) = setup(PositionConfig::default()).await;
        let position = open_btc(&manager, &trader, Side::Long).await;

        let (a, b) = tokio::join!(
            manager.close_position(&position, dec!(51000), ExitReason::Manual),
            manager.close_position(&position, dec!(51000), ExitReason::Manual),
        );
        let settled = settled_closes([a, b]);
        assert_eq!(settled.len(), 1);

        let trades = db.positions().trades_by_position(&position.id).await.unwrap();
        assert_eq!(trades.len(), 1);
        let balance = db.traders().require(&trader.id).await.unwrap().current_balance;
        assert_eq!(balance, dec!(10000) + settled[0].realized_pnl);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_partials_conserve_quantity() {
        let (db, manager, trader) = setup(PositionConfig::default()).await;
        let position = open_btc(&manager, &trader, Side::Long).await;

        let (a, b) = tokio::join!(
            manager.partial_close_position(&position, dec!(0.5), dec!(51000), ExitReason::Manual),
            manager.partial_close_position(&position, dec!(0.5), dec!(51000), ExitReason::Manual),
        );
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();

        let stored = db.positions().require(&position.id).await.unwrap();
        assert_eq!(stored.status, PositionStatus::Open);
        assert_eq!(stored.quantity, dec!(0.05));
        assert_eq!(a.quantity + b.quantity + stored.quantity, dec!(0.2));

        let balance = db.traders().require(&trader.id).await.unwrap().current_balance;
        assert_eq!(balance, dec!(10000) + a.realized_pnl + b.realized_pnl);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_open_waits_for_losing_close() {
        let (db, manager, trader) = setup(PositionConfig::default()).await;
        let position = open_btc(&manager, &trader, Side::Long).await;

        // Needs 9000 margin: fits before the loss, not after it.
        let (closed, opened) = tokio::join!(
            manager.close_position(&position, dec!(40000), ExitReason::StopLoss),
            manager.open_position(&trader, "ETHUSDT", Side::Long, dec!(50000), dec!(1.8), None, None),
        );
        let closed = closed.unwrap();
        let balance = db.traders().require(&trader.id).await.unwrap().current_balance;
        assert_eq!(balance, dec!(10000) + closed.realized_pnl);

        match opened {
            Ok(eth) => assert_eq!(eth.margin(), dec!(9000)),
            Err(SimError::InsufficientBalance { required, available }) => {
                assert_eq!(required, dec!(9000));
                assert_eq!(available, balance);
            }
            Err(e) => panic!("unexpected open error: {e}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_closes_from_two_processes_settle_once() {
        let path = std::env::temp_dir().join(format!("papertrader-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}?mode=rwc", path.display());

        // Two pools with separate lock registries behave like two processes.
        let first_db = Database::new(&url).await.unwrap();
        let second_db = Database::new(&url).await.unwrap();
        let mut new = NewTrader::new("alpha", dec!(10000));
        new.leverage = 10;
        let trader = first_db.traders().create(new).await.unwrap();
        let first = PositionManager::new(first_db.traders(), first_db.positions(), PositionConfig::default());
        let second = PositionManager::new(second_db.traders(), second_db.positions(), PositionConfig::default());
        let position = open_btc(&first, &trader, Side::Long).await;

        let (a, b) = tokio::join!(
            first.close_position(&position, dec!(51000), ExitReason::Manual),
            second.close_position(&position, dec!(51000), ExitReason::Manual),
        );
        let settled = settled_closes([a, b]);
        assert_eq!(settled.len(), 1);

        assert_eq!(first_db.positions().trades_by_position(&position.id).await.unwrap().len(), 1);
        let balance = first_db.traders().require(&trader.id).await.unwrap().current_balance;
        assert_eq!(balance, dec!(10000) + settled[0].realized_pnl);

        first_db.pool().close().await;
        second_db.pool().close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_open_position_defaults() {
        let (_db, manager, trader) = setup(PositionConfig::default()).await;

        let long = open_btc(&manager, &trader, Side::Long).await;
        assert_eq!(long.margin(), dec!(1000));
        assert_eq!(long.take_profit, dec!(55000));
        assert_eq!(long.stop_loss, dec!(47500));
        assert_eq!(long.pyramid_levels.len(), 3);
        assert!(long.trailing_stop.enabled);
        assert_eq!(long.trailing_stop.callback_pct, dec!(1.5));

        let short = open_btc(&manager, &trader, Side::Short).await;
        assert_eq!(short.take_profit, dec!(45000));
        assert_eq!(short.stop_loss, dec!(52500));
    }

    #[tokio::test]
    async fn test_open_rejects_insufficient_balance() {
        let (db, manager, trader) = setup(PositionConfig::default()).await;

        let result = manager
            .open_position(&trader, "BTCUSDT", Side::Long, dec!(50000), dec!(3), None, None)
            .await;
        assert!(matches!(result, Err(SimError::InsufficientBalance { .. })));

        assert!(db.positions().open_by_trader(&trader.id).await.unwrap().is_empty());
        assert_eq!(db.traders().require(&trader.id).await.unwrap().current_balance, dec!(10000));

        let zero = manager
            .open_position(&trader, "BTCUSDT", Side::Long, dec!(50000), dec!(0), None, None)
            .await;
        assert!(matches!(zero, Err(SimError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_pyramiding_fires_once() {
        let (db, manager, trader) = setup(PositionConfig::default()).await;
        let position = open_btc(&manager, &trader, Side::Long).await;

        let update = manager
            .update_position_price(&position, dec!(51500), trader.risk.fee_rate)
            .await
            .unwrap();
        let trade = update.partial_trade.unwrap();
        assert_eq!(trade.exit_reason, "PARTIAL_PYRAMIDING_TP_3PCT_50PCT");
        assert_eq!(trade.quantity, dec!(0.1));
        assert_eq!(trade.realized_pnl, dec!(1495.94));
        assert_eq!(update.position.quantity, dec!(0.1));
        assert!(update.position.pyramid_levels[0].executed);
        assert!(update.exit.is_none());

        let again = manager
            .update_position_price(&update.position, dec!(51500), trader.risk.fee_rate)
            .await
            .unwrap();
        assert!(again.partial_trade.is_none());
        assert_eq!(again.position.quantity, dec!(0.1));
        assert!(again.position.is_open());

        assert_eq!(db.positions().trades_by_trader(&trader.id).await.unwrap().len(), 1);
        assert_eq!(
            db.traders().require(&trader.id).await.unwrap().current_balance,
            dec!(11495.94)
        );
    }

    #[tokio::test]
    async fn test_final_level_requests_exit() {
        let policy = PositionConfig {
            pyramid_levels: vec![PyramidLevel::new(dec!(3), dec!(1.0))],
            ..Default::default()
        };
        let (_db, manager, trader) = setup(policy).await;
        let position = open_btc(&manager, &trader, Side::Long).await;

        let update = manager
            .update_position_price(&position, dec!(51500), trader.risk.fee_rate)
            .await
            .unwrap();
        assert_eq!(update.exit, Some(ExitReason::PyramidingTakeProfit(dec!(3))));
        assert!(update.partial_trade.is_none());
        assert!(update.position.is_open());
        assert_eq!(update.position.quantity, dec!(0.2));
    }

    #[tokio::test]
    async fn test_levels_fire_in_list_order() {
        let policy = PositionConfig {
            pyramid_levels: vec![
                PyramidLevel::new(dec!(5), dec!(0.5)),
                PyramidLevel::new(dec!(3), dec!(0.5)),
            ],
            ..Default::default()
        };
        let (_db, manager, trader) = setup(policy).await;
        let position = open_btc(&manager, &trader, Side::Long).await;

        let hit = PositionManager::check_pyramiding_levels(&position, dec!(53000)).unwrap();
        assert_eq!(hit.index, 0);
        assert_eq!(hit.trigger_pct, dec!(5));

        let hit = PositionManager::check_pyramiding_levels(&position, dec!(51600)).unwrap();
        assert_eq!(hit.index, 1);
        assert!(PositionManager::check_pyramiding_levels(&position, dec!(51000)).is_none());
    }

    #[tokio::test]
    async fn test_trailing_extreme_is_monotonic() {
        let policy = PositionConfig {
            pyramid_levels: vec![],
            ..Default::default()
        };
        let (_db, manager, trader) = setup(policy).await;
        let mut position = open_btc(&manager, &trader, Side::Long).await;

        let mut last = Decimal::ZERO;
        for price in [dec!(50500), dec!(50200), dec!(51000), dec!(50900)] {
            position = manager
                .update_position_price(&position, price, trader.risk.fee_rate)
                .await
                .unwrap()
                .position;
            let highest = position.trailing_stop.highest_price_since_entry.unwrap();
            assert!(highest >= last);
            last = highest;
        }
        assert_eq!(last, dec!(51000));

        // 51000 * 0.985 = 50235
        assert_eq!(
            PositionManager::check_exit_conditions(&position, dec!(50235)),
            Some(ExitReason::TrailingStop)
        );
    }

    #[tokio::test]
    async fn test_exit_priority() {
        let (_db, manager, trader) = setup(PositionConfig::default()).await;
        let mut position = open_btc(&manager, &trader, Side::Long).await;

        assert_eq!(PositionManager::check_exit_conditions(&position, dec!(50000)), None);
        assert_eq!(
            PositionManager::check_exit_conditions(&position, dec!(55000)),
            Some(ExitReason::TakeProfit)
        );

        position.trailing_stop.highest_price_since_entry = Some(dec!(60000));
        assert_eq!(
            PositionManager::check_exit_conditions(&position, dec!(47000)),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            PositionManager::check_exit_conditions(&position, dec!(55000)),
            Some(ExitReason::TrailingStop)
        );
    }

    #[tokio::test]
    async fn test_stop_loss_close_credits_balance() {
        let (db, manager, trader) = setup(PositionConfig::default()).await;
        let position = open_btc(&manager, &trader, Side::Long).await;

        let reason = PositionManager::check_exit_conditions(&position, dec!(47500)).unwrap();
        assert_eq!(reason, ExitReason::StopLoss);

        let trade = manager.close_position(&position, dec!(47500), reason).await.unwrap();
        assert_eq!(trade.exit_reason, "SL");
        assert_eq!(trade.quantity, dec!(0.2));
        assert_eq!(trade.realized_pnl, dec!(-5007.8));
        assert!(trade.closed_at >= trade.opened_at);

        assert!(db.positions().open_by_trader(&trader.id).await.unwrap().is_empty());
        assert_eq!(db.positions().trades_by_trader(&trader.id).await.unwrap().len(), 1);
        assert_eq!(
            db.traders().require(&trader.id).await.unwrap().current_balance,
            dec!(4992.2)
        );

        let again = manager.close_position(&position, dec!(47000), ExitReason::Manual).await;
        assert!(matches!(again, Err(SimError::PositionNotOpen(_))));
    }

    #[tokio::test]
    async fn test_partial_then_full_close_conserves_quantity() {
        let (db, manager, trader) = setup(PositionConfig::default()).await;
        let position = open_btc(&manager, &trader, Side::Short).await;

        let bad = manager
            .partial_close_position(&position, dec!(1), dec!(49000), ExitReason::Manual)
            .await;
        assert!(matches!(bad, Err(SimError::InvalidRatio(_))));

        manager
            .partial_close_position(&position, dec!(0.25), dec!(49000), ExitReason::FomoIntensifyRisk)
            .await
            .unwrap()
            .unwrap();
        manager
            .close_position(&position, dec!(48000), ExitReason::Manual)
            .await
            .unwrap();

        let trades = db.positions().trades_by_position(&position.id).await.unwrap();
        let total: Decimal = trades.iter().map(|t| t.quantity).sum();
        assert_eq!(trades.len(), 2);
        assert_eq!(total, dec!(0.2));
        assert_eq!(trades[0].exit_reason, "PARTIAL_FOMO_INTENSIFY_RISK_25PCT");

        let closed = manager
            .partial_close_position(&position, dec!(0.5), dec!(48000), ExitReason::Manual)
            .await
            .unwrap();
        assert!(closed.is_none());
    }
}
