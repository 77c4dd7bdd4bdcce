//! Simulation engine: turns signals into positions and drives price ticks.
//!
//! Holds no state of its own beyond handles to the repository, the position
//! manager and the price tracker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::api::PriceTracker;
use crate::config::RiskConfig;
use crate::db::TraderRepository;
use crate::error::{SimError, SimResult};
use crate::metrics::MetricsCalculator;
use crate::models::{
    normalize_symbol, ExitReason, PaperTrade, Ranking, Side, Signal, SimulatedPosition, TimeRange,
    TraderMetrics, VirtualTrader,
};

use super::PositionManager;

/// Weight used for indicators a trader has no explicit weight for.
const DEFAULT_INDICATOR_WEIGHT: f64 = 1.0;

/// Score used when a signal carries no indicator scores.
const NEUTRAL_SCORE: f64 = 0.5;

/// Snapshot of one trader's book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderSummary {
    pub trader: VirtualTrader,
    pub open_positions: usize,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,

    /// Balance plus unrealized PnL
    pub equity: Decimal,
}

/// Stateless coordinator over traders, positions and prices.
pub struct SimulationEngine {
    traders: TraderRepository,
    positions: Arc<PositionManager>,
    prices: Arc<PriceTracker>,
    risk: RiskConfig,
}

impl SimulationEngine {
    pub fn new(
        traders: TraderRepository,
        positions: Arc<PositionManager>,
        prices: Arc<PriceTracker>,
        risk: RiskConfig,
    ) -> Self {
        Self {
            traders,
            positions,
            prices,
            risk,
        }
    }

    pub fn traders(&self) -> &TraderRepository {
        &self.traders
    }

    pub fn position_manager(&self) -> &PositionManager {
        &self.positions
    }

    pub fn price_tracker(&self) -> &PriceTracker {
        &self.prices
    }

    // ==================== Signals ====================

    /// Offer a signal to every enabled trader. Returns the positions opened.
    pub async fn process_signal(&self, signal: &Signal) -> SimResult<Vec<SimulatedPosition>> {
        if signal.price <= Decimal::ZERO {
            return Err(SimError::InvalidInput(format!(
                "signal price must be positive, got {}",
                signal.price
            )));
        }
        if !(0.0..=1.0).contains(&signal.confidence) {
            return Err(SimError::InvalidInput(format!(
                "signal confidence must be within [0, 1], got {}",
                signal.confidence
            )));
        }

        let symbol = normalize_symbol(&signal.symbol);
        let traders = self.traders.list_enabled().await?;
        let mut opened = Vec::new();

        info!(
            symbol = %symbol,
            side = %signal.side,
            price = %signal.price,
            confidence = signal.confidence,
            traders = traders.len(),
            "Processing signal"
        );

        for trader in &traders {
            if !Self::evaluate_decision(trader, signal) {
                debug!(trader = %trader.id, symbol = %symbol, "Signal rejected by decision rules");
                continue;
            }

            let quantity = Self::calculate_position_size(trader, signal.price);
            if quantity <= Decimal::ZERO {
                warn!(trader = %trader.id, balance = %trader.current_balance, "Position size is zero, skipping");
                continue;
            }

            match self
                .positions
                .open_position(trader, &symbol, signal.side, signal.price, quantity, None, None)
                .await
            {
                Ok(position) => opened.push(position),
                Err(e) if e.is_recoverable() => {
                    warn!(trader = %trader.id, symbol = %symbol, error = %e, "Trader skipped signal");
                }
                Err(e) => {
                    error!(trader = %trader.id, symbol = %symbol, error = %e, "Failed to open position");
                }
            }
        }

        info!(symbol = %symbol, opened = opened.len(), "Signal processed");
        Ok(opened)
    }

    /// Whether `trader` takes `signal`: confidence gate, then weighted score
    /// against the side's threshold.
    pub fn evaluate_decision(trader: &VirtualTrader, signal: &Signal) -> bool {
        if signal.confidence < trader.decision.confidence_threshold {
            return false;
        }

        let score = Self::weighted_score(trader, signal);
        let threshold = match signal.side {
            Side::Long => trader.decision.buy_threshold,
            Side::Short => trader.decision.sell_threshold,
        };

        score >= threshold
    }

    /// Confluence score of a signal under a trader's indicator weights.
    pub fn weighted_score(trader: &VirtualTrader, signal: &Signal) -> f64 {
        let scores = &signal.indicator_scores;
        if scores.is_empty() {
            return NEUTRAL_SCORE;
        }

        if trader.indicator_weights.is_empty() {
            return scores.values().sum::<f64>() / scores.len() as f64;
        }

        let (weighted, total_weight) = scores.iter().fold((0.0, 0.0), |(sum, weights), (name, score)| {
            let weight = trader
                .indicator_weights
                .get(name)
                .copied()
                .unwrap_or(DEFAULT_INDICATOR_WEIGHT);
            (sum + score * weight, weights + weight)
        });

        if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        }
    }

    /// Quantity committing `max_position_pct` of balance as margin at `price`.
    pub fn calculate_position_size(trader: &VirtualTrader, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO || trader.current_balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        trader.current_balance * trader.risk.max_position_pct / Decimal::ONE_HUNDRED
            * Decimal::from(trader.leverage)
            / price
    }

    // ==================== Ticks ====================

    /// One pass over every open position: one price per symbol, then exit
    /// checks and mark-to-market. Returns the trades closed in this pass.
    pub async fn update_all_positions(&self) -> SimResult<HashMap<String, Vec<PaperTrade>>> {
        let open = self.positions.store().all_open().await?;
        let mut closed: HashMap<String, Vec<PaperTrade>> = HashMap::new();

        if open.is_empty() {
            debug!("No open positions to update");
            return Ok(closed);
        }

        let mut by_symbol: BTreeMap<String, Vec<SimulatedPosition>> = BTreeMap::new();
        for position in open {
            by_symbol.entry(position.symbol.clone()).or_default().push(position);
        }

        let symbols: Vec<String> = by_symbol.keys().cloned().collect();
        let prices = self.prices.get_prices(&symbols).await;
        let fee_rates: HashMap<String, Decimal> = self
            .traders
            .list()
            .await?
            .into_iter()
            .map(|t| (t.id, t.risk.fee_rate))
            .collect();

        for (symbol, positions) in by_symbol {
            let Some(price) = prices.get(&symbol).copied() else {
                warn!(symbol = %symbol, positions = positions.len(), "No price available, skipping symbol this tick");
                continue;
            };

            for position in positions {
                let Some(fee_rate) = fee_rates.get(&position.trader_id).copied() else {
                    warn!(position = %position.id, trader = %position.trader_id, "Position has no trader, skipping");
                    continue;
                };

                match self.tick_position(&position, price, fee_rate).await {
                    Ok(trades) if !trades.is_empty() => {
                        closed.entry(symbol.clone()).or_default().extend(trades);
                    }
                    Ok(_) => {}
                    Err(SimError::PositionNotOpen(_)) => {
                        debug!(position = %position.id, "Position closed concurrently");
                    }
                    Err(e) => {
                        error!(position = %position.id, symbol = %symbol, error = %e, "Failed to update position");
                    }
                }
            }
        }

        let count: usize = closed.values().map(Vec::len).sum();
        if count > 0 {
            info!(trades = count, symbols = closed.len(), "Tick closed trades");
        }
        Ok(closed)
    }

    /// Exit check first; a full close ends the position's tick.
    async fn tick_position(
        &self,
        position: &SimulatedPosition,
        price: Decimal,
        fee_rate: Decimal,
    ) -> SimResult<Vec<PaperTrade>> {
        if let Some(reason) = PositionManager::check_exit_conditions(position, price) {
            let trade = self.positions.close_position(position, price, reason).await?;
            return Ok(vec![trade]);
        }

        let update = self
            .positions
            .update_position_price(position, price, fee_rate)
            .await?;
        let mut trades: Vec<PaperTrade> = update.partial_trade.into_iter().collect();

        if let Some(reason) = update.exit {
            trades.push(self.positions.close_position(&update.position, price, reason).await?);
        }

        Ok(trades)
    }

    // ==================== Risk Events ====================

    /// Close part of every profitable open position on `symbol` across all
    /// traders at the live price. Profit is judged at that same price; only
    /// when no price can be fetched do the last stored marks stand in.
    /// Returns how many positions were reduced.
    pub async fn handle_risk_signal(&self, symbol: &str) -> SimResult<usize> {
        let symbol = normalize_symbol(symbol);
        let positions = self.positions.store().open_by_symbol(&symbol).await?;
        if positions.is_empty() {
            return Ok(0);
        }

        let live = self.prices.get_price(&symbol).await;
        if live.is_none() {
            warn!(symbol = %symbol, "No live price for risk signal, using last marks");
        }

        let mut fee_rates: HashMap<String, Decimal> = HashMap::new();
        let mut reduced = 0;

        for position in &positions {
            let (price, profit) = match live {
                Some(price) => {
                    let fee_rate = match fee_rates.get(&position.trader_id) {
                        Some(rate) => *rate,
                        None => match self.traders.require(&position.trader_id).await {
                            Ok(trader) => {
                                fee_rates.insert(trader.id.clone(), trader.risk.fee_rate);
                                trader.risk.fee_rate
                            }
                            Err(e) => {
                                error!(position = %position.id, error = %e, "Risk close skipped");
                                continue;
                            }
                        },
                    };
                    (price, position.pnl_at(price, fee_rate).net_pnl)
                }
                None => (position.current_price, position.unrealized_pnl),
            };
            if profit <= Decimal::ZERO {
                continue;
            }

            match self
                .positions
                .partial_close_position(
                    position,
                    self.risk.risk_close_ratio,
                    price,
                    ExitReason::FomoIntensifyRisk,
                )
                .await
            {
                Ok(Some(_)) => reduced += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(position = %position.id, symbol = %symbol, error = %e, "Risk close failed");
                }
            }
        }

        info!(
            symbol = %symbol,
            open = positions.len(),
            price = ?live,
            reduced,
            "Handled risk signal"
        );
        Ok(reduced)
    }

    // ==================== Manual Operations ====================

    /// Close a position at the current market price.
    pub async fn close_position_manual(&self, position_id: &str) -> SimResult<PaperTrade> {
        let position = self.positions.store().require(position_id).await?;
        if !position.is_open() {
            return Err(SimError::PositionNotOpen(position_id.to_string()));
        }

        let price = self
            .prices
            .get_price(&position.symbol)
            .await
            .ok_or_else(|| SimError::PriceUnavailable(position.symbol.clone()))?;

        self.positions
            .close_position(&position, price, ExitReason::Manual)
            .await
    }

    /// Delete a trader and everything it owns.
    pub async fn delete_trader(&self, trader_id: &str) -> SimResult<bool> {
        let deleted = {
            let _guard = self.positions.locks().acquire(trader_id).await;
            self.traders.delete(trader_id).await?
        };
        self.positions.locks().forget(trader_id).await;
        Ok(deleted)
    }

    /// Wipe a trader's history and restore its initial balance.
    pub async fn reset_trader(&self, trader_id: &str) -> SimResult<VirtualTrader> {
        let _guard = self.positions.locks().acquire(trader_id).await;
        self.traders.reset(trader_id).await
    }

    // ==================== Reporting ====================

    pub async fn trader_summary(&self, trader_id: &str) -> SimResult<TraderSummary> {
        let trader = self.traders.require(trader_id).await?;
        let open = self.positions.store().open_by_trader(trader_id).await?;
        let trades = self.positions.store().trades_by_trader(trader_id).await?;

        let unrealized_pnl: Decimal = open.iter().map(|p| p.unrealized_pnl).sum();
        let realized_pnl: Decimal = trades.iter().map(|t| t.realized_pnl).sum();

        Ok(TraderSummary {
            equity: trader.current_balance + unrealized_pnl,
            open_positions: open.len(),
            unrealized_pnl,
            realized_pnl,
            trader,
        })
    }

    /// Closed trades of one trader within `range`.
    pub async fn trades(&self, trader_id: &str, range: TimeRange) -> SimResult<Vec<PaperTrade>> {
        self.traders.require(trader_id).await?;
        let trades = self.positions.store().trades_by_trader(trader_id).await?;
        Ok(MetricsCalculator::filter_by_time_range_at(
            &trades,
            range,
            chrono::Utc::now(),
        ))
    }

    pub async fn trader_metrics(&self, trader_id: &str, range: TimeRange) -> SimResult<TraderMetrics> {
        let trades = self.trades(trader_id, range).await?;
        Ok(MetricsCalculator::calculate_trader_metrics(&trades))
    }

    /// Leaderboard over every trader's trades within `range`.
    pub async fn rankings(&self, range: TimeRange) -> SimResult<Vec<Ranking>> {
        let traders = self.traders.list().await?;
        let now = chrono::Utc::now();
        let mut trades_by_trader = HashMap::with_capacity(traders.len());

        for trader in &traders {
            let trades = self.positions.store().trades_by_trader(&trader.id).await?;
            trades_by_trader.insert(
                trader.id.clone(),
                MetricsCalculator::filter_by_time_range_at(&trades, range, now),
            );
        }

        Ok(MetricsCalculator::calculate_rankings(&traders, &trades_by_trader))
    }
}
