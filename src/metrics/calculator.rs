//! Calculator for trader performance metrics: win rate, profit factor, MDD, Sharpe ratio.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{PaperTrade, Ranking, TimeRange, TraderMetrics, VirtualTrader};

/// Calculator for computing trader performance metrics from closed trades.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate metrics over a set of closed trades (partial closes count as trades).
    pub fn calculate_trader_metrics(trades: &[PaperTrade]) -> TraderMetrics {
        let mut metrics = TraderMetrics::empty();

        if trades.is_empty() {
            return metrics;
        }

        let pnls: Vec<Decimal> = trades.iter().map(|t| t.realized_pnl).collect();

        metrics.total_trades = trades.len() as u32;
        metrics.total_pnl = pnls.iter().copied().sum();
        metrics.total_fees = trades.iter().map(|t| t.fees).sum();

        Self::calculate_pnl_metrics(&mut metrics, &pnls);
        Self::calculate_drawdown(&mut metrics, trades);
        Self::calculate_sharpe(&mut metrics, &pnls);

        metrics.avg_duration_secs =
            trades.iter().map(|t| t.duration_secs as f64).sum::<f64>() / trades.len() as f64;

        metrics
    }

    /// Win/loss split; zero-PnL trades count as losses.
    fn calculate_pnl_metrics(metrics: &mut TraderMetrics, pnls: &[Decimal]) {
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().partition(|&&p| p > Decimal::ZERO);

        metrics.winning_trades = wins.len() as u32;
        metrics.losing_trades = losses.len() as u32;
        metrics.win_rate = wins.len() as f64 / pnls.len() as f64;

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            metrics.avg_win = gross_profit / Decimal::from(wins.len() as u32);
            metrics.largest_win = wins.iter().copied().max().unwrap_or_default();
        }
        if !losses.is_empty() {
            metrics.avg_loss = gross_loss / Decimal::from(losses.len() as u32);
            metrics.largest_loss = losses.iter().map(|l| l.abs()).max().unwrap_or_default();
        }

        metrics.profit_factor = if gross_loss > Decimal::ZERO {
            gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0)
        } else if gross_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };

        metrics.expectancy = metrics.total_pnl / Decimal::from(pnls.len() as u32);
    }

    /// Peak-to-trough fall of the realized equity curve, in close-time order.
    fn calculate_drawdown(metrics: &mut TraderMetrics, trades: &[PaperTrade]) {
        let mut sorted: Vec<&PaperTrade> = trades.iter().collect();
        sorted.sort_by_key(|t| t.closed_at);

        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;

        for trade in sorted {
            equity += trade.realized_pnl;
            peak = peak.max(equity);
            max_dd = max_dd.max(peak - equity);
        }

        metrics.max_drawdown = max_dd;
    }

    /// Per-trade Sharpe ratio (risk-free rate 0, not annualised).
    fn calculate_sharpe(metrics: &mut TraderMetrics, pnls: &[Decimal]) {
        if pnls.len() < 2 {
            return;
        }

        let returns: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        if std_dev.is_finite() && std_dev > 0.0 {
            metrics.sharpe_ratio = mean / std_dev;
        }
    }

    /// One entry per trader ranked by total PnL, best first. Ties keep input order.
    pub fn calculate_rankings(
        traders: &[VirtualTrader],
        trades_by_trader: &HashMap<String, Vec<PaperTrade>>,
    ) -> Vec<Ranking> {
        let mut rankings: Vec<Ranking> = traders
            .iter()
            .map(|trader| {
                let metrics = trades_by_trader
                    .get(&trader.id)
                    .map(|trades| Self::calculate_trader_metrics(trades.as_slice()))
                    .unwrap_or_default();

                Ranking {
                    rank: 0,
                    trader_id: trader.id.clone(),
                    trader_name: trader.name.clone(),
                    current_balance: trader.current_balance,
                    return_pct: trader.return_pct(),
                    metrics,
                }
            })
            .collect();

        rankings.sort_by(|a, b| b.metrics.total_pnl.cmp(&a.metrics.total_pnl));
        for (i, ranking) in rankings.iter_mut().enumerate() {
            ranking.rank = i as u32 + 1;
        }

        rankings
    }

    /// Trades closed within `range` ("24h", "7d", "30d", "all") of now.
    pub fn filter_by_time_range(trades: &[PaperTrade], range: &str) -> Vec<PaperTrade> {
        Self::filter_by_time_range_at(trades, TimeRange::parse(range), Utc::now())
    }

    /// Trades with `closed_at >= now - window`; everything for `All`.
    pub fn filter_by_time_range_at(
        trades: &[PaperTrade],
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Vec<PaperTrade> {
        match range.since(now) {
            Some(since) => trades
                .iter()
                .filter(|t| t.closed_at >= since)
                .cloned()
                .collect(),
            None => trades.to_vec(),
        }
    }
}
