//! Paper-trading simulator CLI.
//!
//! Manages virtual traders, feeds them signals and risk events, and runs the
//! periodic price updater behind a JSON HTTP API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use paper_trader::config::SimulatorConfig;
use paper_trader::models::{
    DecisionParams, NewTrader, PaperTrade, RiskParams, Side, Signal, SimulatedPosition, TimeRange,
    TraderMetrics, TraderUpdate, VirtualTrader,
};
use paper_trader::{server, AppContext};

/// Multi-trader paper-trading simulator.
#[derive(Parser)]
#[command(name = "papertrader")]
#[command(about = "Simulate leveraged trading strategies against live prices", long_about = None)]
struct Cli {
    /// Database URL (overrides PAPER_DATABASE_URL)
    #[arg(short, long, env = "PAPER_DATABASE_URL")]
    database: Option<String>,

    /// Log level used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the price updater and the HTTP API until Ctrl+C
    Serve {
        /// Listen address
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Seconds between price updates
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Manage virtual traders
    #[command(subcommand)]
    Trader(TraderCommand),

    /// Show a trader's positions
    Positions {
        trader_id: String,

        /// Include closed positions
        #[arg(long)]
        all: bool,
    },

    /// Show a trader's closed trades
    Trades {
        trader_id: String,

        /// Time range (24h, 7d, 30d, all)
        #[arg(short, long, default_value = "all")]
        range: String,
    },

    /// Submit a trading signal to every enabled trader
    Signal {
        /// Symbol, e.g. BTC or BTCUSDT
        symbol: String,

        /// LONG or SHORT
        #[arg(value_parser = parse_side)]
        side: Side,

        /// Signal price
        price: Decimal,

        /// Aggregator confidence (0.0 to 1.0)
        #[arg(short, long, default_value = "1.0")]
        confidence: f64,

        /// Indicator score as name=value (repeatable)
        #[arg(short, long = "score", value_parser = parse_key_value)]
        scores: Vec<(String, f64)>,
    },

    /// Reduce profitable positions on a symbol after a risk event
    Risk { symbol: String },

    /// Run one price update pass
    Tick,

    /// Show a trader's performance metrics
    Metrics {
        trader_id: String,

        /// Time range (24h, 7d, 30d, all)
        #[arg(short, long, default_value = "all")]
        range: String,
    },

    /// Rank all traders by realized PnL
    Rankings {
        /// Time range (24h, 7d, 30d, all)
        #[arg(short, long, default_value = "all")]
        range: String,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
enum TraderCommand {
    /// Create a trader
    Create {
        name: String,

        /// Starting balance
        #[arg(short, long, default_value = "10000")]
        balance: Decimal,

        #[arg(short = 'x', long, default_value = "1")]
        leverage: u32,

        /// Create disabled
        #[arg(long)]
        disabled: bool,

        #[command(flatten)]
        params: TraderParams,
    },

    /// List all traders
    List,

    /// Show a trader's balance and open exposure
    Show { id: String },

    /// Update a trader's configuration
    Update {
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,

        #[arg(short = 'x', long)]
        leverage: Option<u32>,

        #[command(flatten)]
        params: TraderParams,
    },

    /// Delete a trader with its positions and trades
    Delete { id: String },

    /// Copy a trader's configuration under a new id
    Clone {
        id: String,

        #[arg(long)]
        name: Option<String>,
    },

    /// Drop a trader's history and restore its initial balance
    Reset { id: String },
}

/// Optional strategy parameters shared by `create` and `update`.
#[derive(Args)]
struct TraderParams {
    #[arg(long)]
    confidence_threshold: Option<f64>,

    #[arg(long)]
    buy_threshold: Option<f64>,

    #[arg(long)]
    sell_threshold: Option<f64>,

    /// Percent of balance committed as margin per position
    #[arg(long)]
    max_position_pct: Option<Decimal>,

    #[arg(long)]
    stop_loss_pct: Option<Decimal>,

    #[arg(long)]
    take_profit_pct: Option<Decimal>,

    #[arg(long)]
    fee_rate: Option<Decimal>,

    /// Indicator weight as name=value (repeatable)
    #[arg(long = "weight", value_parser = parse_key_value)]
    weights: Vec<(String, f64)>,
}

impl TraderParams {
    fn has_decision(&self) -> bool {
        self.confidence_threshold.is_some()
            || self.buy_threshold.is_some()
            || self.sell_threshold.is_some()
    }

    fn has_risk(&self) -> bool {
        self.max_position_pct.is_some()
            || self.stop_loss_pct.is_some()
            || self.take_profit_pct.is_some()
            || self.fee_rate.is_some()
    }

    fn apply_decision(&self, decision: &mut DecisionParams) {
        if let Some(v) = self.confidence_threshold {
            decision.confidence_threshold = v;
        }
        if let Some(v) = self.buy_threshold {
            decision.buy_threshold = v;
        }
        if let Some(v) = self.sell_threshold {
            decision.sell_threshold = v;
        }
    }

    fn apply_risk(&self, risk: &mut RiskParams) {
        if let Some(v) = self.max_position_pct {
            risk.max_position_pct = v;
        }
        if let Some(v) = self.stop_loss_pct {
            risk.stop_loss_pct = v;
        }
        if let Some(v) = self.take_profit_pct {
            risk.take_profit_pct = v;
        }
        if let Some(v) = self.fee_rate {
            risk.fee_rate = v;
        }
    }

    fn weight_map(&self) -> HashMap<String, f64> {
        self.weights.iter().cloned().collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = SimulatorConfig::from_env()?;
    if let Some(database) = cli.database {
        config.database_url = database;
    }

    if let Commands::Serve { bind, interval } = &cli.command {
        if let Some(bind) = bind {
            config.bind_addr = *bind;
        }
        if let Some(interval) = interval {
            config.update_interval_secs = *interval;
        }
    }

    let ctx = Arc::new(AppContext::new(config).await?);
    let engine = &ctx.engine;

    match cli.command {
        Commands::Serve { .. } => run_server(Arc::clone(&ctx)).await?,

        Commands::Trader(command) => match command {
            TraderCommand::Create {
                name,
                balance,
                leverage,
                disabled,
                params,
            } => {
                let mut request = NewTrader::new(name, balance);
                request.leverage = leverage;
                request.enabled = !disabled;
                params.apply_decision(&mut request.decision);
                params.apply_risk(&mut request.risk);
                request.indicator_weights = params.weight_map();

                let trader = engine.traders().create(request).await?;
                println!("Created trader {} ({})", trader.name, trader.id);
            }

            TraderCommand::List => {
                let traders = engine.traders().list().await?;
                if traders.is_empty() {
                    println!("No traders yet. Use 'papertrader trader create <name>' to add one.");
                    return Ok(());
                }
                print_traders(&traders);
            }

            TraderCommand::Show { id } => {
                let summary = engine.trader_summary(&id).await?;
                let t = &summary.trader;

                println!("\n=== Trader: {} ===", t.name);
                println!("ID:             {}", t.id);
                println!("Enabled:        {}", if t.enabled { "Yes" } else { "No" });
                println!("Leverage:       {}x", t.leverage);

                println!("\n--- Balance ---");
                println!("Initial:        ${:.2}", t.initial_balance);
                println!("Current:        ${:.2}", t.current_balance);
                println!("Return:         {:.2}%", t.return_pct());
                println!("Realized P&L:   ${:.2}", summary.realized_pnl);
                println!("Unrealized P&L: ${:.2}", summary.unrealized_pnl);
                println!("Equity:         ${:.2}", summary.equity);
                println!("Open Positions: {}", summary.open_positions);

                println!("\n--- Strategy ---");
                println!("Confidence:     {:.2}", t.decision.confidence_threshold);
                println!("Buy Threshold:  {:.2}", t.decision.buy_threshold);
                println!("Sell Threshold: {:.2}", t.decision.sell_threshold);
                println!("Position Size:  {}% of balance", t.risk.max_position_pct);
                println!("Stop Loss:      {}%", t.risk.stop_loss_pct);
                println!("Take Profit:    {}%", t.risk.take_profit_pct);
                println!("Fee Rate:       {}", t.risk.fee_rate);
                for (indicator, weight) in &t.indicator_weights {
                    println!("Weight:         {} = {}", indicator, weight);
                }
            }

            TraderCommand::Update {
                id,
                name,
                enable,
                disable,
                leverage,
                params,
            } => {
                let current = engine.traders().require(&id).await?;
                let mut update = TraderUpdate {
                    name,
                    leverage,
                    enabled: match (enable, disable) {
                        (true, _) => Some(true),
                        (_, true) => Some(false),
                        _ => None,
                    },
                    ..TraderUpdate::default()
                };
                if params.has_decision() {
                    let mut decision = current.decision.clone();
                    params.apply_decision(&mut decision);
                    update.decision = Some(decision);
                }
                if params.has_risk() {
                    let mut risk = current.risk.clone();
                    params.apply_risk(&mut risk);
                    update.risk = Some(risk);
                }
                if !params.weights.is_empty() {
                    let mut weights = current.indicator_weights.clone();
                    weights.extend(params.weight_map());
                    update.indicator_weights = Some(weights);
                }

                let trader = engine.traders().update(&id, update).await?;
                println!("Updated trader {} ({})", trader.name, trader.id);
            }

            TraderCommand::Delete { id } => {
                if engine.delete_trader(&id).await? {
                    println!("Deleted trader {}", id);
                } else {
                    println!("Trader not found: {}", id);
                }
            }

            TraderCommand::Clone { id, name } => {
                let trader = engine.traders().clone_trader(&id, name).await?;
                println!("Cloned into {} ({})", trader.name, trader.id);
            }

            TraderCommand::Reset { id } => {
                let trader = engine.reset_trader(&id).await?;
                println!(
                    "Reset {}: balance restored to ${:.2}",
                    trader.name, trader.current_balance
                );
            }
        },

        Commands::Positions { trader_id, all } => {
            engine.traders().require(&trader_id).await?;
            let store = engine.position_manager().store();
            let positions = if all {
                store.all_by_trader(&trader_id).await?
            } else {
                store.open_by_trader(&trader_id).await?
            };

            if positions.is_empty() {
                println!("No positions.");
                return Ok(());
            }
            print_positions(&positions);
        }

        Commands::Trades { trader_id, range } => {
            let trades = engine.trades(&trader_id, TimeRange::parse(&range)).await?;
            if trades.is_empty() {
                println!("No closed trades.");
                return Ok(());
            }
            print_trades(&trades);
        }

        Commands::Signal {
            symbol,
            side,
            price,
            confidence,
            scores,
        } => {
            let mut signal = Signal::new(&symbol, side, price, confidence);
            for (indicator, score) in scores {
                signal = signal.with_score(&indicator, score);
            }

            info!(symbol = %signal.symbol, side = %side, "Submitting signal");
            let opened = engine.process_signal(&signal).await?;

            println!("Opened {} position(s) on {}", opened.len(), signal.symbol);
            if !opened.is_empty() {
                print_positions(&opened);
            }
        }

        Commands::Risk { symbol } => {
            let reduced = engine.handle_risk_signal(&symbol).await?;
            println!("Reduced {} profitable position(s)", reduced);
        }

        Commands::Tick => {
            let closed = ctx.updater.tick().await?;
            let trades: Vec<PaperTrade> = closed.into_values().flatten().collect();
            println!("Tick complete: {} trade(s) recorded", trades.len());
            if !trades.is_empty() {
                print_trades(&trades);
            }
        }

        Commands::Metrics { trader_id, range } => {
            let range = TimeRange::parse(&range);
            let trader = engine.traders().require(&trader_id).await?;
            let metrics = engine.trader_metrics(&trader_id, range).await?;

            println!("\n=== {} ({}) ===", trader.name, range.as_str());
            print_metrics(&metrics);
        }

        Commands::Rankings { range } => {
            let range = TimeRange::parse(&range);
            let rankings = engine.rankings(range).await?;

            println!(
                "\n{:>4} {:<20} {:>12} {:>12} {:>8} {:>7} {:>8}",
                "RANK", "NAME", "BALANCE", "P&L", "RETURN", "WIN%", "TRADES"
            );
            println!("{}", "-".repeat(77));

            for r in rankings {
                println!(
                    "{:>4} {:<20} {:>12.2} {:>12.2} {:>7.2}% {:>6.1}% {:>8}",
                    r.rank,
                    truncate(&r.trader_name, 20),
                    r.current_balance,
                    r.metrics.total_pnl,
                    r.return_pct,
                    r.metrics.win_rate * 100.0,
                    r.metrics.total_trades
                );
            }
        }

        Commands::Config => print_config(&ctx.config),
    }

    Ok(())
}

/// Serve HTTP and run the updater until Ctrl+C or a server failure.
async fn run_server(ctx: Arc<AppContext>) -> Result<()> {
    let addr = ctx.config.bind_addr;
    let shutdown = ctx.updater.shutdown_token();

    println!("\n=== Paper Trading Simulator ===");
    println!("Listening on:    http://{}", addr);
    println!("Update interval: {}s", ctx.config.update_interval().as_secs());
    println!("Database:        {}", ctx.config.database_url);
    println!("\nPress Ctrl+C to stop.\n");

    let updater = ctx.updater.spawn();
    let mut http = tokio::spawn(server::serve(Arc::clone(&ctx), addr, shutdown));

    let served = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            ctx.updater.stop();
            http.await
        }
        result = &mut http => {
            ctx.updater.stop();
            result
        }
    };

    updater.await.context("Updater task panicked")?;
    served.context("HTTP task panicked")??;

    println!("\n{}", ctx.updater.stats().await);
    Ok(())
}

fn print_config(config: &SimulatorConfig) {
    println!("\n=== Simulator Configuration ===\n");
    println!("Database:             {}", config.database_url);
    println!("Bind Address:         {}", config.bind_addr);
    println!("Update Interval:      {}s", config.update_interval_secs);

    println!("\nPricing:");
    println!("  Endpoints:          {}", config.pricing.endpoints.join(", "));
    println!("  Request Timeout:    {}s", config.pricing.request_timeout_secs);
    println!("  Max Retries:        {}", config.pricing.max_retries);
    println!(
        "  Backoff:            {}ms .. {}ms",
        config.pricing.initial_backoff_ms, config.pricing.max_backoff_ms
    );
    println!("  Stale After:        {}s", config.pricing.stale_after_secs);

    println!("\nPosition Exits:");
    for level in &config.position.pyramid_levels {
        println!(
            "  Pyramid Level:      +{}% -> close {}%",
            level.trigger_pct,
            level.close_ratio * Decimal::ONE_HUNDRED
        );
    }
    println!(
        "  Trailing Stop:      {} ({}% callback)",
        if config.position.trailing_stop_enabled { "on" } else { "off" },
        config.position.trailing_callback_pct
    );

    println!("\nRisk:");
    println!(
        "  Risk Close Ratio:   {}%",
        config.risk.risk_close_ratio * Decimal::ONE_HUNDRED
    );
}

fn print_traders(traders: &[VirtualTrader]) {
    println!(
        "\n{:<36} {:<20} {:>12} {:>8} {:>4} {:>8}",
        "ID", "NAME", "BALANCE", "RETURN", "LEV", "ENABLED"
    );
    println!("{}", "-".repeat(93));

    for t in traders {
        println!(
            "{:<36} {:<20} {:>12.2} {:>7.2}% {:>3}x {:>8}",
            t.id,
            truncate(&t.name, 20),
            t.current_balance,
            t.return_pct(),
            t.leverage,
            if t.enabled { "yes" } else { "no" }
        );
    }
}

fn print_positions(positions: &[SimulatedPosition]) {
    println!(
        "\n{:<36} {:<10} {:<5} {:>12} {:>12} {:>10} {:>12} {:<6}",
        "ID", "SYMBOL", "SIDE", "ENTRY", "MARK", "QTY", "UNREALIZED", "STATUS"
    );
    println!("{}", "-".repeat(110));

    for p in positions {
        println!(
            "{:<36} {:<10} {:<5} {:>12} {:>12} {:>10} {:>12.2} {:<6}",
            p.id,
            p.symbol,
            p.side.as_str(),
            p.entry_price,
            p.current_price,
            p.quantity,
            p.unrealized_pnl,
            p.status.as_str()
        );
    }
}

fn print_trades(trades: &[PaperTrade]) {
    println!(
        "\n{:<19} {:<10} {:<5} {:>12} {:>12} {:>10} {:>12} {}",
        "CLOSED", "SYMBOL", "SIDE", "ENTRY", "EXIT", "QTY", "P&L", "REASON"
    );
    println!("{}", "-".repeat(110));

    for t in trades {
        println!(
            "{:<19} {:<10} {:<5} {:>12} {:>12} {:>10} {:>12.2} {}",
            t.closed_at.format("%Y-%m-%d %H:%M:%S"),
            t.symbol,
            t.side.as_str(),
            t.entry_price,
            t.exit_price,
            t.quantity,
            t.realized_pnl,
            t.exit_reason
        );
    }
}

fn print_metrics(m: &TraderMetrics) {
    println!("\n--- Performance ---");
    println!("Total Trades:   {}", m.total_trades);
    println!("Total P&L:      ${:.2}", m.total_pnl);
    println!("Total Fees:     ${:.2}", m.total_fees);
    println!("Expectancy:     ${:.2}", m.expectancy);

    println!("\n--- Win/Loss ---");
    println!("Win Rate:       {:.1}%", m.win_rate * 100.0);
    println!("Winning Trades: {}", m.winning_trades);
    println!("Losing Trades:  {}", m.losing_trades);
    println!("Avg Win:        ${:.2}", m.avg_win);
    println!("Avg Loss:       ${:.2}", m.avg_loss);
    println!("Largest Win:    ${:.2}", m.largest_win);
    println!("Largest Loss:   ${:.2}", m.largest_loss);
    if m.profit_factor.is_infinite() {
        println!("Profit Factor:  inf");
    } else {
        println!("Profit Factor:  {:.2}", m.profit_factor);
    }

    println!("\n--- Risk ---");
    println!("Max Drawdown:   ${:.2}", m.max_drawdown);
    println!("Sharpe Ratio:   {:.2}", m.sharpe_ratio);
    println!("Avg Duration:   {:.0}s", m.avg_duration_secs);
}

fn parse_side(s: &str) -> Result<Side, String> {
    Side::parse(s).ok_or_else(|| format!("expected LONG or SHORT, got '{}'", s))
}

fn parse_key_value(s: &str) -> Result<(String, f64), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid number in '{}'", s))?;
    Ok((key.trim().to_string(), value))
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
