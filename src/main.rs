//! Straddle Runner - Main Entry Point
//!
//! Polls volatility for the configured universe and trades long straddles on
//! Alpaca (paper by default).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use straddle_runner::broker::alpaca::types::Order;
use straddle_runner::broker::{
    position_belongs_to, AccountService, AlpacaClient, BrokerPosition, OccSymbol, OrderService,
};
use straddle_runner::error::BrokerError;
use straddle_runner::config::Config;
use straddle_runner::strategy::{entry_signal, MarketHours, Scheduler, StraddleEngine};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Straddle Runner CLI
#[derive(Parser)]
#[command(name = "straddle-runner")]
#[command(version, about = "Volatility-driven long straddles on Alpaca")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading loop (default)
    Run {
        /// Run a single pass over the universe and exit
        #[arg(long)]
        once: bool,
    },

    /// Show account snapshot and open positions
    Status {
        /// Show contract details for each position
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the volatility signal for a symbol without trading
    Check {
        /// Underlying symbol (e.g. SPY)
        symbol: String,
    },

    /// Liquidate one position at market
    Close {
        /// Position symbol as listed by `status` (e.g. SPY250117C00450000)
        symbol: String,
    },
}

/// Orders listed by `status`.
const RECENT_ORDERS: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;

    match cli.command.unwrap_or(Commands::Run { once: false }) {
        Commands::Run { once } => run(config, once).await,
        Commands::Status { verbose } => show_status(&config, verbose).await,
        Commands::Check { symbol } => check_symbol(&config, &symbol).await,
        Commands::Close { symbol } => close_symbol(&config, &symbol).await,
    }
}

async fn run(config: Config, once: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Straddle Runner v{}                          ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    if config.alpaca.paper {
        info!("📝 PAPER TRADING MODE - Alpaca paper endpoint");
    } else {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
    }

    anyhow::ensure!(
        !config.alpaca.api_key.is_empty() && !config.alpaca.secret_key.is_empty(),
        "Alpaca credentials missing: set STRADDLE__ALPACA__API_KEY/SECRET_KEY or APCA_API_KEY_ID/APCA_API_SECRET_KEY"
    );

    log_config(&config);

    let client = Arc::new(
        AlpacaClient::new(&config.alpaca).context("Failed to create Alpaca client")?,
    );

    match client.account().await {
        Ok(account) => info!(
            "✅ [INIT] Account: cash ${:.2} | equity ${:.2} | options buying power ${:.2}",
            account.cash, account.equity, account.options_buying_power
        ),
        Err(e) => warn!("⚠️  [INIT] Failed to load account: {}", e),
    }

    match client.is_market_open().await {
        Ok(open) => info!("🕘 [INIT] Broker reports market {}", if open { "OPEN" } else { "CLOSED" }),
        Err(e) => warn!("⚠️  [INIT] Failed to read market clock: {}", e),
    }

    let hours = MarketHours::from_config(&config.session)?;
    let engine = StraddleEngine::new(client, config.strategy.clone())
        .with_market_hours(hours)
        .with_call_timeout(Duration::from_secs(config.scheduler.call_timeout_secs));

    let mut scheduler = Scheduler::new(
        engine,
        config.strategy.symbols.clone(),
        Duration::from_secs(config.scheduler.poll_interval_secs),
    );
    if once {
        scheduler = scheduler.with_max_cycles(1);
    }

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received, finishing current symbol");
        shutdown_tx.send(true).ok();
    });

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let metrics = scheduler.run(shutdown_rx).await;

    let open = scheduler.engine().open_positions().count();
    if open > 0 {
        warn!(
            "⚠️  {} straddle(s) remain open at the broker; they are adopted on next start",
            open
        );
    }

    info!(
        "👋 Done: {} cycles, {} entries, {} exits",
        metrics.cycles, metrics.entries, metrics.exits
    );

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // File appender for detailed logs
    let file_appender = tracing_appender::rolling::hourly("logs", "straddle-runner.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the guard alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("straddle_runner=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let strategy = &config.strategy;
    info!("📋 Configuration:");
    info!("   Symbols: {}", strategy.symbols.join(", "));
    info!("   Entry: IV > {:.2} x HV", strategy.entry_multiplier);
    info!(
        "   Exit: IV < {:.0}% of entry IV | profit +{:.0}% | stop -{:.0}%",
        strategy.exit_iv_fraction * 100.0,
        strategy.profit_target * dec!(100),
        strategy.stop_loss * dec!(100)
    );
    info!(
        "   Sizing: max {} straddle(s), {:.0}% of options buying power",
        strategy.max_straddles,
        strategy.capital_fraction * dec!(100)
    );
    info!(
        "   Expirations: {}-{} days | HV lookback {} days (min {} points)",
        strategy.expiry_min_days,
        strategy.expiry_max_days,
        strategy.lookback_days,
        strategy.min_observations
    );
    info!("   Orders: {:?}", strategy.order_kind);
    info!(
        "   Poll interval: {}s | call timeout: {}s",
        config.scheduler.poll_interval_secs, config.scheduler.call_timeout_secs
    );
    if config.session.enforce {
        info!(
            "   Session: {}-{} US/Eastern, Mon-Fri",
            config.session.open, config.session.close
        );
    } else {
        warn!("   Session gate disabled");
    }
}

/// Print account and positions.
async fn show_status(config: &Config, verbose: bool) -> Result<()> {
    let client = AlpacaClient::new(&config.alpaca).context("Failed to create Alpaca client")?;

    let account = client.account().await.context("Failed to fetch account")?;
    let positions = client
        .list_positions()
        .await
        .context("Failed to fetch positions")?;
    let market_open = client.is_market_open().await.ok();
    let orders = client.recent_orders(RECENT_ORDERS).await;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              STRADDLE RUNNER STATUS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    println!(
        "\n📊 Account ({})",
        if config.alpaca.paper { "paper" } else { "LIVE" }
    );
    println!("   ├─ Cash:                  ${:.2}", account.cash);
    println!("   ├─ Equity:                ${:.2}", account.equity);
    println!("   └─ Options Buying Power:  ${:.2}", account.options_buying_power);

    match market_open {
        Some(true) => println!("\n🕘 Market: OPEN"),
        Some(false) => println!("\n🕘 Market: CLOSED"),
        None => println!("\n🕘 Market: unknown"),
    }

    match orders {
        Ok(orders) => print_orders(&orders),
        Err(e) => println!("\n🧾 Recent orders unavailable: {}", e),
    }

    if positions.is_empty() {
        println!("\n📭 No open positions");
        return Ok(());
    }

    for symbol in &config.strategy.symbols {
        let held: Vec<&BrokerPosition> = positions
            .iter()
            .filter(|p| position_belongs_to(&p.symbol, symbol))
            .collect();
        if held.is_empty() {
            continue;
        }
        println!("\n🔓 {}", symbol);
        print_positions(&held, verbose);
    }

    let other: Vec<&BrokerPosition> = positions
        .iter()
        .filter(|p| {
            !config
                .strategy
                .symbols
                .iter()
                .any(|s| position_belongs_to(&p.symbol, s))
        })
        .collect();
    if !other.is_empty() {
        println!("\n📦 Outside universe");
        print_positions(&other, verbose);
    }

    Ok(())
}

fn print_orders(orders: &[Order]) {
    if orders.is_empty() {
        println!("\n🧾 No recent orders");
        return;
    }

    println!("\n🧾 Recent orders");
    for (i, order) in orders.iter().enumerate() {
        let branch = if i + 1 == orders.len() { "└─" } else { "├─" };
        let submitted = order
            .submitted_at
            .map_or("-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        println!(
            "   {} {} {} x{} {} | {:?} | {}",
            branch,
            submitted,
            order.side.map_or("-".to_string(), |s| format!("{:?}", s).to_lowercase()),
            order.qty.map_or("-".to_string(), |q| q.to_string()),
            order.symbols().join(" + "),
            order.status,
            order.id
        );
    }
}

fn print_positions(positions: &[&BrokerPosition], verbose: bool) {
    for (i, position) in positions.iter().enumerate() {
        let branch = if i + 1 == positions.len() { "└─" } else { "├─" };
        println!(
            "   {} {} x{} | value {} | PnL {}",
            branch,
            position.symbol,
            position.quantity,
            position
                .market_value
                .map_or("n/a".to_string(), |v| format!("${:.2}", v)),
            position
                .unrealized_pnl()
                .map_or("n/a".to_string(), |pnl| format!("${:+.2}", pnl))
        );
        if verbose {
            if let Some(occ) = OccSymbol::parse(&position.symbol) {
                println!(
                    "   │    {} {} strike {} exp {}",
                    occ.root, occ.kind, occ.strike, occ.expiration
                );
            }
        }
    }
}

/// Print HV, IV and the entry decision for one symbol.
async fn check_symbol(config: &Config, symbol: &str) -> Result<()> {
    let symbol = symbol.to_uppercase();
    let client = Arc::new(
        AlpacaClient::new(&config.alpaca).context("Failed to create Alpaca client")?,
    );
    let engine = StraddleEngine::new(client, config.strategy.clone())
        .with_call_timeout(Duration::from_secs(config.scheduler.call_timeout_secs));

    let estimate = engine.volatility(&symbol).await;
    let multiplier = config.strategy.entry_multiplier;

    println!("\n🔎 {}", symbol);
    match estimate.historical {
        Some(hv) => println!("   ├─ Historical volatility: {:.2}%", hv * 100.0),
        None => println!("   ├─ Historical volatility: unavailable"),
    }
    match estimate.implied {
        Some(iv) => println!("   ├─ Implied volatility:    {:.2}%", iv * 100.0),
        None => println!("   ├─ Implied volatility:    unavailable"),
    }

    match estimate.both() {
        Some((hv, iv)) => {
            let fires = entry_signal(hv, iv, multiplier);
            println!(
                "   └─ Entry threshold {:.2}% -> {}",
                hv * multiplier * 100.0,
                if fires { "✅ ENTER" } else { "⏸  no signal" }
            );
        }
        None => println!("   └─ ❌ Cannot evaluate signal"),
    }

    Ok(())
}

/// Liquidate one position by symbol.
async fn close_symbol(config: &Config, symbol: &str) -> Result<()> {
    let symbol = symbol.to_uppercase();
    let client = AlpacaClient::new(&config.alpaca).context("Failed to create Alpaca client")?;

    if !config.alpaca.paper {
        warn!("⚠️  Closing {} on the LIVE account", symbol);
    }

    match client.close_position(&symbol).await {
        Ok(order) => {
            info!("✅ [CLOSE] {} close order {} ({:?})", symbol, order.id, order.status);
            println!("\n✅ Close order for {} submitted: {} ({:?})", symbol, order.id, order.status);
            Ok(())
        }
        Err(BrokerError::PositionNotFound(_)) => {
            println!("\n📭 No open position in {}", symbol);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to close {}", symbol)),
    }
}
