//! UFO Forex Trading Controller
//!
//! Runs a periodic main cycle and a faster monitoring tick against a broker
//! bridge, closing positions on P&L rules, currency-strength reversals and a
//! portfolio equity stop.

mod api;
mod backtest;
mod bot;
mod db;
mod metrics;
mod models;
mod trading;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{
    BridgeClient, ChannelEventSink, EventSink, HttpDecisionPipeline, SystemClock, TracingEventSink,
};
use crate::backtest::{ReplayData, Replayer};
use crate::bot::{Collaborators, CycleOrchestrator};
use crate::db::Database;
use crate::trading::TradingConfig;

/// UFO forex trading controller CLI.
#[derive(Parser)]
#[command(name = "ufotrader")]
#[command(about = "Periodic forex trading controller driven by currency strength", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "UFO_DATABASE_URL", default_value = "sqlite:./ufotrader.db?mode=rwc")]
    database_url: String,

    /// TOML configuration file; missing keys use defaults
    #[arg(short, long, env = "UFO_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trade live through the broker bridge
    Run {
        /// Base URL of the broker terminal bridge
        #[arg(long, env = "UFO_BRIDGE_URL", default_value = "http://127.0.0.1:8765")]
        bridge_url: String,

        /// Base URL of the decision pipeline
        #[arg(long, env = "UFO_DECISION_URL", default_value = "http://127.0.0.1:8766")]
        decision_url: String,

        /// Append trading events as JSON lines to this file instead of the log
        #[arg(long)]
        events_file: Option<PathBuf>,
    },

    /// Replay recorded frames through the same cycles with a paper broker
    Replay {
        /// JSON frame file
        #[arg(short, long)]
        data: PathBuf,

        /// Persist replay snapshots to the database
        #[arg(long)]
        persist: bool,
    },

    /// Show the effective configuration
    Config,

    /// Show recent portfolio history
    History {
        /// Number of snapshots to show
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Also list positions closed within this many hours
        #[arg(long)]
        closed_hours: Option<i64>,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<TradingConfig> {
    let config = match path {
        Some(path) => TradingConfig::load(path)?,
        None => TradingConfig::default(),
    };
    config.validate().context("Configuration rejected")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            bridge_url,
            decision_url,
            events_file,
        } => {
            info!(bridge = %bridge_url, decision = %decision_url, "Starting live trading");

            let bridge = Arc::new(
                BridgeClient::with_timeout(&bridge_url, config.call_timeout())?
                    .with_symbol_suffix(config.symbol_suffix.clone()),
            );
            let services = Collaborators {
                market: bridge.clone(),
                strength: bridge.clone(),
                pipeline: Arc::new(HttpDecisionPipeline::new(&decision_url)?),
                broker: bridge,
                clock: Arc::new(SystemClock),
                events: match events_file {
                    Some(path) => spawn_event_writer(path).await?,
                    None => Arc::new(TracingEventSink),
                },
            };

            let db = Database::new(&cli.database_url).await?;
            let orchestrator = CycleOrchestrator::new(config.clone(), services)?.with_database(db);

            println!("\n=== UFO Trading Controller ===");
            println!("Bridge:          {}", bridge_url);
            println!("Decisions:       {}", decision_url);
            println!("Symbols:         {}", config.symbols.join(", "));
            println!("Main cycle:      {}m", config.main_cycle_period_minutes);
            println!("Monitoring:      {}m", config.monitoring_period_minutes);
            println!("Equity stop:     {}%", config.equity_stop_pct);
            println!("\nPress Ctrl+C to stop.\n");

            Arc::new(orchestrator).run().await?;
        }

        Commands::Replay { data, persist } => {
            let frames = ReplayData::load(&data)?;
            info!(path = %data.display(), frames = frames.frames.len(), "Loaded replay data");

            let db = if persist {
                Some(Database::new(&cli.database_url).await?)
            } else {
                None
            };

            let report = Replayer::new(config, frames)
                .run(Arc::new(TracingEventSink), db)
                .await?;
            println!("{}", report);
        }

        Commands::Config => {
            let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;

            println!("\n=== Trading Configuration ===\n");
            println!("Trailing stop:   {}", config.trailing_strategy);
            println!("Session:         {:02}:00-{:02}:00 UTC", config.session_start_hour, config.session_end_hour);
            println!();
            println!("{}", rendered);
        }

        Commands::History { limit, closed_hours } => {
            let db = Database::new(&cli.database_url).await?;
            let rows = db.get_history(limit).await?;

            if rows.is_empty() {
                println!("No portfolio history recorded. Run 'ufotrader run' first.");
                return Ok(());
            }

            println!(
                "\n{:<27} {:>12} {:>12} {:>12} {:>6}",
                "TIMESTAMP", "EQUITY", "REALIZED", "UNREALIZED", "OPEN"
            );
            println!("{}", "-".repeat(73));
            for row in rows {
                println!(
                    "{:<27} {:>12} {:>12} {:>12} {:>6}",
                    truncate(&row.timestamp, 25),
                    row.equity_value,
                    row.realized_pnl,
                    row.unrealized_pnl,
                    row.position_count
                );
            }

            if let Some(hours) = closed_hours {
                let since = chrono::Utc::now() - chrono::Duration::hours(hours.clamp(0, 24 * 365));
                let closed = db.get_closed_positions(since).await?;

                println!("\n--- Closed Positions ({}) ---", closed.len());
                for pos in &closed {
                    println!(
                        "  #{:<10} {:<7} {:<5} {:>6} @ {:<10} {:>10} {}",
                        pos.ticket,
                        pos.symbol,
                        pos.direction,
                        pos.volume,
                        pos.entry_price,
                        pos.pnl,
                        pos.close_reason.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }

    Ok(())
}

/// Forward events through a bounded channel to a JSON-lines file.
async fn spawn_event_writer(path: PathBuf) -> Result<Arc<dyn EventSink>> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open events file {}", path.display()))?;

    let (sink, mut rx) = ChannelEventSink::new(1024);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize event");
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!(error = %e, "Failed to write event");
            }
        }
    });

    Ok(Arc::new(sink))
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
