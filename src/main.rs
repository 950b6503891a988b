//! Cross-Venue Maker - Main Entry Point
//!
//! Runs the automation engine, or inspects and edits the stored automations
//! without starting it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cross_venue_maker::config::Config;
use cross_venue_maker::exchange::{RetryPolicy, VenueRegistry};
use cross_venue_maker::notify::{BroadcastNotifier, Event};
use cross_venue_maker::persistence::{AutomationStore, SqliteStore};
use cross_venue_maker::strategy::{Automation, ConversionFeed, Engine, EngineContext};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Cross-Venue Maker CLI
#[derive(Parser)]
#[command(name = "cross-venue-maker")]
#[command(version, about = "Cross-venue market making with hedged fills")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every stored automation and keep them running
    Run {
        /// Mirror market data from the venues but simulate orders
        #[arg(long)]
        paper: bool,
    },

    /// Show the stored automations
    Status {
        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Show prices and runtime details of every operation
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate an automation record and store it
    Import {
        /// JSON file holding one automation
        #[arg(short, long)]
        file: String,

        #[arg(short, long)]
        db: Option<String>,
    },

    /// Delete a stored automation
    Remove {
        #[arg(short, long)]
        id: String,

        #[arg(short, long)]
        db: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    init_logging(&config.logging.dir)?;

    match cli.command {
        Some(Commands::Status { db, verbose }) => {
            show_status(&db.unwrap_or(config.persistence.db_path), verbose)
        }
        Some(Commands::Import { file, db }) => {
            import_automation(&file, &db.unwrap_or(config.persistence.db_path))
        }
        Some(Commands::Remove { id, db }) => {
            remove_automation(&id, &db.unwrap_or(config.persistence.db_path))
        }
        Some(Commands::Run { paper }) => run(config, paper).await,
        None => run(config, false).await,
    }
}

async fn run(config: Config, paper: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Cross-Venue Maker v{}                        ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    config.validate()?;
    log_config(&config, paper);

    let venues = VenueRegistry::from_config(&config, paper).await;
    if venues.ids().is_empty() {
        warn!("⚠️  No venue is ready; stored automations will fail to start");
    }

    let notifier = Arc::new(BroadcastNotifier::new());
    let store = Arc::new(SqliteStore::new(&config.persistence.db_path)?);
    let conversion = ConversionFeed::from_config(
        &config.conversion,
        &config.streams,
        RetryPolicy::reads(&config.retry),
        &venues,
        notifier.clone(),
    );

    spawn_event_log(&notifier);

    let ctx = Arc::new(EngineContext {
        config: Arc::new(config),
        notifier,
        store,
        conversion: conversion.subscribe(),
    });
    let engine = Engine::new(venues, ctx);

    let loader = {
        let engine = engine.clone();
        tokio::spawn(async move {
            match engine.load_all().await {
                Ok(started) => info!("🚀 {} automations running", started),
                Err(e) => error!("Failed to load automations: {:#}", e),
            }
        })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("🛑 Shutdown signal received");

    loader.abort();
    let stopped = engine.shutdown();
    drop(conversion);

    info!("👋 Cross-Venue Maker shutdown complete ({} automations stopped, orders left resting)", stopped);
    Ok(())
}

/// Log every published event as a JSON line at debug level.
fn spawn_event_log(notifier: &BroadcastNotifier) {
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if matches!(event, Event::Alert(_)) {
                        // already emitted under engine_alert
                        continue;
                    }
                    match serde_json::to_string(&event) {
                        Ok(json) => debug!(target: "engine_event", "{}", json),
                        Err(e) => warn!("Failed to encode event: {}", e),
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(dir: &str) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(dir)?;

    let file_appender = tracing_appender::rolling::hourly(dir, "cross-venue-maker.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("cross_venue_maker=debug".parse()?)
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
fn log_config(config: &Config, paper: bool) {
    info!("📋 Configuration:");
    info!("   Mode: {}", if paper { "paper" } else { "live" });
    let mut venues: Vec<_> = config.venues.iter().collect();
    venues.sort_by(|a, b| a.0.cmp(b.0));
    for (id, venue) in venues {
        info!(
            "   Venue {}: {:?}, fee {}, {} req / {} ms",
            id,
            venue.kind,
            venue.percentage,
            venue.rate_limit(),
            venue.rate_window_ms
        );
    }
    info!(
        "   Watchdogs: keep-alive {}s, stalled {}s, go-back {}s",
        config.engine.keep_alive_secs, config.engine.stalled_secs, config.engine.go_back_secs
    );
    match (&config.conversion.fixed_rate, &config.conversion.venue) {
        (Some(rate), _) => info!("   Conversion: fixed {}", rate),
        (None, Some(venue)) => info!("   Conversion: {} on {}", config.conversion.symbol, venue),
        (None, None) => info!("   Conversion: none"),
    }
    info!("   Database: {}", config.persistence.db_path);
}

fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              STORED AUTOMATIONS                            ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   No automation has been imported yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SqliteStore::new(db_path)?;
    let automations = store.load_all()?;
    if automations.is_empty() {
        println!("\n❌ No automations stored.");
        return Ok(());
    }

    for automation in &automations {
        println!(
            "\n📊 {}  {} {} ⇄ {} {}",
            automation.id,
            automation.venue_a,
            automation.symbol_a,
            automation.venue_b,
            automation.symbol_b
        );
        println!(
            "   ├─ Base Amounts:  buy {} / sell {}",
            automation.buy_amount, automation.sell_amount
        );
        if let Some(updated) = automation.updated_at {
            println!("   ├─ Last Updated:  {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        println!("   └─ Operations:    {}", automation.operations.len());

        for op in &automation.operations {
            println!(
                "      ┌─ {} {} ({}) {}",
                op.side,
                op.id,
                op.status,
                op.reason.as_deref().unwrap_or("")
            );
            println!("      ├─ Remaining: {} of {}", op.remaining, op.amount);
            if verbose {
                let show = |value: Option<rust_decimal::Decimal>| {
                    value.map_or_else(|| "-".to_string(), |v| v.to_string())
                };
                println!("      ├─ Last Price:      {}", show(op.last_price));
                println!("      ├─ Min Price:       {}", show(op.min_price));
                println!("      ├─ Execution Price: {}", show(op.execution_price));
                println!("      ├─ Waiting Hedge:   {}", op.waiting_amount);
                println!("      ├─ Hedged:          {}", if op.trade { "yes" } else { "no" });
            }
            println!("      └─ Order:     {}", op.order_id.as_deref().unwrap_or("none"));
        }
    }

    println!();
    Ok(())
}

fn import_automation(file: &str, db_path: &str) -> Result<()> {
    let json = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))?;
    let automation: Automation =
        serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", file))?;
    automation
        .validate()
        .with_context(|| format!("Automation {} is invalid", automation.id))?;

    let store = SqliteStore::new(db_path)?;
    store.save(&automation)?;

    println!(
        "✅ Imported {} ({} operations) into {}",
        automation.id,
        automation.operations.len(),
        db_path
    );
    Ok(())
}

fn remove_automation(id: &str, db_path: &str) -> Result<()> {
    let store = SqliteStore::new(db_path)?;
    let Some(automation) = store.get(id)? else {
        println!("❌ No automation {} in {}", id, db_path);
        return Ok(());
    };
    store.delete(id)?;
    println!("✅ Removed {}", id);
    println!(
        "   Orders it left on {} {} stay open until canceled on the venue.",
        automation.venue_a, automation.symbol_a
    );
    Ok(())
}
