use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

mod config;
mod db;
mod feed;
mod notify;
mod patterns;
mod scheduler;

use config::{Cli, Command, Config};
use db::{fmt_ts, Database};
use feed::{ContinuityEngine, FeedClient, Normalizer, RetryPolicy};
use notify::{AlertSink, LogSink};
use patterns::{AlertEngine, PatternTracker, Patterns};
use scheduler::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config;
    config.validate()?;

    let patterns = patterns::load(config.patterns_file.as_deref())?;
    info!("Loaded {} patterns", patterns.len());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config, patterns).await,
        Command::Patterns => list_patterns(&config, &patterns),
        Command::Recalibrate { pattern } => recalibrate(&config, patterns, pattern.as_deref()),
        Command::Audit {
            min_gap_secs,
            limit,
        } => audit(&config, min_gap_secs, limit),
    }
}

async fn run(config: &Config, patterns: Patterns) -> Result<()> {
    // A missing ledger table aborts here, before any polling starts.
    let db = Database::open(&config.database_path)?;
    info!(
        "Ledger opened: {} ({} spins)",
        config.database_path,
        db.spin_count()?
    );

    let offset = config.offset()?;
    let policy = RetryPolicy {
        max_attempts: config.max_retries,
        ..RetryPolicy::default()
    };
    let client = FeedClient::new(
        &config.feed_url,
        &config.table_id,
        config.request_timeout(),
        policy,
    )?;

    let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];
    let pipeline = Pipeline::new(
        ContinuityEngine::new(client, Normalizer::new(offset), db.clone()),
        db.clone(),
        PatternTracker::new(db.clone(), patterns.clone()),
        AlertEngine::new(db, patterns, offset),
        sinks,
        offset,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        scheduler::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    pipeline
        .run(config.poll_interval(), config.error_cooldown(), shutdown_rx)
        .await
}

fn list_patterns(config: &Config, patterns: &Patterns) -> Result<()> {
    let db = Database::open_read_only(&config.database_path)?;
    let tail = db.max_id()?.unwrap_or(0);
    let tracker = PatternTracker::new(db.clone(), patterns.clone());
    let alerts = AlertEngine::new(db, patterns.clone(), config.offset()?);

    println!(
        "ledger tail: #{}  tracker cursor: #{}",
        tail,
        tracker.progress()?.last_processed_id
    );
    for p in patterns.iter() {
        let t = tracker.state(&p.id)?;
        let a = alerts.state(&p.id)?;
        let last = t
            .last_occurrence_id
            .map(|id| format!("#{}", id))
            .unwrap_or_else(|| "uncalibrated".to_string());
        println!(
            "{:<10} {:<14} {:?} last={} waiting={} previous={} sent={:?}",
            p.id, p.name, p.alert_level, last, t.current_distance, t.previous_distance, a.alerts_sent
        );
    }
    Ok(())
}

fn recalibrate(config: &Config, patterns: Patterns, pattern: Option<&str>) -> Result<()> {
    let db = Database::open(&config.database_path)?;
    let tracker = PatternTracker::new(db.clone(), patterns.clone());
    let alerts = AlertEngine::new(db, patterns, config.offset()?);

    let reset = tracker.recalibrate(pattern)?;
    alerts.reset(&reset)?;
    info!("Recalibrated {} pattern(s): {}", reset.len(), reset.join(", "));
    Ok(())
}

fn audit(config: &Config, min_gap_secs: i64, limit: i64) -> Result<()> {
    let db = Database::open_read_only(&config.database_path)?;
    let gaps = db.heartbeat_gaps(min_gap_secs, limit)?;
    if gaps.is_empty() {
        println!("No heartbeat above {}s", min_gap_secs);
    }
    for spin in gaps {
        println!(
            "#{:<8} {} {:<10} heartbeat {}s",
            spin.id,
            fmt_ts(&spin.started_at),
            spin.outcome,
            spin.heartbeat_seconds
        );
    }
    Ok(())
}
