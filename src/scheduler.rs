use anyhow::Result;
use chrono::{FixedOffset, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::db::{fmt_ts, Database, StateEntry};
use crate::feed::{ContinuityEngine, FetchMode, SpinFeed};
use crate::notify::AlertSink;
use crate::patterns::{AlertEngine, PatternTracker};

const MODULE: &str = "scheduler";

/// Summary of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub mode: FetchMode,
    pub inserted: usize,
    pub processed: usize,
    pub alerts: usize,
}

/// One sequential pass: fetch, append, track, alert, deliver.
pub struct Pipeline<F> {
    continuity: ContinuityEngine<F>,
    db: Database,
    tracker: PatternTracker,
    alerts: AlertEngine,
    sinks: Vec<Arc<dyn AlertSink>>,
    offset: FixedOffset,
}

impl<F: SpinFeed> Pipeline<F> {
    pub fn new(
        continuity: ContinuityEngine<F>,
        db: Database,
        tracker: PatternTracker,
        alerts: AlertEngine,
        sinks: Vec<Arc<dyn AlertSink>>,
        offset: FixedOffset,
    ) -> Self {
        Pipeline {
            continuity,
            db,
            tracker,
            alerts,
            sinks,
            offset,
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let outcome = self.continuity.fetch_batches().await?;
        let inserted: usize = outcome
            .batches
            .iter()
            .map(|batch| self.db.insert_batch(batch))
            .sum();
        if inserted > 0 {
            info!("Ledger: {} new spins ({:?})", inserted, outcome.mode);
        }

        let processed = self.tracker.process_new_spins()?;
        let alerts = self.alerts.check_all()?;
        for alert in &alerts {
            for sink in &self.sinks {
                if let Err(e) = sink.deliver(alert).await {
                    error!(
                        "Failed to deliver {:?} alert for {} via {}: {:#}",
                        alert.kind,
                        alert.pattern_id,
                        sink.name(),
                        e
                    );
                }
            }
        }

        self.record_run()?;
        Ok(TickReport {
            mode: outcome.mode,
            inserted,
            processed,
            alerts: alerts.len(),
        })
    }

    fn record_run(&self) -> Result<()> {
        let cycles: u64 = self.db.get_state(MODULE, "cycle_count")?.unwrap_or(0);
        let now = Utc::now().with_timezone(&self.offset).naive_local();
        self.db.set_states(&[
            StateEntry::new(MODULE, "last_run", &fmt_ts(&now))?,
            StateEntry::new(MODULE, "cycle_count", &(cycles + 1))?,
        ])
    }

    /// Tick until `shutdown` flips to `true`.
    ///
    /// Shutdown is only honoured between ticks; a tick in progress always
    /// runs to completion.
    pub async fn run(
        &self,
        poll_interval: Duration,
        error_cooldown: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            "Scheduler started (every {:?}, {:?} cooldown after errors)",
            poll_interval, error_cooldown
        );
        loop {
            let wait = match self.tick().await {
                Ok(report) => {
                    info!(
                        "Tick complete: {} inserted, {} tracked, {} alerts",
                        report.inserted, report.processed, report.alerts
                    );
                    poll_interval
                }
                Err(e) => {
                    error!("Tick failed: {:#}", e);
                    error_cooldown
                }
            };

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed");
                    }
                    break;
                }
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested, finishing current tick");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::continuity::tests::Timeline;
    use crate::feed::normalize::tests::lima;
    use crate::patterns::{
        builtin, Alert, AlertKind, AlertLevel, Matcher, PatternDefinition, Patterns,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for Recorder {
        async fn deliver(&self, alert: &Alert) -> Result<()> {
            self.seen.lock().unwrap().push(alert.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    struct Broken;

    #[async_trait]
    impl AlertSink for Broken {
        async fn deliver(&self, _alert: &Alert) -> Result<()> {
            anyhow::bail!("chat API down")
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn pipeline(
        patterns: Patterns,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> (Database, Pipeline<Timeline>) {
        let db = Database::open(":memory:").unwrap();
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let pipeline = Pipeline::new(
            ContinuityEngine::new(Timeline::new(30), lima(), db.clone()),
            db.clone(),
            PatternTracker::new(db.clone(), patterns.clone()),
            AlertEngine::new(db.clone(), patterns, offset),
            sinks,
            offset,
        );
        (db, pipeline)
    }

    #[tokio::test]
    async fn ticks_are_idempotent_over_the_same_page() {
        let (db, pipeline) = pipeline(builtin().into(), Vec::new());

        let first = pipeline.tick().await.unwrap();
        assert_eq!(first.mode, FetchMode::Seed);
        assert_eq!(first.inserted, 10);
        assert_eq!(first.processed, 10);

        let second = pipeline.tick().await.unwrap();
        assert_eq!(second.mode, FetchMode::Steady);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.processed, 0);
        assert_eq!(db.spin_count().unwrap(), 10);
        assert_eq!(db.get_state::<u64>(MODULE, "cycle_count").unwrap(), Some(2));
        assert!(db.get_state::<String>(MODULE, "last_run").unwrap().is_some());
    }

    #[tokio::test]
    async fn alerts_reach_sinks_despite_a_failing_one() {
        // Page 0 holds Pachinko as its oldest spin, followed by nine others.
        let patterns: Patterns = vec![PatternDefinition {
            id: "pachinko".into(),
            name: "Pachinko".into(),
            matcher: Matcher::Simple("Pachinko".into()),
            warning_thresholds: vec![3],
            betting_windows: vec![(5, 8)],
            alert_level: AlertLevel::Vip,
        }]
        .into();
        let recorder = Arc::new(Recorder::default());
        let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(Broken), recorder.clone()];
        let (db, pipeline) = pipeline(patterns, sinks);

        assert_eq!(pipeline.tick().await.unwrap().alerts, 0);
        assert_eq!(db.spin_by_id(1).unwrap().unwrap().outcome, "Pachinko");

        let report = pipeline.tick().await.unwrap();
        assert_eq!(report.alerts, 1);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, AlertKind::ThresholdReached);
        assert_eq!(seen[0].spin_count, 9);
    }

    #[tokio::test]
    async fn run_stops_after_the_tick_when_shutdown_is_pending() {
        let (db, pipeline) = pipeline(builtin().into(), Vec::new());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        pipeline
            .run(Duration::from_secs(3600), Duration::from_secs(3600), rx)
            .await
            .unwrap();
        assert_eq!(db.spin_count().unwrap(), 10);
    }
}
