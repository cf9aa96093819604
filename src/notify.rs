use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::patterns::{Alert, AlertKind};

/// Destination for emitted alerts (chat bot, webhook, log).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<()>;

    fn name(&self) -> &str;
}

/// Writes each alert as one structured JSON log line.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::to_string(alert).context("Failed to serialize alert")?;
        match alert.kind {
            AlertKind::PatternHit => info!(target: "alerts", kind = "pattern_hit", "{}", payload),
            AlertKind::ThresholdReached => {
                info!(target: "alerts", kind = "threshold_reached", "{}", payload)
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
