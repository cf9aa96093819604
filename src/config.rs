use chrono::FixedOffset;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// Spin ledger: continuous ingestion, pattern distances and alerts
#[derive(Parser, Debug, Clone)]
#[command(name = "spin-ledger", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Poll the feed forever (default)
    Run,
    /// List the loaded pattern registry with tracker and alert state
    Patterns,
    /// Reset pattern tracking to the uncalibrated state
    Recalibrate {
        /// Only this pattern id (all patterns when omitted)
        #[arg(long)]
        pattern: Option<String>,
    },
    /// List spins preceded by an unusually long silence
    Audit {
        /// Heartbeat above which a spin is reported
        #[arg(long, default_value = "15")]
        min_gap_secs: i64,

        /// Maximum rows to print
        #[arg(long, default_value = "50")]
        limit: i64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// SQLite ledger path
    #[arg(long, env = "DATABASE_PATH", default_value = "data/db.sqlite3")]
    pub database_path: String,

    /// Paginated spin history endpoint
    #[arg(
        long,
        env = "FEED_URL",
        default_value = "https://api.casinoscores.com/svc-evolution-game-events/api/crazytime"
    )]
    pub feed_url: String,

    /// Upstream table filter
    #[arg(long, env = "FEED_TABLE_ID", default_value = "CrazyTime0000001")]
    pub table_id: String,

    /// Seconds between scheduler ticks
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "180")]
    pub poll_interval_secs: u64,

    /// Seconds to wait after a failed tick
    #[arg(long, env = "ERROR_COOLDOWN_SECS", default_value = "60")]
    pub error_cooldown_secs: u64,

    /// Attempts per feed request before giving up
    #[arg(long, env = "FEED_MAX_RETRIES", default_value = "5")]
    pub max_retries: u32,

    /// Per-request timeout in seconds
    #[arg(long, env = "FEED_TIMEOUT_SECS", default_value = "15")]
    pub request_timeout_secs: u64,

    /// Fixed UTC offset of the deployment, in hours (e.g. -5)
    #[arg(long, env = "UTC_OFFSET_HOURS", default_value = "-5", allow_hyphen_values = true)]
    pub utc_offset_hours: i32,

    /// JSON file replacing the built-in pattern registry
    #[arg(long, env = "PATTERNS_FILE")]
    pub patterns_file: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be positive");
        }
        if self.error_cooldown_secs == 0 {
            anyhow::bail!("error_cooldown_secs must be positive");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be positive");
        }
        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        if !(-14..=14).contains(&self.utc_offset_hours) {
            anyhow::bail!("utc_offset_hours must be between -14 and 14");
        }
        if self.feed_url.trim().is_empty() {
            anyhow::bail!("feed_url must not be empty");
        }
        Ok(())
    }

    pub fn offset(&self) -> anyhow::Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .ok_or_else(|| anyhow::anyhow!("invalid UTC offset {}h", self.utc_offset_hours))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("spin-ledger").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let cli = parse(&[]);
        assert_eq!(cli.command, None);
        cli.config.validate().unwrap();
        assert_eq!(cli.config.poll_interval(), Duration::from_secs(180));
        assert_eq!(cli.config.offset().unwrap().utc_minus_local(), 5 * 3600);
    }

    #[test]
    fn parses_subcommands() {
        let cli = parse(&["recalibrate", "--pattern", "pachinko"]);
        assert_eq!(
            cli.command,
            Some(Command::Recalibrate {
                pattern: Some("pachinko".into())
            })
        );
        let cli = parse(&["--utc-offset-hours", "2", "audit", "--min-gap-secs", "30"]);
        assert_eq!(cli.config.utc_offset_hours, 2);
        assert_eq!(
            cli.command,
            Some(Command::Audit {
                min_gap_secs: 30,
                limit: 50
            })
        );
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = parse(&[]).config;
        config.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = parse(&[]).config;
        config.utc_offset_hours = 15;
        assert!(config.validate().is_err());

        let mut config = parse(&[]).config;
        config.max_retries = 0;
        assert!(config.validate().is_err());
    }
}
