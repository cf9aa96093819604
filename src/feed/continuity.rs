//! Per-cycle continuity check between the newest upstream page and the
//! ledger tail, with staircase backfill when the two do not touch.
//!
//! ```text
//!  page 0 (size 10) ──▶ gap vs tail ≤ 11s ──▶ [page 0]
//!                               │ > 11s
//!                               ▼
//!     probe pages est..est+3 (size 24) until one reaches back to the tail
//!                               │
//!                               ▼
//!     re-fetch splice..=0 (size 24) ──▶ [page N, ..., page 0]  (oldest first)
//! ```

use anyhow::Result;
use chrono::NaiveDateTime;
use tracing::{error, info, warn};

use super::normalize::Normalizer;
use super::provider::SpinFeed;
use crate::db::models::NewSpin;
use crate::db::{fmt_ts, Database};

/// Tolerance above the normal inter-spin heartbeat before declaring a break.
pub const GAP_THRESHOLD_SECONDS: i64 = 11;
/// Steady-state page size.
pub const PAGE_SIZE: u32 = 10;
/// Page size used while backfilling.
pub const PAGE_SIZE_RECOVERY: u32 = 24;
/// Approximate wall-clock span of one recovery page.
pub const MINUTES_PER_PAGE: f64 = 20.0;
/// Pages probed from the estimated splice page onwards.
pub const PROBE_PAGES: u32 = 4;

/// How this cycle's batches were produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMode {
    /// Feed unavailable or page 0 empty.
    NoData,
    /// Empty ledger; page 0 is the initial seed.
    Seed,
    /// Page 0 is adjacent to the ledger tail.
    Steady,
    /// Continuity break closed by staircase backfill.
    Backfill {
        splice_page: u32,
        /// `false` when no probe reached the tail and page 0 was used instead.
        spliced: bool,
    },
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub mode: FetchMode,
    /// Batches to insert in order, oldest page first.
    pub batches: Vec<Vec<NewSpin>>,
}

impl FetchOutcome {
    fn no_data() -> Self {
        FetchOutcome {
            mode: FetchMode::NoData,
            batches: Vec::new(),
        }
    }
}

pub struct ContinuityEngine<F> {
    feed: F,
    normalizer: Normalizer,
    db: Database,
}

impl<F: SpinFeed> ContinuityEngine<F> {
    pub fn new(feed: F, normalizer: Normalizer, db: Database) -> Self {
        ContinuityEngine {
            feed,
            normalizer,
            db,
        }
    }

    /// Decide what to insert this cycle.
    pub async fn fetch_batches(&self) -> Result<FetchOutcome> {
        let batch = self.fetch_normalized(0, PAGE_SIZE).await;
        let Some(oldest_new) = batch.iter().map(|s| s.started_at).min() else {
            return Ok(FetchOutcome::no_data());
        };

        let Some(tail) = self.db.last_spin()? else {
            info!("Empty ledger, seeding with {} spins", batch.len());
            return Ok(FetchOutcome {
                mode: FetchMode::Seed,
                batches: vec![batch],
            });
        };

        let gap_secs = (oldest_new - tail.ended_at).num_seconds();
        if gap_secs <= GAP_THRESHOLD_SECONDS {
            return Ok(FetchOutcome {
                mode: FetchMode::Steady,
                batches: vec![batch],
            });
        }

        warn!(
            "Continuity break: {}s between tail #{} ({}) and newest page, backfilling",
            gap_secs,
            tail.id,
            fmt_ts(&tail.ended_at)
        );
        Ok(self.staircase(tail.ended_at, gap_secs).await)
    }

    async fn staircase(&self, tail_end: NaiveDateTime, gap_secs: i64) -> FetchOutcome {
        let estimated = (gap_secs as f64 / 60.0 / MINUTES_PER_PAGE) as u32;

        let mut splice = None;
        for page in estimated..estimated + PROBE_PAGES {
            info!("Probing page {} for splice", page);
            let probe = self.fetch_normalized(page, PAGE_SIZE_RECOVERY).await;
            let Some(oldest) = probe.iter().map(|s| s.started_at).min() else {
                continue;
            };
            if oldest <= tail_end {
                info!("Splice found at page {}", page);
                splice = Some(page);
                break;
            }
        }

        let (splice_page, spliced) = match splice {
            Some(p) => (p, true),
            None => {
                error!(
                    "No splice within pages {}..{}, recovering from page 0; a gap may remain",
                    estimated,
                    estimated + PROBE_PAGES - 1
                );
                (0, false)
            }
        };

        let mut batches = Vec::new();
        for page in (0..=splice_page).rev() {
            let batch = self.fetch_normalized(page, PAGE_SIZE_RECOVERY).await;
            if batch.is_empty() {
                warn!("Recovery page {} came back empty", page);
                continue;
            }
            batches.push(batch);
        }

        FetchOutcome {
            mode: FetchMode::Backfill {
                splice_page,
                spliced,
            },
            batches,
        }
    }

    /// Fetch and normalize one page; feed failure means "no data", not an error.
    async fn fetch_normalized(&self, page: u32, size: u32) -> Vec<NewSpin> {
        match self.feed.fetch_page(page, size).await {
            Ok(raw) => self.normalizer.normalize_batch(&raw),
            Err(e) => {
                warn!("{}: no data for page {} this cycle ({})", self.feed.name(), page, e);
                Vec::new()
            }
        }
    }
}
