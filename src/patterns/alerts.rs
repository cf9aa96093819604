use anyhow::Result;
use chrono::{FixedOffset, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::tracker::{PatternTracker, PatternTrackerState};
use super::{PatternDefinition, Patterns};
use crate::db::models::{Spin, SpinDetails};
use crate::db::{Database, StateEntry};

pub const MODULE: &str = "alert_manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ThresholdReached,
    PatternHit,
}

/// Kind-specific payload of an [`Alert`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "detail", rename_all = "snake_case")]
pub enum AlertDetails {
    Threshold {
        /// First spin of the run being measured
        start_id: i64,
    },
    Hit {
        spin_id: i64,
        outcome: Option<String>,
        started_at: Option<NaiveDateTime>,
        /// Betting window the closed run landed in
        window: Option<(i64, i64)>,
        spin: Option<SpinDetails>,
    },
}

/// One notification-worthy event. Emitted, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub pattern_id: String,
    pub pattern_name: String,
    /// Threshold crossed, or the closed run length for a hit
    pub value: i64,
    pub spin_count: i64,
    pub timestamp: NaiveDateTime,
    pub details: AlertDetails,
}

/// Per-pattern alert memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertManagerState {
    pub last_processed_id: i64,
    /// Thresholds already notified since the last hit.
    pub alerts_sent: BTreeSet<i64>,
}

/// Distance to check against thresholds and the id the measured run starts at.
///
/// A fresh hit is judged on the run it just closed; otherwise on the run still
/// open. `None` while the pattern is uncalibrated.
pub fn evaluation_point(tracker: &PatternTrackerState, is_hit: bool) -> Option<(i64, i64)> {
    let last = tracker.last_occurrence_id?;
    Some(if is_hit {
        (tracker.previous_distance, last - tracker.previous_distance)
    } else {
        (tracker.current_distance, last)
    })
}

/// Run one pattern's alert state machine.
///
/// `cursor` is the tracker's global position and `resolve` looks spins up by id.
pub fn evaluate<R>(
    pattern: &PatternDefinition,
    tracker: &PatternTrackerState,
    state: &mut AlertManagerState,
    cursor: i64,
    now: NaiveDateTime,
    resolve: R,
) -> Result<Vec<Alert>>
where
    R: Fn(i64) -> Result<Option<Spin>>,
{
    let Some(last_occurrence_id) = tracker.last_occurrence_id else {
        return Ok(Vec::new());
    };
    let is_hit = last_occurrence_id > state.last_processed_id;
    let Some((distance, start_id)) = evaluation_point(tracker, is_hit) else {
        return Ok(Vec::new());
    };

    let mut alerts = Vec::new();
    for &threshold in &pattern.warning_thresholds {
        if distance < threshold || state.alerts_sent.contains(&threshold) {
            continue;
        }
        let timestamp = resolve(start_id + threshold)?
            .map(|s| s.started_at)
            .unwrap_or(now);
        info!(
            "[{}] threshold {} reached (waiting {})",
            pattern.name, threshold, distance
        );
        alerts.push(Alert {
            kind: AlertKind::ThresholdReached,
            pattern_id: pattern.id.clone(),
            pattern_name: pattern.name.clone(),
            value: threshold,
            spin_count: distance,
            timestamp,
            details: AlertDetails::Threshold { start_id },
        });
        state.alerts_sent.insert(threshold);
    }

    if !is_hit {
        state.last_processed_id = cursor;
        return Ok(alerts);
    }

    let previous = tracker.previous_distance;
    let actionable = pattern
        .first_window_start()
        .is_some_and(|start| previous >= start);
    if actionable {
        let spin = resolve(last_occurrence_id)?;
        let window = pattern.window_containing(previous);
        info!(
            "[{}] hit at #{} after {} spins (window {:?})",
            pattern.name, last_occurrence_id, previous, window
        );
        alerts.push(Alert {
            kind: AlertKind::PatternHit,
            pattern_id: pattern.id.clone(),
            pattern_name: pattern.name.clone(),
            value: previous,
            spin_count: previous,
            timestamp: spin.as_ref().map(|s| s.started_at).unwrap_or(now),
            details: AlertDetails::Hit {
                spin_id: last_occurrence_id,
                outcome: spin.as_ref().map(|s| s.outcome.clone()),
                started_at: spin.as_ref().map(|s| s.started_at),
                window,
                spin: spin.map(|s| s.details),
            },
        });
    } else {
        debug!(
            "[{}] hit at #{} after {} spins, before any betting window",
            pattern.name, last_occurrence_id, previous
        );
    }

    state.alerts_sent.clear();
    state.last_processed_id = last_occurrence_id;
    Ok(alerts)
}

/// Evaluates VIP patterns against tracker state and remembers what was sent.
pub struct AlertEngine {
    db: Database,
    patterns: Patterns,
    tracker: PatternTracker,
    offset: FixedOffset,
}

impl AlertEngine {
    pub fn new(db: Database, patterns: Patterns, offset: FixedOffset) -> Self {
        let tracker = PatternTracker::new(db.clone(), patterns.clone());
        AlertEngine {
            db,
            patterns,
            tracker,
            offset,
        }
    }

    pub fn state(&self, pattern_id: &str) -> Result<AlertManagerState> {
        Ok(self.db.get_state(MODULE, pattern_id)?.unwrap_or_default())
    }

    fn now(&self) -> NaiveDateTime {
        Utc::now()
            .with_timezone(&self.offset)
            .naive_local()
            .trunc_subsecs(0)
    }

    /// Check every VIP pattern once and persist the updated alert memory.
    pub fn check_all(&self) -> Result<Vec<Alert>> {
        let cursor = self.tracker.progress()?.last_processed_id;
        let now = self.now();
        let mut alerts = Vec::new();
        let mut entries = Vec::new();

        for pattern in self.patterns.iter().filter(|p| p.is_vip()) {
            let tracker = self.tracker.state(&pattern.id)?;
            let mut state = self.state(&pattern.id)?;
            let before = state.clone();
            alerts.extend(evaluate(pattern, &tracker, &mut state, cursor, now, |id| {
                self.db.spin_by_id(id)
            })?);
            if state != before {
                entries.push(StateEntry::new(MODULE, pattern.id.clone(), &state)?);
            }
        }

        if !entries.is_empty() {
            self.db.set_states(&entries)?;
        }
        Ok(alerts)
    }

    /// Forget alert memory for the given patterns.
    pub fn reset(&self, pattern_ids: &[String]) -> Result<()> {
        let entries = pattern_ids
            .iter()
            .map(|id| StateEntry::new(MODULE, id.clone(), &AlertManagerState::default()))
            .collect::<Result<Vec<_>>>()?;
        self.db.set_states(&entries)
    }
}
