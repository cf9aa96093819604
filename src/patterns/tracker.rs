use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{Matcher, PatternDefinition, Patterns};
use crate::db::models::Spin;
use crate::db::{Database, StateEntry};

pub const MODULE: &str = "pattern_tracker";
const PROGRESS_KEY: &str = "progress";

/// Global scan position, shared by every pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerProgress {
    pub last_processed_id: i64,
    /// Outcome of the spin at `last_processed_id`, for sequence matching.
    pub last_result: Option<String>,
}

/// Distance bookkeeping for one pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternTrackerState {
    /// `None` until the first occurrence calibrates the pattern.
    pub last_occurrence_id: Option<i64>,
    /// Spins elapsed since `last_occurrence_id`.
    pub current_distance: i64,
    /// Length of the run closed by the most recent hit.
    pub previous_distance: i64,
}

impl PatternTrackerState {
    /// Record a match at `spin_id`; returns the closed run length, or `None` on calibration.
    fn record_hit(&mut self, spin_id: i64) -> Option<i64> {
        let distance = self.last_occurrence_id.map(|last| spin_id - last);
        *self = PatternTrackerState {
            last_occurrence_id: Some(spin_id),
            current_distance: 0,
            previous_distance: distance.unwrap_or(0),
        };
        distance
    }
}

/// A pattern match found during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub pattern_id: String,
    pub spin_id: i64,
    /// `None` for the calibrating first match.
    pub distance: Option<i64>,
}

fn matches(matcher: &Matcher, previous: Option<&str>, current: &str) -> bool {
    match matcher {
        Matcher::Simple(value) => current == value,
        Matcher::Sequence(first, second) => previous == Some(first.as_str()) && current == second,
    }
}

/// Advance tracker state over `spins`, which must be the next spins after
/// `progress.last_processed_id` in ascending id order.
pub fn scan(
    patterns: &[PatternDefinition],
    progress: &mut TrackerProgress,
    states: &mut BTreeMap<String, PatternTrackerState>,
    spins: &[Spin],
) -> Vec<Occurrence> {
    let Some(final_id) = spins.last().map(|s| s.id) else {
        return Vec::new();
    };

    let mut occurrences = Vec::new();
    for spin in spins {
        for pattern in patterns {
            if !matches(&pattern.matcher, progress.last_result.as_deref(), &spin.outcome) {
                continue;
            }
            let state = states.entry(pattern.id.clone()).or_default();
            occurrences.push(Occurrence {
                pattern_id: pattern.id.clone(),
                spin_id: spin.id,
                distance: state.record_hit(spin.id),
            });
        }
        progress.last_result = Some(spin.outcome.clone());
    }

    // Distances only mean something relative to the newest known spin.
    for state in states.values_mut() {
        if let Some(last) = state.last_occurrence_id.filter(|last| *last < final_id) {
            state.current_distance = final_id - last;
        }
    }
    progress.last_processed_id = final_id;
    occurrences
}

/// Consumes newly appended spins and keeps per-pattern distances.
pub struct PatternTracker {
    db: Database,
    patterns: Patterns,
}

impl PatternTracker {
    pub fn new(db: Database, patterns: Patterns) -> Self {
        PatternTracker { db, patterns }
    }

    pub fn progress(&self) -> Result<TrackerProgress> {
        Ok(self.db.get_state(MODULE, PROGRESS_KEY)?.unwrap_or_default())
    }

    pub fn state(&self, pattern_id: &str) -> Result<PatternTrackerState> {
        Ok(self.db.get_state(MODULE, pattern_id)?.unwrap_or_default())
    }

    fn load_states(&self) -> Result<BTreeMap<String, PatternTrackerState>> {
        self.patterns
            .iter()
            .map(|p| Ok((p.id.clone(), self.state(&p.id)?)))
            .collect()
    }

    /// Scan every spin past the cursor. Returns how many spins were processed.
    pub fn process_new_spins(&self) -> Result<usize> {
        let mut progress = self.progress()?;
        let spins = self.db.spins_after_id(progress.last_processed_id)?;
        if spins.is_empty() {
            debug!("Tracker: nothing past #{}", progress.last_processed_id);
            return Ok(0);
        }
        info!("Tracker: processing {} new spins", spins.len());

        let mut states = self.load_states()?;
        for occ in scan(&self.patterns, &mut progress, &mut states, &spins) {
            match occ.distance {
                Some(d) => info!("[{}] hit at #{} (distance {})", occ.pattern_id, occ.spin_id, d),
                None => info!("[{}] first seen at #{} (calibrating)", occ.pattern_id, occ.spin_id),
            }
        }

        let mut entries = vec![StateEntry::new(MODULE, PROGRESS_KEY, &progress)?];
        for (id, state) in &states {
            entries.push(StateEntry::new(MODULE, id.clone(), state)?);
        }
        self.db.set_states(&entries)?;
        Ok(spins.len())
    }

    /// Return one pattern (or all of them) to the uncalibrated state.
    ///
    /// Resetting everything also forgets the sequence look-behind. The cursor
    /// is kept, so calibration resumes from the next new spin.
    pub fn recalibrate(&self, pattern_id: Option<&str>) -> Result<Vec<String>> {
        let ids: Vec<String> = match pattern_id {
            Some(id) => {
                if !self.patterns.iter().any(|p| p.id == id) {
                    let known: Vec<&str> = self.patterns.iter().map(|p| p.id.as_str()).collect();
                    anyhow::bail!("unknown pattern '{}' (known: {})", id, known.join(", "));
                }
                vec![id.to_string()]
            }
            None => self.patterns.iter().map(|p| p.id.clone()).collect(),
        };

        let mut entries = Vec::new();
        for id in &ids {
            entries.push(StateEntry::new(MODULE, id.clone(), &PatternTrackerState::default())?);
        }
        if pattern_id.is_none() {
            let progress = TrackerProgress {
                last_result: None,
                ..self.progress()?
            };
            entries.push(StateEntry::new(MODULE, PROGRESS_KEY, &progress)?);
        }
        self.db.set_states(&entries)?;
        info!("Tracker: recalibrated {}", ids.join(", "));
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{at, run_of};
    use crate::patterns::builtin;
    use chrono::Duration;

    fn spins(outcomes: &[&str], first_id: i64) -> Vec<Spin> {
        outcomes
            .iter()
            .enumerate()
            .map(|(i, o)| {
                let started_at = at(10, 0, 0) + Duration::seconds(40 * (first_id + i as i64));
                Spin {
                    id: first_id + i as i64,
                    outcome: o.to_string(),
                    started_at,
                    ended_at: started_at + Duration::seconds(30),
                    heartbeat_seconds: 10,
                    details: Default::default(),
                }
            })
            .collect()
    }

    #[test]
    fn first_match_calibrates_without_distance() {
        let patterns = builtin();
        let mut progress = TrackerProgress::default();
        let mut states = BTreeMap::new();
        let occ = scan(&patterns, &mut progress, &mut states, &spins(&["1", "Pachinko", "2"], 1));

        assert_eq!(occ.len(), 1);
        assert_eq!(occ[0].distance, None);
        let p = states["pachinko"];
        assert_eq!(p.last_occurrence_id, Some(2));
        assert_eq!(p.previous_distance, 0);
        assert_eq!(p.current_distance, 1);
        assert_eq!(progress.last_processed_id, 3);
    }

    #[test]
    fn second_match_freezes_previous_distance() {
        let patterns = builtin();
        let mut progress = TrackerProgress::default();
        let mut states = BTreeMap::new();
        let mut outcomes = vec!["Pachinko"];
        outcomes.extend(std::iter::repeat("1").take(11));
        outcomes.push("Pachinko");
        scan(&patterns, &mut progress, &mut states, &spins(&outcomes, 1));

        let p = states["pachinko"];
        assert_eq!(p.last_occurrence_id, Some(13));
        assert_eq!(p.previous_distance, 12);
        assert_eq!(p.current_distance, 0);
    }

    #[test]
    fn sequences_match_across_batch_boundaries() {
        let patterns = builtin();
        let mut progress = TrackerProgress::default();
        let mut states = BTreeMap::new();
        scan(&patterns, &mut progress, &mut states, &spins(&["1", "2"], 1));
        let occ = scan(&patterns, &mut progress, &mut states, &spins(&["5", "2"], 3));

        let ids: Vec<&str> = occ.iter().map(|o| o.pattern_id.as_str()).collect();
        assert_eq!(ids, vec!["seq_2_5", "seq_5_2"]);
        assert_eq!(states["seq_2_5"].last_occurrence_id, Some(3));
        assert_eq!(states["seq_2_5"].current_distance, 1);
        assert_eq!(states["seq_5_2"].last_occurrence_id, Some(4));
    }

    #[test]
    fn process_new_spins_persists_cursor_and_state() {
        let db = Database::open(":memory:").unwrap();
        let tracker = PatternTracker::new(db.clone(), builtin().into());
        db.insert_batch(&run_of(&["10", "1", "1", "10", "2"], at(9, 0, 0)));

        assert_eq!(tracker.process_new_spins().unwrap(), 5);
        assert_eq!(tracker.process_new_spins().unwrap(), 0);

        let ten = tracker.state("numero_10").unwrap();
        assert_eq!(ten.last_occurrence_id, Some(4));
        assert_eq!(ten.previous_distance, 3);
        assert_eq!(ten.current_distance, 1);
        assert_eq!(tracker.progress().unwrap().last_processed_id, 5);
        assert_eq!(tracker.state("pachinko").unwrap().last_occurrence_id, None);
    }

    #[test]
    fn recalibrate_resets_a_single_pattern() {
        let db = Database::open(":memory:").unwrap();
        let tracker = PatternTracker::new(db.clone(), builtin().into());
        db.insert_batch(&run_of(&["10", "2", "5"], at(9, 0, 0)));
        tracker.process_new_spins().unwrap();

        assert_eq!(tracker.recalibrate(Some("numero_10")).unwrap(), vec!["numero_10"]);
        assert_eq!(tracker.state("numero_10").unwrap(), PatternTrackerState::default());
        assert_eq!(tracker.state("seq_2_5").unwrap().last_occurrence_id, Some(3));
        assert_eq!(tracker.progress().unwrap().last_processed_id, 3);
        assert!(tracker.recalibrate(Some("nope")).is_err());
    }
}
