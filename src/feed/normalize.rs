//! Maps raw upstream records onto the canonical [`NewSpin`] shape.
//!
//! Upstream timestamps are RFC 3339 UTC; the ledger stores them as naive
//! local times in the deployment's fixed offset, truncated to whole seconds.

use chrono::{DateTime, FixedOffset, NaiveDateTime, SubsecRound};
use serde::Deserialize;
use thiserror::Error;
use tracing::error;

use crate::db::models::{NewSpin, SpinDetails};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing field {0}")]
    Missing(&'static str),
    #[error("unparsable {field} '{value}'")]
    BadTimestamp { field: &'static str, value: String },
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    data: Option<RawData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawData {
    settled_at: Option<String>,
    started_at: Option<String>,
    result: Option<RawResult>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    outcome: Option<RawOutcome>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOutcome {
    wheel_result: Option<RawWheelResult>,
    top_slot: Option<RawTopSlot>,
    is_top_slot_matched_to_wheel_result: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWheelResult {
    wheel_sector: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    bonus: Option<RawBonus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBonus {
    bonus_multiplier: Option<RawValue>,
    flapper_result: Option<RawFlappers>,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawFlappers {
    top: Option<RawFlapper>,
    left: Option<RawFlapper>,
    right: Option<RawFlapper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFlapper {
    bonus_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTopSlot {
    wheel_sector: Option<String>,
    multiplier: Option<f64>,
}

/// Converts upstream records into ledger-ready spins.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    offset: FixedOffset,
}

impl Normalizer {
    pub fn new(offset: FixedOffset) -> Self {
        Normalizer { offset }
    }

    pub fn normalize(&self, raw: &serde_json::Value) -> Result<NewSpin, NormalizeError> {
        let record = RawRecord::deserialize(raw)?;
        let data = record.data.ok_or(NormalizeError::Missing("data"))?;

        let ended_at = self.local_time(
            "settledAt",
            data.settled_at.as_deref().ok_or(NormalizeError::Missing("settledAt"))?,
        )?;
        let started_at = self.local_time(
            "startedAt",
            data.started_at.as_deref().ok_or(NormalizeError::Missing("startedAt"))?,
        )?;

        let outcome = data
            .result
            .and_then(|r| r.outcome)
            .ok_or(NormalizeError::Missing("result.outcome"))?;
        let wheel = outcome
            .wheel_result
            .ok_or(NormalizeError::Missing("wheelResult"))?;
        let sector = match wheel.wheel_sector.as_deref() {
            Some("") | None => return Err(NormalizeError::Missing("wheelSector")),
            Some("CrazyBonus") => "CrazyTime".to_string(),
            Some(s) => s.to_string(),
        };

        let mut details = SpinDetails {
            top_slot_result: outcome.top_slot.as_ref().and_then(|t| t.wheel_sector.clone()),
            top_slot_multiplier: outcome.top_slot.as_ref().and_then(|t| t.multiplier),
            top_slot_matched: outcome.is_top_slot_matched_to_wheel_result.unwrap_or(false),
            ..SpinDetails::default()
        };

        if wheel.kind.as_deref() == Some("BonusRound") {
            if let Some(bonus) = wheel.bonus {
                match sector.as_str() {
                    "Pachinko" | "CoinFlip" => {
                        details.bonus_multiplier = bonus.bonus_multiplier.and_then(|v| v.value);
                    }
                    "CrazyTime" => {
                        if let Some(f) = bonus.flapper_result {
                            details.flapper_blue = f.top.and_then(|x| x.bonus_multiplier);
                            details.flapper_green = f.left.and_then(|x| x.bonus_multiplier);
                            details.flapper_yellow = f.right.and_then(|x| x.bonus_multiplier);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(NewSpin {
            outcome: sector,
            started_at,
            ended_at,
            details,
        })
    }

    /// Normalize a page, dropping (and logging) records that fail.
    pub fn normalize_batch(&self, raw: &[serde_json::Value]) -> Vec<NewSpin> {
        raw.iter()
            .filter_map(|entry| match self.normalize(entry) {
                Ok(spin) => Some(spin),
                Err(e) => {
                    error!("Discarding upstream record: {}", e);
                    None
                }
            })
            .collect()
    }

    fn local_time(&self, field: &'static str, value: &str) -> Result<NaiveDateTime, NormalizeError> {
        let parsed = DateTime::parse_from_rfc3339(value).map_err(|_| NormalizeError::BadTimestamp {
            field,
            value: value.to_string(),
        })?;
        Ok(parsed.with_timezone(&self.offset).naive_local().trunc_subsecs(0))
    }
}
