pub mod alerts;
pub mod tracker;

pub use alerts::{Alert, AlertEngine, AlertKind};
pub use tracker::PatternTracker;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Shared, immutable pattern registry loaded once at startup.
pub type Patterns = Arc<[PatternDefinition]>;

/// What a pattern matches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Matcher {
    /// A single outcome, e.g. "Pachinko".
    Simple(String),
    /// Two consecutive outcomes, first then second.
    Sequence(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Tracked and alerted on
    Vip,
    /// Tracked only
    Tracking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub id: String,
    pub name: String,
    pub matcher: Matcher,
    /// Ascending distances that raise a heat warning.
    #[serde(default)]
    pub warning_thresholds: Vec<i64>,
    /// Ascending, non-overlapping inclusive `[start, end]` distance ranges.
    #[serde(default)]
    pub betting_windows: Vec<(i64, i64)>,
    pub alert_level: AlertLevel,
}

impl PatternDefinition {
    fn simple(id: &str, name: &str, outcome: &str, level: AlertLevel) -> Self {
        PatternDefinition {
            id: id.to_string(),
            name: name.to_string(),
            matcher: Matcher::Simple(outcome.to_string()),
            warning_thresholds: Vec::new(),
            betting_windows: Vec::new(),
            alert_level: level,
        }
    }

    fn sequence(id: &str, name: &str, first: &str, second: &str) -> Self {
        PatternDefinition {
            matcher: Matcher::Sequence(first.to_string(), second.to_string()),
            ..Self::simple(id, name, "", AlertLevel::Tracking)
        }
    }

    fn with_thresholds(mut self, thresholds: &[i64]) -> Self {
        self.warning_thresholds = thresholds.to_vec();
        self
    }

    fn with_windows(mut self, windows: &[(i64, i64)]) -> Self {
        self.betting_windows = windows.to_vec();
        self
    }

    pub fn is_vip(&self) -> bool {
        self.alert_level == AlertLevel::Vip
    }

    /// Start of the earliest betting window, if any.
    pub fn first_window_start(&self) -> Option<i64> {
        self.betting_windows.first().map(|(start, _)| *start)
    }

    pub fn window_containing(&self, distance: i64) -> Option<(i64, i64)> {
        self.betting_windows
            .iter()
            .copied()
            .find(|(start, end)| (*start..=*end).contains(&distance))
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("pattern with empty id");
        }
        let empty_outcome = match &self.matcher {
            Matcher::Simple(o) => o.is_empty(),
            Matcher::Sequence(a, b) => a.is_empty() || b.is_empty(),
        };
        if empty_outcome {
            anyhow::bail!("pattern '{}' matches an empty outcome", self.id);
        }
        if self.warning_thresholds.iter().any(|t| *t <= 0)
            || self.warning_thresholds.windows(2).any(|w| w[0] >= w[1])
        {
            anyhow::bail!(
                "pattern '{}': warning thresholds must be positive and strictly ascending",
                self.id
            );
        }
        if self.betting_windows.iter().any(|(s, e)| *s <= 0 || s > e) {
            anyhow::bail!("pattern '{}': betting window with start > end", self.id);
        }
        if self.betting_windows.windows(2).any(|w| w[0].1 >= w[1].0) {
            anyhow::bail!(
                "pattern '{}': betting windows must be ascending and non-overlapping",
                self.id
            );
        }
        Ok(())
    }
}

/// Built-in registry: two alerting bonus patterns plus tracking-only ones.
pub fn builtin() -> Vec<PatternDefinition> {
    vec![
        PatternDefinition::simple("pachinko", "Pachinko", "Pachinko", AlertLevel::Vip)
            .with_thresholds(&[50, 110])
            .with_windows(&[(61, 90), (121, 150)]),
        PatternDefinition::simple("crazytime", "Crazy Time", "CrazyTime", AlertLevel::Vip)
            .with_thresholds(&[190, 250])
            .with_windows(&[(201, 230), (261, 290)]),
        PatternDefinition::simple("numero_10", "Number 10", "10", AlertLevel::Tracking)
            .with_windows(&[(61, 90)]),
        PatternDefinition::sequence("seq_2_5", "Sequence 2→5", "2", "5").with_windows(&[(61, 90)]),
        PatternDefinition::sequence("seq_5_2", "Sequence 5→2", "5", "2").with_windows(&[(61, 90)]),
    ]
}

pub fn validate(patterns: &[PatternDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for p in patterns {
        p.validate()?;
        if !seen.insert(p.id.as_str()) {
            anyhow::bail!("duplicate pattern id '{}'", p.id);
        }
    }
    Ok(())
}

/// Load the registry from a JSON file, or the built-in set when `path` is `None`.
pub fn load(path: Option<&str>) -> Result<Patterns> {
    let patterns = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read patterns file {}", path))?;
            serde_json::from_str::<Vec<PatternDefinition>>(&raw)
                .with_context(|| format!("Failed to parse patterns file {}", path))?
        }
        None => builtin(),
    };
    validate(&patterns)?;
    Ok(patterns.into())
}
