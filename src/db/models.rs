use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Outcome-specific payout fields carried through the ledger untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpinDetails {
    /// Sector picked by the top slot
    pub top_slot_result: Option<String>,
    pub top_slot_multiplier: Option<f64>,
    /// Whether the top slot landed on the winning sector
    pub top_slot_matched: bool,
    /// Pachinko / CoinFlip bonus round payout
    pub bonus_multiplier: Option<f64>,
    /// Crazy Time flapper payouts (top, left, right)
    pub flapper_blue: Option<f64>,
    pub flapper_green: Option<f64>,
    pub flapper_yellow: Option<f64>,
}

/// A normalized upstream record waiting to be appended to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSpin {
    /// Wheel sector, e.g. "Pachinko" or "2"
    pub outcome: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub details: SpinDetails,
}

/// A spin as stored in the ledger. `id` order is chronological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spin {
    pub id: i64,
    pub outcome: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    /// Seconds between the predecessor's end and this spin's start
    pub heartbeat_seconds: i64,
    pub details: SpinDetails,
}
