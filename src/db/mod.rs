use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDateTime};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod models;
use models::*;

/// On-disk timestamp layout; lexicographic order equals chronological order.
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Two records of the same outcome starting this close together are one spin.
const DUPLICATE_WINDOW_SECS: i64 = 10;

const BUSY_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The core ledger table is gone; the process must not start.
    #[error("ledger table 'spins' is missing from {0}")]
    MissingLedgerTable(String),
    #[error("database connection lock poisoned")]
    Poisoned,
}

pub fn fmt_ts(ts: &NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// One row of the generic module/key state table.
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub module: &'static str,
    pub key: String,
    pub value: serde_json::Value,
}

impl StateEntry {
    pub fn new<T: Serialize>(module: &'static str, key: impl Into<String>, value: &T) -> Result<Self> {
        Ok(StateEntry {
            module,
            key: key.into(),
            value: serde_json::to_value(value).context("Failed to serialize module state")?,
        })
    }
}

/// Thread-safe SQLite handle (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the ledger at the given path for writing.
    ///
    /// A brand-new file gets the full schema. An existing file only gets the
    /// state table topped up; if its `spins` table is missing the open fails
    /// with [`LedgerError::MissingLedgerTable`].
    pub fn open(path: &str) -> Result<Self> {
        let in_memory = path == ":memory:";
        let fresh = in_memory || !Path::new(path).exists();
        if fresh && !in_memory {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            warn!("Database does not exist, creating: {}", path);
        }

        let conn = Connection::open(path).with_context(|| format!("Failed to open {}", path))?;
        conn.busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        if fresh {
            conn.execute_batch(SCHEMA_SQL)?;
        } else {
            conn.execute_batch(STATE_SCHEMA_SQL)?;
        }

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.verify_integrity(path)?;
        Ok(db)
    }

    /// Open an existing ledger for concurrent readers (dashboards, analyzers).
    pub fn open_read_only(path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open {} read-only", path))?;
        conn.busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS))?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.verify_integrity(path)?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned.into())
    }

    fn verify_integrity(&self, path: &str) -> Result<()> {
        let conn = self.conn()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='spins'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_none() {
            error!("Ledger table 'spins' does not exist in {}", path);
            return Err(LedgerError::MissingLedgerTable(path.to_string()).into());
        }
        debug!("Ledger integrity verified: {}", path);
        Ok(())
    }

    // ── Spins ────────────────────────────────────────────────────────────────

    /// Append a batch of normalized records in chronological order.
    ///
    /// Runs in a single transaction: any failure rolls the whole batch back and
    /// reports zero rows inserted.
    pub fn insert_batch(&self, records: &[NewSpin]) -> usize {
        if records.is_empty() {
            return 0;
        }
        let result = self.conn().and_then(|mut conn| {
            let tx = conn.transaction()?;
            let inserted = insert_sorted(&tx, records)?;
            tx.commit()?;
            Ok(inserted)
        });
        match result {
            Ok(n) => n,
            Err(e) => {
                error!("Batch insert of {} records rolled back: {:#}", records.len(), e);
                0
            }
        }
    }

    /// The spin with the highest id (the ledger tail).
    pub fn last_spin(&self) -> Result<Option<Spin>> {
        let conn = self.conn()?;
        let spin = conn
            .query_row(
                &format!("SELECT {SPIN_COLUMNS} FROM spins ORDER BY id DESC LIMIT 1"),
                [],
                map_spin,
            )
            .optional()?;
        Ok(spin)
    }

    pub fn max_id(&self) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let id = conn.query_row("SELECT MAX(id) FROM spins", [], |row| row.get(0))?;
        Ok(id)
    }

    pub fn spin_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let n = conn.query_row("SELECT COUNT(*) FROM spins", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn spin_by_id(&self, id: i64) -> Result<Option<Spin>> {
        let conn = self.conn()?;
        let spin = conn
            .query_row(
                &format!("SELECT {SPIN_COLUMNS} FROM spins WHERE id = ?1"),
                params![id],
                map_spin,
            )
            .optional()?;
        Ok(spin)
    }

    /// All spins with `id > after_id`, ascending.
    pub fn spins_after_id(&self, after_id: i64) -> Result<Vec<Spin>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SPIN_COLUMNS} FROM spins WHERE id > ?1 ORDER BY id ASC"
        ))?;
        let spins = stmt
            .query_map(params![after_id], map_spin)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(spins)
    }

    /// Spins preceded by more than `min_gap_secs` of silence, newest first.
    pub fn heartbeat_gaps(&self, min_gap_secs: i64, limit: i64) -> Result<Vec<Spin>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SPIN_COLUMNS} FROM spins WHERE heartbeat_seconds > ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let spins = stmt
            .query_map(params![min_gap_secs, limit], map_spin)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(spins)
    }

    // ── Module state ─────────────────────────────────────────────────────────

    pub fn get_state<T: DeserializeOwned>(&self, module: &str, key: &str) -> Result<Option<T>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM module_state WHERE module = ?1 AND key = ?2",
                params![module, key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| {
            serde_json::from_str(&s)
                .with_context(|| format!("Corrupt state blob for {}/{}", module, key))
        })
        .transpose()
    }

    /// Write several state rows atomically.
    pub fn set_states(&self, entries: &[StateEntry]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = fmt_ts(&Local::now().naive_local());
        for entry in entries {
            tx.execute(
                "INSERT INTO module_state (module, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(module, key) DO UPDATE SET
                    value=excluded.value,
                    updated_at=excluded.updated_at",
                params![entry.module, entry.key, entry.value.to_string(), now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

// ── Insertion ─────────────────────────────────────────────────────────────────

fn insert_sorted(tx: &Transaction<'_>, records: &[NewSpin]) -> Result<usize> {
    let mut ordered: Vec<&NewSpin> = records.iter().collect();
    ordered.sort_by_key(|r| r.started_at);

    let mut tail_end: Option<NaiveDateTime> = tx
        .query_row(
            "SELECT ended_at FROM spins ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let mut inserted = 0usize;
    let mut duplicates = 0usize;
    for rec in ordered {
        if let Some((id, existing_start)) = find_duplicate(tx, rec)? {
            if existing_start != fmt_ts(&rec.started_at) {
                warn!(
                    "Near-collision: {} ({}) matches spin #{} ({}), skipped",
                    rec.outcome,
                    fmt_ts(&rec.started_at),
                    id,
                    existing_start
                );
            }
            duplicates += 1;
            continue;
        }

        if let Some(tail) = tail_end {
            if rec.ended_at <= tail {
                warn!(
                    "Out-of-order record {} ended {} not after ledger tail {}, skipped",
                    rec.outcome,
                    fmt_ts(&rec.ended_at),
                    fmt_ts(&tail)
                );
                continue;
            }
        }

        let heartbeat = heartbeat_seconds(tx, rec)?;
        let d = &rec.details;
        tx.execute(
            "INSERT INTO spins (
                outcome, started_at, ended_at, heartbeat_seconds,
                top_slot_result, top_slot_multiplier, top_slot_matched,
                bonus_multiplier, flapper_blue, flapper_green, flapper_yellow
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                rec.outcome,
                fmt_ts(&rec.started_at),
                fmt_ts(&rec.ended_at),
                heartbeat,
                d.top_slot_result,
                d.top_slot_multiplier,
                d.top_slot_matched,
                d.bonus_multiplier,
                d.flapper_blue,
                d.flapper_green,
                d.flapper_yellow,
            ],
        )?;
        inserted += 1;
        tail_end = Some(rec.ended_at);
    }

    if inserted > 0 || duplicates > 0 {
        info!("Ledger: {} inserted, {} duplicates absorbed", inserted, duplicates);
    }
    Ok(inserted)
}

/// Most recent spin of the same outcome starting within the duplicate window.
fn find_duplicate(tx: &Transaction<'_>, rec: &NewSpin) -> Result<Option<(i64, String)>> {
    let window = Duration::seconds(DUPLICATE_WINDOW_SECS);
    let hit = tx
        .query_row(
            "SELECT id, started_at FROM spins
             WHERE outcome = ?1 AND started_at BETWEEN ?2 AND ?3
             ORDER BY id DESC LIMIT 1",
            params![
                rec.outcome,
                fmt_ts(&(rec.started_at - window)),
                fmt_ts(&(rec.started_at + window)),
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(hit)
}

fn heartbeat_seconds(tx: &Transaction<'_>, rec: &NewSpin) -> Result<i64> {
    let prev_end: Option<String> = tx
        .query_row(
            "SELECT ended_at FROM spins WHERE ended_at < ?1 ORDER BY ended_at DESC LIMIT 1",
            params![fmt_ts(&rec.started_at)],
            |row| row.get(0),
        )
        .optional()?;
    let Some(prev_end) = prev_end else {
        return Ok(0);
    };
    match NaiveDateTime::parse_from_str(&prev_end, TS_FORMAT) {
        Ok(prev) => Ok((rec.started_at - prev).num_seconds()),
        Err(e) => {
            error!("Unparsable predecessor end '{}': {}", prev_end, e);
            Ok(0)
        }
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

const SPIN_COLUMNS: &str = "id, outcome, started_at, ended_at, heartbeat_seconds,
    top_slot_result, top_slot_multiplier, top_slot_matched,
    bonus_multiplier, flapper_blue, flapper_green, flapper_yellow";

fn map_spin(row: &rusqlite::Row) -> rusqlite::Result<Spin> {
    Ok(Spin {
        id: row.get(0)?,
        outcome: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        heartbeat_seconds: row.get(4)?,
        details: SpinDetails {
            top_slot_result: row.get(5)?,
            top_slot_multiplier: row.get(6)?,
            top_slot_matched: row.get(7)?,
            bonus_multiplier: row.get(8)?,
            flapper_blue: row.get(9)?,
            flapper_green: row.get(10)?,
            flapper_yellow: row.get(11)?,
        },
    })
}

/// Generic module/key state, JSON-encoded values.
pub const STATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS module_state (
    module     TEXT NOT NULL,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (module, key)
);
"#;

/// Full schema for a new ledger (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS spins (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    outcome             TEXT    NOT NULL,
    started_at          TEXT    NOT NULL,
    ended_at            TEXT    NOT NULL,
    heartbeat_seconds   INTEGER NOT NULL DEFAULT 0,
    top_slot_result     TEXT,
    top_slot_multiplier REAL,
    top_slot_matched    INTEGER NOT NULL DEFAULT 0,
    bonus_multiplier    REAL,
    flapper_blue        REAL,
    flapper_green       REAL,
    flapper_yellow      REAL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_spins_ended_at ON spins(ended_at);
CREATE INDEX IF NOT EXISTS idx_spins_outcome ON spins(outcome);
CREATE INDEX IF NOT EXISTS idx_spins_outcome_ended ON spins(outcome, ended_at);
CREATE INDEX IF NOT EXISTS idx_spins_outcome_started ON spins(outcome, started_at);

CREATE TABLE IF NOT EXISTS module_state (
    module     TEXT NOT NULL,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (module, key)
);
"#;
