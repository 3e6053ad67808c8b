//! SQLite persistence layer.
//!
//! RULE: Only the store module talks to the database.
//! Calculators, the normalizer and the maintenance job call store
//! methods; they never execute SQL directly.

use crate::{
    error::CommissionResult,
    event::EventLogEntry,
    types::{CommissionType, Leg, SettlementStatus, Timestamp, UserId},
};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

mod commission;
mod lock;
mod maintenance;
mod network;
mod settlement;

pub use network::NetworkRows;
pub use settlement::SettlementProofUpdate;

pub struct SettlementStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl SettlementStore {
    pub fn open(path: &str) -> CommissionResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> CommissionResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> CommissionResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> CommissionResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_network.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_volume.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_settlement.sql"))?;
        Ok(())
    }

    // ── Calculation runs ───────────────────────────────────────

    pub fn insert_calculation_run(
        &self,
        run_id: &str,
        period_key: &str,
        started_at: Timestamp,
    ) -> CommissionResult<()> {
        self.conn.execute(
            "INSERT INTO calculation_run (run_id, period_key, started_at, status)
             VALUES (?1, ?2, ?3, 'running')",
            params![run_id, period_key, started_at],
        )?;
        Ok(())
    }

    pub fn complete_calculation_run(
        &self,
        run_id: &str,
        status: &str,
        summary_json: Option<&str>,
        completed_at: Timestamp,
    ) -> CommissionResult<()> {
        self.conn.execute(
            "UPDATE calculation_run
             SET status = ?1, summary_json = ?2, completed_at = ?3
             WHERE run_id = ?4",
            params![status, summary_json, completed_at, run_id],
        )?;
        Ok(())
    }

    /// Summary JSON of the most recent completed run for a period.
    pub fn latest_calculation_summary(&self, period_key: &str) -> CommissionResult<Option<String>> {
        let summary = self
            .conn
            .query_row(
                "SELECT summary_json FROM calculation_run
                 WHERE period_key = ?1 AND status = 'completed'
                 ORDER BY completed_at DESC, rowid DESC LIMIT 1",
                params![period_key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(summary)
    }

    /// Most recently started run for a period, whatever its status.
    /// Ordered by insertion; `started_at` holds the read-at-start time and
    /// may be backdated.
    pub fn latest_calculation_run(&self, period_key: &str) -> CommissionResult<Option<CalculationRunRow>> {
        let run = self
            .conn
            .query_row(
                "SELECT run_id, period_key, started_at, completed_at, status
                 FROM calculation_run WHERE period_key = ?1
                 ORDER BY rowid DESC LIMIT 1",
                params![period_key],
                |row| {
                    Ok(CalculationRunRow {
                        run_id: row.get(0)?,
                        period_key: row.get(1)?,
                        started_at: row.get(2)?,
                        completed_at: row.get(3)?,
                        status: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(run)
    }

    pub fn calculation_run_count(&self, period_key: &str) -> CommissionResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM calculation_run WHERE period_key = ?1",
            params![period_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> CommissionResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, period_key, component, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.run_id,
                entry.period_key,
                entry.component,
                entry.event_type,
                entry.payload,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn event_count(&self, event_type: &str) -> CommissionResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ── Column decoding helpers ────────────────────────────────────────

fn decode<T>(idx: usize, raw: &str, parsed: Option<T>) -> rusqlite::Result<T> {
    parsed.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value '{raw}'").into(),
        )
    })
}

pub(crate) fn leg_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Leg> {
    let raw: String = row.get(idx)?;
    decode(idx, &raw, Leg::parse(&raw))
}

pub(crate) fn commission_type_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<CommissionType> {
    let raw: String = row.get(idx)?;
    decode(idx, &raw, CommissionType::parse(&raw))
}

pub(crate) fn status_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<SettlementStatus> {
    let raw: String = row.get(idx)?;
    decode(idx, &raw, SettlementStatus::parse(&raw))
}

// ── Row types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRow {
    pub user_id:          UserId,
    pub sponsor_id:       Option<UserId>,
    pub binary_parent_id: Option<UserId>,
    pub binary_position:  Option<Leg>,
    pub wallet_address:   Option<String>,
    pub rank:             Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRow {
    pub tx_id:      String,
    pub user_id:    UserId,
    pub amount:     f64,
    pub period_key: String,
    pub eligible:   bool,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryNodeRow {
    pub user_id:      UserId,
    pub left_leg_id:  Option<UserId>,
    pub right_leg_id: Option<UserId>,
    pub left_volume:  f64,
    pub right_volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GhostVolumeRow {
    pub ghost_id:   String,
    pub user_id:    UserId,
    pub pay_leg:    Leg,
    pub amount:     f64,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub status:     String, // "active" | "expired"
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecordRow {
    pub record_id:     String,
    pub user_id:       UserId,
    pub leg:           Leg,
    pub amount:        f64,
    pub carry_forward: f64,
    pub created_at:    Timestamp,
    pub flushed_at:    Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommissionRecordRow {
    pub record_id:       String,
    pub run_id:          String,
    pub user_id:         UserId,
    pub source_user_id:  Option<UserId>,
    pub source_count:    u32,
    pub commission_type: CommissionType,
    pub level:           u32,
    pub base_amount:     f64,
    pub pool_factor:     f64,
    pub global_factor:   f64,
    pub scaled_amount:   f64,
    pub period_key:      String,
    pub status:          String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalculationRunRow {
    pub run_id:       String,
    pub period_key:   String,
    pub started_at:   Timestamp,
    pub completed_at: Option<Timestamp>,
    pub status:       String, // running | completed | failed
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeeklySettlementRow {
    pub user_id:         UserId,
    pub period_key:      String,
    pub run_id:          String,
    pub direct_total:    f64,
    pub binary_total:    f64,
    pub override_total:  f64,
    pub grand_total:     f64,
    pub direct_factor:   f64,
    pub binary_factor:   f64,
    pub override_factor: f64,
    pub global_factor:   f64,
    pub status:          SettlementStatus,
    pub leaf_hash:       Option<String>,
    pub merkle_proof:    Option<String>, // JSON array of 0x-hex sibling hashes
    pub cap_flagged:     bool,
    pub pre_cap_total:   Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementBatchRow {
    pub period_key:      String,
    pub merkle_root:     String,
    pub total_users:     i64,
    pub total_amount:    f64,
    pub contract_status: String,
    pub finalized_at:    Timestamp,
}

/// A settlement eligible for a Merkle leaf, with the payee's wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimableSettlementRow {
    pub user_id:        UserId,
    pub grand_total:    f64,
    pub wallet_address: Option<String>,
}

/// A settlement row with the cap that applies to its participant's rank.
#[derive(Debug, Clone, PartialEq)]
pub struct CapCandidateRow {
    pub user_id:     UserId,
    pub period_key:  String,
    pub grand_total: f64,
    pub status:      SettlementStatus,
    pub rank:        Option<String>,
    pub rank_cap:    Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodLockRow {
    pub period_key:  String,
    pub holder:      String,
    pub purpose:     String,
    pub acquired_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutAlertRow {
    pub alert_id:     String,
    pub raised_at:    Timestamp,
    pub window_start: String,
    pub window_end:   String,
    pub payout_total: f64,
    pub sales_volume: f64,
    pub ratio:        f64,
    pub threshold:    f64,
}
