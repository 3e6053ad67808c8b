use super::{
    leg_column, BinaryNodeRow, GhostVolumeRow, ParticipantRow, SettlementStore, TransactionRow,
};
use crate::{
    error::CommissionResult,
    types::{Leg, Timestamp},
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

/// Everything a calculation run reads, taken inside one read transaction.
#[derive(Debug, Clone, Default)]
pub struct NetworkRows {
    pub participants: Vec<ParticipantRow>,
    pub transactions: Vec<TransactionRow>,
    pub binary_nodes: Vec<BinaryNodeRow>,
    pub ghost_volumes: Vec<GhostVolumeRow>,
    pub rank_caps:    HashMap<String, f64>,
}

impl SettlementStore {
    // ── Consistent snapshot read ──────────────────────────────────

    /// Read participants, the period's transactions, binary nodes, active
    /// ghost volume and the rank cap table from a single read transaction,
    /// so concurrent volume writers cannot tear the snapshot.
    pub fn read_network(&self, period_key: &str) -> CommissionResult<NetworkRows> {
        let tx = self.conn.unchecked_transaction()?;
        let rows = NetworkRows {
            participants: query_participants(&tx)?,
            transactions: query_period_transactions(&tx, period_key)?,
            binary_nodes: query_binary_nodes(&tx)?,
            ghost_volumes: query_active_ghost_volumes(&tx)?,
            rank_caps:    query_rank_caps(&tx)?,
        };
        tx.commit()?;
        Ok(rows)
    }

    pub fn participants(&self) -> CommissionResult<Vec<ParticipantRow>> {
        query_participants(&self.conn)
    }

    pub fn binary_node(&self, user_id: i64) -> CommissionResult<Option<BinaryNodeRow>> {
        let node = self
            .conn
            .query_row(
                "SELECT user_id, left_leg_id, right_leg_id, left_volume, right_volume
                 FROM binary_node WHERE user_id = ?1",
                params![user_id],
                map_binary_node,
            )
            .optional()?;
        Ok(node)
    }

    pub fn ghost_volume(&self, ghost_id: &str) -> CommissionResult<Option<GhostVolumeRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ghost_id, user_id, pay_leg, amount, created_at, expires_at, status
             FROM ghost_volume WHERE ghost_id = ?1",
        )?;
        let mut rows = stmt
            .query_map(params![ghost_id], map_ghost_volume)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.pop())
    }

    /// Σ eligible transaction amounts for each of the given periods.
    pub fn sum_eligible_sales(&self, period_keys: &[String]) -> CommissionResult<f64> {
        let mut total = 0.0;
        for key in period_keys {
            let sv: f64 = self.conn.query_row(
                "SELECT COALESCE(SUM(amount), 0.0) FROM ledger_transaction
                 WHERE period_key = ?1 AND eligible = 1",
                params![key],
                |row| row.get(0),
            )?;
            total += sv;
        }
        Ok(total)
    }

    // ── Writers ───────────────────────────────────────────────────
    // The network is owned by the account and purchase services. These
    // writers mirror theirs and exist for seeding, demos and tests.

    pub fn upsert_participant(&self, p: &ParticipantRow) -> CommissionResult<()> {
        self.conn.execute(
            "INSERT INTO participant
                (user_id, sponsor_id, binary_parent_id, binary_position, wallet_address, rank)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                sponsor_id = excluded.sponsor_id,
                binary_parent_id = excluded.binary_parent_id,
                binary_position = excluded.binary_position,
                wallet_address = excluded.wallet_address,
                rank = excluded.rank",
            params![
                p.user_id,
                p.sponsor_id,
                p.binary_parent_id,
                p.binary_position.map(|l| l.as_str()),
                p.wallet_address,
                p.rank,
            ],
        )?;
        Ok(())
    }

    pub fn insert_transaction(&self, t: &TransactionRow) -> CommissionResult<()> {
        self.conn.execute(
            "INSERT INTO ledger_transaction (tx_id, user_id, amount, period_key, eligible, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                t.tx_id,
                t.user_id,
                t.amount,
                t.period_key,
                t.eligible as i32,
                t.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_binary_node(&self, n: &BinaryNodeRow, updated_at: Timestamp) -> CommissionResult<()> {
        self.conn.execute(
            "INSERT INTO binary_node
                (user_id, left_leg_id, right_leg_id, left_volume, right_volume, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                left_leg_id = excluded.left_leg_id,
                right_leg_id = excluded.right_leg_id,
                left_volume = excluded.left_volume,
                right_volume = excluded.right_volume,
                updated_at = excluded.updated_at",
            params![
                n.user_id,
                n.left_leg_id,
                n.right_leg_id,
                n.left_volume,
                n.right_volume,
                updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn insert_ghost_volume(&self, g: &GhostVolumeRow) -> CommissionResult<()> {
        self.conn.execute(
            "INSERT INTO ghost_volume (ghost_id, user_id, pay_leg, amount, created_at, expires_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                g.ghost_id,
                g.user_id,
                g.pay_leg.as_str(),
                g.amount,
                g.created_at,
                g.expires_at,
                g.status,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_rank_cap(&self, rank: &str, weekly_cap: f64) -> CommissionResult<()> {
        self.conn.execute(
            "INSERT INTO rank_cap (rank, weekly_cap) VALUES (?1, ?2)
             ON CONFLICT(rank) DO UPDATE SET weekly_cap = excluded.weekly_cap",
            params![rank, weekly_cap],
        )?;
        Ok(())
    }
}

// Free functions so the same query runs on a bare connection or inside
// a transaction (Transaction derefs to Connection).

fn query_participants(conn: &Connection) -> CommissionResult<Vec<ParticipantRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, sponsor_id, binary_parent_id, binary_position, wallet_address, rank
         FROM participant ORDER BY user_id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let position: Option<String> = row.get(3)?;
            Ok(ParticipantRow {
                user_id: row.get(0)?,
                sponsor_id: row.get(1)?,
                binary_parent_id: row.get(2)?,
                binary_position: position.as_deref().and_then(Leg::parse),
                wallet_address: row.get(4)?,
                rank: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_period_transactions(
    conn: &Connection,
    period_key: &str,
) -> CommissionResult<Vec<TransactionRow>> {
    let mut stmt = conn.prepare(
        "SELECT tx_id, user_id, amount, period_key, eligible, created_at
         FROM ledger_transaction
         WHERE period_key = ?1 AND eligible = 1
         ORDER BY tx_id ASC",
    )?;
    let rows = stmt
        .query_map(params![period_key], |row| {
            Ok(TransactionRow {
                tx_id: row.get(0)?,
                user_id: row.get(1)?,
                amount: row.get(2)?,
                period_key: row.get(3)?,
                eligible: row.get::<_, i32>(4)? != 0,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_binary_nodes(conn: &Connection) -> CommissionResult<Vec<BinaryNodeRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, left_leg_id, right_leg_id, left_volume, right_volume
         FROM binary_node ORDER BY user_id ASC",
    )?;
    let rows = stmt
        .query_map([], map_binary_node)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_active_ghost_volumes(conn: &Connection) -> CommissionResult<Vec<GhostVolumeRow>> {
    let mut stmt = conn.prepare(
        "SELECT ghost_id, user_id, pay_leg, amount, created_at, expires_at, status
         FROM ghost_volume WHERE status = 'active'
         ORDER BY ghost_id ASC",
    )?;
    let rows = stmt
        .query_map([], map_ghost_volume)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_rank_caps(conn: &Connection) -> CommissionResult<HashMap<String, f64>> {
    let mut stmt = conn.prepare("SELECT rank, weekly_cap FROM rank_cap")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

fn map_binary_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<BinaryNodeRow> {
    Ok(BinaryNodeRow {
        user_id: row.get(0)?,
        left_leg_id: row.get(1)?,
        right_leg_id: row.get(2)?,
        left_volume: row.get(3)?,
        right_volume: row.get(4)?,
    })
}

pub(super) fn map_ghost_volume(row: &rusqlite::Row<'_>) -> rusqlite::Result<GhostVolumeRow> {
    Ok(GhostVolumeRow {
        ghost_id: row.get(0)?,
        user_id: row.get(1)?,
        pay_leg: leg_column(row, 2)?,
        amount: row.get(3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
        status: row.get(6)?,
    })
}
