use super::{
    commission_type_column, status_column, CommissionRecordRow, SettlementStore,
    WeeklySettlementRow,
};
use crate::{error::CommissionResult, types::UserId};
use rusqlite::{params, Connection, OptionalExtension};

impl SettlementStore {
    // ── Idempotent commission persistence ─────────────────────────

    /// Upsert one chunk of commission records and settlement rollups in a
    /// single transaction. Keys: (user, period, type, level) for records,
    /// (user, period) for settlements. A record keeps the id it was first
    /// inserted with; every other column is overwritten.
    pub fn persist_commission_chunk(
        &self,
        records: &[CommissionRecordRow],
        settlements: &[WeeklySettlementRow],
    ) -> CommissionResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for r in records {
            upsert_commission_record(&tx, r)?;
        }
        for s in settlements {
            upsert_weekly_settlement(&tx, s)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete period rows not written by `run_id`.
    /// Returns (commission records removed, settlements removed).
    pub fn delete_stale_period_rows(
        &self,
        period_key: &str,
        run_id: &str,
    ) -> CommissionResult<(usize, usize)> {
        let tx = self.conn.unchecked_transaction()?;
        let records = tx.execute(
            "DELETE FROM commission_record WHERE period_key = ?1 AND run_id != ?2",
            params![period_key, run_id],
        )?;
        let settlements = tx.execute(
            "DELETE FROM weekly_settlement
             WHERE period_key = ?1 AND run_id != ?2 AND status = 'pending'",
            params![period_key, run_id],
        )?;
        tx.commit()?;
        Ok((records, settlements))
    }

    pub fn commission_records_for_period(
        &self,
        period_key: &str,
    ) -> CommissionResult<Vec<CommissionRecordRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, run_id, user_id, source_user_id, source_count, commission_type,
                    level, base_amount, pool_factor, global_factor, scaled_amount, period_key, status
             FROM commission_record WHERE period_key = ?1
             ORDER BY user_id ASC, commission_type ASC, level ASC",
        )?;
        let rows = stmt
            .query_map(params![period_key], map_commission_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn commission_record_count(&self, period_key: &str) -> CommissionResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM commission_record WHERE period_key = ?1",
            params![period_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn settlements_for_period(
        &self,
        period_key: &str,
    ) -> CommissionResult<Vec<WeeklySettlementRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SETTLEMENT_COLUMNS} WHERE period_key = ?1 ORDER BY user_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![period_key], map_weekly_settlement)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn settlement(
        &self,
        user_id: UserId,
        period_key: &str,
    ) -> CommissionResult<Option<WeeklySettlementRow>> {
        let row = self
            .conn
            .query_row(
                &format!("{SETTLEMENT_COLUMNS} WHERE user_id = ?1 AND period_key = ?2"),
                params![user_id, period_key],
                map_weekly_settlement,
            )
            .optional()?;
        Ok(row)
    }

    /// Σ grand_total across the given periods, every status.
    pub fn sum_grand_totals(&self, period_keys: &[String]) -> CommissionResult<f64> {
        let mut total = 0.0;
        for key in period_keys {
            let sum: f64 = self.conn.query_row(
                "SELECT COALESCE(SUM(grand_total), 0.0) FROM weekly_settlement WHERE period_key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            total += sum;
        }
        Ok(total)
    }
}

const SETTLEMENT_COLUMNS: &str = "SELECT user_id, period_key, run_id, direct_total, binary_total,
        override_total, grand_total, direct_factor, binary_factor, override_factor,
        global_factor, status, leaf_hash, merkle_proof, cap_flagged, pre_cap_total
     FROM weekly_settlement";

fn upsert_commission_record(conn: &Connection, r: &CommissionRecordRow) -> CommissionResult<()> {
    conn.execute(
        "INSERT INTO commission_record (
            record_id, run_id, user_id, source_user_id, source_count, commission_type, level,
            base_amount, pool_factor, global_factor, scaled_amount, period_key, status
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
        ON CONFLICT(user_id, period_key, commission_type, level) DO UPDATE SET
            run_id = excluded.run_id,
            source_user_id = excluded.source_user_id,
            source_count = excluded.source_count,
            base_amount = excluded.base_amount,
            pool_factor = excluded.pool_factor,
            global_factor = excluded.global_factor,
            scaled_amount = excluded.scaled_amount,
            status = excluded.status",
        params![
            r.record_id,
            r.run_id,
            r.user_id,
            r.source_user_id,
            r.source_count as i64,
            r.commission_type.as_str(),
            r.level as i64,
            r.base_amount,
            r.pool_factor,
            r.global_factor,
            r.scaled_amount,
            r.period_key,
            r.status,
        ],
    )?;
    Ok(())
}

fn upsert_weekly_settlement(conn: &Connection, s: &WeeklySettlementRow) -> CommissionResult<()> {
    conn.execute(
        "INSERT INTO weekly_settlement (
            user_id, period_key, run_id, direct_total, binary_total, override_total, grand_total,
            direct_factor, binary_factor, override_factor, global_factor, status,
            leaf_hash, merkle_proof, cap_flagged, pre_cap_total
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,NULL,NULL,0,NULL)
        ON CONFLICT(user_id, period_key) DO UPDATE SET
            run_id = excluded.run_id,
            direct_total = excluded.direct_total,
            binary_total = excluded.binary_total,
            override_total = excluded.override_total,
            grand_total = excluded.grand_total,
            direct_factor = excluded.direct_factor,
            binary_factor = excluded.binary_factor,
            override_factor = excluded.override_factor,
            global_factor = excluded.global_factor,
            status = excluded.status,
            leaf_hash = NULL,
            merkle_proof = NULL,
            cap_flagged = 0,
            pre_cap_total = NULL
        WHERE weekly_settlement.status = 'pending'",
        params![
            s.user_id,
            s.period_key,
            s.run_id,
            s.direct_total,
            s.binary_total,
            s.override_total,
            s.grand_total,
            s.direct_factor,
            s.binary_factor,
            s.override_factor,
            s.global_factor,
            s.status.as_str(),
        ],
    )?;
    Ok(())
}

fn map_commission_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommissionRecordRow> {
    Ok(CommissionRecordRow {
        record_id: row.get(0)?,
        run_id: row.get(1)?,
        user_id: row.get(2)?,
        source_user_id: row.get(3)?,
        source_count: row.get::<_, i64>(4)? as u32,
        commission_type: commission_type_column(row, 5)?,
        level: row.get::<_, i64>(6)? as u32,
        base_amount: row.get(7)?,
        pool_factor: row.get(8)?,
        global_factor: row.get(9)?,
        scaled_amount: row.get(10)?,
        period_key: row.get(11)?,
        status: row.get(12)?,
    })
}

pub(super) fn map_weekly_settlement(row: &rusqlite::Row<'_>) -> rusqlite::Result<WeeklySettlementRow> {
    Ok(WeeklySettlementRow {
        user_id: row.get(0)?,
        period_key: row.get(1)?,
        run_id: row.get(2)?,
        direct_total: row.get(3)?,
        binary_total: row.get(4)?,
        override_total: row.get(5)?,
        grand_total: row.get(6)?,
        direct_factor: row.get(7)?,
        binary_factor: row.get(8)?,
        override_factor: row.get(9)?,
        global_factor: row.get(10)?,
        status: status_column(row, 11)?,
        leaf_hash: row.get(12)?,
        merkle_proof: row.get(13)?,
        cap_flagged: row.get::<_, i32>(14)? != 0,
        pre_cap_total: row.get(15)?,
    })
}
