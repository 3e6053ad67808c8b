use super::{
    leg_column, network::map_ghost_volume, status_column, CapCandidateRow, GhostVolumeRow,
    PayoutAlertRow, SettlementStore, VolumeRecordRow,
};
use crate::{
    error::CommissionResult,
    types::{floor_cents, Leg, Timestamp, UserId},
};
use rusqlite::{params, Connection, OptionalExtension};

fn subtract_leg_volume(conn: &Connection, user_id: UserId, leg: Leg, amount: f64) -> CommissionResult<()> {
    let sql = match leg {
        Leg::Left => {
            "UPDATE binary_node SET left_volume = MAX(0.0, left_volume - ?1) WHERE user_id = ?2"
        }
        Leg::Right => {
            "UPDATE binary_node SET right_volume = MAX(0.0, right_volume - ?1) WHERE user_id = ?2"
        }
    };
    conn.execute(sql, params![amount, user_id])?;
    Ok(())
}

impl SettlementStore {
    // ── Ghost volume expiry ───────────────────────────────────────

    pub fn ghost_volumes_expired_by(&self, now: Timestamp) -> CommissionResult<Vec<GhostVolumeRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ghost_id, user_id, pay_leg, amount, created_at, expires_at, status
             FROM ghost_volume
             WHERE status = 'active' AND expires_at <= ?1
             ORDER BY expires_at ASC, ghost_id ASC",
        )?;
        let rows = stmt
            .query_map(params![now], map_ghost_volume)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark one ghost row expired and take its amount back off the leg.
    /// Returns false when another worker expired it first.
    pub fn expire_ghost_volume(&self, ghost: &GhostVolumeRow) -> CommissionResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE ghost_volume SET status = 'expired' WHERE ghost_id = ?1 AND status = 'active'",
            params![ghost.ghost_id],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        subtract_leg_volume(&tx, ghost.user_id, ghost.pay_leg, ghost.amount)?;
        tx.commit()?;
        Ok(true)
    }

    // ── Carry-forward aging ───────────────────────────────────────

    pub fn insert_volume_record(&self, r: &VolumeRecordRow) -> CommissionResult<()> {
        self.conn.execute(
            "INSERT INTO volume_record (record_id, user_id, leg, amount, carry_forward, created_at, flushed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                r.record_id,
                r.user_id,
                r.leg.as_str(),
                r.amount,
                r.carry_forward,
                r.created_at,
                r.flushed_at,
            ],
        )?;
        Ok(())
    }

    pub fn volume_records_aged_before(&self, cutoff: Timestamp) -> CommissionResult<Vec<VolumeRecordRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, user_id, leg, amount, carry_forward, created_at, flushed_at
             FROM volume_record
             WHERE created_at < ?1 AND carry_forward > 0
             ORDER BY created_at ASC, record_id ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], map_volume_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn volume_record(&self, record_id: &str) -> CommissionResult<Option<VolumeRecordRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, user_id, leg, amount, carry_forward, created_at, flushed_at
             FROM volume_record WHERE record_id = ?1",
        )?;
        let mut rows = stmt
            .query_map(params![record_id], map_volume_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.pop())
    }

    /// Zero a record's carry-forward and remove it from the node's leg.
    pub fn flush_carry_forward(&self, record: &VolumeRecordRow, now: Timestamp) -> CommissionResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE volume_record SET carry_forward = 0, flushed_at = ?1
             WHERE record_id = ?2 AND carry_forward > 0",
            params![now, record.record_id],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        subtract_leg_volume(&tx, record.user_id, record.leg, record.carry_forward)?;
        tx.commit()?;
        Ok(true)
    }

    // ── Hard-cap backstop ─────────────────────────────────────────

    /// Unflagged settlements with a positive total, with the rank cap if any.
    pub fn cap_candidates(&self) -> CommissionResult<Vec<CapCandidateRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.user_id, s.period_key, s.grand_total, s.status, p.rank, rc.weekly_cap
             FROM weekly_settlement s
             LEFT JOIN participant p ON p.user_id = s.user_id
             LEFT JOIN rank_cap rc ON rc.rank = p.rank
             WHERE s.cap_flagged = 0 AND s.grand_total > 0
             ORDER BY s.period_key ASC, s.user_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CapCandidateRow {
                    user_id: row.get(0)?,
                    period_key: row.get(1)?,
                    grand_total: row.get(2)?,
                    status: status_column(row, 3)?,
                    rank: row.get(4)?,
                    rank_cap: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clamp a pending settlement to `cap`, keeping the original total.
    /// Components are scaled by the same ratio and floored to cents; the new
    /// total is their sum, so it never exceeds `cap`.
    pub fn clamp_settlement_to_cap(
        &self,
        user_id: UserId,
        period_key: &str,
        cap: f64,
    ) -> CommissionResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let current = tx
            .query_row(
                "SELECT direct_total, binary_total, override_total, grand_total
                 FROM weekly_settlement
                 WHERE user_id = ?1 AND period_key = ?2 AND status = 'pending' AND grand_total > ?3",
                params![user_id, period_key, cap],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((direct, binary, override_, grand)) = current else {
            return Ok(false);
        };

        let scale = |part: f64| floor_cents(part * cap / grand);
        let (direct, binary, override_) = (scale(direct), scale(binary), scale(override_));
        let clamped = ((direct + binary + override_) * 100.0).round() / 100.0;
        tx.execute(
            "UPDATE weekly_settlement SET
                pre_cap_total = grand_total,
                direct_total = ?1,
                binary_total = ?2,
                override_total = ?3,
                grand_total = ?4,
                cap_flagged = 1
             WHERE user_id = ?5 AND period_key = ?6",
            params![direct, binary, override_, clamped, user_id, period_key],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Flag a settlement whose proof is already published. Amount unchanged.
    pub fn flag_settlement_over_cap(&self, user_id: UserId, period_key: &str) -> CommissionResult<()> {
        self.conn.execute(
            "UPDATE weekly_settlement SET cap_flagged = 1 WHERE user_id = ?1 AND period_key = ?2",
            params![user_id, period_key],
        )?;
        Ok(())
    }

    // ── Payout ratio audit ────────────────────────────────────────

    pub fn insert_payout_alert(&self, alert: &PayoutAlertRow) -> CommissionResult<()> {
        self.conn.execute(
            "INSERT INTO payout_alert
                (alert_id, raised_at, window_start, window_end, payout_total, sales_volume, ratio, threshold)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alert.alert_id,
                alert.raised_at,
                alert.window_start,
                alert.window_end,
                alert.payout_total,
                alert.sales_volume,
                alert.ratio,
                alert.threshold,
            ],
        )?;
        Ok(())
    }

    pub fn payout_alert_count(&self) -> CommissionResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM payout_alert", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn map_volume_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<VolumeRecordRow> {
    Ok(VolumeRecordRow {
        record_id: row.get(0)?,
        user_id: row.get(1)?,
        leg: leg_column(row, 2)?,
        amount: row.get(3)?,
        carry_forward: row.get(4)?,
        created_at: row.get(5)?,
        flushed_at: row.get(6)?,
    })
}
