use super::{PeriodLockRow, SettlementStore};
use crate::{error::CommissionResult, types::Timestamp};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};

impl SettlementStore {
    /// Claim the lock row for a period. Returns the current holder when the
    /// lock is taken and fresh; a row acquired before `stale_before` is
    /// considered abandoned and is replaced.
    pub fn try_acquire_period_lock(
        &self,
        lock: &PeriodLockRow,
        stale_before: Timestamp,
    ) -> CommissionResult<Option<PeriodLockRow>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let existing = tx
            .query_row(
                "SELECT period_key, holder, purpose, acquired_at
                 FROM period_lock WHERE period_key = ?1",
                params![lock.period_key],
                map_period_lock,
            )
            .optional()?;

        if let Some(current) = existing {
            if current.acquired_at >= stale_before {
                tx.commit()?;
                return Ok(Some(current));
            }
            log::warn!(
                "period {}: taking over abandoned lock held by {} since {}",
                current.period_key,
                current.holder,
                current.acquired_at
            );
        }

        tx.execute(
            "INSERT OR REPLACE INTO period_lock (period_key, holder, purpose, acquired_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![lock.period_key, lock.holder, lock.purpose, lock.acquired_at],
        )?;
        tx.commit()?;
        Ok(None)
    }

    pub fn release_period_lock(&self, period_key: &str, holder: &str) -> CommissionResult<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM period_lock WHERE period_key = ?1 AND holder = ?2",
            params![period_key, holder],
        )?;
        Ok(deleted == 1)
    }

    pub fn held_period_locks(&self) -> CommissionResult<Vec<PeriodLockRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT period_key, holder, purpose, acquired_at FROM period_lock ORDER BY period_key",
        )?;
        let rows = stmt
            .query_map([], map_period_lock)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn map_period_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeriodLockRow> {
    Ok(PeriodLockRow {
        period_key: row.get(0)?,
        holder: row.get(1)?,
        purpose: row.get(2)?,
        acquired_at: row.get(3)?,
    })
}
