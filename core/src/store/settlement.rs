use super::{ClaimableSettlementRow, SettlementBatchRow, SettlementStore};
use crate::{
    error::{CommissionError, CommissionResult},
    types::UserId,
};
use rusqlite::{params, OptionalExtension};

/// Proof material written for one participant at finalization.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementProofUpdate {
    pub user_id:      UserId,
    pub leaf_hash:    String,
    pub merkle_proof: String,
}

impl SettlementStore {
    pub fn batch_for_period(&self, period_key: &str) -> CommissionResult<Option<SettlementBatchRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT period_key, merkle_root, total_users, total_amount, contract_status, finalized_at
                 FROM settlement_batch WHERE period_key = ?1",
                params![period_key],
                |row| {
                    Ok(SettlementBatchRow {
                        period_key: row.get(0)?,
                        merkle_root: row.get(1)?,
                        total_users: row.get(2)?,
                        total_amount: row.get(3)?,
                        contract_status: row.get(4)?,
                        finalized_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Pending settlements with a positive total, joined to the payee wallet.
    pub fn claimable_settlements(
        &self,
        period_key: &str,
    ) -> CommissionResult<Vec<ClaimableSettlementRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.user_id, s.grand_total, p.wallet_address
             FROM weekly_settlement s
             LEFT JOIN participant p ON p.user_id = s.user_id
             WHERE s.period_key = ?1 AND s.status = 'pending' AND s.grand_total > 0
             ORDER BY s.user_id ASC",
        )?;
        let rows = stmt
            .query_map(params![period_key], |row| {
                Ok(ClaimableSettlementRow {
                    user_id: row.get(0)?,
                    grand_total: row.get(1)?,
                    wallet_address: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Distinct runs that wrote the period's pending settlements.
    pub fn pending_settlement_run_ids(&self, period_key: &str) -> CommissionResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT run_id FROM weekly_settlement
             WHERE period_key = ?1 AND status = 'pending'
             ORDER BY run_id ASC",
        )?;
        let ids = stmt
            .query_map(params![period_key], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Write the batch meta row and every participant's proof, moving them
    /// to ready_to_claim. All-or-nothing: any row that is no longer pending
    /// rolls the whole batch back.
    pub fn commit_finalized_batch(
        &self,
        batch: &SettlementBatchRow,
        proofs: &[SettlementProofUpdate],
    ) -> CommissionResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO settlement_batch
                (period_key, merkle_root, total_users, total_amount, contract_status, finalized_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                batch.period_key,
                batch.merkle_root,
                batch.total_users,
                batch.total_amount,
                batch.contract_status,
                batch.finalized_at,
            ],
        )?;
        for p in proofs {
            let updated = tx.execute(
                "UPDATE weekly_settlement
                 SET status = 'ready_to_claim', leaf_hash = ?1, merkle_proof = ?2
                 WHERE user_id = ?3 AND period_key = ?4 AND status = 'pending'",
                params![p.leaf_hash, p.merkle_proof, p.user_id, batch.period_key],
            )?;
            if updated != 1 {
                // Dropping `tx` without commit rolls back.
                return Err(CommissionError::consistency(
                    batch.period_key.clone(),
                    format!("settlement for user {} changed during finalization", p.user_id),
                ));
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Advance a claimed settlement. Called by the claim watcher.
    pub fn mark_settlement_paid(&self, user_id: UserId, period_key: &str) -> CommissionResult<bool> {
        let updated = self.conn.execute(
            "UPDATE weekly_settlement SET status = 'paid'
             WHERE user_id = ?1 AND period_key = ?2 AND status = 'ready_to_claim'",
            params![user_id, period_key],
        )?;
        Ok(updated == 1)
    }
}
