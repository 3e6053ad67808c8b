//! Settlement persister. Writes scaled commissions and the per-user rollup.
//!
//! Writes are upserts keyed by (user, period, type, level) and
//! (user, period), committed one chunk of users at a time. A crash mid-run
//! leaves a mix of old and new rows; re-running from scratch overwrites
//! all of them and the stale-row sweep removes the rest.

use crate::{
    error::CommissionResult,
    pool_scaling::{ScaledCommission, ScalingOutcome},
    store::{CommissionRecordRow, SettlementStore, WeeklySettlementRow},
    types::{CommissionType, SettlementStatus, UserId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistOutcome {
    pub records_written:           usize,
    pub settlements_written:       usize,
    pub stale_records_removed:     usize,
    pub stale_settlements_removed: usize,
}

pub struct SettlementPersister<'a> {
    store:      &'a SettlementStore,
    chunk_size: usize,
}

impl<'a> SettlementPersister<'a> {
    pub fn new(store: &'a SettlementStore, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn persist(
        &self,
        run_id: &str,
        period_key: &str,
        scaled: &[ScaledCommission],
        outcome: &ScalingOutcome,
    ) -> CommissionResult<PersistOutcome> {
        let mut by_user: BTreeMap<UserId, Vec<&ScaledCommission>> = BTreeMap::new();
        for s in scaled {
            by_user.entry(s.commission.user_id).or_default().push(s);
        }

        let users: Vec<(UserId, Vec<&ScaledCommission>)> = by_user.into_iter().collect();
        let mut result = PersistOutcome::default();

        for (chunk_no, chunk) in users.chunks(self.chunk_size).enumerate() {
            let mut records = Vec::new();
            let mut settlements = Vec::with_capacity(chunk.len());
            for (user_id, items) in chunk {
                records.extend(items.iter().map(|s| record_row(run_id, period_key, s)));
                settlements.push(rollup(run_id, period_key, *user_id, items, outcome));
            }
            self.store.persist_commission_chunk(&records, &settlements)?;
            result.records_written += records.len();
            result.settlements_written += settlements.len();
            log::debug!(
                "period {period_key}: chunk {chunk_no} persisted ({} records, {} settlements)",
                records.len(),
                settlements.len()
            );
        }

        let (stale_records, stale_settlements) =
            self.store.delete_stale_period_rows(period_key, run_id)?;
        result.stale_records_removed = stale_records;
        result.stale_settlements_removed = stale_settlements;
        if stale_records + stale_settlements > 0 {
            log::info!(
                "period {period_key}: removed {stale_records} stale records and {stale_settlements} stale settlements"
            );
        }
        Ok(result)
    }
}

fn record_row(run_id: &str, period_key: &str, s: &ScaledCommission) -> CommissionRecordRow {
    CommissionRecordRow {
        // Kept only on first insert; an overwrite preserves the original id.
        record_id:       uuid::Uuid::new_v4().to_string(),
        run_id:          run_id.to_string(),
        user_id:         s.commission.user_id,
        source_user_id:  s.commission.sole_source(),
        source_count:    s.commission.sources.len() as u32,
        commission_type: s.commission.commission_type,
        level:           s.commission.level,
        base_amount:     s.commission.base_amount,
        pool_factor:     s.pool_factor,
        global_factor:   s.global_factor,
        scaled_amount:   s.scaled_amount,
        period_key:      period_key.to_string(),
        status:          SettlementStatus::Pending.as_str().to_string(),
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn rollup(
    run_id: &str,
    period_key: &str,
    user_id: UserId,
    items: &[&ScaledCommission],
    outcome: &ScalingOutcome,
) -> WeeklySettlementRow {
    let total_of = |pool: CommissionType| {
        round_cents(
            items
                .iter()
                .filter(|s| s.commission.commission_type == pool)
                .map(|s| s.scaled_amount)
                .sum(),
        )
    };
    let direct_total = total_of(CommissionType::Direct);
    let binary_total = total_of(CommissionType::Binary);
    let override_total = total_of(CommissionType::Override);

    WeeklySettlementRow {
        user_id,
        period_key: period_key.to_string(),
        run_id: run_id.to_string(),
        direct_total,
        binary_total,
        override_total,
        grand_total: round_cents(direct_total + binary_total + override_total),
        direct_factor: outcome.pool_factors.direct,
        binary_factor: outcome.pool_factors.binary,
        override_factor: outcome.pool_factors.override_,
        global_factor: outcome.global_factor,
        status: SettlementStatus::Pending,
        leaf_hash: None,
        merkle_proof: None,
        cap_flagged: false,
        pre_cap_total: None,
    }
}
