//! Merkle settlement builder. Freezes a period's payouts into one root.
//!
//! Irreversible: once proofs are handed out, the leaf set cannot change.
//! A finalize either persists the root, the batch meta row and every proof
//! together, or persists nothing.

use crate::{
    config::CommissionConfig,
    error::{CommissionError, CommissionResult},
    merkle::{self, Hash32, MerkleTree, ADDRESS_LEN},
    period::PeriodKey,
    store::{SettlementBatchRow, SettlementProofUpdate, SettlementStore},
    types::UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CONTRACT_STATUS_PENDING_PUBLISH: &str = "pending_publish";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalizeSummary {
    pub period_key:        String,
    pub merkle_root:       String,
    pub total_users:       usize,
    pub total_amount:      f64,
    pub leaf_count:        usize,
    /// Positive settlements left pending because the payee has no wallet.
    pub skipped_no_wallet: Vec<UserId>,
}

/// One leaf: a wallet's total for the period.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementLeaf {
    pub wallet:       String,
    pub amount:       f64,
    pub amount_units: u128,
    pub hash:         Hash32,
    pub users:        Vec<UserId>,
}

/// Group claimable settlements by wallet and encode one leaf per wallet.
pub fn build_leaves(
    period: PeriodKey,
    settlements: &[(UserId, String, f64)],
    token_decimals: u32,
) -> CommissionResult<Vec<SettlementLeaf>> {
    let period_key = period.to_string();
    let mut by_wallet: BTreeMap<[u8; ADDRESS_LEN], (String, i128, Vec<UserId>)> = BTreeMap::new();

    for (user_id, wallet, amount) in settlements {
        let address = merkle::parse_address(wallet).map_err(|reason| {
            CommissionError::consistency(&period_key, format!("user {user_id}: {reason}"))
        })?;
        let entry = by_wallet
            .entry(address)
            .or_insert_with(|| (format!("0x{}", hex::encode(address)), 0, Vec::new()));
        entry.1 += (amount * 100.0).round() as i128;
        entry.2.push(*user_id);
    }

    let ts = period.unix_timestamp();
    by_wallet
        .into_iter()
        .map(|(address, (wallet, cents, users))| -> CommissionResult<SettlementLeaf> {
            let amount = cents as f64 / 100.0;
            let amount_units = merkle::amount_to_units(amount, token_decimals)
                .map_err(|reason| CommissionError::consistency(&period_key, reason))?;
            let hash = merkle::leaf_hash(&address, ts, amount_units)
                .map_err(|reason| CommissionError::consistency(&period_key, reason))?;
            Ok(SettlementLeaf {
                wallet,
                amount,
                amount_units,
                hash,
                users,
            })
        })
        .collect()
}

pub struct MerkleSettlementBuilder<'a> {
    store:  &'a SettlementStore,
    config: &'a CommissionConfig,
}

impl<'a> MerkleSettlementBuilder<'a> {
    pub fn new(store: &'a SettlementStore, config: &'a CommissionConfig) -> Self {
        Self { store, config }
    }

    /// Build and persist the period's root and proofs. The caller holds
    /// the period lock and has confirmed no batch exists yet.
    pub fn finalize(&self, period: PeriodKey, now: DateTime<Utc>) -> CommissionResult<FinalizeSummary> {
        let period_key = period.to_string();

        if let Some(batch) = self.store.batch_for_period(&period_key)? {
            return Err(CommissionError::AlreadyFinalized {
                period_key,
                merkle_root: batch.merkle_root,
            });
        }

        self.ensure_settled_by_latest_run(&period_key)?;

        let claimable = self.store.claimable_settlements(&period_key)?;
        let mut skipped_no_wallet = Vec::new();
        let mut payable = Vec::with_capacity(claimable.len());
        for row in claimable {
            match row.wallet_address.as_deref().map(str::trim) {
                Some(w) if !w.is_empty() => payable.push((row.user_id, w.to_string(), row.grand_total)),
                _ => skipped_no_wallet.push(row.user_id),
            }
        }
        if !skipped_no_wallet.is_empty() {
            log::warn!(
                "period {period_key}: {} settlements have no wallet and stay pending",
                skipped_no_wallet.len()
            );
        }

        let leaves = build_leaves(period, &payable, self.config.token_decimals)?;
        let hashes: Vec<Hash32> = leaves.iter().map(|l| l.hash).collect();
        let tree = MerkleTree::build(hashes.clone()).ok_or_else(|| CommissionError::NothingToFinalize {
            period_key: period_key.clone(),
        })?;
        let root = tree.root();

        // Re-verify: a rebuild from a different input order must give the
        // same root, and every proof must fold back to it.
        let mut reversed = hashes;
        reversed.reverse();
        let rebuilt = MerkleTree::build(reversed).map(|t| t.root());
        if rebuilt != Some(root) {
            return Err(CommissionError::consistency(
                &period_key,
                "root is not reproducible across leaf orderings",
            ));
        }

        let mut proofs = Vec::with_capacity(payable.len());
        for leaf in &leaves {
            let proof = tree.proof_for(&leaf.hash).ok_or_else(|| {
                CommissionError::consistency(&period_key, format!("no proof for wallet {}", leaf.wallet))
            })?;
            if !merkle::verify_proof(&leaf.hash, &proof, &root) {
                return Err(CommissionError::consistency(
                    &period_key,
                    format!("proof for wallet {} does not verify", leaf.wallet),
                ));
            }
            let proof_json = serde_json::to_string(
                &proof.iter().map(merkle::to_hex).collect::<Vec<_>>(),
            )?;
            for user_id in &leaf.users {
                proofs.push(SettlementProofUpdate {
                    user_id:      *user_id,
                    leaf_hash:    merkle::to_hex(&leaf.hash),
                    merkle_proof: proof_json.clone(),
                });
            }
        }

        let total_amount = (payable.iter().map(|(_, _, a)| a).sum::<f64>() * 100.0).round() / 100.0;
        let batch = SettlementBatchRow {
            period_key:      period_key.clone(),
            merkle_root:     merkle::to_hex(&root),
            total_users:     proofs.len() as i64,
            total_amount,
            contract_status: CONTRACT_STATUS_PENDING_PUBLISH.to_string(),
            finalized_at:    now.timestamp(),
        };
        self.store.commit_finalized_batch(&batch, &proofs)?;

        log::info!(
            "period {period_key}: finalized root {} over {} leaves, {} users, total {:.2}",
            batch.merkle_root,
            leaves.len(),
            proofs.len(),
            total_amount
        );

        Ok(FinalizeSummary {
            period_key,
            merkle_root: batch.merkle_root,
            total_users: proofs.len(),
            total_amount,
            leaf_count: leaves.len(),
            skipped_no_wallet,
        })
    }

    /// The pending set must be exactly what the latest run wrote, and that
    /// run must have completed. A crashed or failed re-run leaves its new
    /// rows next to stale ones from the run before it.
    fn ensure_settled_by_latest_run(&self, period_key: &str) -> CommissionResult<()> {
        let run_ids = self.store.pending_settlement_run_ids(period_key)?;
        if run_ids.is_empty() {
            return Ok(());
        }
        let Some(latest) = self.store.latest_calculation_run(period_key)? else {
            return Err(CommissionError::consistency(
                period_key,
                "pending settlements exist but no calculation run is recorded",
            ));
        };
        if latest.status != "completed" {
            return Err(CommissionError::consistency(
                period_key,
                format!("latest run {} is {}, recalculate before finalizing", latest.run_id, latest.status),
            ));
        }
        if let Some(other) = run_ids.iter().find(|id| **id != latest.run_id) {
            return Err(CommissionError::consistency(
                period_key,
                format!("pending settlements from run {other} do not belong to latest run {}", latest.run_id),
            ));
        }
        Ok(())
    }
}

/// Check a stored settlement's proof against its period's published root.
pub fn verify_settlement_claim(
    store: &SettlementStore,
    user_id: UserId,
    period_key: &str,
) -> CommissionResult<bool> {
    let (Some(settlement), Some(batch)) = (
        store.settlement(user_id, period_key)?,
        store.batch_for_period(period_key)?,
    ) else {
        return Ok(false);
    };
    let (Some(leaf_hex), Some(proof_json)) = (settlement.leaf_hash, settlement.merkle_proof) else {
        return Ok(false);
    };
    let proof_hex: Vec<String> = serde_json::from_str(&proof_json)?;
    let decode = |s: &str| merkle::from_hex(s).map_err(|r| CommissionError::consistency(period_key, r));
    let leaf = decode(leaf_hex.as_str())?;
    let root = decode(batch.merkle_root.as_str())?;
    let proof = proof_hex
        .iter()
        .map(|s| decode(s.as_str()))
        .collect::<CommissionResult<Vec<_>>>()?;
    Ok(merkle::verify_proof(&leaf, &proof, &root))
}
