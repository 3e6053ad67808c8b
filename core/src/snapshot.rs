//! Period snapshot: the frozen view of ledger and graph a run computes on.
//!
//! Everything is read once, at the start of a run, inside one read
//! transaction. Calculators never touch the store; two runs over the
//! same snapshot produce the same commissions.

use crate::{
    error::{CommissionError, CommissionResult, PartialComputeError},
    period::PeriodKey,
    store::{BinaryNodeRow, ParticipantRow, SettlementStore},
    types::{Leg, UserId},
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct PeriodSnapshot {
    pub period:          PeriodKey,
    pub as_of:           DateTime<Utc>,
    pub participants:    BTreeMap<UserId, ParticipantRow>,
    /// Σ of each user's own eligible transactions this period.
    pub own_sales:       BTreeMap<UserId, f64>,
    /// Σ of all eligible transactions this period (SV).
    pub sales_volume:    f64,
    /// Binary nodes with ghost volume outside its window already removed.
    pub nodes:           BTreeMap<UserId, BinaryNodeRow>,
    /// Binary-parent linkage, children sorted ascending.
    pub binary_children: BTreeMap<UserId, Vec<UserId>>,
    pub rank_caps:       HashMap<String, f64>,
    /// Ghost volume withheld because `as_of` fell outside its window.
    pub withheld_ghost_volume: f64,
    /// Data problems found while assembling the snapshot.
    pub load_issues:     Vec<PartialComputeError>,
}

impl PeriodSnapshot {
    pub fn load(
        store: &SettlementStore,
        period: PeriodKey,
        as_of: DateTime<Utc>,
    ) -> CommissionResult<Self> {
        let rows = store.read_network(&period.to_string())?;
        if rows.participants.is_empty() {
            return Err(CommissionError::validation(format!(
                "snapshot for period {period} has no participants"
            )));
        }

        let participants: BTreeMap<UserId, ParticipantRow> = rows
            .participants
            .into_iter()
            .map(|p| (p.user_id, p))
            .collect();

        let mut load_issues = Vec::new();
        let mut own_sales: BTreeMap<UserId, f64> = BTreeMap::new();
        let mut sales_volume = 0.0;
        for t in &rows.transactions {
            if !t.amount.is_finite() {
                return Err(CommissionError::validation(format!(
                    "transaction {} has a non-finite amount",
                    t.tx_id
                )));
            }
            sales_volume += t.amount;
            if participants.contains_key(&t.user_id) {
                *own_sales.entry(t.user_id).or_insert(0.0) += t.amount;
            } else {
                load_issues.push(PartialComputeError::new(
                    t.user_id,
                    "snapshot",
                    format!("transaction {} belongs to an unknown participant", t.tx_id),
                ));
            }
        }
        if sales_volume < 0.0 {
            return Err(CommissionError::validation(format!(
                "period {period} has negative sales volume {sales_volume:.2}"
            )));
        }

        let mut nodes: BTreeMap<UserId, BinaryNodeRow> = BTreeMap::new();
        for node in rows.binary_nodes {
            if participants.contains_key(&node.user_id) {
                nodes.insert(node.user_id, node);
            } else {
                load_issues.push(PartialComputeError::new(
                    node.user_id,
                    "snapshot",
                    "binary node has no participant",
                ));
            }
        }

        // Ghost volume counts only while as_of ∈ [created_at, expires_at).
        let now = as_of.timestamp();
        let mut withheld_ghost_volume = 0.0;
        for ghost in rows.ghost_volumes {
            if now >= ghost.created_at && now < ghost.expires_at {
                continue;
            }
            if let Some(node) = nodes.get_mut(&ghost.user_id) {
                let leg = match ghost.pay_leg {
                    Leg::Left => &mut node.left_volume,
                    Leg::Right => &mut node.right_volume,
                };
                let before = *leg;
                *leg = (*leg - ghost.amount).max(0.0);
                withheld_ghost_volume += before - *leg;
            }
        }

        let mut binary_children: BTreeMap<UserId, Vec<UserId>> = BTreeMap::new();
        for p in participants.values() {
            if let Some(parent) = p.binary_parent_id {
                binary_children.entry(parent).or_default().push(p.user_id);
            }
        }

        Ok(Self {
            period,
            as_of,
            participants,
            own_sales,
            sales_volume,
            nodes,
            binary_children,
            rank_caps: rows.rank_caps,
            withheld_ghost_volume,
            load_issues,
        })
    }

    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants.keys().copied().collect()
    }

    pub fn children_of(&self, user_id: UserId) -> &[UserId] {
        self.binary_children
            .get(&user_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
