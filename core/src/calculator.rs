//! Calculator trait and the per-participant output it produces.
//!
//! RULE: Calculators are pure functions of the PeriodSnapshot.
//! They run in parallel across participants and never write.

use crate::{
    error::PartialComputeError,
    snapshot::PeriodSnapshot,
    store::BinaryNodeRow,
    types::{CommissionType, UserId},
};

/// One unscaled contribution from `source` to `recipient`.
/// Several contributions with the same (recipient, type, level) fold
/// into one commission record.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseCommission {
    pub recipient:       UserId,
    pub source:          UserId,
    pub commission_type: CommissionType,
    pub level:           u32,
    pub base_amount:     f64,
}

pub trait CommissionCalculator: Send + Sync {
    /// Stable name, used in skip lists and logs.
    fn name(&self) -> &'static str;

    fn commission_type(&self) -> CommissionType;

    /// Contributions attributable to `user_id`'s data this period.
    /// An Err drops this participant from this calculator only.
    fn compute(
        &self,
        snapshot: &PeriodSnapshot,
        user_id: UserId,
    ) -> Result<Vec<BaseCommission>, PartialComputeError>;
}

/// Weak-leg volume of a node, rejecting malformed volumes.
pub fn weak_leg_volume(node: &BinaryNodeRow) -> Result<f64, String> {
    let (l, r) = (node.left_volume, node.right_volume);
    if !l.is_finite() || !r.is_finite() {
        return Err(format!("non-finite leg volume ({l}, {r})"));
    }
    if l < 0.0 || r < 0.0 {
        return Err(format!("negative leg volume ({l}, {r})"));
    }
    Ok(l.min(r))
}
