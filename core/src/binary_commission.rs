//! Binary matching commission: a fixed share of the weak leg.

use crate::{
    calculator::{weak_leg_volume, BaseCommission, CommissionCalculator},
    error::PartialComputeError,
    snapshot::PeriodSnapshot,
    types::{CommissionType, UserId},
};

pub struct BinaryCommissionCalculator {
    match_rate: f64,
}

impl BinaryCommissionCalculator {
    pub fn new(match_rate: f64) -> Self {
        Self { match_rate }
    }

    /// Unscaled binary amount for one node, shared with the override walk.
    pub fn base_for(&self, snapshot: &PeriodSnapshot, user_id: UserId) -> Result<f64, String> {
        match snapshot.nodes.get(&user_id) {
            Some(node) => Ok(weak_leg_volume(node)? * self.match_rate),
            None => Ok(0.0),
        }
    }
}

impl CommissionCalculator for BinaryCommissionCalculator {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn commission_type(&self) -> CommissionType {
        CommissionType::Binary
    }

    fn compute(
        &self,
        snapshot: &PeriodSnapshot,
        user_id: UserId,
    ) -> Result<Vec<BaseCommission>, PartialComputeError> {
        let base = self
            .base_for(snapshot, user_id)
            .map_err(|reason| PartialComputeError::new(user_id, self.name(), reason))?;
        if base <= 0.0 {
            return Ok(Vec::new());
        }
        Ok(vec![BaseCommission {
            recipient:       user_id,
            source:          user_id,
            commission_type: CommissionType::Binary,
            level:           1,
            base_amount:     base,
        }])
    }
}
