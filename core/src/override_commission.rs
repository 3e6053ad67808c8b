//! Override commission: a leadership share of downline binary earnings.
//!
//! The downline is the binary-parent tree, not the sponsor tree. Level n
//! holds the nodes n binary-parent links below the earner; each level's
//! children contribute their unscaled binary amount times that level's rate.

use crate::{
    binary_commission::BinaryCommissionCalculator,
    calculator::{BaseCommission, CommissionCalculator},
    error::PartialComputeError,
    snapshot::PeriodSnapshot,
    types::{CommissionType, UserId},
};
use std::collections::HashSet;

pub struct OverrideCommissionCalculator {
    level_rates: Vec<f64>,
    binary:      BinaryCommissionCalculator,
}

impl OverrideCommissionCalculator {
    pub fn new(level_rates: Vec<f64>, binary_match_rate: f64) -> Self {
        Self {
            level_rates,
            binary: BinaryCommissionCalculator::new(binary_match_rate),
        }
    }
}

impl CommissionCalculator for OverrideCommissionCalculator {
    fn name(&self) -> &'static str {
        "override"
    }

    fn commission_type(&self) -> CommissionType {
        CommissionType::Override
    }

    fn compute(
        &self,
        snapshot: &PeriodSnapshot,
        user_id: UserId,
    ) -> Result<Vec<BaseCommission>, PartialComputeError> {
        let mut out = Vec::new();
        let mut visited = HashSet::from([user_id]);
        let mut frontier: Vec<UserId> = snapshot.children_of(user_id).to_vec();

        for (depth, rate) in self.level_rates.iter().enumerate() {
            if frontier.is_empty() {
                break;
            }
            let level = depth as u32 + 1;
            let mut next = Vec::new();
            for child in frontier {
                if !visited.insert(child) {
                    return Err(PartialComputeError::new(
                        user_id,
                        self.name(),
                        format!("binary-parent cycle through {child} at level {level}"),
                    ));
                }
                let child_base = self.binary.base_for(snapshot, child).map_err(|reason| {
                    PartialComputeError::new(
                        user_id,
                        self.name(),
                        format!("downline {child}: {reason}"),
                    )
                })?;
                if child_base > 0.0 {
                    out.push(BaseCommission {
                        recipient:       user_id,
                        source:          child,
                        commission_type: CommissionType::Override,
                        level,
                        base_amount:     child_base * rate,
                    });
                }
                next.extend_from_slice(snapshot.children_of(child));
            }
            frontier = next;
        }
        Ok(out)
    }
}
