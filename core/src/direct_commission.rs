//! Direct commission, paid up the sponsor chain on a buyer's own sales.
//!
//! Tier n is the sponsor n hops above the buyer. The walk stops at a
//! missing sponsor or after the last configured tier. A sponsor seen twice
//! within the walk is a cycle; the buyer is skipped.

use crate::{
    calculator::{BaseCommission, CommissionCalculator},
    error::PartialComputeError,
    snapshot::PeriodSnapshot,
    types::{CommissionType, UserId},
};
use std::collections::HashSet;

pub struct DirectCommissionCalculator {
    tier_rates: Vec<f64>,
}

impl DirectCommissionCalculator {
    pub fn new(tier_rates: Vec<f64>) -> Self {
        Self { tier_rates }
    }
}

impl CommissionCalculator for DirectCommissionCalculator {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn commission_type(&self) -> CommissionType {
        CommissionType::Direct
    }

    fn compute(
        &self,
        snapshot: &PeriodSnapshot,
        user_id: UserId,
    ) -> Result<Vec<BaseCommission>, PartialComputeError> {
        let user_sv = snapshot.own_sales.get(&user_id).copied().unwrap_or(0.0);
        if !user_sv.is_finite() || user_sv < 0.0 {
            return Err(PartialComputeError::new(
                user_id,
                self.name(),
                format!("own sales volume is {user_sv}"),
            ));
        }
        if user_sv == 0.0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(self.tier_rates.len());
        let mut visited = HashSet::from([user_id]);
        let mut current = user_id;

        for (hop, rate) in self.tier_rates.iter().enumerate() {
            let sponsor = match snapshot
                .participants
                .get(&current)
                .and_then(|p| p.sponsor_id)
            {
                Some(s) if snapshot.participants.contains_key(&s) => s,
                _ => break,
            };
            if !visited.insert(sponsor) {
                return Err(PartialComputeError::new(
                    user_id,
                    self.name(),
                    format!("sponsor cycle through {sponsor} at tier {}", hop + 1),
                ));
            }
            out.push(BaseCommission {
                recipient:       sponsor,
                source:          user_id,
                commission_type: CommissionType::Direct,
                level:           hop as u32 + 1,
                base_amount:     user_sv * rate,
            });
            current = sponsor;
        }
        Ok(out)
    }
}
