//! Pool scaling: two independent proportional clamps over all base amounts.
//!
//! Pass 1 folds every contribution into per-record base amounts and per-pool
//! totals. Pass 2 applies `pool_factor × global_factor` to each record.
//! No record's final amount is known until every participant is summed.
//!
//!   budget(p)      = pool_rate(p) × SV
//!   pool_factor(p) = min(1, budget(p) / unscaled(p))     (1 when unscaled = 0)
//!   post_pool      = Σ unscaled(p) × pool_factor(p)
//!   global_factor  = min(1, global_cap_rate × SV / post_pool)  (1 when post_pool = 0)
//!   scaled         = floor_cents(base × pool_factor × global_factor)

use crate::{
    calculator::BaseCommission,
    config::CommissionConfig,
    types::{floor_cents, CommissionType, UserId},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Totals are summed in micro-units so the parallel reduce is exact and
/// independent of how rayon splits the work.
const MICROS_PER_UNIT: f64 = 1_000_000.0;

fn to_micros(amount: f64) -> i128 {
    (amount * MICROS_PER_UNIT).round() as i128
}

fn from_micros(micros: i128) -> f64 {
    micros as f64 / MICROS_PER_UNIT
}

/// One value per pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolBreakdown {
    pub direct: f64,
    pub binary: f64,
    #[serde(rename = "override")]
    pub override_: f64,
}

impl PoolBreakdown {
    pub fn uniform(value: f64) -> Self {
        Self { direct: value, binary: value, override_: value }
    }

    pub fn get(&self, pool: CommissionType) -> f64 {
        match pool {
            CommissionType::Direct   => self.direct,
            CommissionType::Binary   => self.binary,
            CommissionType::Override => self.override_,
        }
    }

    pub fn set(&mut self, pool: CommissionType, value: f64) {
        match pool {
            CommissionType::Direct   => self.direct = value,
            CommissionType::Binary   => self.binary = value,
            CommissionType::Override => self.override_ = value,
        }
    }

    pub fn total(&self) -> f64 {
        self.direct + self.binary + self.override_
    }
}

/// Contributions folded to one idempotency key (recipient, type, level).
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedCommission {
    pub user_id:         UserId,
    pub commission_type: CommissionType,
    pub level:           u32,
    pub base_amount:     f64,
    pub sources:         BTreeSet<UserId>,
}

impl AggregatedCommission {
    /// The single contributing source, if there was exactly one.
    pub fn sole_source(&self) -> Option<UserId> {
        if self.sources.len() == 1 {
            self.sources.iter().next().copied()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScaledCommission {
    pub commission:    AggregatedCommission,
    pub pool_factor:   f64,
    pub global_factor: f64,
    pub scaled_amount: f64,
}

/// Budgets, totals and both clamp layers for one period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingOutcome {
    pub sales_volume:    f64,
    pub budgets:         PoolBreakdown,
    pub unscaled:        PoolBreakdown,
    pub pool_factors:    PoolBreakdown,
    pub global_cap:      f64,
    pub post_pool_total: f64,
    pub global_factor:   f64,
}

/// Fold contributions into one entry per (recipient, type, level),
/// ordered by key.
pub fn aggregate(contributions: &[BaseCommission]) -> Vec<AggregatedCommission> {
    let mut by_key: BTreeMap<(UserId, CommissionType, u32), (i128, BTreeSet<UserId>)> =
        BTreeMap::new();
    for c in contributions {
        let entry = by_key
            .entry((c.recipient, c.commission_type, c.level))
            .or_default();
        entry.0 += to_micros(c.base_amount);
        entry.1.insert(c.source);
    }
    by_key
        .into_iter()
        .map(|((user_id, commission_type, level), (micros, sources))| AggregatedCommission {
            user_id,
            commission_type,
            level,
            base_amount: from_micros(micros),
            sources,
        })
        .collect()
}

/// Σ base per pool, as a parallel fold/reduce.
pub fn pool_totals(records: &[AggregatedCommission]) -> PoolBreakdown {
    let [direct, binary, override_] = records
        .par_iter()
        .fold(
            || [0i128; 3],
            |mut acc, r| {
                acc[pool_index(r.commission_type)] += to_micros(r.base_amount);
                acc
            },
        )
        .reduce(
            || [0i128; 3],
            |a, b| [a[0] + b[0], a[1] + b[1], a[2] + b[2]],
        );
    PoolBreakdown {
        direct:    from_micros(direct),
        binary:    from_micros(binary),
        override_: from_micros(override_),
    }
}

fn pool_index(pool: CommissionType) -> usize {
    match pool {
        CommissionType::Direct   => 0,
        CommissionType::Binary   => 1,
        CommissionType::Override => 2,
    }
}

/// A clamp factor in (0, 1]. Never amplifies; vacuous when nothing is owed.
fn clamp_factor(budget: f64, total: f64) -> f64 {
    if total <= 0.0 {
        1.0
    } else {
        (budget / total).min(1.0)
    }
}

pub fn compute_factors(
    sales_volume: f64,
    unscaled: PoolBreakdown,
    config: &CommissionConfig,
) -> ScalingOutcome {
    // Nothing sold: nothing is payable, and no clamp is applied.
    if sales_volume <= 0.0 {
        return ScalingOutcome {
            sales_volume: 0.0,
            budgets: PoolBreakdown::default(),
            unscaled,
            pool_factors: PoolBreakdown::uniform(1.0),
            global_cap: 0.0,
            post_pool_total: 0.0,
            global_factor: 1.0,
        };
    }

    let mut budgets = PoolBreakdown::default();
    let mut pool_factors = PoolBreakdown::default();
    let mut post_pool_total = 0.0;
    for pool in CommissionType::ALL {
        let budget = config.pool_rates.rate(pool) * sales_volume;
        let factor = clamp_factor(budget, unscaled.get(pool));
        budgets.set(pool, budget);
        pool_factors.set(pool, factor);
        post_pool_total += unscaled.get(pool) * factor;
    }

    let global_cap = config.global_cap_rate * sales_volume;
    ScalingOutcome {
        sales_volume,
        budgets,
        unscaled,
        pool_factors,
        global_cap,
        post_pool_total,
        global_factor: clamp_factor(global_cap, post_pool_total),
    }
}

/// Pass 2: pool clamp first, global clamp second, then round down to cents.
pub fn apply_factors(
    records: Vec<AggregatedCommission>,
    outcome: &ScalingOutcome,
) -> Vec<ScaledCommission> {
    let payable = outcome.sales_volume > 0.0;
    records
        .into_par_iter()
        .map(|commission| {
            let pool_factor = outcome.pool_factors.get(commission.commission_type);
            let global_factor = outcome.global_factor;
            let scaled_amount = if payable {
                floor_cents(commission.base_amount * pool_factor * global_factor)
            } else {
                0.0
            };
            ScaledCommission {
                commission,
                pool_factor,
                global_factor,
                scaled_amount,
            }
        })
        .collect()
}

/// Σ scaled per pool.
pub fn scaled_totals(scaled: &[ScaledCommission]) -> PoolBreakdown {
    let mut totals = PoolBreakdown::default();
    for pool in CommissionType::ALL {
        let micros: i128 = scaled
            .iter()
            .filter(|s| s.commission.commission_type == pool)
            .map(|s| to_micros(s.scaled_amount))
            .sum();
        totals.set(pool, from_micros(micros));
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(user_id: UserId, t: CommissionType, base: f64) -> AggregatedCommission {
        AggregatedCommission {
            user_id,
            commission_type: t,
            level: 1,
            base_amount: base,
            sources: BTreeSet::from([user_id + 100]),
        }
    }

    #[test]
    fn clamp_factor_never_amplifies() {
        assert_eq!(clamp_factor(100.0, 50.0), 1.0);
        assert_eq!(clamp_factor(100.0, 0.0), 1.0);
        assert!((clamp_factor(20_000.0, 25_000.0) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn aggregate_merges_same_key_and_counts_sources() {
        let contributions = vec![
            BaseCommission {
                recipient: 1,
                source: 10,
                commission_type: CommissionType::Direct,
                level: 1,
                base_amount: 5.0,
            },
            BaseCommission {
                recipient: 1,
                source: 11,
                commission_type: CommissionType::Direct,
                level: 1,
                base_amount: 2.5,
            },
            BaseCommission {
                recipient: 1,
                source: 10,
                commission_type: CommissionType::Direct,
                level: 2,
                base_amount: 1.0,
            },
        ];
        let out = aggregate(&contributions);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].base_amount, 7.5);
        assert_eq!(out[0].sole_source(), None);
        assert_eq!(out[1].sole_source(), Some(10));
    }

    #[test]
    fn pool_totals_split_by_type() {
        let records = vec![
            agg(1, CommissionType::Direct, 10.0),
            agg(2, CommissionType::Direct, 5.0),
            agg(3, CommissionType::Binary, 7.0),
        ];
        let totals = pool_totals(&records);
        assert_eq!(totals.direct, 15.0);
        assert_eq!(totals.binary, 7.0);
        assert_eq!(totals.override_, 0.0);
    }
}
