//! Pool scaling: per-pool clamps, the global clamp, and the zero-volume case.

mod common;

use commission_core::{
    calculator::BaseCommission,
    config::{CommissionConfig, PoolRates},
    demo::DemoNetwork,
    pool_scaling::{aggregate, apply_factors, compute_factors, pool_totals, scaled_totals},
    types::{CommissionType, UserId},
};
use common::*;

fn base(recipient: UserId, source: UserId, t: CommissionType, amount: f64) -> BaseCommission {
    BaseCommission {
        recipient,
        source,
        commission_type: t,
        level: 1,
        base_amount: amount,
    }
}

#[test]
fn direct_pool_over_budget_scales_by_point_eight() {
    // SV 100,000; A's direct base 12,000; direct pool 25,000 vs 20,000 budget.
    let contributions = vec![
        base(1, 10, CommissionType::Direct, 12_000.0),
        base(2, 11, CommissionType::Direct, 13_000.0),
        base(3, 3, CommissionType::Binary, 5_000.0),
    ];
    let aggregated = aggregate(&contributions);
    let unscaled = pool_totals(&aggregated);
    let outcome = compute_factors(100_000.0, unscaled, &CommissionConfig::default());

    assert!(approx(outcome.budgets.direct, 20_000.0));
    assert!(approx(outcome.pool_factors.direct, 0.8));
    assert_eq!(outcome.pool_factors.binary, 1.0);
    assert_eq!(outcome.pool_factors.override_, 1.0, "empty pool is vacuous");
    assert_eq!(outcome.global_factor, 1.0);

    let scaled = apply_factors(aggregated, &outcome);
    let a = scaled.iter().find(|s| s.commission.user_id == 1).unwrap();
    assert_eq!(a.scaled_amount, 9_600.0);
    assert_eq!(scaled_totals(&scaled).direct, 20_000.0);
}

#[test]
fn global_clamp_catches_misconfigured_pool_rates() {
    let config = CommissionConfig {
        pool_rates: PoolRates {
            direct:    0.30,
            binary:    0.30,
            override_: 0.10,
        },
        ..CommissionConfig::default()
    };
    let contributions = vec![
        base(1, 10, CommissionType::Direct, 30_000.0),
        base(2, 2, CommissionType::Binary, 20_000.0),
    ];
    let aggregated = aggregate(&contributions);
    let outcome = compute_factors(100_000.0, pool_totals(&aggregated), &config);

    assert_eq!(outcome.pool_factors.direct, 1.0);
    assert_eq!(outcome.pool_factors.binary, 1.0);
    assert!(approx(outcome.post_pool_total, 50_000.0));
    assert!(approx(outcome.global_factor, 0.8));

    let scaled = apply_factors(aggregated, &outcome);
    let total = scaled_totals(&scaled).total();
    assert!(total <= 40_000.0 + 1e-9, "aggregate ceiling breached: {total}");
}

#[test]
fn zero_sales_volume_pays_nothing_with_unit_factors() {
    let contributions = vec![base(1, 1, CommissionType::Binary, 250.0)];
    let aggregated = aggregate(&contributions);
    let outcome = compute_factors(0.0, pool_totals(&aggregated), &CommissionConfig::default());

    assert_eq!(outcome.pool_factors.direct, 1.0);
    assert_eq!(outcome.pool_factors.binary, 1.0);
    assert_eq!(outcome.pool_factors.override_, 1.0);
    assert_eq!(outcome.global_factor, 1.0);
    let scaled = apply_factors(aggregated, &outcome);
    assert!(scaled.iter().all(|s| s.scaled_amount == 0.0));
}

#[test]
fn zero_sales_period_persists_zero_settlements() {
    let store = store();
    participant(&store, 1, None, None);
    node(&store, 1, 400.0, 400.0);

    let engine = engine(store);
    let summary = engine.calculate_at(PERIOD, as_of()).unwrap();
    assert_eq!(summary.sales_volume, 0.0);
    assert_eq!(summary.scaled_total(), 0.0);

    let s = engine.store.settlement(1, PERIOD).unwrap().unwrap();
    assert_eq!(s.grand_total, 0.0);
    assert_eq!(s.binary_factor, 1.0);
    assert_eq!(s.global_factor, 1.0);
}

#[test]
fn demo_network_respects_every_budget() {
    let store = store();
    let net = DemoNetwork::generate(2025, 300, period());
    net.write_to(&store).unwrap();

    let engine = engine(store);
    let summary = engine.calculate_at(PERIOD, as_of()).unwrap();
    let sv = summary.sales_volume;
    assert!(approx(sv, net.sales_volume()));

    for pool in CommissionType::ALL {
        let budget = summary.budgets.get(pool);
        let scaled = summary.scaled.get(pool);
        assert!(scaled <= budget + 1e-6, "{pool:?}: scaled {scaled} over budget {budget}");
        let factor = summary.pool_factors.get(pool);
        assert!(factor > 0.0 && factor <= 1.0, "{pool:?} factor {factor}");
    }
    assert!(summary.global_factor > 0.0 && summary.global_factor <= 1.0);
    assert!(summary.scaled_total() <= 0.40 * sv + 1e-6);

    // The persisted rollups add up to the same totals.
    let settled: f64 = engine
        .store
        .settlements_for_period(PERIOD)
        .unwrap()
        .iter()
        .map(|s| s.grand_total)
        .sum();
    assert!((settled - summary.scaled_total()).abs() < 0.01 * summary.persisted.settlements_written as f64 + 1e-6);
}
