//! Same network, same period, same as_of: same commissions, same root.
//!
//! Two engines on separate databases must agree byte for byte on every
//! amount, factor and proof. Any divergence is a blocker.

mod common;

use commission_core::{
    demo::DemoNetwork,
    engine::SettlementEngine,
    store::{CommissionRecordRow, WeeklySettlementRow},
};
use common::*;

fn seeded_engine(seed: u64, participants: usize) -> SettlementEngine {
    let store = store();
    DemoNetwork::generate(seed, participants, period())
        .write_to(&store)
        .expect("seed demo network");
    engine(store)
}

/// Records without the per-run identifiers.
fn comparable_records(rows: Vec<CommissionRecordRow>) -> Vec<CommissionRecordRow> {
    rows.into_iter()
        .map(|mut r| {
            r.record_id.clear();
            r.run_id.clear();
            r
        })
        .collect()
}

fn comparable_settlements(rows: Vec<WeeklySettlementRow>) -> Vec<WeeklySettlementRow> {
    rows.into_iter()
        .map(|mut s| {
            s.run_id.clear();
            s
        })
        .collect()
}

#[test]
fn identical_inputs_produce_identical_settlements() {
    let a = seeded_engine(42, 400);
    let b = seeded_engine(42, 400);

    let sa = a.calculate_at(PERIOD, as_of()).unwrap();
    let sb = b.calculate_at(PERIOD, as_of()).unwrap();
    assert_eq!(sa.unscaled, sb.unscaled);
    assert_eq!(sa.pool_factors, sb.pool_factors);
    assert_eq!(sa.scaled, sb.scaled);

    assert_eq!(
        comparable_records(a.store.commission_records_for_period(PERIOD).unwrap()),
        comparable_records(b.store.commission_records_for_period(PERIOD).unwrap()),
    );
    assert_eq!(
        comparable_settlements(a.store.settlements_for_period(PERIOD).unwrap()),
        comparable_settlements(b.store.settlements_for_period(PERIOD).unwrap()),
    );

    let fa = a.finalize_at(PERIOD, as_of()).unwrap();
    let fb = b.finalize_at(PERIOD, as_of()).unwrap();
    assert_eq!(fa.merkle_root, fb.merkle_root, "Merkle roots diverged");
    assert_eq!(fa.total_amount, fb.total_amount);
    assert_eq!(
        comparable_settlements(a.store.settlements_for_period(PERIOD).unwrap()),
        comparable_settlements(b.store.settlements_for_period(PERIOD).unwrap()),
        "proofs diverged",
    );
}

#[test]
fn repeated_runs_on_one_database_are_stable() {
    let engine = seeded_engine(7, 250);
    let first = engine.calculate_at(PERIOD, as_of()).unwrap();
    let records = comparable_records(engine.store.commission_records_for_period(PERIOD).unwrap());

    for _ in 0..3 {
        let again = engine.calculate_at(PERIOD, as_of()).unwrap();
        assert_eq!(again.scaled, first.scaled);
        assert_eq!(
            comparable_records(engine.store.commission_records_for_period(PERIOD).unwrap()),
            records
        );
    }
}

#[test]
fn different_seeds_produce_different_roots() {
    let a = seeded_engine(1, 200);
    let b = seeded_engine(2, 200);
    a.calculate_at(PERIOD, as_of()).unwrap();
    b.calculate_at(PERIOD, as_of()).unwrap();
    let ra = a.finalize_at(PERIOD, as_of()).unwrap().merkle_root;
    let rb = b.finalize_at(PERIOD, as_of()).unwrap().merkle_root;
    assert_ne!(ra, rb);
}
