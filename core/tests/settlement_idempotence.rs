//! Re-running calculate overwrites; it never duplicates or leaves stale rows.

mod common;

use commission_core::{
    error::CommissionError,
    store::SettlementStore,
    types::{CommissionType, Leg, SettlementStatus},
};
use common::*;
use std::collections::BTreeMap;

fn network(store: &SettlementStore) {
    participant(store, 1, None, None);
    participant(store, 2, Some(1), Some((1, Leg::Left)));
    participant(store, 3, Some(1), Some((1, Leg::Right)));
    participant(store, 4, Some(2), Some((2, Leg::Left)));
    sale(store, "t1", 2, 1_000.0);
    sale(store, "t2", 3, 2_000.0);
    sale(store, "t3", 4, 500.0);
    node(store, 1, 1_500.0, 2_000.0);
    node(store, 2, 500.0, 250.0);
}

#[test]
fn rerun_overwrites_without_duplicates() {
    let store = store();
    network(&store);
    let engine = engine(store);

    let first = engine.calculate_at(PERIOD, as_of()).unwrap();
    let records_before = engine.store.commission_records_for_period(PERIOD).unwrap();
    let settlements_before = engine.store.settlements_for_period(PERIOD).unwrap();

    let second = engine.calculate_at(PERIOD, as_of()).unwrap();
    let records_after = engine.store.commission_records_for_period(PERIOD).unwrap();
    let settlements_after = engine.store.settlements_for_period(PERIOD).unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(records_before.len(), records_after.len());
    assert_eq!(settlements_before.len(), settlements_after.len());
    assert_eq!(engine.store.calculation_run_count(PERIOD).unwrap(), 2);

    for (before, after) in records_before.iter().zip(&records_after) {
        assert_eq!(before.record_id, after.record_id, "record id survives an overwrite");
        assert_eq!(before.scaled_amount, after.scaled_amount);
        assert_eq!(after.run_id, second.run_id);
    }
    for (before, after) in settlements_before.iter().zip(&settlements_after) {
        assert_eq!(before.grand_total, after.grand_total);
    }
    assert_eq!(second.persisted.stale_records_removed, 0);
}

#[test]
fn rerun_removes_rows_no_longer_produced() {
    let store = store();
    network(&store);
    let engine = engine(store);
    engine.calculate_at(PERIOD, as_of()).unwrap();
    assert!(engine.store.settlement(2, PERIOD).unwrap().is_some());

    // 2's weak leg drains to zero: its binary record and 1's override go.
    node(&engine.store, 2, 500.0, 0.0);
    let summary = engine.calculate_at(PERIOD, as_of()).unwrap();

    let records = engine.store.commission_records_for_period(PERIOD).unwrap();
    assert!(!records
        .iter()
        .any(|r| r.user_id == 2 && r.commission_type == CommissionType::Binary));
    assert!(summary.persisted.stale_records_removed >= 2);
    assert!(records.iter().all(|r| r.run_id == summary.run_id));

    let mut keys = BTreeMap::new();
    for r in &records {
        *keys.entry((r.user_id, r.commission_type, r.level)).or_insert(0) += 1;
    }
    assert!(keys.values().all(|&n| n == 1), "idempotency key is unique");
}

#[test]
fn summary_is_persisted_with_the_run() {
    let store = store();
    network(&store);
    let engine = engine(store);
    let summary = engine.calculate_at(PERIOD, as_of()).unwrap();

    let stored = engine.calculation_summary(PERIOD).unwrap().expect("summary");
    assert_eq!(stored, summary);
    assert_eq!(engine.store.event_count("calculation_completed").unwrap(), 1);
    assert_eq!(engine.store.event_count("pool_scaled").unwrap(), 3);
}

#[test]
fn settlement_rollup_matches_its_records() {
    let store = store();
    network(&store);
    let engine = engine(store);
    engine.calculate_at(PERIOD, as_of()).unwrap();

    let records = engine.store.commission_records_for_period(PERIOD).unwrap();
    for s in engine.store.settlements_for_period(PERIOD).unwrap() {
        let sum: f64 = records
            .iter()
            .filter(|r| r.user_id == s.user_id)
            .map(|r| r.scaled_amount)
            .sum();
        assert!(approx(sum, s.grand_total), "user {}: {sum} vs {}", s.user_id, s.grand_total);
        assert!(approx(s.direct_total + s.binary_total + s.override_total, s.grand_total));
        assert_eq!(s.status, SettlementStatus::Pending);
        assert!(s.merkle_proof.is_none());
    }
}

#[test]
fn malformed_period_key_aborts_before_any_write() {
    let store = store();
    network(&store);
    let engine = engine(store);

    for bad in ["", "2025-13-01", "2025-01-07", "last week"] {
        let err = engine.calculate_at(bad, as_of()).unwrap_err();
        assert!(matches!(err, CommissionError::Validation { .. }), "{bad}: {err}");
    }
    assert_eq!(engine.store.calculation_run_count("2025-01-07").unwrap(), 0);
    assert_eq!(engine.store.commission_record_count(PERIOD).unwrap(), 0);
}

#[test]
fn empty_snapshot_is_a_validation_error() {
    let engine = engine(store());
    let err = engine.calculate_at(PERIOD, as_of()).unwrap_err();
    assert!(matches!(err, CommissionError::Validation { .. }));
    assert_eq!(engine.store.calculation_run_count(PERIOD).unwrap(), 0);
    assert!(engine.store.held_period_locks().unwrap().is_empty(), "lock released on error");
}

#[test]
fn finalized_period_cannot_be_recalculated() {
    let store = store();
    network(&store);
    let engine = engine(store);
    engine.calculate_at(PERIOD, as_of()).unwrap();
    engine.finalize_at(PERIOD, as_of()).unwrap();
    let proofs_before = engine.store.settlements_for_period(PERIOD).unwrap();

    let err = engine.calculate_at(PERIOD, as_of()).unwrap_err();
    assert!(matches!(err, CommissionError::PeriodFinalized { .. }), "{err}");
    assert_eq!(engine.store.settlements_for_period(PERIOD).unwrap(), proofs_before);
}
