//! Shared fixtures for the integration tests.
//! Each test file uses a different subset.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use commission_core::{
    config::CommissionConfig,
    engine::SettlementEngine,
    period::PeriodKey,
    snapshot::PeriodSnapshot,
    store::{BinaryNodeRow, ParticipantRow, SettlementStore, TransactionRow},
    types::{Leg, UserId},
};

pub const PERIOD: &str = "2025-01-06";

pub fn period() -> PeriodKey {
    PeriodKey::parse(PERIOD).expect("valid period")
}

/// Read-at-start time: the Monday after the period closes.
pub fn as_of() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 13, 0, 0, 0).unwrap()
}

pub fn store() -> SettlementStore {
    let store = SettlementStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    store
}

pub fn engine(store: SettlementStore) -> SettlementEngine {
    SettlementEngine::build(store, CommissionConfig::default()).expect("engine")
}

pub fn engine_with(store: SettlementStore, config: CommissionConfig) -> SettlementEngine {
    SettlementEngine::build(store, config).expect("engine")
}

/// Record a completed calculation run for a period, once, so settlements
/// written directly by a test can be finalized. Returns its run id.
pub fn completed_run(store: &SettlementStore, period_key: &str) -> String {
    let run_id = format!("fixture-{period_key}");
    if store.latest_calculation_run(period_key).unwrap().is_none() {
        let at = as_of().timestamp();
        store.insert_calculation_run(&run_id, period_key, at).unwrap();
        store.complete_calculation_run(&run_id, "completed", None, at).unwrap();
    }
    run_id
}

/// Deterministic, distinct wallet for a small integer.
pub fn wallet(n: u64) -> String {
    format!("0x{n:040x}")
}

/// Participant with the default wallet `wallet(id)`.
pub fn participant(
    store: &SettlementStore,
    user_id: UserId,
    sponsor_id: Option<UserId>,
    binary_parent: Option<(UserId, Leg)>,
) {
    participant_with_wallet(store, user_id, sponsor_id, binary_parent, Some(&wallet(user_id as u64)));
}

pub fn participant_with_wallet(
    store: &SettlementStore,
    user_id: UserId,
    sponsor_id: Option<UserId>,
    binary_parent: Option<(UserId, Leg)>,
    wallet_address: Option<&str>,
) {
    store
        .upsert_participant(&ParticipantRow {
            user_id,
            sponsor_id,
            binary_parent_id: binary_parent.map(|(p, _)| p),
            binary_position: binary_parent.map(|(_, leg)| leg),
            wallet_address: wallet_address.map(str::to_string),
            rank: None,
        })
        .expect("upsert participant");
}

pub fn sale(store: &SettlementStore, tx_id: &str, user_id: UserId, amount: f64) {
    sale_in(store, tx_id, user_id, amount, PERIOD, true);
}

pub fn sale_in(
    store: &SettlementStore,
    tx_id: &str,
    user_id: UserId,
    amount: f64,
    period_key: &str,
    eligible: bool,
) {
    let created_at = PeriodKey::parse(period_key)
        .expect("valid period")
        .unix_timestamp()
        + 3_600;
    store
        .insert_transaction(&TransactionRow {
            tx_id: tx_id.to_string(),
            user_id,
            amount,
            period_key: period_key.to_string(),
            eligible,
            created_at,
        })
        .expect("insert transaction");
}

pub fn node(store: &SettlementStore, user_id: UserId, left_volume: f64, right_volume: f64) {
    store
        .upsert_binary_node(
            &BinaryNodeRow {
                user_id,
                left_leg_id: None,
                right_leg_id: None,
                left_volume,
                right_volume,
            },
            0,
        )
        .expect("upsert node");
}

pub fn snapshot(store: &SettlementStore) -> PeriodSnapshot {
    PeriodSnapshot::load(store, period(), as_of()).expect("snapshot")
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
