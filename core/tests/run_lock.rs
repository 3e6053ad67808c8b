//! Period run lock across two connections to one database file.

mod common;

use chrono::{Duration, Utc};
use commission_core::{
    calculator::{BaseCommission, CommissionCalculator},
    config::CommissionConfig,
    error::{CommissionError, PartialComputeError},
    period::PeriodKey,
    run_lock::{LockPurpose, PeriodLock},
    snapshot::PeriodSnapshot,
    store::SettlementStore,
    types::{CommissionType, UserId},
    SettlementEngine,
};
use common::*;
use std::sync::{Arc, Mutex};

struct TempDb {
    path: std::path::PathBuf,
}

impl TempDb {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("settlement-{}.db", uuid::Uuid::new_v4()));
        Self { path }
    }

    fn open(&self) -> SettlementStore {
        let store = SettlementStore::open(self.path.to_str().unwrap()).expect("open file db");
        store.migrate().expect("migration");
        store
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.path.display()));
        }
    }
}

#[test]
fn second_holder_is_refused_until_release() {
    let db = TempDb::new();
    let a = db.open();
    let b = a.reopen().unwrap();
    let now = as_of();

    let guard = PeriodLock::acquire(&a, period(), "worker-a", LockPurpose::Calculate, now, 120).unwrap();
    let err = PeriodLock::acquire(&b, period(), "worker-b", LockPurpose::Finalize, now, 120).unwrap_err();
    match err {
        CommissionError::PeriodLocked { holder, purpose, .. } => {
            assert_eq!(holder, "worker-a");
            assert_eq!(purpose, "calculate");
        }
        other => panic!("expected PeriodLocked, got {other}"),
    }

    drop(guard);
    let relock = PeriodLock::acquire(&b, period(), "worker-b", LockPurpose::Finalize, now, 120);
    assert!(relock.is_ok(), "released lock can be taken");
}

#[test]
fn different_periods_do_not_contend() {
    let db = TempDb::new();
    let a = db.open();
    let b = a.reopen().unwrap();
    let next = PeriodKey::parse("2025-01-13").unwrap();

    let _g1 = PeriodLock::acquire(&a, period(), "worker-a", LockPurpose::Calculate, as_of(), 120).unwrap();
    let _g2 = PeriodLock::acquire(&b, next, "worker-b", LockPurpose::Calculate, as_of(), 120).unwrap();
    assert_eq!(a.held_period_locks().unwrap().len(), 2);
}

#[test]
fn abandoned_lock_is_taken_over_after_ttl() {
    let db = TempDb::new();
    let a = db.open();
    let b = a.reopen().unwrap();

    let crashed = PeriodLock::acquire(&a, period(), "crashed", LockPurpose::Calculate, as_of(), 120).unwrap();
    // Simulate the crash: the guard never runs.
    std::mem::forget(crashed);

    let too_soon = as_of() + Duration::minutes(60);
    assert!(PeriodLock::acquire(&b, period(), "rescuer", LockPurpose::Calculate, too_soon, 120).is_err());

    let later = as_of() + Duration::minutes(121);
    let rescued = PeriodLock::acquire(&b, period(), "rescuer", LockPurpose::Calculate, later, 120).unwrap();
    assert_eq!(rescued.period_key(), PERIOD);
    assert_eq!(b.held_period_locks().unwrap()[0].holder, "rescuer");
}

#[test]
fn calculate_is_refused_while_another_run_holds_the_period() {
    let db = TempDb::new();
    let seed = db.open();
    participant(&seed, 1, None, None);
    sale(&seed, "t1", 1, 100.0);

    let engine = SettlementEngine::build(seed.reopen().unwrap(), CommissionConfig::default()).unwrap();
    // Held the way a live run holds it: stamped with the wall clock, while
    // the contender's read-at-start time is days earlier.
    let _other = PeriodLock::acquire(&seed, period(), "other-runner", LockPurpose::Calculate, Utc::now(), 120)
        .unwrap();

    let err = engine.calculate_at(PERIOD, as_of()).unwrap_err();
    assert!(matches!(err, CommissionError::PeriodLocked { .. }), "{err}");
    assert_eq!(engine.store.calculation_run_count(PERIOD).unwrap(), 0);

    let err = engine.finalize_at(PERIOD, as_of()).unwrap_err();
    assert!(matches!(err, CommissionError::PeriodLocked { .. }), "{err}");
}

/// What a second connection observed while a run was in pass 1.
#[derive(Debug, Default)]
struct Observed {
    rival_refused: bool,
    in_flight:     Vec<String>,
}

/// Runs inside the first engine's calculation and contends from another
/// connection: a second calculate for the same period, then the safety valve.
struct Contender {
    path:     String,
    observed: Arc<Mutex<Option<Observed>>>,
}

impl CommissionCalculator for Contender {
    fn name(&self) -> &'static str {
        "contender"
    }

    fn commission_type(&self) -> CommissionType {
        CommissionType::Direct
    }

    fn compute(
        &self,
        _snapshot: &PeriodSnapshot,
        _user_id: UserId,
    ) -> Result<Vec<BaseCommission>, PartialComputeError> {
        let mut observed = self.observed.lock().unwrap();
        if observed.is_none() {
            let store = SettlementStore::open(&self.path).expect("second connection");
            let rival = SettlementEngine::build(store, CommissionConfig::default()).unwrap();
            let rival_refused = matches!(
                rival.calculate_at(PERIOD, as_of()),
                Err(CommissionError::PeriodLocked { .. })
            );
            let report = rival.run_safety_valve(Utc::now()).unwrap();
            *observed = Some(Observed { rival_refused, in_flight: report.in_flight });
        }
        Ok(Vec::new())
    }
}

#[test]
fn backdated_run_holds_its_period_for_the_whole_calculation() {
    let db = TempDb::new();
    let seed = db.open();
    participant(&seed, 1, None, None);
    sale(&seed, "t1", 1, 100.0);

    let observed = Arc::new(Mutex::new(None));
    let mut engine = SettlementEngine::build(seed.reopen().unwrap(), CommissionConfig::default()).unwrap();
    engine.register(Box::new(Contender {
        path:     db.path.to_str().unwrap().to_string(),
        observed: Arc::clone(&observed),
    }));

    // as_of is long past; the lock must still count as fresh.
    engine.calculate_at(PERIOD, as_of()).unwrap();

    let observed = observed.lock().unwrap().take().expect("contender ran");
    assert!(observed.rival_refused, "second calculate must not take the lock over");
    assert_eq!(observed.in_flight, vec![PERIOD.to_string()]);
    assert_eq!(seed.calculation_run_count(PERIOD).unwrap(), 1);
    assert!(seed.held_period_locks().unwrap().is_empty());
}
