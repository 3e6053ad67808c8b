//! Binary matching and override commissions over the binary-parent tree.

mod common;

use commission_core::{
    binary_commission::BinaryCommissionCalculator,
    calculator::CommissionCalculator,
    override_commission::OverrideCommissionCalculator,
    snapshot::PeriodSnapshot,
    store::GhostVolumeRow,
    types::{CommissionType, Leg},
};
use chrono::Duration;
use common::*;

fn binary() -> BinaryCommissionCalculator {
    BinaryCommissionCalculator::new(0.10)
}

fn overrides() -> OverrideCommissionCalculator {
    OverrideCommissionCalculator::new(vec![0.05, 0.03, 0.02], 0.10)
}

/// 1 at the top; 2 and 3 under 1; 4 and 5 under 2; 6 under 4.
/// Sponsorship deliberately differs from placement.
fn tree(store: &commission_core::store::SettlementStore) {
    participant(store, 1, None, None);
    participant(store, 2, Some(1), Some((1, Leg::Left)));
    participant(store, 3, Some(2), Some((1, Leg::Right)));
    participant(store, 4, Some(3), Some((2, Leg::Left)));
    participant(store, 5, Some(1), Some((2, Leg::Right)));
    participant(store, 6, Some(1), Some((4, Leg::Left)));
    sale(store, "t1", 6, 10.0);

    node(store, 1, 1_000.0, 800.0);
    node(store, 2, 200.0, 100.0); // binary 10
    node(store, 3, 50.0, 400.0); //  binary 5
    node(store, 4, 100.0, 100.0); // binary 10
    node(store, 6, 70.0, 30.0); //   binary 3
}

#[test]
fn binary_pays_match_rate_on_weak_leg() {
    let store = store();
    tree(&store);
    let out = binary().compute(&snapshot(&store), 1).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].recipient, 1);
    assert_eq!(out[0].source, 1);
    assert_eq!(out[0].level, 1);
    assert_eq!(out[0].commission_type, CommissionType::Binary);
    assert!(approx(out[0].base_amount, 80.0));
}

#[test]
fn binary_skips_zero_weak_leg_and_missing_node() {
    let store = store();
    participant(&store, 1, None, None);
    participant(&store, 2, None, None);
    sale(&store, "t1", 1, 10.0);
    node(&store, 1, 500.0, 0.0);

    let snap = snapshot(&store);
    assert!(binary().compute(&snap, 1).unwrap().is_empty());
    assert!(binary().compute(&snap, 2).unwrap().is_empty());
}

#[test]
fn negative_leg_volume_is_a_partial_compute_error() {
    let store = store();
    participant(&store, 1, None, None);
    sale(&store, "t1", 1, 10.0);
    node(&store, 1, -5.0, 100.0);

    let err = binary().compute(&snapshot(&store), 1).unwrap_err();
    assert_eq!(err.calculator, "binary");
    assert!(err.reason.contains("negative"));
}

#[test]
fn override_walks_binary_children_by_level() {
    let store = store();
    tree(&store);
    let out = overrides().compute(&snapshot(&store), 1).unwrap();

    let mut by_source: Vec<(i64, u32, f64)> =
        out.iter().map(|c| (c.source, c.level, c.base_amount)).collect();
    by_source.sort_by_key(|(s, _, _)| *s);

    // Level 1: 2 and 3. Level 2: 4 (5 has no node). Level 3: 6.
    assert_eq!(by_source.len(), 4);
    assert_eq!((by_source[0].0, by_source[0].1), (2, 1));
    assert!(approx(by_source[0].2, 10.0 * 0.05));
    assert_eq!((by_source[1].0, by_source[1].1), (3, 1));
    assert!(approx(by_source[1].2, 5.0 * 0.05));
    assert_eq!((by_source[2].0, by_source[2].1), (4, 2));
    assert!(approx(by_source[2].2, 10.0 * 0.03));
    assert_eq!((by_source[3].0, by_source[3].1), (6, 3));
    assert!(approx(by_source[3].2, 3.0 * 0.02));
    assert!(out.iter().all(|c| c.recipient == 1));
}

#[test]
fn override_follows_placement_not_sponsorship() {
    let store = store();
    tree(&store);
    // 3 sponsored 4, but 4 is placed under 2: 3 earns no override from 4.
    let out = overrides().compute(&snapshot(&store), 3).unwrap();
    assert!(out.is_empty());
}

#[test]
fn override_depth_is_bounded() {
    let store = store();
    participant(&store, 1, None, None);
    for id in 2..=6 {
        participant(&store, id, None, Some((id - 1, Leg::Left)));
        node(&store, id, 100.0, 100.0);
    }
    sale(&store, "t1", 1, 10.0);

    let out = overrides().compute(&snapshot(&store), 1).unwrap();
    let levels: Vec<u32> = out.iter().map(|c| c.level).collect();
    assert_eq!(levels, vec![1, 2, 3], "4 links deep and beyond is unpaid");
}

#[test]
fn binary_parent_cycle_is_a_partial_compute_error() {
    let store = store();
    participant(&store, 1, None, Some((2, Leg::Left)));
    participant(&store, 2, None, Some((1, Leg::Left)));
    sale(&store, "t1", 1, 10.0);

    let err = overrides().compute(&snapshot(&store), 1).unwrap_err();
    assert_eq!(err.calculator, "override");
    assert!(err.reason.contains("cycle"));
}

#[test]
fn malformed_child_node_skips_the_earner() {
    let store = store();
    tree(&store);
    node(&store, 3, -1.0, 10.0);

    let err = overrides().compute(&snapshot(&store), 1).unwrap_err();
    assert!(err.reason.contains("downline 3"), "reason was: {}", err.reason);
}

#[test]
fn ghost_volume_counts_only_inside_its_window() {
    let store = store();
    participant(&store, 1, None, None);
    sale(&store, "t1", 1, 10.0);
    node(&store, 1, 500.0, 300.0);

    let now = as_of().timestamp();
    let day = 86_400;
    let ghost = |id: &str, leg: Leg, amount: f64, created_at: i64| GhostVolumeRow {
        ghost_id: id.to_string(),
        user_id: 1,
        pay_leg: leg,
        amount,
        created_at,
        expires_at: created_at + 10 * day,
        status: "active".to_string(),
    };
    // Live: created 2 days ago.
    store.insert_ghost_volume(&ghost("live", Leg::Right, 100.0, now - 2 * day)).unwrap();
    // Lapsed but not yet swept by the safety valve.
    store.insert_ghost_volume(&ghost("lapsed", Leg::Right, 150.0, now - 20 * day)).unwrap();

    let snap = snapshot(&store);
    let n = &snap.nodes[&1];
    assert!(approx(n.right_volume, 150.0), "lapsed ghost withheld, got {}", n.right_volume);
    assert!(approx(snap.withheld_ghost_volume, 150.0));

    // Before the live ghost starts, it is withheld too.
    let early = PeriodSnapshot::load(&store, period(), as_of() - Duration::days(3)).unwrap();
    assert!(approx(early.nodes[&1].right_volume, 50.0));
}

#[test]
fn engine_rolls_up_binary_and_override_per_user() {
    let store = store();
    tree(&store);
    sale(&store, "t2", 1, 100_000.0);

    let engine = engine(store);
    engine.calculate_at(PERIOD, as_of()).unwrap();

    let s1 = engine.store.settlement(1, PERIOD).unwrap().unwrap();
    assert!(approx(s1.binary_total, 80.0));
    assert!(approx(s1.override_total, 0.5 + 0.25 + 0.3 + 0.06));

    let records = engine.store.commission_records_for_period(PERIOD).unwrap();
    let level1 = records
        .iter()
        .find(|r| r.user_id == 1 && r.commission_type == CommissionType::Override && r.level == 1)
        .expect("level 1 override");
    assert_eq!(level1.source_count, 2);
    assert_eq!(level1.source_user_id, None, "two sources, no single source");
    let binary = records
        .iter()
        .find(|r| r.user_id == 1 && r.commission_type == CommissionType::Binary)
        .unwrap();
    assert_eq!(binary.source_user_id, Some(1));
}
