//! Safety valve job: periodic maintenance on its own schedule.
//!
//! RULE: Every task implements MaintenanceTask. The job runs each task in
//! registration order; a task that fails is logged and reported, and the
//! remaining tasks still run.
//!
//! Tasks that mutate binary leg volume consult the held period locks and
//! leave rows touching an in-flight period for a later run.

use crate::{
    config::CommissionConfig,
    error::{CommissionError, CommissionResult},
    event::{EventLogEntry, SettlementEvent},
    period::PeriodKey,
    store::{PayoutAlertRow, SettlementStore},
    types::SettlementStatus,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

const SECONDS_PER_DAY: i64 = 86_400;

/// What one task sees.
pub struct MaintenanceContext<'a> {
    pub store:     &'a SettlementStore,
    pub config:    &'a CommissionConfig,
    pub now:       DateTime<Utc>,
    /// Periods with a live calculate or finalize lock.
    pub in_flight: Vec<PeriodKey>,
}

impl MaintenanceContext<'_> {
    /// The first in-flight period overlapping `[from, to)`.
    pub fn in_flight_overlapping(&self, from: i64, to: i64) -> Option<PeriodKey> {
        self.in_flight.iter().copied().find(|p| p.overlaps(from, to))
    }

    pub fn is_in_flight(&self, period_key: &str) -> bool {
        self.in_flight.iter().any(|p| p.to_string() == period_key)
    }
}

/// Progress of one task. Filled in as the task runs, so work done before
/// a failure is still reported and audited.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub processed: usize,
    pub deferred:  BTreeMap<String, usize>,
    pub events:    Vec<SettlementEvent>,
}

impl TaskOutcome {
    fn defer(&mut self, period_key: String) {
        *self.deferred.entry(period_key).or_insert(0) += 1;
    }

    pub fn deferred_total(&self) -> usize {
        self.deferred.values().sum()
    }
}

pub trait MaintenanceTask: Send + Sync {
    /// Stable name, used as the event log component.
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &MaintenanceContext<'_>, out: &mut TaskOutcome) -> CommissionResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task:      String,
    pub status:    TaskStatus,
    pub processed: usize,
    pub deferred:  usize,
    pub error:     Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyValveReport {
    pub run_id:    String,
    pub ran_at:    i64,
    pub in_flight: Vec<String>,
    pub tasks:     Vec<TaskReport>,
}

impl SafetyValveReport {
    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task == name)
    }

    pub fn failed_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.task.as_str())
            .collect()
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Expire ghost volume past its window and take it back off the leg.
pub struct GhostVolumeExpiry;

impl MaintenanceTask for GhostVolumeExpiry {
    fn name(&self) -> &'static str {
        "ghost_volume_expiry"
    }

    fn run(&self, ctx: &MaintenanceContext<'_>, out: &mut TaskOutcome) -> CommissionResult<()> {
        for ghost in ctx.store.ghost_volumes_expired_by(ctx.now.timestamp())? {
            if let Some(period) = ctx.in_flight_overlapping(ghost.created_at, ghost.expires_at) {
                out.defer(period.to_string());
                continue;
            }
            if ctx.store.expire_ghost_volume(&ghost)? {
                out.processed += 1;
                out.events.push(SettlementEvent::GhostVolumeExpired {
                    ghost_id: ghost.ghost_id.clone(),
                    user_id:  ghost.user_id,
                    leg:      ghost.pay_leg,
                    amount:   ghost.amount,
                });
            }
        }
        Ok(())
    }
}

/// Zero the carry-forward of volume records older than the aging window.
/// Settled commissions are never revisited.
pub struct VolumeAgingFlush;

impl MaintenanceTask for VolumeAgingFlush {
    fn name(&self) -> &'static str {
        "volume_aging_flush"
    }

    fn run(&self, ctx: &MaintenanceContext<'_>, out: &mut TaskOutcome) -> CommissionResult<()> {
        let aging = ctx.config.volume_aging_days * SECONDS_PER_DAY;
        let now = ctx.now.timestamp();
        for record in ctx.store.volume_records_aged_before(now - aging)? {
            // The record's carry-forward was live over [created_at, created_at + aging).
            if let Some(period) = ctx.in_flight_overlapping(record.created_at, record.created_at + aging) {
                out.defer(period.to_string());
                continue;
            }
            if ctx.store.flush_carry_forward(&record, now)? {
                out.processed += 1;
                out.events.push(SettlementEvent::CarryForwardFlushed {
                    record_id: record.record_id.clone(),
                    user_id:   record.user_id,
                    leg:       record.leg,
                    amount:    record.carry_forward,
                });
            }
        }
        Ok(())
    }
}

/// Clamp settlements above the per-user cap. Pending rows are clamped;
/// published rows keep their amount and are only flagged.
pub struct HardCapBackstop;

impl MaintenanceTask for HardCapBackstop {
    fn name(&self) -> &'static str {
        "hard_cap_backstop"
    }

    fn run(&self, ctx: &MaintenanceContext<'_>, out: &mut TaskOutcome) -> CommissionResult<()> {
        for row in ctx.store.cap_candidates()? {
            let cap = row
                .rank_cap
                .map_or(ctx.config.absolute_user_cap, |rank_cap| {
                    rank_cap.min(ctx.config.absolute_user_cap)
                });
            if row.grand_total <= cap {
                continue;
            }
            if ctx.is_in_flight(&row.period_key) {
                out.defer(row.period_key);
                continue;
            }

            let clamped = match row.status {
                SettlementStatus::Pending => {
                    ctx.store.clamp_settlement_to_cap(row.user_id, &row.period_key, cap)?
                }
                SettlementStatus::ReadyToClaim | SettlementStatus::Paid => {
                    ctx.store.flag_settlement_over_cap(row.user_id, &row.period_key)?;
                    false
                }
            };
            log::warn!(
                "cap breach: user {} period {} total {:.2} over cap {:.2} ({})",
                row.user_id,
                row.period_key,
                row.grand_total,
                cap,
                if clamped { "clamped" } else { "flagged only" }
            );
            out.processed += 1;
            out.events.push(SettlementEvent::CapBreachCorrected {
                user_id:     row.user_id,
                period_key:  row.period_key,
                grand_total: row.grand_total,
                cap,
                clamped,
            });
        }
        Ok(())
    }
}

/// Trailing payout / sales-volume ratio. Detective only.
pub struct PayoutRatioAudit;

impl MaintenanceTask for PayoutRatioAudit {
    fn name(&self) -> &'static str {
        "payout_ratio_audit"
    }

    fn run(&self, ctx: &MaintenanceContext<'_>, out: &mut TaskOutcome) -> CommissionResult<()> {
        let window = PeriodKey::containing(ctx.now).trailing(ctx.config.payout_audit_window_weeks.max(1));
        let keys: Vec<String> = window.iter().map(PeriodKey::to_string).collect();
        let (Some(first), Some(last)) = (keys.first(), keys.last()) else {
            return Ok(());
        };

        let payout_total = ctx.store.sum_grand_totals(&keys)?;
        let sales_volume = ctx.store.sum_eligible_sales(&keys)?;
        out.processed += 1;

        if sales_volume <= 0.0 {
            if payout_total > 0.0 {
                return Err(CommissionError::consistency(
                    format!("{first}..{last}"),
                    format!("payouts of {payout_total:.2} against zero sales volume"),
                ));
            }
            log::debug!("payout audit {first}..{last}: no sales volume");
            return Ok(());
        }

        let ratio = payout_total / sales_volume;
        let threshold = ctx.config.global_cap_rate;
        if ratio <= threshold {
            log::debug!("payout audit {first}..{last}: ratio {ratio:.4} within {threshold:.4}");
            return Ok(());
        }

        log::warn!("payout audit {first}..{last}: ratio {ratio:.4} exceeds {threshold:.4}");
        ctx.store.insert_payout_alert(&PayoutAlertRow {
            alert_id:     Uuid::new_v4().to_string(),
            raised_at:    ctx.now.timestamp(),
            window_start: first.clone(),
            window_end:   last.clone(),
            payout_total,
            sales_volume,
            ratio,
            threshold,
        })?;
        out.events.push(SettlementEvent::PayoutRatioAlert {
            window_start: first.clone(),
            window_end:   last.clone(),
            ratio,
            threshold,
        });
        Ok(())
    }
}

// ── Job ────────────────────────────────────────────────────────────

pub struct SafetyValveJob {
    config: CommissionConfig,
    tasks:  Vec<Box<dyn MaintenanceTask>>,
}

impl SafetyValveJob {
    pub fn new(config: CommissionConfig) -> Self {
        Self {
            config,
            tasks: Vec::new(),
        }
    }

    /// The four production tasks in their fixed order.
    pub fn standard(config: CommissionConfig) -> Self {
        let mut job = Self::new(config);
        job.register(Box::new(GhostVolumeExpiry));
        job.register(Box::new(VolumeAgingFlush));
        job.register(Box::new(HardCapBackstop));
        job.register(Box::new(PayoutRatioAudit));
        job
    }

    pub fn register(&mut self, task: Box<dyn MaintenanceTask>) {
        self.tasks.push(task);
    }

    pub fn run(&self, store: &SettlementStore, now: DateTime<Utc>) -> CommissionResult<SafetyValveReport> {
        let run_id = Uuid::new_v4().to_string();
        let ctx = MaintenanceContext {
            store,
            config: &self.config,
            now,
            in_flight: in_flight_periods(store, now, self.config.lock_ttl_minutes)?,
        };
        if !ctx.in_flight.is_empty() {
            log::info!("safety valve {run_id}: {} periods in flight", ctx.in_flight.len());
        }

        let mut reports = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let mut out = TaskOutcome::default();
            let result = task.run(&ctx, &mut out);

            for (period_key, rows) in &out.deferred {
                log::warn!(
                    "{}: deferred {rows} rows touching in-flight period {period_key}",
                    task.name()
                );
                out.events.push(SettlementEvent::MaintenanceDeferred {
                    task:       task.name().to_string(),
                    period_key: period_key.clone(),
                    rows:       *rows,
                });
            }
            let error = match result {
                Ok(()) => None,
                Err(e) => {
                    log::warn!("{}: failed: {e}", task.name());
                    out.events.push(SettlementEvent::MaintenanceTaskFailed {
                        task:  task.name().to_string(),
                        error: e.to_string(),
                    });
                    Some(e.to_string())
                }
            };

            for event in &out.events {
                append(store, &run_id, task.name(), event, now)?;
            }
            log::info!(
                "{}: processed {}, deferred {}",
                task.name(),
                out.processed,
                out.deferred_total()
            );
            reports.push(TaskReport {
                task:      task.name().to_string(),
                status:    if error.is_some() { TaskStatus::Failed } else { TaskStatus::Completed },
                processed: out.processed,
                deferred:  out.deferred_total(),
                error,
            });
        }

        Ok(SafetyValveReport {
            run_id,
            ran_at: now.timestamp(),
            in_flight: ctx.in_flight.iter().map(PeriodKey::to_string).collect(),
            tasks: reports,
        })
    }
}

/// Periods with a lock younger than the TTL. Abandoned locks do not count.
fn in_flight_periods(
    store: &SettlementStore,
    now: DateTime<Utc>,
    ttl_minutes: i64,
) -> CommissionResult<Vec<PeriodKey>> {
    let stale_before = (now - Duration::minutes(ttl_minutes)).timestamp();
    let mut periods = Vec::new();
    for lock in store.held_period_locks()? {
        if lock.acquired_at < stale_before {
            continue;
        }
        match PeriodKey::parse(&lock.period_key) {
            Ok(p) => periods.push(p),
            Err(e) => log::warn!("ignoring lock with bad period key: {e}"),
        }
    }
    Ok(periods)
}

fn append(
    store: &SettlementStore,
    run_id: &str,
    component: &str,
    event: &SettlementEvent,
    now: DateTime<Utc>,
) -> CommissionResult<()> {
    let period_key = match event {
        SettlementEvent::CapBreachCorrected { period_key, .. }
        | SettlementEvent::MaintenanceDeferred { period_key, .. } => Some(period_key.clone()),
        _ => None,
    };
    store.append_event(&EventLogEntry {
        id: None,
        run_id: run_id.to_string(),
        period_key,
        component: component.to_string(),
        event_type: event.type_name().to_string(),
        payload: serde_json::to_string(event)?,
        created_at: now.timestamp(),
    })
}
