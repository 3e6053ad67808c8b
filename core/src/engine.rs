//! The settlement engine: the two operator actions for a period.
//!
//! calculate (idempotent, re-runnable):
//!   1. Validate the period key and load the snapshot. No write before this.
//!   2. Pass 1: every calculator over every participant, in parallel.
//!   3. Barrier: aggregate, sum pools, derive both clamp factors.
//!   4. Pass 2: apply factors, in parallel.
//!   5. Persist records and settlements in chunks, sweep stale rows.
//!
//! finalize (one-shot, irreversible):
//!   Merkle build over the frozen settlement set, after calculate committed.
//!
//! RULES:
//!   - Both actions hold the period lock for their whole duration.
//!   - A participant's bad data skips that participant, never the run.
//!   - Every operator-relevant occurrence is recorded in the event log.

use crate::{
    calculator::{BaseCommission, CommissionCalculator},
    binary_commission::BinaryCommissionCalculator,
    config::CommissionConfig,
    direct_commission::DirectCommissionCalculator,
    error::{CommissionError, CommissionResult, PartialComputeError},
    event::{EventLogEntry, SettlementEvent},
    merkle_settlement::{FinalizeSummary, MerkleSettlementBuilder},
    override_commission::OverrideCommissionCalculator,
    period::PeriodKey,
    pool_scaling::{self, PoolBreakdown},
    run_lock::{LockPurpose, PeriodLock},
    safety_valve::{SafetyValveJob, SafetyValveReport},
    settlement::{PersistOutcome, SettlementPersister},
    snapshot::PeriodSnapshot,
    store::SettlementStore,
    types::{CommissionType, RunId},
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured result of one calculate run, persisted as the run summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalculationSummary {
    pub run_id:                RunId,
    pub period_key:            String,
    pub as_of:                 i64,
    pub participants:          usize,
    pub sales_volume:          f64,
    pub budgets:               PoolBreakdown,
    pub unscaled:              PoolBreakdown,
    pub pool_factors:          PoolBreakdown,
    pub global_cap:            f64,
    pub post_pool_total:       f64,
    pub global_factor:         f64,
    pub scaled:                PoolBreakdown,
    pub withheld_ghost_volume: f64,
    pub persisted:             PersistOutcome,
    /// Participants dropped by one calculator, with the reason.
    pub skipped:               Vec<PartialComputeError>,
}

impl CalculationSummary {
    pub fn scaled_total(&self) -> f64 {
        self.scaled.total()
    }

    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

pub struct SettlementEngine {
    pub store:   SettlementStore,
    config:      CommissionConfig,
    calculators: Vec<Box<dyn CommissionCalculator>>,
    holder:      String,
}

impl SettlementEngine {
    pub fn new(store: SettlementStore, config: CommissionConfig) -> CommissionResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            calculators: Vec::new(),
            holder: format!("{}-{}", std::process::id(), Uuid::new_v4()),
        })
    }

    /// Build an engine with the three production calculators registered.
    /// Call this instead of new() + manual register() calls.
    pub fn build(store: SettlementStore, config: CommissionConfig) -> CommissionResult<Self> {
        let mut engine = Self::new(store, config)?;
        let direct = DirectCommissionCalculator::new(engine.config.direct_tier_rates.clone());
        let binary = BinaryCommissionCalculator::new(engine.config.binary_match_rate);
        let override_ = OverrideCommissionCalculator::new(
            engine.config.override_level_rates.clone(),
            engine.config.binary_match_rate,
        );
        engine.register(Box::new(direct));
        engine.register(Box::new(binary));
        engine.register(Box::new(override_));
        Ok(engine)
    }

    pub fn register(&mut self, calculator: Box<dyn CommissionCalculator>) {
        self.calculators.push(calculator);
    }

    pub fn config(&self) -> &CommissionConfig {
        &self.config
    }

    // ── calculate ──────────────────────────────────────────────────

    pub fn calculate(&self, period_key: &str) -> CommissionResult<CalculationSummary> {
        self.calculate_at(period_key, Utc::now())
    }

    /// Run with a fixed read-at-start timestamp.
    pub fn calculate_at(
        &self,
        period_key: &str,
        as_of: DateTime<Utc>,
    ) -> CommissionResult<CalculationSummary> {
        let period = PeriodKey::parse(period_key)?;
        self.ensure_not_finalized(period)?;
        // The lock ages by wall clock; `as_of` only fixes the snapshot.
        let _lock = PeriodLock::acquire(
            &self.store,
            period,
            &self.holder,
            LockPurpose::Calculate,
            Utc::now(),
            self.config.lock_ttl_minutes,
        )?;
        // A finalize may have committed between the first check and the lock.
        self.ensure_not_finalized(period)?;

        let snapshot = PeriodSnapshot::load(&self.store, period, as_of)?;

        let run_id = Uuid::new_v4().to_string();
        self.store
            .insert_calculation_run(&run_id, &period.to_string(), as_of.timestamp())?;

        match self.run_calculation(&run_id, &snapshot) {
            Ok(summary) => {
                let json = serde_json::to_string(&summary)?;
                self.store.complete_calculation_run(
                    &run_id,
                    "completed",
                    Some(&json),
                    Utc::now().timestamp(),
                )?;
                Ok(summary)
            }
            Err(e) => {
                log::warn!("period {period}: run {run_id} failed: {e}");
                if let Err(mark) = self.store.complete_calculation_run(
                    &run_id,
                    "failed",
                    None,
                    Utc::now().timestamp(),
                ) {
                    log::warn!("period {period}: could not mark run {run_id} failed: {mark}");
                }
                Err(e)
            }
        }
    }

    fn ensure_not_finalized(&self, period: PeriodKey) -> CommissionResult<()> {
        if self.store.batch_for_period(&period.to_string())?.is_some() {
            return Err(CommissionError::PeriodFinalized {
                period_key: period.to_string(),
            });
        }
        Ok(())
    }

    fn run_calculation(
        &self,
        run_id: &str,
        snapshot: &PeriodSnapshot,
    ) -> CommissionResult<CalculationSummary> {
        let period_key = snapshot.period.to_string();
        let ids = snapshot.participant_ids();
        self.emit(
            run_id,
            &period_key,
            "engine",
            &SettlementEvent::CalculationStarted {
                period_key: period_key.clone(),
                as_of: snapshot.as_of.timestamp(),
                participants: ids.len(),
            },
        )?;

        // Pass 1. collect() keeps participant order, so the result does not
        // depend on how rayon schedules the work.
        let calculators = &self.calculators;
        let per_user: Vec<(Vec<BaseCommission>, Vec<PartialComputeError>)> = ids
            .par_iter()
            .map(|&user_id| {
                let mut contributions = Vec::new();
                let mut skipped = Vec::new();
                for calc in calculators {
                    match calc.compute(snapshot, user_id) {
                        Ok(found) => contributions.extend(found),
                        Err(e) => skipped.push(e),
                    }
                }
                (contributions, skipped)
            })
            .collect();

        let mut skipped = snapshot.load_issues.clone();
        let mut contributions = Vec::new();
        for (found, errs) in per_user {
            contributions.extend(found);
            skipped.extend(errs);
        }
        for issue in &skipped {
            log::warn!("period {period_key}: {issue}");
            self.emit(
                run_id,
                &period_key,
                &issue.calculator,
                &SettlementEvent::ParticipantSkipped {
                    user_id:    issue.user_id,
                    calculator: issue.calculator.clone(),
                    reason:     issue.reason.clone(),
                },
            )?;
        }

        // Barrier: no scaled amount exists until every base is summed.
        let aggregated = pool_scaling::aggregate(&contributions);
        let unscaled = pool_scaling::pool_totals(&aggregated);
        let outcome = pool_scaling::compute_factors(snapshot.sales_volume, unscaled, &self.config);

        // Pass 2.
        let scaled = pool_scaling::apply_factors(aggregated, &outcome);
        let scaled_totals = pool_scaling::scaled_totals(&scaled);

        for pool in CommissionType::ALL {
            self.emit(
                run_id,
                &period_key,
                "pool_scaling",
                &SettlementEvent::PoolScaled {
                    pool,
                    budget:        outcome.budgets.get(pool),
                    unscaled:      outcome.unscaled.get(pool),
                    pool_factor:   outcome.pool_factors.get(pool),
                    global_factor: outcome.global_factor,
                },
            )?;
        }
        log::info!(
            "period {period_key}: SV {:.2}, budgets d={:.2} b={:.2} o={:.2}, unscaled d={:.2} b={:.2} o={:.2}",
            outcome.sales_volume,
            outcome.budgets.direct,
            outcome.budgets.binary,
            outcome.budgets.override_,
            outcome.unscaled.direct,
            outcome.unscaled.binary,
            outcome.unscaled.override_,
        );
        log::info!(
            "period {period_key}: factors d={:.6} b={:.6} o={:.6} global={:.6}, scaled total {:.2}",
            outcome.pool_factors.direct,
            outcome.pool_factors.binary,
            outcome.pool_factors.override_,
            outcome.global_factor,
            scaled_totals.total(),
        );

        let persister = SettlementPersister::new(&self.store, self.config.persist_chunk_size);
        let persisted = persister.persist(run_id, &period_key, &scaled, &outcome)?;

        self.emit(
            run_id,
            &period_key,
            "engine",
            &SettlementEvent::CalculationCompleted {
                period_key:   period_key.clone(),
                sales_volume: outcome.sales_volume,
                records:      persisted.records_written,
                settlements:  persisted.settlements_written,
                skipped:      skipped.len(),
            },
        )?;

        Ok(CalculationSummary {
            run_id: run_id.to_string(),
            period_key,
            as_of: snapshot.as_of.timestamp(),
            participants: ids.len(),
            sales_volume: outcome.sales_volume,
            budgets: outcome.budgets,
            unscaled: outcome.unscaled,
            pool_factors: outcome.pool_factors,
            global_cap: outcome.global_cap,
            post_pool_total: outcome.post_pool_total,
            global_factor: outcome.global_factor,
            scaled: scaled_totals,
            withheld_ghost_volume: snapshot.withheld_ghost_volume,
            persisted,
            skipped,
        })
    }

    /// Summary of the latest completed calculate run for a period.
    pub fn calculation_summary(&self, period_key: &str) -> CommissionResult<Option<CalculationSummary>> {
        let period = PeriodKey::parse(period_key)?;
        match self.store.latest_calculation_summary(&period.to_string())? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // ── finalize ───────────────────────────────────────────────────

    pub fn finalize(&self, period_key: &str) -> CommissionResult<FinalizeSummary> {
        self.finalize_at(period_key, Utc::now())
    }

    pub fn finalize_at(&self, period_key: &str, now: DateTime<Utc>) -> CommissionResult<FinalizeSummary> {
        let period = PeriodKey::parse(period_key)?;
        if let Some(batch) = self.store.batch_for_period(&period.to_string())? {
            return Err(CommissionError::AlreadyFinalized {
                period_key:  batch.period_key,
                merkle_root: batch.merkle_root,
            });
        }

        let _lock = PeriodLock::acquire(
            &self.store,
            period,
            &self.holder,
            LockPurpose::Finalize,
            Utc::now(),
            self.config.lock_ttl_minutes,
        )?;
        let summary = MerkleSettlementBuilder::new(&self.store, &self.config).finalize(period, now)?;

        self.emit(
            &Uuid::new_v4().to_string(),
            &summary.period_key,
            "merkle_settlement",
            &SettlementEvent::SettlementFinalized {
                period_key:   summary.period_key.clone(),
                merkle_root:  summary.merkle_root.clone(),
                total_users:  summary.total_users,
                total_amount: summary.total_amount,
            },
        )?;
        Ok(summary)
    }

    // ── maintenance ────────────────────────────────────────────────

    pub fn run_safety_valve(&self, now: DateTime<Utc>) -> CommissionResult<SafetyValveReport> {
        SafetyValveJob::standard(self.config.clone()).run(&self.store, now)
    }

    fn emit(
        &self,
        run_id: &str,
        period_key: &str,
        component: &str,
        event: &SettlementEvent,
    ) -> CommissionResult<()> {
        let entry = EventLogEntry {
            id:         None,
            run_id:     run_id.to_string(),
            period_key: Some(period_key.to_string()),
            component:  component.to_string(),
            event_type: event.type_name().to_string(),
            payload:    serde_json::to_string(event)?,
            created_at: Utc::now().timestamp(),
        };
        self.store.append_event(&entry)
    }
}
