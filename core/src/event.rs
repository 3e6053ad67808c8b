//! Audit events: every operator-relevant occurrence in a run.
//!
//! RULE: Anything an auditor may need to reconstruct a payout decision
//! is emitted as a SettlementEvent and appended to event_log.

use crate::types::{CommissionType, Leg, RunId, UserId};
use serde::{Deserialize, Serialize};

/// Variants are appended as features land. Never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    // ── Calculation ────────────────────────────────
    CalculationStarted {
        period_key: String,
        as_of:      i64,
        participants: usize,
    },
    ParticipantSkipped {
        user_id:    UserId,
        calculator: String,
        reason:     String,
    },
    PoolScaled {
        pool:          CommissionType,
        budget:        f64,
        unscaled:      f64,
        pool_factor:   f64,
        global_factor: f64,
    },
    CalculationCompleted {
        period_key:   String,
        sales_volume: f64,
        records:      usize,
        settlements:  usize,
        skipped:      usize,
    },

    // ── Finalization ───────────────────────────────
    SettlementFinalized {
        period_key:   String,
        merkle_root:  String,
        total_users:  usize,
        total_amount: f64,
    },

    // ── Safety valve ───────────────────────────────
    GhostVolumeExpired {
        ghost_id: String,
        user_id:  UserId,
        leg:      Leg,
        amount:   f64,
    },
    CarryForwardFlushed {
        record_id: String,
        user_id:   UserId,
        leg:       Leg,
        amount:    f64,
    },
    CapBreachCorrected {
        user_id:    UserId,
        period_key: String,
        grand_total: f64,
        cap:        f64,
        clamped:    bool,
    },
    PayoutRatioAlert {
        window_start: String,
        window_end:   String,
        ratio:        f64,
        threshold:    f64,
    },
    MaintenanceTaskFailed {
        task:  String,
        error: String,
    },
    MaintenanceDeferred {
        task:       String,
        period_key: String,
        rows:       usize,
    },
}

impl SettlementEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CalculationStarted { .. }    => "calculation_started",
            Self::ParticipantSkipped { .. }    => "participant_skipped",
            Self::PoolScaled { .. }            => "pool_scaled",
            Self::CalculationCompleted { .. }  => "calculation_completed",
            Self::SettlementFinalized { .. }   => "settlement_finalized",
            Self::GhostVolumeExpired { .. }    => "ghost_volume_expired",
            Self::CarryForwardFlushed { .. }   => "carry_forward_flushed",
            Self::CapBreachCorrected { .. }    => "cap_breach_corrected",
            Self::PayoutRatioAlert { .. }      => "payout_ratio_alert",
            Self::MaintenanceTaskFailed { .. } => "maintenance_task_failed",
            Self::MaintenanceDeferred { .. }   => "maintenance_deferred",
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub period_key: Option<String>,
    pub component:  String,
    pub event_type: String,
    pub payload:    String, // JSON-serialized SettlementEvent
    pub created_at: i64,
}
