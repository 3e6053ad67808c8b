use crate::types::UserId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommissionError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Period {period_key} is locked by {holder} ({purpose})")]
    PeriodLocked {
        period_key: String,
        holder:     String,
        purpose:    String,
    },

    #[error("Period {period_key} is finalized; commissions can no longer be recalculated")]
    PeriodFinalized { period_key: String },

    #[error("Period {period_key} was already finalized with root {merkle_root}")]
    AlreadyFinalized {
        period_key:  String,
        merkle_root: String,
    },

    #[error("Consistency violation in period {period_key}: {reason}")]
    Consistency { period_key: String, reason: String },

    #[error("Period {period_key} has no claimable settlements")]
    NothingToFinalize { period_key: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CommissionError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }

    pub fn consistency(period_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Consistency {
            period_key: period_key.into(),
            reason:     reason.into(),
        }
    }
}

pub type CommissionResult<T> = Result<T, CommissionError>;

/// One participant's data could not be used by one calculator.
/// Collected into the run summary; never aborts a run.
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[error("participant {user_id} skipped by {calculator}: {reason}")]
pub struct PartialComputeError {
    pub user_id:    UserId,
    pub calculator: String,
    pub reason:     String,
}

impl PartialComputeError {
    pub fn new(user_id: UserId, calculator: &str, reason: impl Into<String>) -> Self {
        Self {
            user_id,
            calculator: calculator.to_string(),
            reason:     reason.into(),
        }
    }
}
