//! Period run lock. At most one calculate/finalize per period at a time.
//!
//! The lock is a row in period_lock, so it holds across processes sharing
//! the database. The guard releases it on drop. A row older than the TTL is
//! treated as left behind by a crashed run and may be taken over.

use crate::{
    error::{CommissionError, CommissionResult},
    period::PeriodKey,
    store::{PeriodLockRow, SettlementStore},
};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPurpose {
    Calculate,
    Finalize,
}

impl LockPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calculate => "calculate",
            Self::Finalize  => "finalize",
        }
    }
}

pub struct PeriodLock<'a> {
    store:      &'a SettlementStore,
    period_key: String,
    holder:     String,
}

impl std::fmt::Debug for PeriodLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodLock")
            .field("period_key", &self.period_key)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl<'a> PeriodLock<'a> {
    pub fn acquire(
        store: &'a SettlementStore,
        period: PeriodKey,
        holder: &str,
        purpose: LockPurpose,
        now: DateTime<Utc>,
        ttl_minutes: i64,
    ) -> CommissionResult<Self> {
        let row = PeriodLockRow {
            period_key:  period.to_string(),
            holder:      holder.to_string(),
            purpose:     purpose.as_str().to_string(),
            acquired_at: now.timestamp(),
        };
        let stale_before = (now - Duration::minutes(ttl_minutes)).timestamp();

        if let Some(current) = store.try_acquire_period_lock(&row, stale_before)? {
            return Err(CommissionError::PeriodLocked {
                period_key: current.period_key,
                holder:     current.holder,
                purpose:    current.purpose,
            });
        }
        log::debug!("period {period}: lock acquired by {holder} for {}", purpose.as_str());
        Ok(Self {
            store,
            period_key: row.period_key,
            holder: row.holder,
        })
    }

    pub fn period_key(&self) -> &str {
        &self.period_key
    }
}

impl Drop for PeriodLock<'_> {
    fn drop(&mut self) {
        match self.store.release_period_lock(&self.period_key, &self.holder) {
            Ok(true) => log::debug!("period {}: lock released by {}", self.period_key, self.holder),
            Ok(false) => log::warn!(
                "period {}: lock held by {} was already taken over",
                self.period_key,
                self.holder
            ),
            Err(e) => log::warn!("period {}: failed to release lock: {e}", self.period_key),
        }
    }
}
