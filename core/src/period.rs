//! Settlement periods, one per calendar week, keyed by its opening Monday.

use crate::{
    error::{CommissionError, CommissionResult},
    types::Timestamp,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PERIOD_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodKey {
    start: NaiveDate,
}

impl PeriodKey {
    /// Parse a `YYYY-MM-DD` key. The date must be a Monday.
    pub fn parse(raw: &str) -> CommissionResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CommissionError::validation("period key is missing"));
        }
        let start = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|e| {
            CommissionError::validation(format!("period key '{trimmed}' is malformed: {e}"))
        })?;
        if start.weekday() != Weekday::Mon {
            return Err(CommissionError::validation(format!(
                "period key '{trimmed}' is a {:?}, periods open on Monday",
                start.weekday()
            )));
        }
        Ok(Self { start })
    }

    /// The period containing `at`.
    pub fn containing(at: DateTime<Utc>) -> Self {
        let date = at.date_naive();
        let offset = date.weekday().num_days_from_monday() as i64;
        Self { start: date - Duration::days(offset) }
    }

    pub fn starts_at(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.start.and_time(chrono::NaiveTime::MIN))
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.starts_at() + Duration::days(PERIOD_DAYS)
    }

    /// Midnight UTC of the opening Monday. This is the period field of a Merkle leaf.
    pub fn unix_timestamp(&self) -> Timestamp {
        self.starts_at().timestamp()
    }

    /// Whether `[from, to)` overlaps this period's week.
    pub fn overlaps(&self, from: Timestamp, to: Timestamp) -> bool {
        let start = self.unix_timestamp();
        let end = self.ends_at().timestamp();
        from < end && to > start
    }

    pub fn previous(&self) -> Self {
        Self { start: self.start - Duration::days(PERIOD_DAYS) }
    }

    /// This period and the `n - 1` before it, oldest first.
    pub fn trailing(&self, n: u32) -> Vec<Self> {
        let mut out = Vec::with_capacity(n as usize);
        let mut p = *self;
        for _ in 0..n {
            out.push(p);
            p = p.previous();
        }
        out.reverse();
        out
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start.format("%Y-%m-%d"))
    }
}
