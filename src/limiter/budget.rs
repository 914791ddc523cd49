//! Budget Tracking
//!
//! Pure helpers for the metered-data budget: billing-cycle rollover dates
//! and conversion of configured megabytes into a byte budget.

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Bytes per configured megabyte
pub const BYTES_PER_MEGABYTE: u64 = 1_000_000;

/// Earliest billing-cycle day
pub const MIN_PLAN_DATE: u32 = 1;

/// Latest billing-cycle day; every month has it
pub const MAX_PLAN_DATE: u32 = 28;

/// Byte budget for the current metering period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetWindow {
    /// Ceiling in bytes
    pub budget: u64,

    /// False means the connection is unmetered
    pub has_budget: bool,

    /// Bytes consumed in this window
    pub count: u64,
}

impl BudgetWindow {
    /// Replace the ceiling, leaving the consumed count alone
    ///
    /// When `has_budget` is false the window is unmetered and `megabytes`
    /// is irrelevant.
    pub fn set_budget(&mut self, megabytes: u64, has_budget: bool) {
        self.budget = megabytes.saturating_mul(BYTES_PER_MEGABYTE);
        self.has_budget = has_budget;
    }

    /// Whether the window has no room left
    pub fn is_exhausted(&self) -> bool {
        self.has_budget && self.count >= self.budget
    }

    /// Whether the consumed count has gone past the ceiling
    pub fn is_exceeded(&self) -> bool {
        self.has_budget && self.count > self.budget
    }

    /// Start a new period
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// `day` of the month containing `now`, at midnight
///
/// Days outside the billing-cycle range are clamped into it.
pub fn day_this_month(day: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let day = day.clamp(MIN_PLAN_DATE, MAX_PLAN_DATE);
    let date = NaiveDate::from_ymd_opt(now.year(), now.month(), day).unwrap_or(now.date_naive());
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Push `date` forward by a month unless it is at or after `now`
///
/// A date equal to `now` is kept: a timer scheduled for that instant fires
/// immediately, which is acceptable.
pub fn ensure_future(date: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if date >= now {
        return date;
    }
    date.checked_add_months(Months::new(1)).unwrap_or(date)
}

/// Next rollover instant for a billing cycle starting on `day`
pub fn next_rollover(day: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    ensure_future(day_this_month(day, now), now)
}
