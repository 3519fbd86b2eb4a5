//! Step delay calculation.
//!
//! A step's due date is `enrolled_at` plus the delays of every step up to
//! and including it, with the first step's delay forced to zero. Pure, no I/O.

use cadence_core::types::{Enrollment, Step};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Whether an enrollment's next step should be sent now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum DueStatus {
    Due { due_at: DateTime<Utc> },
    NotDue { due_at: DateTime<Utc> },
    /// `current_step` is past the last step.
    Complete,
}

/// Cumulative delay in days from enrollment to `step_index`.
pub fn cumulative_delay_days(steps: &[Step], step_index: u32) -> Option<u64> {
    let index = step_index as usize;
    if index >= steps.len() {
        return None;
    }
    Some(
        steps[1..=index]
            .iter()
            .map(|s| u64::from(s.delay_days))
            .sum(),
    )
}

/// Due date of `step_index` for an enrollment starting at `enrolled_at`.
pub fn due_at(enrolled_at: DateTime<Utc>, steps: &[Step], step_index: u32) -> Option<DateTime<Utc>> {
    let days = cumulative_delay_days(steps, step_index)?;
    let days = i64::try_from(days).ok()?;
    enrolled_at.checked_add_signed(Duration::try_days(days)?)
}

/// Evaluate whether the enrollment's `current_step` is due at `now`.
pub fn evaluate(enrollment: &Enrollment, steps: &[Step], now: DateTime<Utc>) -> DueStatus {
    match due_at(enrollment.enrolled_at, steps, enrollment.current_step) {
        Some(due_at) if now >= due_at => DueStatus::Due { due_at },
        Some(due_at) => DueStatus::NotDue { due_at },
        None => DueStatus::Complete,
    }
}
