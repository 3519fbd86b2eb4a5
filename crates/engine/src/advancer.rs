//! Enrollment advancer: moves an enrollment forward once its current step
//! has been settled (sent now, or found already sent).

use crate::state_machine::EnrollmentStateMachine;
use cadence_core::error::CadenceResult;
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::types::{Enrollment, EnrollmentStatus, EventType};
use cadence_store::{ProgressUpdate, SequenceStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// What happened to the enrollment's current step this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    AlreadySent,
    /// Operator skipped the step without sending it.
    Skipped,
    NotDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceResult {
    Unchanged,
    Advanced { current_step: u32 },
    Completed { completed_at: DateTime<Utc> },
    /// The enrollment moved under us (another writer advanced or completed
    /// it); nothing was written.
    Stale,
}

pub struct EnrollmentAdvancer {
    store: Arc<dyn SequenceStore>,
    event_sink: Arc<dyn EventSink>,
}

impl EnrollmentAdvancer {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self {
            store,
            event_sink: cadence_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Apply a dispatch outcome for a sequence of `step_count` steps.
    pub async fn apply(
        &self,
        enrollment: &Enrollment,
        step_count: u32,
        outcome: DispatchOutcome,
        now: DateTime<Utc>,
    ) -> CadenceResult<AdvanceResult> {
        if outcome == DispatchOutcome::NotDue {
            return Ok(AdvanceResult::Unchanged);
        }

        let next = enrollment.current_step.saturating_add(1);
        if next >= step_count {
            return self.complete(enrollment, step_count, now).await;
        }

        let update = ProgressUpdate {
            expected_step: enrollment.current_step,
            new_step: next,
            expected_status: enrollment.status,
            completed_at: None,
        };
        if !self.store.update_progress(enrollment.id, update).await? {
            debug!(enrollment_id = %enrollment.id, "Enrollment changed concurrently; skipping advance");
            return Ok(AdvanceResult::Stale);
        }

        debug!(enrollment_id = %enrollment.id, current_step = next, "Enrollment advanced");
        self.event_sink.emit(make_event(
            EventType::EnrollmentAdvanced,
            Some(enrollment.sequence_id),
            Some(enrollment.id),
            Some(enrollment.member_id),
            Some(next),
        ));
        Ok(AdvanceResult::Advanced { current_step: next })
    }

    /// Mark the enrollment completed. `current_step` becomes the step count
    /// unless it is already past it.
    pub async fn complete(
        &self,
        enrollment: &Enrollment,
        step_count: u32,
        now: DateTime<Utc>,
    ) -> CadenceResult<AdvanceResult> {
        EnrollmentStateMachine::check(enrollment.status, EnrollmentStatus::Completed)?;

        let update = ProgressUpdate {
            expected_step: enrollment.current_step,
            new_step: enrollment.current_step.max(step_count),
            expected_status: enrollment.status,
            completed_at: Some(now),
        };
        if !self.store.update_progress(enrollment.id, update).await? {
            debug!(enrollment_id = %enrollment.id, "Enrollment changed concurrently; skipping completion");
            return Ok(AdvanceResult::Stale);
        }

        metrics::counter!("sequence.completed").increment(1);
        info!(
            enrollment_id = %enrollment.id,
            sequence_id = %enrollment.sequence_id,
            member_id = %enrollment.member_id,
            "Enrollment completed"
        );
        self.event_sink.emit(make_event(
            EventType::EnrollmentCompleted,
            Some(enrollment.sequence_id),
            Some(enrollment.id),
            Some(enrollment.member_id),
            None,
        ));
        Ok(AdvanceResult::Completed { completed_at: now })
    }
}
