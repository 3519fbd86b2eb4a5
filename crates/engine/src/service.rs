use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use cadence_channels::TrackingLinks;
use cadence_core::error::{CadenceError, CadenceResult};
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::steps::{normalize_steps, validate_steps, RawSequence};
use cadence_core::types::{
    DeliveryRecord, Enrollment, EnrollmentStatus, EventType, Sequence, SequenceStats,
};
use cadence_store::{MemberDirectory, SequenceStore};

use crate::advancer::{AdvanceResult, DispatchOutcome, EnrollmentAdvancer};
use crate::clock::Clock;
use crate::state_machine::EnrollmentStateMachine;
use crate::tracking::EngagementTracker;

/// Operator-facing surface of the engine: sequence definitions, enrollment
/// lifecycle, engagement tracking and statistics.
#[derive(Clone)]
pub struct SequenceService {
    store: Arc<dyn SequenceStore>,
    directory: Arc<dyn MemberDirectory>,
    clock: Arc<dyn Clock>,
    links: TrackingLinks,
    advancer: Arc<EnrollmentAdvancer>,
    tracker: Arc<EngagementTracker>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SequenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceService")
            .field("tracking_base", &self.links.base_url())
            .finish()
    }
}

impl SequenceService {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        directory: Arc<dyn MemberDirectory>,
        clock: Arc<dyn Clock>,
        links: TrackingLinks,
    ) -> Self {
        Self {
            advancer: Arc::new(EnrollmentAdvancer::new(store.clone())),
            tracker: Arc::new(EngagementTracker::new(
                store.clone(),
                clock.clone(),
                links.clone(),
            )),
            store,
            directory,
            clock,
            links,
            event_sink: cadence_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.advancer =
            Arc::new(EnrollmentAdvancer::new(self.store.clone()).with_event_sink(sink.clone()));
        self.tracker = Arc::new(
            EngagementTracker::new(self.store.clone(), self.clock.clone(), self.links.clone())
                .with_event_sink(sink.clone()),
        );
        self.event_sink = sink;
        self
    }

    pub fn tracker(&self) -> &EngagementTracker {
        &self.tracker
    }

    // ─── Sequences ──────────────────────────────────────────────────────

    /// Normalize a raw definition and store it as a new sequence.
    pub async fn create_sequence(&self, raw: RawSequence) -> CadenceResult<Sequence> {
        let steps = normalize_steps(&raw.steps)?;
        let mut sequence = Sequence::new(raw.name, steps);
        sequence.is_active = raw.is_active;
        sequence.is_onboarding = raw.is_onboarding;
        sequence.created_at = self.clock.now();
        self.store.put_sequence(&sequence).await?;
        info!(
            sequence_id = %sequence.id,
            name = %sequence.name,
            steps = sequence.steps.len(),
            "Sequence created"
        );
        Ok(sequence)
    }

    /// Store a canonical sequence, replacing the definition if it exists.
    /// Counters already accumulated are kept.
    pub async fn put_sequence(&self, sequence: &Sequence) -> CadenceResult<()> {
        validate_steps(&sequence.steps)?;
        self.store.put_sequence(sequence).await
    }

    pub async fn get_sequence(&self, id: Uuid) -> CadenceResult<Sequence> {
        self.store
            .get_sequence(id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("sequence {id}")))
    }

    pub async fn list_sequences(&self) -> CadenceResult<Vec<Sequence>> {
        self.store.list_sequences().await
    }

    pub async fn set_sequence_active(&self, id: Uuid, is_active: bool) -> CadenceResult<Sequence> {
        let mut sequence = self.get_sequence(id).await?;
        sequence.is_active = is_active;
        self.store.put_sequence(&sequence).await?;
        info!(sequence_id = %id, is_active, "Sequence activation changed");
        Ok(sequence)
    }

    // ─── Enrollments ────────────────────────────────────────────────────

    /// Enroll a member at step 0. Fails with `Conflict` if the member has
    /// ever been enrolled in this sequence.
    pub async fn enroll(&self, member_id: Uuid, sequence_id: Uuid) -> CadenceResult<Enrollment> {
        let sequence = self.get_sequence(sequence_id).await?;
        if !sequence.is_active {
            return Err(CadenceError::InvalidState(format!(
                "sequence {sequence_id} is not active"
            )));
        }
        if self.directory.get_member(member_id).await?.is_none() {
            return Err(CadenceError::NotFound(format!("member {member_id}")));
        }

        let enrollment = Enrollment::new(member_id, sequence_id, self.clock.now());
        self.store.insert_enrollment(&enrollment).await?;

        info!(
            enrollment_id = %enrollment.id,
            member_id = %member_id,
            sequence_id = %sequence_id,
            "Member enrolled"
        );
        self.event_sink.emit(make_event(
            EventType::EnrollmentCreated,
            Some(sequence_id),
            Some(enrollment.id),
            Some(member_id),
            Some(0),
        ));
        Ok(enrollment)
    }

    /// Enroll a member in every active onboarding sequence. Sequences the
    /// member is already enrolled in are skipped.
    pub async fn enroll_onboarding(&self, member_id: Uuid) -> CadenceResult<Vec<Enrollment>> {
        let mut created = Vec::new();
        for sequence in self.store.list_sequences().await? {
            if !(sequence.is_active && sequence.is_onboarding) {
                continue;
            }
            match self.enroll(member_id, sequence.id).await {
                Ok(enrollment) => created.push(enrollment),
                Err(CadenceError::Conflict(_)) => {
                    debug!(member_id = %member_id, sequence_id = %sequence.id, "Already enrolled")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    pub async fn get_enrollment(&self, id: Uuid) -> CadenceResult<Enrollment> {
        self.store
            .get_enrollment(id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("enrollment {id}")))
    }

    pub async fn find_enrollment(
        &self,
        member_id: Uuid,
        sequence_id: Uuid,
    ) -> CadenceResult<Option<Enrollment>> {
        self.store.find_enrollment(member_id, sequence_id).await
    }

    pub async fn pause(&self, id: Uuid) -> CadenceResult<Enrollment> {
        self.change_status(id, EnrollmentStatus::Paused, EventType::EnrollmentPaused)
            .await
    }

    pub async fn resume(&self, id: Uuid) -> CadenceResult<Enrollment> {
        self.change_status(id, EnrollmentStatus::Active, EventType::EnrollmentResumed)
            .await
    }

    async fn change_status(
        &self,
        id: Uuid,
        to: EnrollmentStatus,
        event_type: EventType,
    ) -> CadenceResult<Enrollment> {
        let mut enrollment = self.get_enrollment(id).await?;
        let from = enrollment.status;
        EnrollmentStateMachine::check(from, to)?;

        if !self.store.transition_status(id, from, to).await? {
            return Err(CadenceError::InvalidState(format!(
                "enrollment {id} changed status concurrently"
            )));
        }
        enrollment.status = to;

        info!(enrollment_id = %id, ?from, ?to, "Enrollment status changed");
        self.event_sink.emit(make_event(
            event_type,
            Some(enrollment.sequence_id),
            Some(id),
            Some(enrollment.member_id),
            Some(enrollment.current_step),
        ));
        Ok(enrollment)
    }

    /// Skip the current step without sending it. Advancing past the last
    /// step completes the enrollment.
    pub async fn advance(&self, id: Uuid) -> CadenceResult<Enrollment> {
        let enrollment = self.get_enrollment(id).await?;
        if enrollment.status == EnrollmentStatus::Completed {
            return Err(CadenceError::InvalidState(format!(
                "enrollment {id} is already completed"
            )));
        }
        let sequence = self.get_sequence(enrollment.sequence_id).await?;

        let result = self
            .advancer
            .apply(
                &enrollment,
                sequence.step_count(),
                DispatchOutcome::Skipped,
                self.clock.now(),
            )
            .await?;
        if result == AdvanceResult::Stale {
            return Err(CadenceError::InvalidState(format!(
                "enrollment {id} changed concurrently"
            )));
        }
        info!(enrollment_id = %id, ?result, "Enrollment advanced manually");
        self.get_enrollment(id).await
    }

    // ─── Engagement ─────────────────────────────────────────────────────

    pub async fn record_open(&self, tracking_id: &str) -> bool {
        self.tracker.record_open(tracking_id).await
    }

    /// Record a click and return the redirect target.
    pub async fn record_click(&self, tracking_id: &str, url: Option<&str>) -> String {
        self.tracker.record_click(tracking_id, url).await
    }

    // ─── Statistics ─────────────────────────────────────────────────────

    pub async fn sequence_stats(&self, sequence_id: Uuid) -> CadenceResult<SequenceStats> {
        Ok(self.get_sequence(sequence_id).await?.stats())
    }

    pub async fn all_sequence_stats(&self) -> CadenceResult<Vec<SequenceStats>> {
        Ok(self
            .store
            .list_sequences()
            .await?
            .iter()
            .map(Sequence::stats)
            .collect())
    }

    pub async fn list_deliveries(&self, sequence_id: Uuid) -> CadenceResult<Vec<DeliveryRecord>> {
        self.get_sequence(sequence_id).await?;
        self.store.list_deliveries(sequence_id).await
    }
}
