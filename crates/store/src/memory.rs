//! In-memory store backed by DashMap.
//!
//! Every mutation that must be atomic (counter increments, flag
//! compare-and-set, uniqueness checks) happens while holding the DashMap
//! shard guard for the affected entry.

use crate::{Engagement, MarkOutcome, MemberDirectory, ProgressUpdate, SequenceStore};
use async_trait::async_trait;
use cadence_core::error::{CadenceError, CadenceResult};
use cadence_core::types::{
    DeliveryKey, DeliveryRecord, Enrollment, EnrollmentStatus, Member, Sequence, SequenceCounter,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Thread-safe in-memory store for sequences, enrollments and deliveries.
pub struct MemoryStore {
    sequences: DashMap<Uuid, Sequence>,
    enrollments: DashMap<Uuid, Enrollment>,
    /// (member_id, sequence_id) → enrollment id.
    enrollment_pairs: DashMap<(Uuid, Uuid), Uuid>,
    /// tracking_id → delivery.
    deliveries: DashMap<String, DeliveryRecord>,
    delivery_keys: DashMap<DeliveryKey, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Sequence store initialized (in-memory)");
        Self {
            sequences: DashMap::new(),
            enrollments: DashMap::new(),
            enrollment_pairs: DashMap::new(),
            deliveries: DashMap::new(),
            delivery_keys: DashMap::new(),
        }
    }

    pub fn enrollment_count(&self) -> usize {
        self.enrollments.len()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SequenceStore for MemoryStore {
    async fn put_sequence(&self, sequence: &Sequence) -> CadenceResult<()> {
        match self.sequences.entry(sequence.id) {
            Entry::Occupied(mut entry) => {
                // Definitions are replaced; counters belong to the store.
                let existing = entry.get_mut();
                existing.name = sequence.name.clone();
                existing.steps = sequence.steps.clone();
                existing.is_active = sequence.is_active;
                existing.is_onboarding = sequence.is_onboarding;
            }
            Entry::Vacant(entry) => {
                entry.insert(sequence.clone());
            }
        }
        debug!(sequence_id = %sequence.id, steps = sequence.steps.len(), "Sequence stored");
        Ok(())
    }

    async fn get_sequence(&self, id: Uuid) -> CadenceResult<Option<Sequence>> {
        Ok(self.sequences.get(&id).map(|r| r.value().clone()))
    }

    async fn list_sequences(&self) -> CadenceResult<Vec<Sequence>> {
        let mut sequences: Vec<Sequence> =
            self.sequences.iter().map(|r| r.value().clone()).collect();
        sequences.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sequences)
    }

    async fn increment_counter(
        &self,
        sequence_id: Uuid,
        counter: SequenceCounter,
    ) -> CadenceResult<u64> {
        let mut entry = self
            .sequences
            .get_mut(&sequence_id)
            .ok_or_else(|| CadenceError::NotFound(format!("sequence {sequence_id}")))?;
        let value = match counter {
            SequenceCounter::Sent => &mut entry.total_sent,
            SequenceCounter::Opens => &mut entry.total_opens,
            SequenceCounter::Clicks => &mut entry.total_clicks,
        };
        *value += 1;
        Ok(*value)
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> CadenceResult<()> {
        match self
            .enrollment_pairs
            .entry((enrollment.member_id, enrollment.sequence_id))
        {
            Entry::Occupied(existing) => Err(CadenceError::Conflict(format!(
                "member {} already enrolled in sequence {} (enrollment {})",
                enrollment.member_id,
                enrollment.sequence_id,
                existing.get()
            ))),
            Entry::Vacant(slot) => {
                self.enrollments.insert(enrollment.id, enrollment.clone());
                slot.insert(enrollment.id);
                Ok(())
            }
        }
    }

    async fn get_enrollment(&self, id: Uuid) -> CadenceResult<Option<Enrollment>> {
        Ok(self.enrollments.get(&id).map(|r| r.value().clone()))
    }

    async fn find_enrollment(
        &self,
        member_id: Uuid,
        sequence_id: Uuid,
    ) -> CadenceResult<Option<Enrollment>> {
        let id = match self.enrollment_pairs.get(&(member_id, sequence_id)) {
            Some(r) => *r.value(),
            None => return Ok(None),
        };
        Ok(self.enrollments.get(&id).map(|r| r.value().clone()))
    }

    async fn list_active_enrollments(&self) -> CadenceResult<Vec<Enrollment>> {
        let mut active: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().status == EnrollmentStatus::Active)
            .map(|r| r.value().clone())
            .collect();
        active.sort_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at));
        Ok(active)
    }

    async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> CadenceResult<bool> {
        let mut entry = self
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| CadenceError::NotFound(format!("enrollment {id}")))?;
        if entry.current_step != update.expected_step
            || entry.status != update.expected_status
            || entry.status == EnrollmentStatus::Completed
        {
            return Ok(false);
        }
        entry.current_step = update.new_step;
        if let Some(at) = update.completed_at {
            entry.status = EnrollmentStatus::Completed;
            entry.completed_at = Some(at);
        }
        Ok(true)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> CadenceResult<bool> {
        let mut entry = self
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| CadenceError::NotFound(format!("enrollment {id}")))?;
        if entry.status != from {
            return Ok(false);
        }
        entry.status = to;
        Ok(true)
    }

    async fn delivery_exists(&self, key: DeliveryKey) -> CadenceResult<bool> {
        Ok(self.delivery_keys.contains_key(&key))
    }

    async fn insert_delivery(&self, record: &DeliveryRecord) -> CadenceResult<bool> {
        match self.delivery_keys.entry(record.key()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                self.deliveries
                    .insert(record.tracking_id.clone(), record.clone());
                slot.insert(record.tracking_id.clone());
                Ok(true)
            }
        }
    }

    async fn get_delivery(&self, tracking_id: &str) -> CadenceResult<Option<DeliveryRecord>> {
        Ok(self.deliveries.get(tracking_id).map(|r| r.value().clone()))
    }

    async fn list_deliveries(&self, sequence_id: Uuid) -> CadenceResult<Vec<DeliveryRecord>> {
        let mut records: Vec<DeliveryRecord> = self
            .deliveries
            .iter()
            .filter(|r| r.value().sequence_id == sequence_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        Ok(records)
    }

    async fn mark_engagement(
        &self,
        tracking_id: &str,
        engagement: Engagement,
        at: DateTime<Utc>,
    ) -> CadenceResult<MarkOutcome> {
        let Some(mut entry) = self.deliveries.get_mut(tracking_id) else {
            return Ok(MarkOutcome::Unknown);
        };
        let record = entry.value_mut();
        let sequence_id = record.sequence_id;
        let (flag, stamp) = match engagement {
            Engagement::Open => (&mut record.opened, &mut record.opened_at),
            Engagement::Click => (&mut record.clicked, &mut record.clicked_at),
        };
        if *flag {
            return Ok(MarkOutcome::AlreadySet { sequence_id });
        }
        *flag = true;
        *stamp = Some(at);
        Ok(MarkOutcome::Marked { sequence_id })
    }
}

/// In-memory member directory.
#[derive(Default)]
pub struct MemoryDirectory {
    members: DashMap<Uuid, Member>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
        }
    }

    pub fn insert(&self, member: Member) {
        self.members.insert(member.id, member);
    }
}

#[async_trait]
impl MemberDirectory for MemoryDirectory {
    async fn get_member(&self, id: Uuid) -> CadenceResult<Option<Member>> {
        Ok(self.members.get(&id).map(|r| r.value().clone()))
    }
}
