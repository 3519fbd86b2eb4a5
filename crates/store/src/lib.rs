//! Sequence & enrollment persistence.
//!
//! The engine talks to storage only through [`SequenceStore`] and
//! [`MemberDirectory`]. Two backends ship: [`MemoryStore`] (DashMap, for
//! development and tests) and [`RedisStore`].

#![warn(clippy::unwrap_used)]

pub mod memory;
pub mod redis_store;

pub use memory::{MemoryDirectory, MemoryStore};
pub use redis_store::RedisStore;

use async_trait::async_trait;
use cadence_core::error::CadenceResult;
use cadence_core::types::{
    DeliveryKey, DeliveryRecord, Enrollment, EnrollmentStatus, Member, Sequence, SequenceCounter,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result of a compare-and-set on a delivery record's open/click flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// No delivery record carries this tracking id.
    Unknown,
    /// The flag was already set; nothing changed.
    AlreadySet { sequence_id: Uuid },
    /// The flag was set by this call.
    Marked { sequence_id: Uuid },
}

/// Engagement flag on a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engagement {
    Open,
    Click,
}

impl Engagement {
    pub fn counter(self) -> SequenceCounter {
        match self {
            Engagement::Open => SequenceCounter::Opens,
            Engagement::Click => SequenceCounter::Clicks,
        }
    }
}

/// Change to an enrollment's progress after a step is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// `current_step` the caller observed; the write is skipped if it moved.
    pub expected_step: u32,
    /// Status the caller observed; a pause or completion in between skips
    /// the write.
    pub expected_status: EnrollmentStatus,
    pub new_step: u32,
    /// Set when the enrollment finished its last step.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted sequences, enrollments and delivery records.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    // ─── Sequences ──────────────────────────────────────────────────────
    async fn put_sequence(&self, sequence: &Sequence) -> CadenceResult<()>;

    async fn get_sequence(&self, id: Uuid) -> CadenceResult<Option<Sequence>>;

    async fn list_sequences(&self) -> CadenceResult<Vec<Sequence>>;

    /// Atomically add one to a sequence counter and return the new value.
    async fn increment_counter(&self, sequence_id: Uuid, counter: SequenceCounter)
        -> CadenceResult<u64>;

    // ─── Enrollments ────────────────────────────────────────────────────
    /// Insert a new enrollment. Fails with `CadenceError::Conflict` if an
    /// enrollment already exists for the same (member, sequence) pair.
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> CadenceResult<()>;

    async fn get_enrollment(&self, id: Uuid) -> CadenceResult<Option<Enrollment>>;

    async fn find_enrollment(
        &self,
        member_id: Uuid,
        sequence_id: Uuid,
    ) -> CadenceResult<Option<Enrollment>>;

    async fn list_active_enrollments(&self) -> CadenceResult<Vec<Enrollment>>;

    /// Apply a progress update if `current_step` and `status` still equal
    /// the expected values. Returns whether the write happened.
    async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> CadenceResult<bool>;

    /// Move an enrollment from `from` to `to`. Returns whether the status
    /// matched `from` and was changed.
    async fn transition_status(
        &self,
        id: Uuid,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> CadenceResult<bool>;

    // ─── Delivery records ───────────────────────────────────────────────
    async fn delivery_exists(&self, key: DeliveryKey) -> CadenceResult<bool>;

    /// Persist a delivery record. Returns `false` without writing when a
    /// record for the same key already exists.
    async fn insert_delivery(&self, record: &DeliveryRecord) -> CadenceResult<bool>;

    async fn get_delivery(&self, tracking_id: &str) -> CadenceResult<Option<DeliveryRecord>>;

    async fn list_deliveries(&self, sequence_id: Uuid) -> CadenceResult<Vec<DeliveryRecord>>;

    /// Set the open or click flag if it is not set yet.
    async fn mark_engagement(
        &self,
        tracking_id: &str,
        engagement: Engagement,
        at: DateTime<Utc>,
    ) -> CadenceResult<MarkOutcome>;
}

/// Read-only member lookup.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn get_member(&self, id: Uuid) -> CadenceResult<Option<Member>>;
}
