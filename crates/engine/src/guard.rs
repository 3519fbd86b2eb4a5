//! Idempotent dispatch guard.
//!
//! Before a step is sent the delivery log is checked for an existing record
//! of the same (sequence, member, step). A hit means an earlier send
//! succeeded but the enrollment was never advanced; the caller advances
//! without resending. The check and the later insert are not atomic, so two
//! concurrent schedulers could both pass; only one scheduler is run.

use cadence_core::error::CadenceResult;
use cadence_core::types::{DeliveryKey, Enrollment};
use cadence_store::SequenceStore;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Proceed,
    AlreadySent,
}

pub struct DispatchGuard {
    store: Arc<dyn SequenceStore>,
}

impl DispatchGuard {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self { store }
    }

    pub async fn check(&self, enrollment: &Enrollment) -> CadenceResult<GuardDecision> {
        let key = DeliveryKey {
            sequence_id: enrollment.sequence_id,
            member_id: enrollment.member_id,
            step_index: enrollment.current_step,
        };
        if self.store.delivery_exists(key).await? {
            debug!(
                enrollment_id = %enrollment.id,
                step = enrollment.current_step,
                "Step already delivered, skipping send"
            );
            metrics::counter!("sequence.already_sent").increment(1);
            Ok(GuardDecision::AlreadySent)
        } else {
            Ok(GuardDecision::Proceed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::DeliveryRecord;
    use cadence_store::MemoryStore;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_guard_detects_prior_delivery() {
        let store = Arc::new(MemoryStore::new());
        let guard = DispatchGuard::new(store.clone());
        let enrollment = Enrollment::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());

        assert_eq!(guard.check(&enrollment).await.unwrap(), GuardDecision::Proceed);

        store
            .insert_delivery(&DeliveryRecord {
                id: Uuid::new_v4(),
                sequence_id: enrollment.sequence_id,
                member_id: enrollment.member_id,
                enrollment_id: enrollment.id,
                step_index: 0,
                tracking_id: "t".into(),
                message_id: None,
                sent_at: Utc::now(),
                opened: false,
                opened_at: None,
                clicked: false,
                clicked_at: None,
            })
            .await
            .unwrap();

        assert_eq!(
            guard.check(&enrollment).await.unwrap(),
            GuardDecision::AlreadySent
        );
    }
}
