use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// One email in a sequence. `delay_days` is the gap after the previous step;
/// the first step always fires at enrollment time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Step {
    pub index: u32,
    pub delay_days: u32,
    pub subject: String,
    pub body: String,
}

/// An ordered series of email steps.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<Step>,
    pub is_active: bool,
    pub is_onboarding: bool,
    #[serde(default)]
    pub total_sent: u64,
    #[serde(default)]
    pub total_opens: u64,
    #[serde(default)]
    pub total_clicks: u64,
    pub created_at: DateTime<Utc>,
}

impl Sequence {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            steps,
            is_active: true,
            is_onboarding: false,
            total_sent: 0,
            total_opens: 0,
            total_clicks: 0,
            created_at: Utc::now(),
        }
    }

    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn step(&self, index: u32) -> Option<&Step> {
        self.steps.get(index as usize)
    }

    pub fn stats(&self) -> SequenceStats {
        SequenceStats::new(self.id, self.total_sent, self.total_opens, self.total_clicks)
    }
}

/// Lifecycle status of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
}

/// A member's progress through one sequence. `current_step` is the next step
/// to send, not the last one sent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Enrollment {
    pub id: Uuid,
    pub member_id: Uuid,
    pub sequence_id: Uuid,
    pub current_step: u32,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn new(member_id: Uuid, sequence_id: Uuid, enrolled_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            member_id,
            sequence_id,
            current_step: 0,
            status: EnrollmentStatus::Active,
            enrolled_at,
            completed_at: None,
        }
    }
}

/// Durable proof that one step was sent to one member.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub member_id: Uuid,
    pub enrollment_id: Uuid,
    pub step_index: u32,
    pub tracking_id: String,
    pub message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub opened: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked: bool,
    pub clicked_at: Option<DateTime<Utc>>,
}

/// Key enforcing at most one delivery per step per member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub sequence_id: Uuid,
    pub member_id: Uuid,
    pub step_index: u32,
}

impl DeliveryRecord {
    pub fn key(&self) -> DeliveryKey {
        DeliveryKey {
            sequence_id: self.sequence_id,
            member_id: self.member_id,
            step_index: self.step_index,
        }
    }
}

/// Read-only member profile from the member directory.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Member {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl Member {
    /// First and last name joined, skipping whichever is missing.
    pub fn full_name(&self) -> String {
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Whether the address looks deliverable: non-empty local and domain parts.
    pub fn has_usable_email(&self) -> bool {
        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && !domain.contains('@')
                    && !email.contains(char::is_whitespace)
            }
            None => false,
        }
    }
}

/// Which engagement counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceCounter {
    Sent,
    Opens,
    Clicks,
}

/// Engagement statistics for one sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SequenceStats {
    pub sequence_id: Uuid,
    pub total_sent: u64,
    pub total_opens: u64,
    pub total_clicks: u64,
    pub open_rate: f64,
    pub click_rate: f64,
}

impl SequenceStats {
    pub fn new(sequence_id: Uuid, sent: u64, opens: u64, clicks: u64) -> Self {
        let rate = |n: u64| {
            if sent > 0 {
                n as f64 / sent as f64
            } else {
                0.0
            }
        };
        Self {
            sequence_id,
            total_sent: sent,
            total_opens: opens,
            total_clicks: clicks,
            open_rate: rate(opens),
            click_rate: rate(clicks),
        }
    }
}

/// Analytics event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub sequence_id: Option<Uuid>,
    pub enrollment_id: Option<Uuid>,
    pub member_id: Option<Uuid>,
    pub step_index: Option<u32>,
    pub tracking_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EnrollmentCreated,
    EnrollmentPaused,
    EnrollmentResumed,
    EnrollmentAdvanced,
    EnrollmentCompleted,
    StepSent,
    StepAlreadySent,
    StepFailed,
    EmailOpened,
    EmailClicked,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(email: &str) -> Member {
        Member {
            id: Uuid::new_v4(),
            email: email.to_string(),
            first_name: Some("Ada".into()),
            last_name: None,
            organization: None,
        }
    }

    #[test]
    fn test_usable_email() {
        assert!(member("ada@example.com").has_usable_email());
        assert!(!member("").has_usable_email());
        assert!(!member("ada").has_usable_email());
        assert!(!member("@example.com").has_usable_email());
        assert!(!member("ada@").has_usable_email());
        assert!(!member("ada lovelace@example.com").has_usable_email());
    }

    #[test]
    fn test_full_name_skips_missing_parts() {
        let mut m = member("ada@example.com");
        assert_eq!(m.full_name(), "Ada");
        m.last_name = Some("Lovelace".into());
        assert_eq!(m.full_name(), "Ada Lovelace");
        m.first_name = None;
        assert_eq!(m.full_name(), "Lovelace");
    }

    #[test]
    fn test_stats_rates() {
        let id = Uuid::new_v4();
        let stats = SequenceStats::new(id, 0, 0, 0);
        assert_eq!(stats.open_rate, 0.0);
        assert_eq!(stats.click_rate, 0.0);

        let stats = SequenceStats::new(id, 4, 2, 1);
        assert!((stats.open_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.click_rate - 0.25).abs() < f64::EPSILON);
    }
}
