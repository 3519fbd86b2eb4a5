//! Event bus: trait for emitting sequence analytics events from any module.
//!
//! The engine accepts an `Arc<dyn EventSink>`; the server wires it to the log
//! stream, tests wire it to a `CaptureSink`.

use crate::types::{AnalyticsEvent, EventType};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trait for emitting analytics events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// No-op sink for modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// Sink that writes every event to the tracing stream at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: AnalyticsEvent) {
        tracing::debug!(
            event_type = ?event.event_type,
            sequence_id = ?event.sequence_id,
            enrollment_id = ?event.enrollment_id,
            step_index = ?event.step_index,
            "sequence event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for an event about one enrollment step.
pub fn make_event(
    event_type: EventType,
    sequence_id: Option<Uuid>,
    enrollment_id: Option<Uuid>,
    member_id: Option<Uuid>,
    step_index: Option<u32>,
) -> AnalyticsEvent {
    AnalyticsEvent {
        event_id: Uuid::new_v4(),
        event_type,
        sequence_id,
        enrollment_id,
        member_id,
        step_index,
        tracking_id: None,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
