//! Email dispatcher: personalizes one step, instruments it for tracking,
//! hands it to the mail transport and records the delivery.
//!
//! A delivery record is written only after the transport accepted the
//! message, so a failed send leaves the step due for the next tick.

use cadence_channels::{MailTransport, OutboundEmail, TrackingLinks};
use cadence_core::error::{CadenceError, CadenceResult};
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::templates::TemplateRenderer;
use cadence_core::types::{
    DeliveryRecord, Enrollment, EventType, Member, Sequence, SequenceCounter, Step,
};
use cadence_store::SequenceStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Subject and instrumented body for one send.
#[derive(Debug, Clone)]
pub struct RenderedStep {
    pub tracking_id: String,
    pub subject: String,
    pub html_body: String,
}

pub struct EmailDispatcher {
    store: Arc<dyn SequenceStore>,
    transport: Arc<dyn MailTransport>,
    links: TrackingLinks,
    event_sink: Arc<dyn EventSink>,
    send_timeout: Duration,
}

impl EmailDispatcher {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        transport: Arc<dyn MailTransport>,
        links: TrackingLinks,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            links,
            event_sink: cadence_core::event_bus::noop_sink(),
            send_timeout,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Render and instrument a step under a fresh tracking id.
    pub fn render(&self, sequence: &Sequence, step: &Step, member: &Member) -> RenderedStep {
        let tracking_id = Uuid::new_v4().simple().to_string();
        let renderer = TemplateRenderer::for_step(member, sequence, step);
        let body = renderer.render(&step.body);
        RenderedStep {
            subject: renderer.render(&step.subject),
            html_body: self.links.instrument(&body, &tracking_id),
            tracking_id,
        }
    }

    /// Send `step` to `member` and persist the delivery record.
    pub async fn dispatch(
        &self,
        sequence: &Sequence,
        step: &Step,
        enrollment: &Enrollment,
        member: &Member,
        now: DateTime<Utc>,
    ) -> CadenceResult<DeliveryRecord> {
        let rendered = self.render(sequence, step, member);
        let full_name = member.full_name();
        let email = OutboundEmail {
            to: member.email.trim().to_string(),
            to_name: (!full_name.is_empty()).then_some(full_name),
            subject: rendered.subject,
            html_body: rendered.html_body,
        };

        let sent = match tokio::time::timeout(self.send_timeout, self.transport.send(&email)).await
        {
            Ok(result) => result,
            Err(_) => Err(CadenceError::Transport(format!(
                "send timed out after {}s",
                self.send_timeout.as_secs()
            ))),
        };

        let message_id = match sent {
            Ok(id) => id,
            Err(e) => {
                metrics::counter!("sequence.send_failures").increment(1);
                warn!(
                    enrollment_id = %enrollment.id,
                    step = step.index,
                    error = %e,
                    "Step send failed; will retry next tick"
                );
                self.event_sink.emit(make_event(
                    EventType::StepFailed,
                    Some(sequence.id),
                    Some(enrollment.id),
                    Some(member.id),
                    Some(step.index),
                ));
                return Err(e);
            }
        };

        let record = DeliveryRecord {
            id: Uuid::new_v4(),
            sequence_id: sequence.id,
            member_id: member.id,
            enrollment_id: enrollment.id,
            step_index: step.index,
            tracking_id: rendered.tracking_id,
            message_id: Some(message_id),
            sent_at: now,
            opened: false,
            opened_at: None,
            clicked: false,
            clicked_at: None,
        };

        let inserted = self.store.insert_delivery(&record).await.inspect_err(|e| {
            error!(
                enrollment_id = %enrollment.id,
                step = step.index,
                error = %e,
                "Email sent but delivery record could not be stored"
            );
        })?;

        if inserted {
            // The record is committed; a retry would take the already-sent
            // path, so the counter miss is only logged.
            if let Err(e) = self
                .store
                .increment_counter(sequence.id, SequenceCounter::Sent)
                .await
            {
                error!(
                    sequence_id = %sequence.id,
                    tracking_id = %record.tracking_id,
                    error = %e,
                    "Failed to increment sent counter"
                );
            }
            metrics::counter!("sequence.emails_sent").increment(1);
            info!(
                enrollment_id = %enrollment.id,
                sequence_id = %sequence.id,
                step = step.index,
                tracking_id = %record.tracking_id,
                "Sequence step sent"
            );
        } else {
            warn!(
                enrollment_id = %enrollment.id,
                step = step.index,
                "Concurrent delivery already recorded for this step"
            );
        }

        let mut event = make_event(
            EventType::StepSent,
            Some(sequence.id),
            Some(enrollment.id),
            Some(member.id),
            Some(step.index),
        );
        event.tracking_id = Some(record.tracking_id.clone());
        self.event_sink.emit(event);

        Ok(record)
    }
}
