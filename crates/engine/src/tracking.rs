//! Engagement tracking: correlates open and click signals with the
//! delivery record that produced them and maintains sequence counters.
//!
//! Tracking never fails the caller: unknown ids are ignored and store errors
//! are logged, so the pixel is always served and the click always redirects.

use crate::clock::Clock;
use cadence_channels::TrackingLinks;
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::types::EventType;
use cadence_store::{Engagement, MarkOutcome, SequenceStore};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

pub struct EngagementTracker {
    store: Arc<dyn SequenceStore>,
    clock: Arc<dyn Clock>,
    links: TrackingLinks,
    event_sink: Arc<dyn EventSink>,
}

impl EngagementTracker {
    pub fn new(store: Arc<dyn SequenceStore>, clock: Arc<dyn Clock>, links: TrackingLinks) -> Self {
        Self {
            store,
            clock,
            links,
            event_sink: cadence_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Record an open for `tracking_id`. Returns whether this call counted it.
    pub async fn record_open(&self, tracking_id: &str) -> bool {
        self.record(tracking_id, Engagement::Open).await
    }

    /// Record a click and return the URL the visitor should be sent to.
    pub async fn record_click(&self, tracking_id: &str, url: Option<&str>) -> String {
        self.record(tracking_id, Engagement::Click).await;
        self.redirect_target(url)
    }

    /// Only absolute http(s) targets are honoured; anything else lands on
    /// the tracking base URL.
    pub fn redirect_target(&self, url: Option<&str>) -> String {
        match url.map(str::trim).filter(|u| !u.is_empty()).map(Url::parse) {
            Some(Ok(parsed)) if matches!(parsed.scheme(), "http" | "https") => parsed.into(),
            Some(_) => {
                debug!(url = ?url, "Rejected click redirect target");
                self.links.base_url().to_string()
            }
            None => self.links.base_url().to_string(),
        }
    }

    async fn record(&self, tracking_id: &str, engagement: Engagement) -> bool {
        let now = self.clock.now();
        let outcome = match self.store.mark_engagement(tracking_id, engagement, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(tracking_id, ?engagement, error = %e, "Failed to record engagement");
                return false;
            }
        };

        let sequence_id = match outcome {
            MarkOutcome::Unknown => {
                metrics::counter!("tracking.unknown_id").increment(1);
                debug!(tracking_id, ?engagement, "Unknown tracking id");
                return false;
            }
            MarkOutcome::AlreadySet { .. } => return false,
            MarkOutcome::Marked { sequence_id } => sequence_id,
        };

        if let Err(e) = self
            .store
            .increment_counter(sequence_id, engagement.counter())
            .await
        {
            warn!(tracking_id, sequence_id = %sequence_id, error = %e, "Failed to bump engagement counter");
        }

        let (metric, event_type) = match engagement {
            Engagement::Open => ("tracking.opens", EventType::EmailOpened),
            Engagement::Click => ("tracking.clicks", EventType::EmailClicked),
        };
        metrics::counter!(metric).increment(1);
        info!(tracking_id, sequence_id = %sequence_id, ?engagement, "Engagement recorded");

        let mut event = make_event(event_type, Some(sequence_id), None, None, None);
        event.tracking_id = Some(tracking_id.to_string());
        self.event_sink.emit(event);
        true
    }
}
