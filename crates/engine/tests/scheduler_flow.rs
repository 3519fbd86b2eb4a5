//! End-to-end scheduler behaviour over the in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use cadence_channels::{MailTransport, OutboundEmail, TrackingLinks};
use cadence_core::error::{CadenceError, CadenceResult};
use cadence_core::event_bus::{capture_sink, CaptureSink};
use cadence_core::types::{
    DeliveryKey, DeliveryRecord, Enrollment, EnrollmentStatus, EventType, Member, Sequence,
    SequenceCounter, Step,
};
use cadence_engine::{
    EmailDispatcher, ManualClock, Scheduler, SequenceService, TickReport,
};
use cadence_store::{
    Engagement, MarkOutcome, MemberDirectory, MemoryDirectory, MemoryStore, ProgressUpdate,
    SequenceStore,
};

// ─── Fakes ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<OutboundEmail>>,
    failing: AtomicBool,
}

impl FakeTransport {
    fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn send(&self, email: &OutboundEmail) -> CadenceResult<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CadenceError::Transport("relay unavailable".into()));
        }
        let mut sent = self.sent.lock();
        sent.push(email.clone());
        Ok(format!("msg-{}", sent.len()))
    }
}

/// Datastore operation that fails as if the server were down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outage {
    Listing,
    SequenceLookup,
    Counters,
}

/// Memory store with one operation knocked out.
struct OutageStore {
    inner: MemoryStore,
    outage: Outage,
}

impl OutageStore {
    fn new(outage: Outage) -> Self {
        Self {
            inner: MemoryStore::new(),
            outage,
        }
    }

    fn check(&self, op: Outage) -> CadenceResult<()> {
        if self.outage == op {
            return Err(CadenceError::Store("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for OutageStore {
    async fn put_sequence(&self, sequence: &Sequence) -> CadenceResult<()> {
        self.inner.put_sequence(sequence).await
    }
    async fn get_sequence(&self, id: Uuid) -> CadenceResult<Option<Sequence>> {
        self.check(Outage::SequenceLookup)?;
        self.inner.get_sequence(id).await
    }
    async fn list_sequences(&self) -> CadenceResult<Vec<Sequence>> {
        self.inner.list_sequences().await
    }
    async fn increment_counter(
        &self,
        sequence_id: Uuid,
        counter: SequenceCounter,
    ) -> CadenceResult<u64> {
        self.check(Outage::Counters)?;
        self.inner.increment_counter(sequence_id, counter).await
    }
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> CadenceResult<()> {
        self.inner.insert_enrollment(enrollment).await
    }
    async fn get_enrollment(&self, id: Uuid) -> CadenceResult<Option<Enrollment>> {
        self.inner.get_enrollment(id).await
    }
    async fn find_enrollment(
        &self,
        member_id: Uuid,
        sequence_id: Uuid,
    ) -> CadenceResult<Option<Enrollment>> {
        self.inner.find_enrollment(member_id, sequence_id).await
    }
    async fn list_active_enrollments(&self) -> CadenceResult<Vec<Enrollment>> {
        self.check(Outage::Listing)?;
        self.inner.list_active_enrollments().await
    }
    async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> CadenceResult<bool> {
        self.inner.update_progress(id, update).await
    }
    async fn transition_status(
        &self,
        id: Uuid,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> CadenceResult<bool> {
        self.inner.transition_status(id, from, to).await
    }
    async fn delivery_exists(&self, key: DeliveryKey) -> CadenceResult<bool> {
        self.inner.delivery_exists(key).await
    }
    async fn insert_delivery(&self, record: &DeliveryRecord) -> CadenceResult<bool> {
        self.inner.insert_delivery(record).await
    }
    async fn get_delivery(&self, tracking_id: &str) -> CadenceResult<Option<DeliveryRecord>> {
        self.inner.get_delivery(tracking_id).await
    }
    async fn list_deliveries(&self, sequence_id: Uuid) -> CadenceResult<Vec<DeliveryRecord>> {
        self.inner.list_deliveries(sequence_id).await
    }
    async fn mark_engagement(
        &self,
        tracking_id: &str,
        engagement: Engagement,
        at: DateTime<Utc>,
    ) -> CadenceResult<MarkOutcome> {
        self.inner.mark_engagement(tracking_id, engagement, at).await
    }
}

// ─── Harness ────────────────────────────────────────────────────────────

struct Harness {
    t0: DateTime<Utc>,
    store: Arc<MemoryStore>,
    directory: Arc<MemoryDirectory>,
    transport: Arc<FakeTransport>,
    clock: Arc<ManualClock>,
    sink: Arc<CaptureSink>,
    scheduler: Scheduler,
    service: SequenceService,
}

fn links() -> TrackingLinks {
    TrackingLinks::new("https://t.example.com")
}

fn harness() -> Harness {
    let t0 = Utc::now();
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(MemoryDirectory::new());
    let transport = Arc::new(FakeTransport::default());
    let clock = Arc::new(ManualClock::new(t0));
    let sink = capture_sink();

    let scheduler = Scheduler::new(
        store.clone(),
        directory.clone(),
        transport.clone(),
        clock.clone(),
        links(),
        StdDuration::from_secs(5),
    )
    .with_event_sink(sink.clone());
    let service = SequenceService::new(store.clone(), directory.clone(), clock.clone(), links())
        .with_event_sink(sink.clone());

    Harness {
        t0,
        store,
        directory,
        transport,
        clock,
        sink,
        scheduler,
        service,
    }
}

impl Harness {
    async fn sequence(&self, delays: &[u32]) -> Sequence {
        let steps = delays
            .iter()
            .enumerate()
            .map(|(i, d)| Step {
                index: i as u32,
                delay_days: *d,
                subject: format!("Step {} for {{{{first_name}}}}", i + 1),
                body: format!(r#"<p>Read <a href="https://docs.example.com/{i}">this</a></p>"#),
            })
            .collect();
        let sequence = Sequence::new("Nurture", steps);
        self.service.put_sequence(&sequence).await.unwrap();
        sequence
    }

    fn member(&self, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.directory.insert(Member {
            id,
            email: email.to_string(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            organization: Some("Analytical Engines".into()),
        });
        id
    }

    async fn enrollment(&self, id: Uuid) -> Enrollment {
        self.store.get_enrollment(id).await.unwrap().unwrap()
    }

    async fn tick(&self) -> TickReport {
        self.scheduler.tick().await.unwrap()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_three_step_sequence_follows_cumulative_schedule() {
    let h = harness();
    let sequence = h.sequence(&[0, 3, 7]).await;
    let member = h.member("ada@example.com");
    let e = h.service.enroll(member, sequence.id).await.unwrap();

    let report = h.tick().await;
    assert_eq!(report.sent, 1);
    assert_eq!(h.enrollment(e.id).await.current_step, 1);
    assert_eq!(h.transport.sent.lock()[0].subject, "Step 1 for Ada");

    // Just short of T0+3d nothing is due.
    h.clock.set(h.t0 + Duration::days(3) - Duration::seconds(1));
    let report = h.tick().await;
    assert_eq!((report.sent, report.not_due), (0, 1));

    h.clock.set(h.t0 + Duration::days(3));
    assert_eq!(h.tick().await.sent, 1);
    assert_eq!(h.enrollment(e.id).await.current_step, 2);

    h.clock.set(h.t0 + Duration::days(10) - Duration::seconds(1));
    assert_eq!(h.tick().await.not_due, 1);

    h.clock.set(h.t0 + Duration::days(10));
    let report = h.tick().await;
    assert_eq!((report.sent, report.completed), (1, 1));

    let done = h.enrollment(e.id).await;
    assert_eq!(done.status, EnrollmentStatus::Completed);
    assert_eq!(done.current_step, 3);
    assert_eq!(done.completed_at, Some(h.t0 + Duration::days(10)));

    // Completed enrollments are no longer examined.
    h.clock.set(h.t0 + Duration::days(60));
    assert_eq!(h.tick().await, TickReport::default());

    assert_eq!(h.transport.sent_count(), 3);
    assert_eq!(h.store.delivery_count(), 3);
    assert_eq!(h.sink.count_type(EventType::EnrollmentCompleted), 1);
    let stats = h.service.sequence_stats(sequence.id).await.unwrap();
    assert_eq!(stats.total_sent, 3);
}

#[tokio::test]
async fn test_current_step_never_decreases() {
    let h = harness();
    let sequence = h.sequence(&[0, 1, 1, 1]).await;
    let e = h
        .service
        .enroll(h.member("ada@example.com"), sequence.id)
        .await
        .unwrap();

    let mut last = 0;
    for day in 0..8 {
        h.clock.set(h.t0 + Duration::days(day));
        h.tick().await;
        h.tick().await;
        let step = h.enrollment(e.id).await.current_step;
        assert!(step >= last);
        last = step;
    }
    assert_eq!(last, 4);
    assert_eq!(h.transport.sent_count(), 4);
}

#[tokio::test]
async fn test_first_step_ignores_configured_delay() {
    let h = harness();
    let sequence = h.sequence(&[9, 2]).await;
    let e = h
        .service
        .enroll(h.member("ada@example.com"), sequence.id)
        .await
        .unwrap();

    assert_eq!(h.tick().await.sent, 1);
    assert_eq!(h.enrollment(e.id).await.current_step, 1);
}

#[tokio::test]
async fn test_recorded_step_advances_without_resend() {
    let h = harness();
    let sequence = h.sequence(&[0, 5]).await;
    let member = h.member("ada@example.com");
    let e = h.service.enroll(member, sequence.id).await.unwrap();

    // A previous run sent step 0 but died before advancing.
    h.store
        .insert_delivery(&DeliveryRecord {
            id: Uuid::new_v4(),
            sequence_id: sequence.id,
            member_id: member,
            enrollment_id: e.id,
            step_index: 0,
            tracking_id: "earlier".into(),
            message_id: Some("msg-0".into()),
            sent_at: h.t0,
            opened: false,
            opened_at: None,
            clicked: false,
            clicked_at: None,
        })
        .await
        .unwrap();

    let report = h.tick().await;
    assert_eq!((report.sent, report.already_sent), (0, 1));
    assert_eq!(h.transport.sent_count(), 0);
    assert_eq!(h.enrollment(e.id).await.current_step, 1);
    assert_eq!(h.store.delivery_count(), 1);
    assert_eq!(h.sink.count_type(EventType::StepAlreadySent), 1);
}

#[tokio::test]
async fn test_dispatching_same_step_twice_keeps_one_record() {
    let h = harness();
    let sequence = h.sequence(&[0]).await;
    let member_id = h.member("ada@example.com");
    let member = h.directory.get_member(member_id).await.unwrap().unwrap();
    let e = Enrollment::new(member_id, sequence.id, h.t0);

    let dispatcher = EmailDispatcher::new(
        h.store.clone(),
        h.transport.clone(),
        links(),
        StdDuration::from_secs(5),
    );
    dispatcher
        .dispatch(&sequence, &sequence.steps[0], &e, &member, h.t0)
        .await
        .unwrap();
    dispatcher
        .dispatch(&sequence, &sequence.steps[0], &e, &member, h.t0)
        .await
        .unwrap();

    assert_eq!(h.store.delivery_count(), 1);
    let stored = h.store.get_sequence(sequence.id).await.unwrap().unwrap();
    assert_eq!(stored.total_sent, 1);
}

#[tokio::test]
async fn test_transport_failure_keeps_step_due() {
    let h = harness();
    let sequence = h.sequence(&[0, 1]).await;
    let e = h
        .service
        .enroll(h.member("ada@example.com"), sequence.id)
        .await
        .unwrap();
    assert_eq!(h.tick().await.sent, 1);

    h.transport.set_failing(true);
    h.clock.set(h.t0 + Duration::days(1));
    let report = h.tick().await;
    assert_eq!((report.sent, report.failed), (0, 1));
    assert_eq!(h.enrollment(e.id).await.current_step, 1);
    assert_eq!(h.store.delivery_count(), 1);
    assert_eq!(h.sink.count_type(EventType::StepFailed), 1);

    h.transport.set_failing(false);
    let report = h.tick().await;
    assert_eq!((report.sent, report.completed), (1, 1));
    assert_eq!(h.store.delivery_count(), 2);
    assert_eq!(
        h.enrollment(e.id).await.status,
        EnrollmentStatus::Completed
    );
}

#[tokio::test]
async fn test_ineligible_enrollments_are_skipped() {
    let h = harness();
    let sequence = h.sequence(&[0]).await;
    let inactive = h.sequence(&[0]).await;

    h.service
        .enroll(h.member("no-at-sign"), sequence.id)
        .await
        .unwrap();
    let paused = h
        .service
        .enroll(h.member("paused@example.com"), sequence.id)
        .await
        .unwrap();
    h.service.pause(paused.id).await.unwrap();
    h.service
        .enroll(h.member("ada@example.com"), inactive.id)
        .await
        .unwrap();
    h.service.set_sequence_active(inactive.id, false).await.unwrap();

    let report = h.tick().await;
    assert_eq!(report.examined, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.sent, 0);
    assert_eq!(h.transport.sent_count(), 0);
    assert_eq!(h.enrollment(paused.id).await.current_step, 0);
}

fn outage_scheduler(
    store: Arc<OutageStore>,
    directory: Arc<MemoryDirectory>,
    transport: Arc<FakeTransport>,
) -> Scheduler {
    Scheduler::new(
        store,
        directory,
        transport,
        Arc::new(ManualClock::new(Utc::now())),
        links(),
        StdDuration::from_secs(5),
    )
}

async fn seed_outage_store(
    store: &OutageStore,
    directory: &MemoryDirectory,
    members: usize,
) -> Sequence {
    let sequence = Sequence::new(
        "Nurture",
        vec![
            Step {
                index: 0,
                delay_days: 0,
                subject: "Welcome".into(),
                body: "<p>Hi</p>".into(),
            },
            Step {
                index: 1,
                delay_days: 2,
                subject: "Tips".into(),
                body: "<p>More</p>".into(),
            },
        ],
    );
    store.inner.put_sequence(&sequence).await.unwrap();
    for i in 0..members {
        let id = Uuid::new_v4();
        directory.insert(Member {
            id,
            email: format!("member{i}@example.com"),
            first_name: None,
            last_name: None,
            organization: None,
        });
        let enrolled_at = Utc::now() - Duration::minutes(1);
        store
            .inner
            .insert_enrollment(&Enrollment::new(id, sequence.id, enrolled_at))
            .await
            .unwrap();
    }
    sequence
}

#[tokio::test]
async fn test_store_outage_while_listing_aborts_tick() {
    let store = Arc::new(OutageStore::new(Outage::Listing));
    let scheduler = outage_scheduler(
        store,
        Arc::new(MemoryDirectory::new()),
        Arc::new(FakeTransport::default()),
    );
    assert!(matches!(
        scheduler.tick().await,
        Err(CadenceError::Store(_))
    ));
}

#[tokio::test]
async fn test_store_outage_mid_tick_aborts_tick() {
    let store = Arc::new(OutageStore::new(Outage::SequenceLookup));
    let directory = Arc::new(MemoryDirectory::new());
    let transport = Arc::new(FakeTransport::default());
    seed_outage_store(&store, &directory, 3).await;

    let scheduler = outage_scheduler(store.clone(), directory, transport.clone());
    assert!(matches!(
        scheduler.tick().await,
        Err(CadenceError::Store(_))
    ));
    assert_eq!(transport.sent_count(), 0);
    assert_eq!(store.inner.delivery_count(), 0);
}

#[tokio::test]
async fn test_sent_counter_failure_keeps_committed_send() {
    let store = Arc::new(OutageStore::new(Outage::Counters));
    let directory = Arc::new(MemoryDirectory::new());
    let transport = Arc::new(FakeTransport::default());
    seed_outage_store(&store, &directory, 1).await;

    let scheduler = outage_scheduler(store.clone(), directory, transport.clone());
    let report = scheduler.tick().await.unwrap();
    assert_eq!((report.sent, report.failed), (1, 0));
    assert_eq!(transport.sent_count(), 1);
    assert_eq!(store.inner.delivery_count(), 1);

    let enrollments = store.inner.list_active_enrollments().await.unwrap();
    assert_eq!(enrollments[0].current_step, 1);
}

#[tokio::test]
async fn test_engagement_is_counted_once() {
    let h = harness();
    let sequence = h.sequence(&[0]).await;
    h.service
        .enroll(h.member("ada@example.com"), sequence.id)
        .await
        .unwrap();
    h.tick().await;

    let records = h.store.list_deliveries(sequence.id).await.unwrap();
    let tracking_id = records[0].tracking_id.clone();
    let body = h.transport.sent.lock()[0].html_body.clone();
    assert!(body.contains(&format!("/t/o/{tracking_id}.gif")));
    assert!(body.contains(&format!("/t/c/{tracking_id}?url=https%3A%2F%2Fdocs.example.com%2F0")));

    assert!(h.service.record_open(&tracking_id).await);
    assert!(!h.service.record_open(&tracking_id).await);
    let target = h
        .service
        .record_click(&tracking_id, Some("https://docs.example.com/0"))
        .await;
    assert_eq!(target, "https://docs.example.com/0");
    h.service
        .record_click(&tracking_id, Some("https://docs.example.com/0"))
        .await;

    // Unknown ids change nothing.
    assert!(!h.service.record_open("does-not-exist").await);
    h.service.record_click("does-not-exist", None).await;

    let stats = h.service.sequence_stats(sequence.id).await.unwrap();
    assert_eq!(
        (stats.total_sent, stats.total_opens, stats.total_clicks),
        (1, 1, 1)
    );
    assert_eq!(stats.open_rate, 1.0);
    assert_eq!(stats.click_rate, 1.0);
    assert_eq!(h.sink.count_type(EventType::EmailOpened), 1);
    assert_eq!(h.sink.count_type(EventType::EmailClicked), 1);
}

#[tokio::test]
async fn test_spawned_scheduler_runs_manual_ticks_and_shuts_down() {
    let h = harness();
    let sequence = h.sequence(&[0, 2]).await;
    let e = h
        .service
        .enroll(h.member("ada@example.com"), sequence.id)
        .await
        .unwrap();

    let handle = Arc::new(h.scheduler).spawn(None);
    let report = handle.trigger().await.unwrap();
    assert_eq!(report.sent, 1);
    assert!(handle.is_running());

    handle.shutdown().await;
    assert!(!handle.is_running());
    assert!(handle.trigger().await.is_err());
    assert_eq!(
        h.store.get_enrollment(e.id).await.unwrap().unwrap().current_step,
        1
    );
}

/// Transport that takes a while to accept each message and reports when a
/// send has started.
struct SlowTransport {
    started: tokio::sync::Notify,
    delay: StdDuration,
    sent: Mutex<usize>,
}

#[async_trait]
impl MailTransport for SlowTransport {
    async fn send(&self, _email: &OutboundEmail) -> CadenceResult<String> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        let mut sent = self.sent.lock();
        *sent += 1;
        Ok(format!("msg-{}", *sent))
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..1_000 {
        if done() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    done()
}

#[tokio::test(start_paused = true)]
async fn test_periodic_scheduler_ticks_at_start_and_each_interval() {
    let h = harness();
    let sequence = h.sequence(&[0, 1]).await;
    let e = h
        .service
        .enroll(h.member("ada@example.com"), sequence.id)
        .await
        .unwrap();

    let interval = StdDuration::from_secs(60);
    let handle = Arc::new(h.scheduler).spawn(Some(interval));

    // First tick runs without any time passing.
    let transport = h.transport.clone();
    assert!(wait_for(|| transport.sent_count() == 1).await);

    // Step 1 becomes due, but no tick runs until the interval elapses.
    h.clock.set(h.t0 + Duration::days(1));
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.transport.sent_count(), 1);

    tokio::time::advance(interval).await;
    assert!(wait_for(|| transport.sent_count() == 2).await);

    handle.shutdown().await;
    let done = h.store.get_enrollment(e.id).await.unwrap().unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_tick() {
    let h = harness();
    let sequence = h.sequence(&[0, 3]).await;
    let e = h
        .service
        .enroll(h.member("ada@example.com"), sequence.id)
        .await
        .unwrap();

    let transport = Arc::new(SlowTransport {
        started: tokio::sync::Notify::new(),
        delay: StdDuration::from_secs(2),
        sent: Mutex::new(0),
    });
    let scheduler = Scheduler::new(
        h.store.clone(),
        h.directory.clone(),
        transport.clone(),
        h.clock.clone(),
        links(),
        StdDuration::from_secs(5),
    );
    let handle = Arc::new(scheduler).spawn(None);

    let trigger = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.trigger().await })
    };
    transport.started.notified().await;

    handle.shutdown().await;
    assert!(!handle.is_running());

    let report = trigger.await.unwrap().unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(*transport.sent.lock(), 1);
    assert_eq!(h.store.delivery_count(), 1);
    assert_eq!(h.enrollment(e.id).await.current_step, 1);
}
