//! Scheduler loop: the long-lived task that walks every active enrollment
//! on a fixed interval and pushes it through delay check, dispatch guard,
//! send and advance.
//!
//! Enrollments are processed one at a time. A failure on one enrollment is
//! logged and counted. A datastore failure at any point aborts the tick;
//! progress already committed stays, and the dispatch guard keeps the retry
//! from re-sending.

use crate::advancer::{AdvanceResult, DispatchOutcome, EnrollmentAdvancer};
use crate::clock::Clock;
use crate::delay::{self, DueStatus};
use crate::dispatcher::EmailDispatcher;
use crate::guard::{DispatchGuard, GuardDecision};
use cadence_channels::{MailTransport, TrackingLinks};
use cadence_core::error::{CadenceError, CadenceResult};
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::steps::validate_steps;
use cadence_core::types::{Enrollment, EnrollmentStatus, EventType, Sequence};
use cadence_store::{MemberDirectory, SequenceStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

const COMMAND_CHANNEL_BUFFER: usize = 16;

/// Per-tick counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct TickReport {
    pub examined: usize,
    pub sent: usize,
    pub already_sent: usize,
    pub not_due: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// How one enrollment was handled within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    Sent(AdvanceResult),
    AlreadySent(AdvanceResult),
    NotDue,
    Finished(AdvanceResult),
    Failed,
    Skipped,
}

impl TickReport {
    fn record(&mut self, handled: Handled) {
        self.examined += 1;
        let advance = match handled {
            Handled::Sent(r) => {
                self.sent += 1;
                Some(r)
            }
            Handled::AlreadySent(r) => {
                self.already_sent += 1;
                Some(r)
            }
            Handled::Finished(r) => Some(r),
            Handled::NotDue => {
                self.not_due += 1;
                None
            }
            Handled::Failed => {
                self.failed += 1;
                None
            }
            Handled::Skipped => {
                self.skipped += 1;
                None
            }
        };
        if let Some(AdvanceResult::Completed { .. }) = advance {
            self.completed += 1;
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn SequenceStore>,
    directory: Arc<dyn MemberDirectory>,
    clock: Arc<dyn Clock>,
    guard: DispatchGuard,
    dispatcher: EmailDispatcher,
    advancer: EnrollmentAdvancer,
    event_sink: Arc<dyn EventSink>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        directory: Arc<dyn MemberDirectory>,
        transport: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
        links: TrackingLinks,
        send_timeout: Duration,
    ) -> Self {
        Self {
            guard: DispatchGuard::new(store.clone()),
            dispatcher: EmailDispatcher::new(store.clone(), transport, links, send_timeout),
            advancer: EnrollmentAdvancer::new(store.clone()),
            store,
            directory,
            clock,
            event_sink: cadence_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.dispatcher = self.dispatcher.with_event_sink(sink.clone());
        self.advancer = self.advancer.with_event_sink(sink.clone());
        self.event_sink = sink;
        self
    }

    /// Run one pass over every active enrollment.
    pub async fn tick(&self) -> CadenceResult<TickReport> {
        let enrollments = self.store.list_active_enrollments().await?;
        let now = self.clock.now();
        let mut report = TickReport::default();
        let mut sequences: HashMap<Uuid, Option<Sequence>> = HashMap::new();

        for enrollment in &enrollments {
            let handled = match self.process(enrollment, now, &mut sequences).await {
                Ok(handled) => handled,
                Err(e) if e.is_store_unavailable() => {
                    error!(
                        enrollment_id = %enrollment.id,
                        examined = report.examined,
                        error = %e,
                        "Datastore unavailable; abandoning tick"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        enrollment_id = %enrollment.id,
                        sequence_id = %enrollment.sequence_id,
                        error = %e,
                        "Enrollment processing failed"
                    );
                    Handled::Failed
                }
            };
            report.record(handled);
        }

        Ok(report)
    }

    async fn process(
        &self,
        enrollment: &Enrollment,
        now: chrono::DateTime<chrono::Utc>,
        sequences: &mut HashMap<Uuid, Option<Sequence>>,
    ) -> CadenceResult<Handled> {
        let sequence = match sequences.get(&enrollment.sequence_id) {
            Some(cached) => cached.clone(),
            None => {
                let loaded = self.store.get_sequence(enrollment.sequence_id).await?;
                sequences.insert(enrollment.sequence_id, loaded.clone());
                loaded
            }
        };
        let Some(sequence) = sequence else {
            warn!(enrollment_id = %enrollment.id, sequence_id = %enrollment.sequence_id, "Sequence not found");
            return Ok(Handled::Skipped);
        };
        if !sequence.is_active {
            return Ok(Handled::Skipped);
        }
        if let Err(e) = validate_steps(&sequence.steps) {
            error!(sequence_id = %sequence.id, error = %e, "Malformed sequence steps; skipping");
            return Ok(Handled::Skipped);
        }

        let step_count = sequence.step_count();
        let step = match delay::evaluate(enrollment, &sequence.steps, now) {
            DueStatus::NotDue { .. } => return Ok(Handled::NotDue),
            DueStatus::Complete => {
                let result = self.advancer.complete(enrollment, step_count, now).await?;
                return Ok(Handled::Finished(result));
            }
            DueStatus::Due { due_at } => {
                debug!(enrollment_id = %enrollment.id, step = enrollment.current_step, %due_at, "Step due");
                match sequence.step(enrollment.current_step) {
                    Some(step) => step,
                    None => return Ok(Handled::Skipped),
                }
            }
        };

        let member = match self.directory.get_member(enrollment.member_id).await? {
            Some(member) if member.has_usable_email() => member,
            Some(_) => {
                debug!(member_id = %enrollment.member_id, "Member has no usable email");
                return Ok(Handled::Skipped);
            }
            None => {
                warn!(member_id = %enrollment.member_id, "Member not found");
                return Ok(Handled::Skipped);
            }
        };

        // Paused or advanced since the listing.
        match self.store.get_enrollment(enrollment.id).await? {
            Some(current)
                if current.status == EnrollmentStatus::Active
                    && current.current_step == enrollment.current_step => {}
            _ => {
                debug!(enrollment_id = %enrollment.id, "Enrollment changed since listing");
                return Ok(Handled::Skipped);
            }
        }

        if self.guard.check(enrollment).await? == GuardDecision::AlreadySent {
            self.event_sink.emit(make_event(
                EventType::StepAlreadySent,
                Some(sequence.id),
                Some(enrollment.id),
                Some(member.id),
                Some(step.index),
            ));
            let result = self
                .advancer
                .apply(enrollment, step_count, DispatchOutcome::AlreadySent, now)
                .await?;
            return Ok(Handled::AlreadySent(result));
        }

        match self
            .dispatcher
            .dispatch(&sequence, step, enrollment, &member, now)
            .await
        {
            Ok(_) => {
                let result = self
                    .advancer
                    .apply(enrollment, step_count, DispatchOutcome::Sent, now)
                    .await?;
                Ok(Handled::Sent(result))
            }
            // Already logged by the dispatcher; the step stays due.
            Err(CadenceError::Transport(_)) => Ok(Handled::Failed),
            Err(e) => Err(e),
        }
    }

    async fn run_tick(&self) -> CadenceResult<TickReport> {
        let start = Instant::now();
        metrics::counter!("scheduler.ticks").increment(1);
        let result = self.tick().await;
        let elapsed_ms = start.elapsed().as_millis() as f64;
        metrics::histogram!("scheduler.tick_duration_ms").record(elapsed_ms);

        match &result {
            Ok(report) => info!(
                examined = report.examined,
                sent = report.sent,
                already_sent = report.already_sent,
                not_due = report.not_due,
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                elapsed_ms,
                "Scheduler tick finished"
            ),
            Err(e) => {
                metrics::counter!("scheduler.tick_errors").increment(1);
                error!(error = %e, "Scheduler tick aborted; retrying next interval");
            }
        }
        result
    }

    /// Start the background loop. With `interval` set the first tick runs
    /// immediately and then once per interval; with `None` only manual
    /// triggers run ticks.
    pub fn spawn(self: Arc<Self>, interval: Option<Duration>) -> SchedulerHandle {
        let (command_tx, mut command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let periodic = interval.is_some();
        let period = interval.unwrap_or(Duration::from_secs(3600));

        let task: JoinHandle<()> = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), periodic, "Scheduler started");

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    Some(command) = command_rx.recv() => match command {
                        SchedulerCommand::Tick { response } => {
                            let result = self.run_tick().await;
                            let _ = response.send(result);
                        }
                    },
                    _ = ticker.tick(), if periodic => {
                        let _ = self.run_tick().await;
                    }
                }
            }

            info!("Scheduler stopped");
            let _ = stopped_tx.send(true);
        });

        SchedulerHandle {
            command_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            stopped_rx,
            task: Arc::new(parking_lot::Mutex::new(Some(task))),
        }
    }
}

enum SchedulerCommand {
    Tick {
        response: oneshot::Sender<CadenceResult<TickReport>>,
    },
}

/// Handle for controlling a spawned scheduler. Dropping every handle stops
/// the loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    stopped_rx: watch::Receiver<bool>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    /// Run one tick now and wait for its report. Queued behind any tick in
    /// progress.
    pub async fn trigger(&self) -> CadenceResult<TickReport> {
        let (response, rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Tick { response })
            .await
            .map_err(|_| CadenceError::InvalidState("scheduler is not running".into()))?;
        rx.await
            .map_err(|_| CadenceError::InvalidState("scheduler stopped before replying".into()))?
    }

    pub fn is_running(&self) -> bool {
        !*self.stopped_rx.borrow()
    }

    /// Stop the loop after the in-flight tick completes and wait for it.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    error!(error = %e, "Scheduler task panicked");
                }
            }
            None => {
                let mut stopped = self.stopped_rx.clone();
                let _ = stopped.wait_for(|s| *s).await;
            }
        }
    }
}
