//! Sequence orchestration: advances members through time-delayed email
//! sequences, sends each step at most once, and attributes opens and clicks
//! to the send that produced them.

pub mod advancer;
pub mod clock;
pub mod delay;
pub mod dispatcher;
pub mod guard;
pub mod scheduler;
pub mod service;
pub mod state_machine;
pub mod tracking;

pub use advancer::{AdvanceResult, DispatchOutcome, EnrollmentAdvancer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delay::DueStatus;
pub use dispatcher::EmailDispatcher;
pub use guard::{DispatchGuard, GuardDecision};
pub use scheduler::{Scheduler, SchedulerHandle, TickReport};
pub use service::SequenceService;
pub use state_machine::EnrollmentStateMachine;
pub use tracking::EngagementTracker;
