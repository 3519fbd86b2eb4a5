use cadence_core::error::{CadenceError, CadenceResult};
use cadence_core::types::EnrollmentStatus;
use serde::{Deserialize, Serialize};

/// Describes a single valid state transition for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: String,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// state transitions. `Completed` is terminal.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    pub state: EnrollmentStatus,
    pub transitions: Vec<StateTransition>,
}

impl EnrollmentStateMachine {
    /// Creates a state machine positioned at `state` with all valid
    /// transitions pre-configured.
    pub fn new(state: EnrollmentStatus) -> Self {
        let transitions = vec![
            // Active ->
            StateTransition {
                from: EnrollmentStatus::Active,
                to: EnrollmentStatus::Paused,
                trigger: "pause".to_string(),
            },
            StateTransition {
                from: EnrollmentStatus::Active,
                to: EnrollmentStatus::Completed,
                trigger: "last_step_settled".to_string(),
            },
            // Paused ->
            StateTransition {
                from: EnrollmentStatus::Paused,
                to: EnrollmentStatus::Active,
                trigger: "resume".to_string(),
            },
            StateTransition {
                from: EnrollmentStatus::Paused,
                to: EnrollmentStatus::Completed,
                trigger: "manual_advance_past_end".to_string(),
            },
        ];

        Self { state, transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &EnrollmentStatus, to: &EnrollmentStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Attempts to move the state machine to `to`. Returns
    /// `CadenceError::InvalidState` if the transition is not permitted.
    pub fn transition(&mut self, to: EnrollmentStatus) -> CadenceResult<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(CadenceError::InvalidState(format!(
                "cannot move enrollment from {:?} to {:?}",
                self.state, to
            )))
        }
    }

    /// Validate a transition without keeping a machine around.
    pub fn check(from: EnrollmentStatus, to: EnrollmentStatus) -> CadenceResult<()> {
        Self::new(from).transition(to)
    }
}

impl Default for EnrollmentStateMachine {
    fn default() -> Self {
        Self::new(EnrollmentStatus::Active)
    }
}
