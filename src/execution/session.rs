//! Session state machine and the outcome it produces.

use std::{fmt, time::Duration};

use crate::{
    error::ExecutionError,
    execution::capture::CapturedOutput,
    kernel::UnitStatus,
};

/// Why a session ended in [`SessionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Unit { index: usize, detail: String },
    Kernel { unit: Option<usize>, detail: String },
    AmbiguousOutput { first_unit: usize, second_unit: usize },
    OutputTooLarge { bytes: usize, limit: usize },
}

impl From<Failure> for ExecutionError {
    fn from(f: Failure) -> Self {
        match f {
            Failure::Unit { index, detail } => ExecutionError::UnitFailed { index, detail },
            Failure::Kernel { unit, detail } => ExecutionError::Kernel { unit, detail },
            Failure::AmbiguousOutput {
                first_unit,
                second_unit,
            } => ExecutionError::AmbiguousOutput {
                first_unit,
                second_unit,
            },
            Failure::OutputTooLarge { bytes, limit } => {
                ExecutionError::OutputTooLarge { bytes, limit }
            }
        }
    }
}

impl Failure {
    /// Map a capture latch rejection; other errors never come out of the latch.
    pub(crate) fn from_capture(err: ExecutionError, unit: usize) -> Self {
        match err {
            ExecutionError::AmbiguousOutput {
                first_unit,
                second_unit,
            } => Failure::AmbiguousOutput {
                first_unit,
                second_unit,
            },
            ExecutionError::OutputTooLarge { bytes, limit } => {
                Failure::OutputTooLarge { bytes, limit }
            }
            other => Failure::Kernel {
                unit: Some(unit),
                detail: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Starting,
    Running(usize),
    Completed,
    Failed(Failure),
    TimedOut { unit: Option<usize> },
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed(_)
                | SessionState::TimedOut { .. }
                | SessionState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Starting) => true,
            // a notebook without code units completes straight after start
            (Starting, Running(_) | Completed) => true,
            (Running(cur), Running(n)) => n > cur,
            (Running(_), Completed) => true,
            (Starting | Running(_), Failed(_) | TimedOut { .. } | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => f.write_str("created"),
            SessionState::Starting => f.write_str("starting"),
            SessionState::Running(i) => write!(f, "running({})", i),
            SessionState::Completed => f.write_str("completed"),
            SessionState::Failed(_) => f.write_str("failed"),
            SessionState::TimedOut { .. } => f.write_str("timed-out"),
            SessionState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Tracks the current state and every state visited.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    history: Vec<SessionState>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Created,
            history: vec![SessionState::Created],
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "illegal session transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!(from = %self.state, to = %next, "session transition");
        self.history.push(next.clone());
        self.state = next;
    }

    pub fn into_parts(self) -> (SessionState, Vec<SessionState>) {
        (self.state, self.history)
    }
}

/// What happened to one code unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord {
    pub index: usize,
    pub status: UnitStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub history: Vec<SessionState>,
    pub captured: Option<CapturedOutput>,
    pub units: Vec<UnitRecord>,
    pub elapsed: Duration,
    pub fingerprint: String,
}

impl SessionOutcome {
    /// The captured output of a completed session, or the execution error
    /// describing why there is none.
    pub fn into_result(self) -> Result<CapturedOutput, ExecutionError> {
        match self.state {
            SessionState::Completed => self.captured.ok_or(ExecutionError::NoOutputProduced),
            SessionState::Failed(failure) => Err(failure.into()),
            SessionState::TimedOut { unit } => Err(ExecutionError::TimedOut { unit }),
            SessionState::Cancelled => Err(ExecutionError::Cancelled),
            other => Err(ExecutionError::Kernel {
                unit: None,
                detail: format!("session ended in non-terminal state {}", other),
            }),
        }
    }
}
