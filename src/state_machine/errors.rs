use crate::events::EventKind;
use crate::models::{RunId, Stage, TaskId};
use thiserror::Error;

/// Reasons an event cannot be applied to a folded run.
///
/// The engine applies every event before appending it, so these only surface
/// for logs written by something other than this engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("Event belongs to run {found}, expected {expected}")]
    WrongRun { expected: RunId, found: RunId },

    #[error("Out-of-order event: expected sequence {expected}, found {found}")]
    OutOfOrder { expected: u64, found: u64 },

    #[error("Invalid transition: {kind} for stage {stage} while {state}")]
    InvalidTransition {
        kind: EventKind,
        stage: Stage,
        state: String,
    },

    #[error("Unknown task {task_id}")]
    UnknownTask { task_id: TaskId },

    #[error("Attempt mismatch for {task_id}: current attempt {current}, event attempt {found}")]
    AttemptMismatch {
        task_id: TaskId,
        current: u32,
        found: u32,
    },

    #[error("Run {run_id} is already terminal")]
    RunTerminal { run_id: RunId },
}

pub type ReplayResult<T> = Result<T, ReplayError>;

pub(crate) fn invalid_transition(
    kind: EventKind,
    stage: Stage,
    state: impl ToString,
) -> ReplayError {
    ReplayError::InvalidTransition {
        kind,
        stage,
        state: state.to_string(),
    }
}
