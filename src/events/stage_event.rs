use crate::models::{PipelineOutput, RunId, Stage, TaskFailure, TaskId, TaskInvocation};
use crate::state_machine::{RunState, StageState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind tag stored alongside every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StageStarted,
    TaskDispatched,
    TaskCompleted,
    TaskFailed,
    StageCompleted,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageStarted => "StageStarted",
            Self::TaskDispatched => "TaskDispatched",
            Self::TaskCompleted => "TaskCompleted",
            Self::TaskFailed => "TaskFailed",
            Self::StageCompleted => "StageCompleted",
            Self::RunCompleted => "RunCompleted",
            Self::RunFailed => "RunFailed",
            Self::RunCancelled => "RunCancelled",
        }
    }

    /// Check if this event ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunFailed | Self::RunCancelled)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "StageStarted" => Ok(Self::StageStarted),
            "TaskDispatched" => Ok(Self::TaskDispatched),
            "TaskCompleted" => Ok(Self::TaskCompleted),
            "TaskFailed" => Ok(Self::TaskFailed),
            "StageCompleted" => Ok(Self::StageCompleted),
            "RunCompleted" => Ok(Self::RunCompleted),
            "RunFailed" => Ok(Self::RunFailed),
            "RunCancelled" => Ok(Self::RunCancelled),
            _ => Err(format!("Invalid event kind: {s}")),
        }
    }
}

/// Event body. A retried attempt is recorded as another `TaskDispatched`
/// carrying the next attempt number and the previous attempt's error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    StageStarted {
        planned_tasks: usize,
    },
    TaskDispatched {
        invocation: TaskInvocation,
    },
    TaskCompleted {
        task_id: TaskId,
        attempt_number: u32,
        output: Value,
    },
    TaskFailed {
        task_id: TaskId,
        attempt_number: u32,
        failure: TaskFailure,
    },
    StageCompleted {
        state: StageState,
        succeeded: usize,
        failed: usize,
    },
    RunCompleted {
        state: RunState,
        output: PipelineOutput,
    },
    RunFailed {
        stage: Stage,
        reason: String,
    },
    RunCancelled {
        reason: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StageStarted { .. } => EventKind::StageStarted,
            Self::TaskDispatched { .. } => EventKind::TaskDispatched,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::StageCompleted { .. } => EventKind::StageCompleted,
            Self::RunCompleted { .. } => EventKind::RunCompleted,
            Self::RunFailed { .. } => EventKind::RunFailed,
            Self::RunCancelled { .. } => EventKind::RunCancelled,
        }
    }
}

/// An immutable, ordered entry in a run's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub run_id: RunId,
    pub sequence_no: u64,
    pub stage: Stage,
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Recorded for auditing only; replay never reads it
    pub timestamp: DateTime<Utc>,
}

impl StageEvent {
    pub fn new(
        run_id: RunId,
        sequence_no: u64,
        stage: Stage,
        payload: EventPayload,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            sequence_no,
            stage,
            kind: payload.kind(),
            payload,
            timestamp,
        }
    }
}
