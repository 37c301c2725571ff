use super::{RunId, Stage, TaskFailure, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One dispatched unit of work.
///
/// Every attempt is its own invocation; `(run_id, task_id, attempt_number)`
/// identifies it on the queue and correlates the eventual outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub run_id: RunId,
    pub stage: Stage,
    pub task_id: TaskId,
    pub queue_name: String,
    pub input: Value,
    pub attempt_number: u32,
    /// Earliest time a worker may receive this attempt (retry backoff)
    pub available_at: DateTime<Utc>,
    /// No outcome recorded by this time means the attempt timed out
    pub deadline: DateTime<Utc>,
    /// Why the previous attempt ended, for retried invocations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_error: Option<TaskFailure>,
}

impl TaskInvocation {
    /// Queue-level identity, used for de-duplication and cancellation
    pub fn invocation_id(&self) -> String {
        format!("{}/{}/{}", self.run_id, self.task_id, self.attempt_number)
    }

    pub fn key(&self) -> InvocationKey {
        InvocationKey {
            run_id: self.run_id.clone(),
            task_id: self.task_id,
            attempt_number: self.attempt_number,
        }
    }
}

/// Lightweight handle on a specific attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationKey {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub attempt_number: u32,
}
