use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Failure classification for task attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Network blip, overloaded worker
    Transient,
    /// Bad input or otherwise unrecoverable; never retried
    Permanent,
    /// No outcome before the deadline; retried like a transient error
    Timeout,
}

impl TaskErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Timeout, message)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// What a worker (or the deadline tracker) reports for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeResult {
    Succeeded { output: Value },
    Failed { failure: TaskFailure },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub attempt_number: u32,
    pub result: OutcomeResult,
}

impl TaskOutcome {
    pub fn succeeded(attempt_number: u32, output: Value) -> Self {
        Self {
            attempt_number,
            result: OutcomeResult::Succeeded { output },
        }
    }

    pub fn failed(attempt_number: u32, failure: TaskFailure) -> Self {
        Self {
            attempt_number,
            result: OutcomeResult::Failed { failure },
        }
    }

    pub fn timed_out(attempt_number: u32) -> Self {
        Self {
            attempt_number,
            result: OutcomeResult::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(TaskErrorKind::Transient.is_retryable());
        assert!(TaskErrorKind::Timeout.is_retryable());
        assert!(!TaskErrorKind::Permanent.is_retryable());
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome = TaskOutcome::failed(2, TaskFailure::permanent("bad input"));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["attempt_number"], 2);
        assert_eq!(json["result"]["status"], "failed");
        assert_eq!(json["result"]["failure"]["kind"], "permanent");
    }
}
