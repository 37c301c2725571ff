use super::{PipelineInput, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a fan-out stage does when some, but not all, members fail permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// Continue with the successful subset; the stage and run end up Degraded
    #[default]
    Proceed,
    /// Fail the run at the first partially failed fan-out
    Halt,
}

impl fmt::Display for PartialFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proceed => write!(f, "proceed"),
            Self::Halt => write!(f, "halt"),
        }
    }
}

impl std::str::FromStr for PartialFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proceed" => Ok(Self::Proceed),
            "halt" => Ok(Self::Halt),
            _ => Err(format!("Invalid partial failure policy: {s}")),
        }
    }
}

/// The immutable facts a run was created with.
///
/// Together with the event log this is everything replay reads; the policy
/// is captured here so later configuration changes never alter a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub input: PipelineInput,
    pub partial_failure: PartialFailurePolicy,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        run_id: RunId,
        input: PipelineInput,
        partial_failure: PartialFailurePolicy,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            input,
            partial_failure,
            created_at,
        }
    }
}
