//! # Pipeline Client
//!
//! The submission surface: submit a dataset, then ask for its result either
//! as a point-in-time status or by waiting for the run to end.

use crate::error::Result;
use crate::models::{PipelineInput, PipelineOutput, RunFailure, RunId, RunStatus};
use crate::orchestration::Orchestrator;
use crate::state_machine::RunState;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(RunId),
    AlreadyExists(RunId),
}

impl SubmitOutcome {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Accepted(run_id) | Self::AlreadyExists(run_id) => run_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    InProgress(RunStatus),
    /// Completed or Degraded
    Finished {
        state: RunState,
        output: PipelineOutput,
    },
    Failed(RunFailure),
    Cancelled { reason: String },
}

impl RunResult {
    pub fn from_status(status: RunStatus) -> Self {
        match status.state {
            RunState::Completed | RunState::Degraded => match status.output {
                Some(output) => Self::Finished {
                    state: status.state,
                    output,
                },
                None => Self::InProgress(status),
            },
            RunState::Failed => match status.failure {
                Some(failure) => Self::Failed(failure),
                None => Self::InProgress(status),
            },
            RunState::Cancelled => Self::Cancelled {
                reason: status.cancellation.unwrap_or_default(),
            },
            RunState::Running => Self::InProgress(status),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress(_))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineClient {
    orchestrator: Arc<Orchestrator>,
}

impl PipelineClient {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Submit under the conventional `dataset-<id>` run id
    pub async fn submit(&self, dataset_id: i64) -> Result<SubmitOutcome> {
        self.submit_with_id(RunId::for_dataset(dataset_id), dataset_id)
            .await
    }

    pub async fn submit_with_id(&self, run_id: RunId, dataset_id: i64) -> Result<SubmitOutcome> {
        let handle = self
            .orchestrator
            .submit(run_id, PipelineInput { dataset_id })
            .await?;
        Ok(if handle.created {
            SubmitOutcome::Accepted(handle.run_id)
        } else {
            SubmitOutcome::AlreadyExists(handle.run_id)
        })
    }

    /// Current result; with `blocking`, wait for the run to end first
    pub async fn get_result(&self, run_id: &RunId, blocking: bool) -> Result<RunResult> {
        let status = if blocking {
            self.orchestrator.wait_for_terminal(run_id).await?
        } else {
            self.orchestrator.get_status(run_id).await?
        };
        Ok(RunResult::from_status(status))
    }

    /// Like a blocking `get_result`, but gives up after `timeout` and returns
    /// the status at that point
    pub async fn get_result_within(&self, run_id: &RunId, timeout: Duration) -> Result<RunResult> {
        match tokio::time::timeout(timeout, self.orchestrator.wait_for_terminal(run_id)).await {
            Ok(status) => Ok(RunResult::from_status(status?)),
            Err(_) => self.get_result(run_id, false).await,
        }
    }

    pub async fn cancel(&self, run_id: &RunId, reason: &str) -> Result<bool> {
        self.orchestrator.cancel(run_id, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;

    fn status(state: RunState) -> RunStatus {
        RunStatus {
            run_id: RunId::for_dataset(1),
            dataset_id: 1,
            state,
            current_stage: Some(Stage::ProcessItems),
            stages: Vec::new(),
            last_sequence: 9,
            output: None,
            failure: None,
            cancellation: None,
        }
    }

    #[test]
    fn test_result_mapping() {
        assert!(matches!(
            RunResult::from_status(status(RunState::Running)),
            RunResult::InProgress(_)
        ));

        let mut failed = status(RunState::Failed);
        failed.failure = Some(RunFailure {
            stage: Stage::ProcessItems,
            reason: "all 2 process_items tasks failed".to_string(),
        });
        let RunResult::Failed(failure) = RunResult::from_status(failed) else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, Stage::ProcessItems);

        let mut cancelled = status(RunState::Cancelled);
        cancelled.cancellation = Some("stop".to_string());
        assert_eq!(
            RunResult::from_status(cancelled),
            RunResult::Cancelled {
                reason: "stop".to_string()
            }
        );
    }
}
