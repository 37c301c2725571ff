use super::{PipelineOutput, RunFailure, RunId, Stage};
use crate::state_machine::{RunState, StageState};
use serde::{Deserialize, Serialize};

/// Point-in-time view of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub state: StageState,
    pub planned: usize,
    pub dispatched: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Point-in-time view of a run, as returned by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub dataset_id: i64,
    pub state: RunState,
    pub current_stage: Option<Stage>,
    pub stages: Vec<StageSummary>,
    pub last_sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PipelineOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<String>,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageSummary> {
        self.stages.iter().find(|summary| summary.stage == stage)
    }
}
