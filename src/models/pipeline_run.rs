use super::{
    FanOutSet, PartialFailurePolicy, PipelineInput, PipelineOutput, RunId, RunRecord, RunStatus,
    Stage, StageSummary, TaskInvocation,
};
use crate::state_machine::{RunState, StageState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Progress of one started stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: Stage,
    pub state: StageState,
    /// Number of tasks the stage was planned with when it started
    pub planned_tasks: usize,
    pub fan_out: FanOutSet,
}

impl StageProgress {
    pub fn new(stage: Stage, planned_tasks: usize) -> Self {
        Self {
            stage,
            state: StageState::Pending,
            planned_tasks,
            fan_out: FanOutSet::new(),
        }
    }

    pub fn summary(&self) -> StageSummary {
        let counts = self.fan_out.counts();
        StageSummary {
            stage: self.stage,
            state: self.state,
            planned: self.planned_tasks,
            dispatched: counts.total,
            in_flight: counts.in_flight,
            completed: counts.completed,
            failed: counts.failed,
        }
    }
}

/// Why a run ended in Failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: Stage,
    pub reason: String,
}

/// A run reconstructed by folding its event log.
///
/// Never mutated directly by the engine; only
/// [`apply`](crate::state_machine::apply) changes it, one event at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub input: PipelineInput,
    pub partial_failure: PartialFailurePolicy,
    pub state: RunState,
    pub current_stage: Option<Stage>,
    pub stages: BTreeMap<Stage, StageProgress>,
    /// Sequence number of the last applied event, 0 for an empty log
    pub last_sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PipelineOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<String>,
}

impl PipelineRun {
    pub fn new(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            input: record.input,
            partial_failure: record.partial_failure,
            state: RunState::Running,
            current_stage: None,
            stages: BTreeMap::new(),
            last_sequence: 0,
            output: None,
            failure: None,
            cancellation: None,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.last_sequence + 1
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageProgress> {
        self.stages.get(&stage)
    }

    pub fn current(&self) -> Option<&StageProgress> {
        self.current_stage.and_then(|stage| self.stages.get(&stage))
    }

    /// Whether any stage proceeded with a partial result set
    pub fn is_degraded(&self) -> bool {
        self.stages
            .values()
            .any(|progress| progress.state == StageState::Degraded)
    }

    /// Invocations still awaiting an outcome in the current stage
    pub fn in_flight(&self) -> Vec<TaskInvocation> {
        self.current()
            .map(|progress| {
                progress
                    .fan_out
                    .in_flight()
                    .map(|member| member.to_invocation(&self.run_id, progress.stage))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.run_id.clone(),
            dataset_id: self.input.dataset_id,
            state: self.state,
            current_stage: self.current_stage,
            stages: self.stages.values().map(StageProgress::summary).collect(),
            last_sequence: self.last_sequence,
            output: self.output.clone(),
            failure: self.failure.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}
