//! # Stage Decisions
//!
//! The pure half of `advance`: given a folded run, what happens next.
//!
//! [`decide`] reads nothing but the run itself (which is a function of the
//! event log and the run record), so replaying the same log always yields the
//! same actions. It never looks at the clock; the engine stamps times on the
//! events it derives from these actions.
//!
//! Stage inputs are planned the same way: [`plan_stage`] derives every task of
//! a stage from the outputs recorded for the previous one, in input order.

use crate::models::{
    AnalyzeRequest, CvResult, DatasetInfo, FileList, ListFilesRequest, MlResult,
    PartialFailurePolicy, PipelineOutput, PipelineRun, ProcessFileRequest, Stage, StageProgress,
    TaskId,
};
use crate::state_machine::{RunState, StageState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// One task a stage will dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTask {
    pub task_id: TaskId,
    pub input: Value,
}

/// Next step for a run. Several `Dispatch` actions may come back together;
/// every other action is returned alone.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartStage {
        stage: Stage,
        planned_tasks: usize,
    },
    Dispatch {
        stage: Stage,
        task: PlannedTask,
    },
    CompleteStage {
        stage: Stage,
        state: StageState,
        succeeded: usize,
        failed: usize,
    },
    CompleteRun {
        state: RunState,
        output: PipelineOutput,
    },
    FailRun {
        stage: Stage,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("{0} has no recorded output")]
    MissingOutput(Stage),

    #[error("Output of {stage} could not be decoded: {message}")]
    Decode { stage: Stage, message: String },
}

/// Compute the next actions for `run`. Empty means "wait for outcomes".
pub fn decide(run: &PipelineRun) -> Vec<Action> {
    if run.is_terminal() {
        return Vec::new();
    }

    let Some(progress) = run.current() else {
        return start(run, Stage::FIRST);
    };

    if progress.state.is_terminal() {
        if progress.state == StageState::Failed {
            return vec![Action::FailRun {
                stage: progress.stage,
                reason: failure_reason(run, progress),
            }];
        }
        return match progress.stage.next() {
            Some(next) => start(run, next),
            None => match aggregate(run) {
                Ok(output) => vec![Action::CompleteRun {
                    state: if run.is_degraded() {
                        RunState::Degraded
                    } else {
                        RunState::Completed
                    },
                    output,
                }],
                Err(e) => fail(progress.stage, e),
            },
        };
    }

    if !progress.stage.dispatches_tasks() {
        return vec![Action::CompleteStage {
            stage: progress.stage,
            state: StageState::Completed,
            succeeded: 0,
            failed: 0,
        }];
    }

    if progress.fan_out.len() < progress.planned_tasks {
        let tasks = match plan_stage(run, progress.stage) {
            Ok(tasks) => tasks,
            Err(e) => return fail(progress.stage, e),
        };
        if tasks.len() != progress.planned_tasks {
            return vec![Action::FailRun {
                stage: progress.stage,
                reason: format!(
                    "planned {} tasks but the stage started with {}",
                    tasks.len(),
                    progress.planned_tasks
                ),
            }];
        }
        return tasks
            .into_iter()
            .filter(|task| !progress.fan_out.contains(task.task_id.index))
            .map(|task| Action::Dispatch {
                stage: progress.stage,
                task,
            })
            .collect();
    }

    if !progress.fan_out.is_fully_terminal(progress.planned_tasks) {
        return Vec::new();
    }

    let counts = progress.fan_out.counts();
    vec![Action::CompleteStage {
        stage: progress.stage,
        state: evaluate(progress, run.partial_failure),
        succeeded: counts.completed,
        failed: counts.failed,
    }]
}

fn start(run: &PipelineRun, stage: Stage) -> Vec<Action> {
    match plan_stage(run, stage) {
        Ok(tasks) => vec![Action::StartStage {
            stage,
            planned_tasks: tasks.len(),
        }],
        Err(e) => fail(stage, e),
    }
}

fn fail(stage: Stage, error: PlanError) -> Vec<Action> {
    vec![Action::FailRun {
        stage,
        reason: error.to_string(),
    }]
}

/// Terminal state of a stage whose members are all terminal
fn evaluate(progress: &StageProgress, policy: PartialFailurePolicy) -> StageState {
    let counts = progress.fan_out.counts();
    if counts.failed == 0 {
        return StageState::Completed;
    }
    if !progress.stage.is_fan_out() || counts.completed == 0 {
        return StageState::Failed;
    }
    match policy {
        PartialFailurePolicy::Proceed => StageState::Degraded,
        PartialFailurePolicy::Halt => StageState::Failed,
    }
}

fn failure_reason(run: &PipelineRun, progress: &StageProgress) -> String {
    let counts = progress.fan_out.counts();
    if !progress.stage.is_fan_out() {
        let detail = progress
            .fan_out
            .failed()
            .next()
            .and_then(|member| member.failure.as_ref())
            .map_or_else(|| "unknown error".to_string(), ToString::to_string);
        return format!("{} task failed: {detail}", progress.stage);
    }
    if counts.completed == 0 {
        return format!("all {} {} tasks failed", counts.total, progress.stage);
    }
    format!(
        "{} of {} {} tasks failed (partial failure policy: {})",
        counts.failed, counts.total, progress.stage, run.partial_failure
    )
}

/// Every task of `stage`, derived from the outputs of the stages before it
pub fn plan_stage(run: &PipelineRun, stage: Stage) -> Result<Vec<PlannedTask>, PlanError> {
    match stage {
        Stage::MetadataFetch => Ok(vec![PlannedTask {
            task_id: TaskId::new(stage, 0),
            input: to_input(stage, &run.input)?,
        }]),

        Stage::EnumerateItems => {
            let info: DatasetInfo = single_output(run, Stage::MetadataFetch)?;
            let request = ListFilesRequest {
                s3_bucket: info.s3_bucket,
                s3_prefix: info.s3_prefix,
            };
            Ok(vec![PlannedTask {
                task_id: TaskId::new(stage, 0),
                input: to_input(stage, &request)?,
            }])
        }

        Stage::ProcessItems => {
            let info: DatasetInfo = single_output(run, Stage::MetadataFetch)?;
            let files: FileList = single_output(run, Stage::EnumerateItems)?;
            files
                .into_iter()
                .enumerate()
                .map(|(index, file)| {
                    let request = ProcessFileRequest {
                        file,
                        dataset_id: run.input.dataset_id,
                        dataset_info: info.clone(),
                    };
                    Ok(PlannedTask {
                        task_id: TaskId::new(stage, task_index(index)),
                        input: to_input(stage, &request)?,
                    })
                })
                .collect()
        }

        Stage::AnalyzeResults => {
            let info: DatasetInfo = single_output(run, Stage::MetadataFetch)?;
            completed_outputs::<CvResult>(run, Stage::ProcessItems)?
                .into_iter()
                .enumerate()
                .map(|(index, cv_result)| {
                    let request = AnalyzeRequest {
                        dataset_id: run.input.dataset_id,
                        cv_result,
                        dataset_info: info.clone(),
                    };
                    Ok(PlannedTask {
                        task_id: TaskId::new(stage, task_index(index)),
                        input: to_input(stage, &request)?,
                    })
                })
                .collect()
        }

        Stage::Aggregate => Ok(Vec::new()),
    }
}

/// The final output: successful results of both fan-outs, in input order
pub fn aggregate(run: &PipelineRun) -> Result<PipelineOutput, PlanError> {
    let cv_results: Vec<CvResult> = completed_outputs(run, Stage::ProcessItems)?;
    let ml_results: Vec<MlResult> = completed_outputs(run, Stage::AnalyzeResults)?;
    Ok(PipelineOutput {
        dataset_id: run.input.dataset_id,
        files_processed: cv_results.len(),
        cv_results,
        ml_results,
    })
}

/// Check that a reported output has the shape its stage produces
pub fn validate_output(stage: Stage, output: &Value) -> Result<(), String> {
    fn check<T: DeserializeOwned>(output: &Value) -> Result<(), String> {
        T::deserialize(output).map(|_| ()).map_err(|e| e.to_string())
    }
    match stage {
        Stage::MetadataFetch => check::<DatasetInfo>(output),
        Stage::EnumerateItems => check::<FileList>(output),
        Stage::ProcessItems => check::<CvResult>(output),
        Stage::AnalyzeResults => check::<MlResult>(output),
        Stage::Aggregate => Err("aggregate runs no tasks".to_string()),
    }
}

fn task_index(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

fn single_output<T: DeserializeOwned>(run: &PipelineRun, stage: Stage) -> Result<T, PlanError> {
    let output = run
        .stage(stage)
        .and_then(|progress| progress.fan_out.get(0))
        .and_then(|member| member.output.as_ref())
        .ok_or(PlanError::MissingOutput(stage))?;
    decode(stage, output)
}

fn completed_outputs<T: DeserializeOwned>(
    run: &PipelineRun,
    stage: Stage,
) -> Result<Vec<T>, PlanError> {
    let progress = run.stage(stage).ok_or(PlanError::MissingOutput(stage))?;
    progress
        .fan_out
        .completed()
        .map(|(_, output)| decode(stage, output))
        .collect()
}

fn decode<T: DeserializeOwned>(stage: Stage, output: &Value) -> Result<T, PlanError> {
    T::deserialize(output).map_err(|e| PlanError::Decode {
        stage,
        message: e.to_string(),
    })
}

fn to_input<T: Serialize>(stage: Stage, value: &T) -> Result<Value, PlanError> {
    serde_json::to_value(value).map_err(|e| PlanError::Decode {
        stage,
        message: e.to_string(),
    })
}
