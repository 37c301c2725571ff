//! The pure fold from an event log to a [`PipelineRun`].
//!
//! `apply` validates an event completely before it mutates anything, so a
//! rejected event leaves the run untouched.

use super::errors::{invalid_transition, ReplayError, ReplayResult};
use super::states::{MemberState, RunState, StageState};
use crate::events::{EventPayload, StageEvent};
use crate::models::{
    FanOutMember, PipelineRun, RunFailure, RunRecord, Stage, StageProgress, TaskId,
};

/// Fold a complete log from scratch
pub fn replay(record: &RunRecord, events: &[StageEvent]) -> ReplayResult<PipelineRun> {
    replay_from(PipelineRun::new(record), events)
}

/// Fold the tail of a log onto a snapshot. Events the snapshot already covers
/// are skipped.
pub fn replay_from(mut run: PipelineRun, events: &[StageEvent]) -> ReplayResult<PipelineRun> {
    for event in events {
        if event.sequence_no <= run.last_sequence {
            continue;
        }
        apply(&mut run, event)?;
    }
    Ok(run)
}

/// Apply one event
pub fn apply(run: &mut PipelineRun, event: &StageEvent) -> ReplayResult<()> {
    if event.run_id != run.run_id {
        return Err(ReplayError::WrongRun {
            expected: run.run_id.clone(),
            found: event.run_id.clone(),
        });
    }
    if event.sequence_no != run.next_sequence() {
        return Err(ReplayError::OutOfOrder {
            expected: run.next_sequence(),
            found: event.sequence_no,
        });
    }
    if run.is_terminal() {
        return Err(ReplayError::RunTerminal {
            run_id: run.run_id.clone(),
        });
    }

    let kind = event.kind;
    match &event.payload {
        EventPayload::StageStarted { planned_tasks } => {
            let expected = match run.current() {
                None => Stage::FIRST,
                Some(progress) if progress.state.allows_progress() => progress
                    .stage
                    .next()
                    .ok_or_else(|| invalid_transition(kind, event.stage, progress.state))?,
                Some(progress) => return Err(invalid_transition(kind, event.stage, progress.state)),
            };
            if event.stage != expected {
                return Err(invalid_transition(kind, event.stage, "out of sequence"));
            }
            if !event.stage.dispatches_tasks() && *planned_tasks > 0 {
                return Err(invalid_transition(kind, event.stage, "aggregate plans no tasks"));
            }
            if !event.stage.is_fan_out() && event.stage.dispatches_tasks() && *planned_tasks != 1 {
                return Err(invalid_transition(kind, event.stage, "single-task stage"));
            }
            run.stages
                .insert(event.stage, StageProgress::new(event.stage, *planned_tasks));
            run.current_stage = Some(event.stage);
        }

        EventPayload::TaskDispatched { invocation } => {
            let progress = open_stage(run, event)?;
            let task_id = invocation.task_id;
            if invocation.stage != event.stage || task_id.stage != event.stage {
                return Err(invalid_transition(kind, event.stage, "invocation for another stage"));
            }
            if task_id.index as usize >= progress.planned_tasks {
                return Err(ReplayError::UnknownTask { task_id });
            }
            let expected_attempt = match progress.fan_out.get(task_id.index) {
                None => 1,
                Some(member) if member.is_terminal() => {
                    return Err(invalid_transition(kind, event.stage, member.state))
                }
                Some(member) => member.attempt_number + 1,
            };
            if invocation.attempt_number != expected_attempt {
                return Err(ReplayError::AttemptMismatch {
                    task_id,
                    current: expected_attempt - 1,
                    found: invocation.attempt_number,
                });
            }
            progress.fan_out.insert(FanOutMember::from_invocation(invocation));
            progress.state = if event.stage.is_fan_out() {
                StageState::FannedOut
            } else {
                StageState::Dispatched
            };
        }

        EventPayload::TaskCompleted {
            task_id,
            attempt_number,
            output,
        } => {
            let member = open_member(run, event, *task_id, *attempt_number)?;
            member.state = MemberState::Completed;
            member.output = Some(output.clone());
        }

        EventPayload::TaskFailed {
            task_id,
            attempt_number,
            failure,
        } => {
            let member = open_member(run, event, *task_id, *attempt_number)?;
            member.state = MemberState::Failed;
            member.failure = Some(failure.clone());
        }

        EventPayload::StageCompleted { state, .. } => {
            let progress = open_stage(run, event)?;
            if !state.is_terminal() {
                return Err(invalid_transition(kind, event.stage, state));
            }
            if !progress.fan_out.is_fully_terminal(progress.planned_tasks) {
                return Err(invalid_transition(kind, event.stage, "members still in flight"));
            }
            progress.state = *state;
        }

        EventPayload::RunCompleted { state, output } => {
            let aggregated = run
                .stage(Stage::Aggregate)
                .is_some_and(|progress| progress.state == StageState::Completed);
            if !aggregated || !state.has_output() {
                return Err(invalid_transition(kind, event.stage, "aggregate not complete"));
            }
            run.state = *state;
            run.output = Some(output.clone());
        }

        EventPayload::RunFailed { stage, reason } => {
            run.state = RunState::Failed;
            run.failure = Some(RunFailure {
                stage: *stage,
                reason: reason.clone(),
            });
        }

        EventPayload::RunCancelled { reason } => {
            run.state = RunState::Cancelled;
            run.cancellation = Some(reason.clone());
        }
    }

    run.last_sequence = event.sequence_no;
    Ok(())
}

/// The event's stage, which must be current and not yet terminal
fn open_stage<'a>(
    run: &'a mut PipelineRun,
    event: &StageEvent,
) -> ReplayResult<&'a mut StageProgress> {
    if run.current_stage != Some(event.stage) {
        return Err(invalid_transition(event.kind, event.stage, "not the current stage"));
    }
    let progress = run
        .stages
        .get_mut(&event.stage)
        .ok_or_else(|| invalid_transition(event.kind, event.stage, "not started"))?;
    if progress.state.is_terminal() {
        return Err(invalid_transition(event.kind, event.stage, progress.state));
    }
    Ok(progress)
}

/// A non-terminal member whose current attempt matches the event
fn open_member<'a>(
    run: &'a mut PipelineRun,
    event: &StageEvent,
    task_id: TaskId,
    attempt_number: u32,
) -> ReplayResult<&'a mut FanOutMember> {
    if task_id.stage != event.stage {
        return Err(ReplayError::UnknownTask { task_id });
    }
    let progress = open_stage(run, event)?;
    let member = progress
        .fan_out
        .get_mut(task_id.index)
        .ok_or(ReplayError::UnknownTask { task_id })?;
    if member.is_terminal() {
        return Err(invalid_transition(event.kind, event.stage, member.state));
    }
    if member.attempt_number != attempt_number {
        return Err(ReplayError::AttemptMismatch {
            task_id,
            current: member.attempt_number,
            found: attempt_number,
        });
    }
    Ok(member)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        PartialFailurePolicy, PipelineInput, RunId, TaskFailure, TaskInvocation,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record() -> RunRecord {
        RunRecord::new(
            RunId::for_dataset(42),
            PipelineInput { dataset_id: 42 },
            PartialFailurePolicy::Proceed,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    struct LogBuilder {
        run_id: RunId,
        events: Vec<StageEvent>,
    }

    impl LogBuilder {
        fn new() -> Self {
            Self {
                run_id: RunId::for_dataset(42),
                events: Vec::new(),
            }
        }

        fn push(&mut self, stage: Stage, payload: EventPayload) -> &mut Self {
            let seq = self.events.len() as u64 + 1;
            let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, seq as u32).unwrap();
            self.events
                .push(StageEvent::new(self.run_id.clone(), seq, stage, payload, at));
            self
        }

        fn dispatch(&mut self, stage: Stage, index: u32, attempt: u32) -> &mut Self {
            let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let invocation = TaskInvocation {
                run_id: self.run_id.clone(),
                stage,
                task_id: TaskId::new(stage, index),
                queue_name: "q".to_string(),
                input: json!({ "index": index }),
                attempt_number: attempt,
                available_at: at,
                deadline: at,
                previous_error: None,
            };
            self.push(stage, EventPayload::TaskDispatched { invocation })
        }
    }

    #[test]
    fn test_replay_single_task_stage() {
        let mut log = LogBuilder::new();
        log.push(Stage::MetadataFetch, EventPayload::StageStarted { planned_tasks: 1 })
            .dispatch(Stage::MetadataFetch, 0, 1)
            .push(
                Stage::MetadataFetch,
                EventPayload::TaskCompleted {
                    task_id: TaskId::new(Stage::MetadataFetch, 0),
                    attempt_number: 1,
                    output: json!({"s3_bucket": "b", "s3_prefix": "p/"}),
                },
            )
            .push(
                Stage::MetadataFetch,
                EventPayload::StageCompleted {
                    state: StageState::Completed,
                    succeeded: 1,
                    failed: 0,
                },
            );

        let run = replay(&record(), &log.events).unwrap();
        assert_eq!(run.last_sequence, 4);
        assert_eq!(run.current_stage, Some(Stage::MetadataFetch));
        let progress = run.stage(Stage::MetadataFetch).unwrap();
        assert_eq!(progress.state, StageState::Completed);
        assert_eq!(progress.fan_out.counts().completed, 1);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut log = LogBuilder::new();
        log.push(Stage::MetadataFetch, EventPayload::StageStarted { planned_tasks: 1 })
            .dispatch(Stage::MetadataFetch, 0, 1);
        let first = replay(&record(), &log.events).unwrap();
        let second = replay(&record(), &log.events).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_gaps_in_sequence() {
        let mut log = LogBuilder::new();
        log.push(Stage::MetadataFetch, EventPayload::StageStarted { planned_tasks: 1 })
            .dispatch(Stage::MetadataFetch, 0, 1);
        log.events.remove(0);
        let err = replay(&record(), &log.events).unwrap_err();
        assert_eq!(
            err,
            ReplayError::OutOfOrder {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn test_retry_requires_next_attempt_number() {
        let mut log = LogBuilder::new();
        log.push(Stage::MetadataFetch, EventPayload::StageStarted { planned_tasks: 1 })
            .dispatch(Stage::MetadataFetch, 0, 1)
            .dispatch(Stage::MetadataFetch, 0, 3);
        let err = replay(&record(), &log.events).unwrap_err();
        assert!(matches!(err, ReplayError::AttemptMismatch { found: 3, .. }));
    }

    #[test]
    fn test_stale_completion_is_rejected() {
        let mut log = LogBuilder::new();
        log.push(Stage::MetadataFetch, EventPayload::StageStarted { planned_tasks: 1 })
            .dispatch(Stage::MetadataFetch, 0, 1)
            .dispatch(Stage::MetadataFetch, 0, 2)
            .push(
                Stage::MetadataFetch,
                EventPayload::TaskCompleted {
                    task_id: TaskId::new(Stage::MetadataFetch, 0),
                    attempt_number: 1,
                    output: json!({}),
                },
            );
        let err = replay(&record(), &log.events).unwrap_err();
        assert!(matches!(err, ReplayError::AttemptMismatch { current: 2, .. }));
    }

    #[test]
    fn test_stage_cannot_complete_with_members_in_flight() {
        let mut log = LogBuilder::new();
        log.push(Stage::MetadataFetch, EventPayload::StageStarted { planned_tasks: 1 })
            .dispatch(Stage::MetadataFetch, 0, 1)
            .push(
                Stage::MetadataFetch,
                EventPayload::StageCompleted {
                    state: StageState::Completed,
                    succeeded: 1,
                    failed: 0,
                },
            );
        assert!(replay(&record(), &log.events).is_err());
    }

    #[test]
    fn test_stages_must_start_in_order() {
        let mut log = LogBuilder::new();
        log.push(Stage::ProcessItems, EventPayload::StageStarted { planned_tasks: 3 });
        assert!(replay(&record(), &log.events).is_err());
    }

    #[test]
    fn test_failed_apply_leaves_run_untouched() {
        let mut log = LogBuilder::new();
        log.push(Stage::MetadataFetch, EventPayload::StageStarted { planned_tasks: 1 })
            .dispatch(Stage::MetadataFetch, 0, 1);
        let mut run = replay(&record(), &log.events).unwrap();
        let before = run.clone();

        log.push(
            Stage::MetadataFetch,
            EventPayload::TaskFailed {
                task_id: TaskId::new(Stage::MetadataFetch, 0),
                attempt_number: 9,
                failure: TaskFailure::permanent("nope"),
            },
        );
        let bad = log.events.last().unwrap().clone();
        assert!(apply(&mut run, &bad).is_err());
        assert_eq!(run, before);
    }

    #[test]
    fn test_cancelled_run_accepts_nothing_further() {
        let mut log = LogBuilder::new();
        log.push(Stage::MetadataFetch, EventPayload::StageStarted { planned_tasks: 1 })
            .push(
                Stage::MetadataFetch,
                EventPayload::RunCancelled {
                    reason: "operator".to_string(),
                },
            )
            .dispatch(Stage::MetadataFetch, 0, 1);
        let err = replay(&record(), &log.events).unwrap_err();
        assert!(matches!(err, ReplayError::RunTerminal { .. }));

        let run = replay(&record(), &log.events[..2]).unwrap();
        assert_eq!(run.state, RunState::Cancelled);
    }

    #[test]
    fn test_replay_from_skips_covered_events() {
        let mut log = LogBuilder::new();
        log.push(Stage::MetadataFetch, EventPayload::StageStarted { planned_tasks: 1 })
            .dispatch(Stage::MetadataFetch, 0, 1);
        let snapshot = replay(&record(), &log.events[..1]).unwrap();
        let resumed = replay_from(snapshot, &log.events).unwrap();
        assert_eq!(resumed, replay(&record(), &log.events).unwrap());
    }
}
