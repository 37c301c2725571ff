//! # Dispatcher
//!
//! Per-stage dispatch policy and the pure retry decision. Given an attempt
//! and its outcome, [`Dispatcher::resolve`] says whether the task is done,
//! gets another attempt (and when), or has failed for good. It never touches
//! the queue or the store.

use super::clock::to_chrono;
use super::decision::PlannedTask;
use crate::config::{BackoffConfig, BackoffStrategy, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::models::{OutcomeResult, RunId, Stage, TaskFailure, TaskInvocation};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Delay before a retry
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    Fixed {
        delay: Duration,
    },
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter_fraction: f64,
    },
}

impl BackoffPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        match config.strategy {
            BackoffStrategy::Fixed => Self::Fixed {
                delay: Duration::from_millis(config.initial_delay_ms),
            },
            BackoffStrategy::Exponential => Self::Exponential {
                initial: Duration::from_millis(config.initial_delay_ms),
                multiplier: config.multiplier,
                max: Duration::from_millis(config.max_delay_ms),
                jitter_fraction: config.jitter_fraction,
            },
        }
    }

    /// Delay after attempt `failed_attempt` (1-based) failed. Jitter is derived
    /// from `jitter_seed`, so the same attempt always gets the same delay.
    pub fn delay_for(&self, failed_attempt: u32, jitter_seed: u64) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
                jitter_fraction,
            } => {
                let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let base = (initial.as_secs_f64() * multiplier.powi(exponent)).min(max.as_secs_f64());
                let unit = (jitter_seed % 10_000) as f64 / 10_000.0;
                let jittered = (base + base * jitter_fraction * unit).min(max.as_secs_f64());
                Duration::from_secs_f64(jittered.max(0.0))
            }
        }
    }
}

/// Dispatch policy for one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StagePolicy {
    pub queue_name: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

/// What the engine should do with a reported outcome
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchDecision {
    Complete { output: Value },
    Retry { next: TaskInvocation },
    Fail { failure: TaskFailure },
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    policies: BTreeMap<Stage, StagePolicy>,
}

impl Dispatcher {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let policies = config
            .stages
            .iter()
            .map(|(stage, stage_config)| {
                (
                    stage,
                    StagePolicy {
                        queue_name: stage_config.queue_name.clone(),
                        timeout: stage_config.timeout(),
                        max_attempts: stage_config.max_attempts,
                        backoff: BackoffPolicy::from_config(config.backoff_for(stage)),
                    },
                )
            })
            .collect();
        Self { policies }
    }

    pub fn policy(&self, stage: Stage) -> Result<&StagePolicy> {
        self.policies
            .get(&stage)
            .ok_or(PipelineError::MissingStagePolicy(stage))
    }

    /// Attempt 1 of a planned task, deliverable at once
    pub fn first_attempt(
        &self,
        run_id: &RunId,
        stage: Stage,
        task: &PlannedTask,
        now: DateTime<Utc>,
    ) -> Result<TaskInvocation> {
        let policy = self.policy(stage)?;
        Ok(TaskInvocation {
            run_id: run_id.clone(),
            stage,
            task_id: task.task_id,
            queue_name: policy.queue_name.clone(),
            input: task.input.clone(),
            attempt_number: 1,
            available_at: now,
            deadline: now + to_chrono(policy.timeout),
            previous_error: None,
        })
    }

    /// Decide the fate of `invocation` given its outcome
    pub fn resolve(
        &self,
        invocation: &TaskInvocation,
        result: &OutcomeResult,
        now: DateTime<Utc>,
    ) -> Result<DispatchDecision> {
        let policy = self.policy(invocation.stage)?;

        let failure = match result {
            OutcomeResult::Succeeded { output } => {
                return Ok(DispatchDecision::Complete {
                    output: output.clone(),
                })
            }
            OutcomeResult::Failed { failure } => failure.clone(),
            OutcomeResult::TimedOut => TaskFailure::timeout(format!(
                "no outcome within {}s",
                policy.timeout.as_secs()
            )),
        };

        if !failure.kind.is_retryable() || invocation.attempt_number >= policy.max_attempts {
            return Ok(DispatchDecision::Fail { failure });
        }

        let delay = policy
            .backoff
            .delay_for(invocation.attempt_number, jitter_seed(&invocation.invocation_id()));
        let available_at = now + to_chrono(delay);
        Ok(DispatchDecision::Retry {
            next: TaskInvocation {
                attempt_number: invocation.attempt_number + 1,
                available_at,
                deadline: available_at + to_chrono(policy.timeout),
                previous_error: Some(failure),
                ..invocation.clone()
            },
        })
    }
}

/// FNV-1a, stable across processes and releases
fn jitter_seed(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskErrorKind, TaskId};
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn dispatcher(max_attempts: u32) -> Dispatcher {
        let mut config = PipelineConfig::default();
        config.backoff = BackoffConfig {
            strategy: BackoffStrategy::Fixed,
            initial_delay_ms: 2_000,
            max_delay_ms: 2_000,
            ..Default::default()
        };
        for stage in Stage::ALL {
            if let Some(stage_config) = config.stages.get_mut(stage) {
                stage_config.max_attempts = max_attempts;
            }
        }
        Dispatcher::from_config(&config)
    }

    fn first(dispatcher: &Dispatcher) -> TaskInvocation {
        let task = PlannedTask {
            task_id: TaskId::new(Stage::ProcessItems, 4),
            input: json!({"file": "a.jpg"}),
        };
        dispatcher
            .first_attempt(&RunId::for_dataset(1), Stage::ProcessItems, &task, now())
            .unwrap()
    }

    #[test]
    fn test_first_attempt_uses_stage_policy() {
        let invocation = first(&dispatcher(3));
        assert_eq!(invocation.queue_name, "cv-queue");
        assert_eq!(invocation.attempt_number, 1);
        assert_eq!(invocation.deadline, now() + chrono::Duration::minutes(30));
    }

    #[test]
    fn test_transient_failure_is_retried_with_backoff() {
        let d = dispatcher(3);
        let invocation = first(&d);
        let decision = d
            .resolve(
                &invocation,
                &OutcomeResult::Failed {
                    failure: TaskFailure::transient("flaky"),
                },
                now(),
            )
            .unwrap();
        let next = match decision {
            DispatchDecision::Retry { next } => next,
            other => panic!("expected retry, got {other:?}"),
        };
        assert_eq!(next.attempt_number, 2);
        assert_eq!(next.task_id, invocation.task_id);
        assert_eq!(next.available_at, now() + chrono::Duration::seconds(2));
        assert_eq!(
            next.deadline,
            next.available_at + chrono::Duration::minutes(30)
        );
        assert_eq!(next.previous_error.unwrap().kind, TaskErrorKind::Transient);
    }

    #[test]
    fn test_permanent_failure_is_never_retried() {
        let d = dispatcher(3);
        let decision = d
            .resolve(
                &first(&d),
                &OutcomeResult::Failed {
                    failure: TaskFailure::permanent("corrupt image"),
                },
                now(),
            )
            .unwrap();
        assert!(matches!(decision, DispatchDecision::Fail { failure } if failure.kind == TaskErrorKind::Permanent));
    }

    #[test]
    fn test_timeout_is_retried_until_budget_is_spent() {
        let d = dispatcher(2);
        let attempt1 = first(&d);
        let DispatchDecision::Retry { next: attempt2 } =
            d.resolve(&attempt1, &OutcomeResult::TimedOut, now()).unwrap()
        else {
            panic!("expected retry");
        };
        let decision = d.resolve(&attempt2, &OutcomeResult::TimedOut, now()).unwrap();
        assert!(matches!(decision, DispatchDecision::Fail { failure } if failure.kind == TaskErrorKind::Timeout));
    }

    #[test]
    fn test_success_completes() {
        let d = dispatcher(1);
        let decision = d
            .resolve(
                &first(&d),
                &OutcomeResult::Succeeded {
                    output: json!({"ok": true}),
                },
                now(),
            )
            .unwrap();
        assert_eq!(
            decision,
            DispatchDecision::Complete {
                output: json!({"ok": true})
            }
        );
    }

    #[test]
    fn test_exponential_backoff_grows_and_caps() {
        let policy = BackoffPolicy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(5),
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.delay_for(1, 0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, 0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, 0), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4, 0), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_is_deterministic_and_bounded() {
        let policy = BackoffPolicy::Exponential {
            initial: Duration::from_secs(10),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter_fraction: 0.5,
        };
        let seed = jitter_seed("dataset-1/process_items:00004/1");
        let a = policy.delay_for(1, seed);
        let b = policy.delay_for(1, seed);
        assert_eq!(a, b);
        assert!(a >= Duration::from_secs(10));
        assert!(a <= Duration::from_secs(15));
    }

    #[test]
    fn test_aggregate_has_no_policy() {
        assert!(matches!(
            dispatcher(3).policy(Stage::Aggregate),
            Err(PipelineError::MissingStagePolicy(Stage::Aggregate))
        ));
    }
}
