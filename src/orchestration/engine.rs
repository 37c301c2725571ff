//! # Orchestrator Engine
//!
//! Drives runs forward by folding their event log, asking [`decide`] what to
//! do next, and appending the resulting events.
//!
//! ## Ownership
//!
//! Every operation that writes first takes (or renews) the run's lease in the
//! store, and every append is fenced by the lease token. The folded run is
//! cached per run together with the token it was built under; when the token
//! changes the cache is rebuilt from the store, since another owner may have
//! appended in between.
//!
//! ## Conflicts
//!
//! - `LogAppendConflict`: the cached fold is dropped, the log re-read and the
//!   operation re-evaluated, up to `engine.max_conflict_retries` times.
//! - `RunLeaseConflict`: returned to the caller. The run is left alone.
//!
//! Within one process, operations on the same run are serialized by a per-run
//! async mutex; different runs proceed independently.

use super::clock::SharedClock;
use super::deadlines::DeadlineTracker;
use super::decision::{decide, validate_output, Action};
use super::dispatcher::{DispatchDecision, Dispatcher};
use crate::config::{InfraRetryConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::events::{EventPayload, StageEvent};
use crate::logging::{log_error, log_run_operation, log_task_operation};
use crate::messaging::SharedQueue;
use crate::models::{
    OutcomeResult, PartialFailurePolicy, PipelineInput, PipelineRun, RunId, RunRecord, RunStatus,
    Stage, TaskFailure, TaskId, TaskInvocation, TaskOutcome,
};
use crate::resilience::with_infra_retry;
use crate::state_machine::{apply, replay_from};
use crate::store::{CreateRunOutcome, LeaseOutcome, RunLease, RunSnapshot, SharedStore};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Returned by `submit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: RunId,
    /// False when the run already existed
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalResult {
    Recorded,
    Ignored(IgnoredReason),
}

/// Why an outcome was not recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoredReason {
    RunTerminal,
    /// The task's stage is not the current one, or already finished
    StageClosed,
    UnknownTask,
    /// The task already has a terminal outcome (a redelivered report)
    AlreadyTerminal,
    /// The report is for a different attempt than the one outstanding
    AttemptMismatch { current: u32, reported: u32 },
}

impl fmt::Display for IgnoredReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunTerminal => write!(f, "run is terminal"),
            Self::StageClosed => write!(f, "stage is not open"),
            Self::UnknownTask => write!(f, "unknown task"),
            Self::AlreadyTerminal => write!(f, "task already has a terminal outcome"),
            Self::AttemptMismatch { current, reported } => {
                write!(f, "outcome for attempt {reported}, current attempt is {current}")
            }
        }
    }
}

/// Fold cached under the lease it was built with
#[derive(Debug)]
struct LoadedRun {
    lease: RunLease,
    run: PipelineRun,
    since_snapshot: u64,
    /// Set when the cache may disagree with the store
    stale: bool,
}

type RunSlot = Option<LoadedRun>;

pub struct Orchestrator {
    owner_id: String,
    store: SharedStore,
    queue: SharedQueue,
    clock: SharedClock,
    dispatcher: Dispatcher,
    deadlines: DeadlineTracker,
    partial_failure: PartialFailurePolicy,
    lease_ttl: Duration,
    snapshot_interval: u64,
    max_conflict_retries: u32,
    status_poll_interval: Duration,
    infra_retry: InfraRetryConfig,
    slots: DashMap<RunId, Arc<Mutex<RunSlot>>>,
    watchers: DashMap<RunId, watch::Sender<RunStatus>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("owner_id", &self.owner_id)
            .field("cached_runs", &self.slots.len())
            .field("tracked_deadlines", &self.deadlines.len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        config: &PipelineConfig,
        store: SharedStore,
        queue: SharedQueue,
        clock: SharedClock,
    ) -> Self {
        Self {
            owner_id: format!("orchestrator-{}", Uuid::new_v4()),
            store,
            queue,
            clock,
            dispatcher: Dispatcher::from_config(config),
            deadlines: DeadlineTracker::new(),
            partial_failure: config.policy.partial_failure,
            lease_ttl: config.store.lease_duration(),
            snapshot_interval: config.store.snapshot_interval_events,
            max_conflict_retries: config.engine.max_conflict_retries,
            status_poll_interval: config.engine.status_poll_interval(),
            infra_retry: config.infra_retry,
            slots: DashMap::new(),
            watchers: DashMap::new(),
        }
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn deadlines(&self) -> &DeadlineTracker {
        &self.deadlines
    }

    /// Create the run if it does not exist and start advancing it.
    /// Resubmitting an existing run id returns the existing run.
    #[instrument(skip(self, run_id, input), fields(run_id = %run_id))]
    pub async fn submit(&self, run_id: RunId, input: PipelineInput) -> Result<RunHandle> {
        if run_id.as_str().trim().is_empty() {
            return Err(PipelineError::InvalidInput("run id must not be empty".to_string()));
        }

        let record = RunRecord::new(run_id.clone(), input, self.partial_failure, self.clock.now());
        let outcome = with_infra_retry("create_run", &self.infra_retry, || {
            self.store.create_run(&record)
        })
        .await
        .map_err(|e| PipelineError::from_store(&run_id, e))?;

        if let CreateRunOutcome::AlreadyExists(existing) = outcome {
            if existing.input != input {
                warn!(
                    run_id = %run_id,
                    existing_dataset = existing.input.dataset_id,
                    submitted_dataset = input.dataset_id,
                    "Resubmission with different input ignored"
                );
            }
            log_run_operation("SUBMIT", &run_id, None, "already_exists", None);
            self.resume_existing(&run_id).await?;
            return Ok(RunHandle {
                run_id,
                created: false,
            });
        }

        log_run_operation(
            "SUBMIT",
            &run_id,
            None,
            "created",
            Some(&format!("dataset_id={}", input.dataset_id)),
        );

        let mut slot = self.lock(&run_id).await;
        let mut conflicts = 0;
        let advanced = loop {
            match self.advance_run(&run_id, &mut slot).await {
                Err(e) if self.retry_conflict(&e, &mut conflicts, &mut slot) => continue,
                result => break result,
            }
        };
        self.evict_if_finished(&run_id, &mut slot).await;
        advanced?;

        Ok(RunHandle {
            run_id,
            created: true,
        })
    }

    /// Submit under the conventional `dataset-<id>` run id
    pub async fn submit_dataset(&self, dataset_id: i64) -> Result<RunHandle> {
        self.submit(RunId::for_dataset(dataset_id), PipelineInput { dataset_id })
            .await
    }

    /// Record the outcome of one attempt and re-evaluate the run
    #[instrument(
        skip(self, run_id, task_id, outcome),
        fields(run_id = %run_id, task_id = %task_id, attempt = outcome.attempt_number)
    )]
    pub async fn signal_task_outcome(
        &self,
        run_id: &RunId,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> Result<SignalResult> {
        let mut slot = self.lock(run_id).await;
        let mut conflicts = 0;
        let result = loop {
            match self.record_outcome(run_id, task_id, &outcome, &mut slot).await {
                Err(e) if self.retry_conflict(&e, &mut conflicts, &mut slot) => continue,
                result => break result,
            }
        };
        self.evict_if_finished(run_id, &mut slot).await;
        result
    }

    /// Point-in-time status read from the store. Takes no lease.
    pub async fn get_status(&self, run_id: &RunId) -> Result<RunStatus> {
        Ok(self.load(run_id).await?.status())
    }

    /// Cancel a run. Pending invocations are withdrawn from their queues
    /// best-effort; running ones are left to finish and their outcomes are
    /// ignored. Returns false if the run had already ended.
    #[instrument(skip(self, run_id, reason), fields(run_id = %run_id))]
    pub async fn cancel(&self, run_id: &RunId, reason: &str) -> Result<bool> {
        let mut slot = self.lock(run_id).await;
        let mut conflicts = 0;
        let result = loop {
            match self.cancel_run(run_id, reason, &mut slot).await {
                Err(e) if self.retry_conflict(&e, &mut conflicts, &mut slot) => continue,
                result => break result,
            }
        };
        self.evict_if_finished(run_id, &mut slot).await;
        result
    }

    /// Take over a run after a restart: rebuild it from the store, put every
    /// outstanding invocation back on its queue, re-arm deadlines and advance.
    #[instrument(skip(self, run_id), fields(run_id = %run_id))]
    pub async fn recover(&self, run_id: &RunId) -> Result<RunStatus> {
        let mut slot = self.lock(run_id).await;
        if let Some(loaded) = slot.as_mut() {
            loaded.stale = true;
        }
        let mut conflicts = 0;
        let result = loop {
            match self.recover_run(run_id, &mut slot).await {
                Err(e) if self.retry_conflict(&e, &mut conflicts, &mut slot) => continue,
                result => break result,
            }
        };
        self.evict_if_finished(run_id, &mut slot).await;
        result
    }

    /// Recover every run in the store that has not ended. Runs leased by
    /// another live orchestrator are skipped.
    pub async fn recover_all(&self) -> Result<Vec<RunId>> {
        let records = with_infra_retry("list_runs", &self.infra_retry, || self.store.list_runs())
            .await?;

        let mut recovered = Vec::new();
        for record in records {
            match self.recover(&record.run_id).await {
                Ok(status) if !status.is_terminal() => recovered.push(record.run_id),
                Ok(_) => {}
                Err(e) if e.is_lease_conflict() => {
                    debug!(run_id = %record.run_id, error = %e, "Skipping run owned elsewhere");
                }
                Err(e) => log_error(
                    "orchestrator",
                    "recover_all",
                    &e.to_string(),
                    Some(record.run_id.as_str()),
                ),
            }
        }

        info!(recovered = recovered.len(), "🔄 Recovery pass complete");
        Ok(recovered)
    }

    /// Turn every attempt whose deadline has passed into a `TimedOut`
    /// outcome. Returns how many were recorded. An attempt whose timeout
    /// could not be recorded is re-armed for the next tick, unless the run
    /// is gone or owned elsewhere.
    pub async fn handle_timeouts(&self) -> usize {
        let now = self.clock.now();
        let expired = self.deadlines.expired(now);
        let mut recorded = 0;
        for key in expired {
            let outcome = TaskOutcome::timed_out(key.attempt_number);
            match self.signal_task_outcome(&key.run_id, key.task_id, outcome).await {
                Ok(SignalResult::Recorded) => recorded += 1,
                Ok(SignalResult::Ignored(reason)) => {
                    debug!(run_id = %key.run_id, task_id = %key.task_id, %reason, "Timeout ignored");
                }
                Err(e) => {
                    log_error(
                        "orchestrator",
                        "handle_timeouts",
                        &e.to_string(),
                        Some(&format!("{}/{}", key.run_id, key.task_id)),
                    );
                    if !e.is_lease_conflict() && !matches!(e, PipelineError::RunNotFound(_)) {
                        self.deadlines.rearm(key, now);
                    }
                }
            }
        }
        recorded
    }

    /// Status updates for a run as this process records them
    pub async fn subscribe(&self, run_id: &RunId) -> Result<watch::Receiver<RunStatus>> {
        if let Some(sender) = self.watchers.get(run_id) {
            return Ok(sender.subscribe());
        }
        let status = self.get_status(run_id).await?;
        if status.is_terminal() {
            return Ok(watch::channel(status).1);
        }
        Ok(self
            .watchers
            .entry(run_id.clone())
            .or_insert_with(|| watch::channel(status).0)
            .subscribe())
    }

    /// Wait until the run ends. Also polls the store, so runs advanced by
    /// another process are observed too.
    pub async fn wait_for_terminal(&self, run_id: &RunId) -> Result<RunStatus> {
        let mut updates = self.subscribe(run_id).await?;
        let status = loop {
            let status = updates.borrow_and_update().clone();
            if status.is_terminal() {
                break status;
            }
            tokio::select! {
                _ = updates.changed() => {}
                _ = tokio::time::sleep(self.status_poll_interval) => {
                    let status = self.get_status(run_id).await?;
                    if status.is_terminal() {
                        break status;
                    }
                }
            }
        };
        drop(updates);
        self.watchers
            .remove_if(run_id, |_, sender| sender.receiver_count() == 0);
        Ok(status)
    }

    /// Number of runs with cached state in this process
    pub fn cached_runs(&self) -> usize {
        self.slots.len()
    }

    /// Number of runs with a status channel in this process
    pub fn watched_runs(&self) -> usize {
        self.watchers.len()
    }

    /// A resubmitted run that has started but not ended is recovered, so an
    /// invocation lost to a failed enqueue goes back on its queue. Runs owned
    /// by another live orchestrator are left to it.
    async fn resume_existing(&self, run_id: &RunId) -> Result<()> {
        let status = self.get_status(run_id).await?;
        if status.is_terminal() || status.last_sequence == 0 {
            return Ok(());
        }
        match self.recover(run_id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_lease_conflict() => {
                debug!(run_id = %run_id, error = %e, "Resubmitted run is owned elsewhere");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Once a run has ended, give its lease back and drop everything this
    /// process holds for it
    async fn evict_if_finished(&self, run_id: &RunId, slot: &mut RunSlot) {
        let finished = slot
            .as_ref()
            .is_some_and(|loaded| !loaded.stale && loaded.run.is_terminal());
        if !finished {
            return;
        }
        let Some(loaded) = slot.take() else {
            return;
        };
        if let Some((_, sender)) = self.watchers.remove(run_id) {
            sender.send_replace(loaded.run.status());
        }
        if let Err(e) = self.store.release_lease(&loaded.lease).await {
            debug!(run_id = %run_id, error = %e, "Lease release failed; it will expire");
        }
        // Shared only by the map and our guard. A caller queued on it evicts later.
        self.slots
            .remove_if(run_id, |_, shared| Arc::strong_count(shared) <= 2);
    }

    async fn lock(&self, run_id: &RunId) -> OwnedMutexGuard<RunSlot> {
        let slot = self.slots.entry(run_id.clone()).or_default().clone();
        slot.lock_owned().await
    }

    fn retry_conflict(&self, error: &PipelineError, conflicts: &mut u32, slot: &mut RunSlot) -> bool {
        if !error.is_append_conflict() || *conflicts >= self.max_conflict_retries {
            return false;
        }
        *conflicts += 1;
        if let Some(loaded) = slot.as_mut() {
            loaded.stale = true;
        }
        warn!(error = %error, attempt = *conflicts, "Append conflict, re-reading the log");
        true
    }

    /// Fold the run from its latest snapshot and the events after it
    async fn load(&self, run_id: &RunId) -> Result<PipelineRun> {
        let record = with_infra_retry("get_run", &self.infra_retry, || self.store.get_run(run_id))
            .await
            .map_err(|e| PipelineError::from_store(run_id, e))?
            .ok_or_else(|| PipelineError::RunNotFound(run_id.clone()))?;
        let snapshot = with_infra_retry("load_snapshot", &self.infra_retry, || {
            self.store.load_snapshot(run_id)
        })
        .await
        .map_err(|e| PipelineError::from_store(run_id, e))?;

        let base = snapshot.map_or_else(|| PipelineRun::new(&record), |snapshot| snapshot.run);
        let after = base.last_sequence;
        let events = with_infra_retry("read_after", &self.infra_retry, || {
            self.store.read_after(run_id, after)
        })
        .await
        .map_err(|e| PipelineError::from_store(run_id, e))?;

        replay_from(base, &events).map_err(|source| PipelineError::Replay {
            run_id: run_id.clone(),
            source,
        })
    }

    /// Take or renew the lease and make sure the cached fold was built under it
    async fn prepare<'a>(&self, run_id: &RunId, slot: &'a mut RunSlot) -> Result<&'a mut LoadedRun> {
        let outcome = with_infra_retry("acquire_lease", &self.infra_retry, || {
            self.store.acquire_lease(run_id, &self.owner_id, self.lease_ttl)
        })
        .await
        .map_err(|e| PipelineError::from_store(run_id, e))?;

        let lease = match outcome {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::HeldBy { owner, expires_at } => {
                *slot = None;
                debug!(run_id = %run_id, holder = %owner, %expires_at, "Run is leased elsewhere");
                return Err(PipelineError::RunLeaseConflict {
                    run_id: run_id.clone(),
                    holder: owner,
                });
            }
        };

        let reusable = matches!(
            slot.as_ref(),
            Some(loaded) if !loaded.stale && loaded.lease.token == lease.token
        );
        if reusable {
            if let Some(loaded) = slot.as_mut() {
                loaded.lease = lease;
            }
        } else {
            let run = self.load(run_id).await?;
            debug!(run_id = %run_id, last_sequence = run.last_sequence, "Run state rebuilt from store");
            *slot = Some(LoadedRun {
                lease,
                run,
                since_snapshot: 0,
                stale: false,
            });
        }
        slot.as_mut()
            .ok_or_else(|| PipelineError::RunNotFound(run_id.clone()))
    }

    async fn advance_run(&self, run_id: &RunId, slot: &mut RunSlot) -> Result<()> {
        let loaded = self.prepare(run_id, slot).await?;
        self.advance(loaded).await?;
        self.finish(loaded).await;
        Ok(())
    }

    async fn record_outcome(
        &self,
        run_id: &RunId,
        task_id: TaskId,
        outcome: &TaskOutcome,
        slot: &mut RunSlot,
    ) -> Result<SignalResult> {
        let loaded = self.prepare(run_id, slot).await?;

        let invocation = match current_attempt(&loaded.run, task_id, outcome.attempt_number) {
            Ok(invocation) => invocation,
            Err(reason) => {
                log_task_operation(
                    "SIGNAL_OUTCOME",
                    run_id,
                    task_id,
                    outcome.attempt_number,
                    "ignored",
                    Some(&reason.to_string()),
                );
                return Ok(SignalResult::Ignored(reason));
            }
        };

        let result = match &outcome.result {
            OutcomeResult::Succeeded { output } => match validate_output(task_id.stage, output) {
                Ok(()) => outcome.result.clone(),
                Err(message) => OutcomeResult::Failed {
                    failure: TaskFailure::permanent(format!("invalid output: {message}")),
                },
            },
            other => other.clone(),
        };

        let now = self.clock.now();
        match self.dispatcher.resolve(&invocation, &result, now)? {
            DispatchDecision::Complete { output } => {
                self.append(
                    loaded,
                    task_id.stage,
                    EventPayload::TaskCompleted {
                        task_id,
                        attempt_number: invocation.attempt_number,
                        output,
                    },
                )
                .await?;
                self.deadlines.clear(run_id, task_id);
                log_task_operation("SIGNAL_OUTCOME", run_id, task_id, invocation.attempt_number, "completed", None);
            }
            DispatchDecision::Fail { failure } => {
                let details = failure.to_string();
                self.append(
                    loaded,
                    task_id.stage,
                    EventPayload::TaskFailed {
                        task_id,
                        attempt_number: invocation.attempt_number,
                        failure,
                    },
                )
                .await?;
                self.deadlines.clear(run_id, task_id);
                log_task_operation(
                    "SIGNAL_OUTCOME",
                    run_id,
                    task_id,
                    invocation.attempt_number,
                    "failed",
                    Some(&details),
                );
            }
            DispatchDecision::Retry { next } => {
                self.append(
                    loaded,
                    task_id.stage,
                    EventPayload::TaskDispatched {
                        invocation: next.clone(),
                    },
                )
                .await?;
                self.enqueue(&next).await?;
                log_task_operation(
                    "SIGNAL_OUTCOME",
                    run_id,
                    task_id,
                    next.attempt_number,
                    "retry_scheduled",
                    Some(&format!("available_at={}", next.available_at.to_rfc3339())),
                );
            }
        }

        let settled = [invocation.invocation_id()];
        if matches!(result, OutcomeResult::TimedOut) {
            self.withdraw(&settled).await;
        }
        self.queue.forget(&settled);

        self.advance(loaded).await?;
        self.finish(loaded).await;
        Ok(SignalResult::Recorded)
    }

    async fn cancel_run(&self, run_id: &RunId, reason: &str, slot: &mut RunSlot) -> Result<bool> {
        let loaded = self.prepare(run_id, slot).await?;
        if loaded.run.is_terminal() {
            return Ok(false);
        }

        let pending: Vec<String> = loaded
            .run
            .in_flight()
            .iter()
            .map(TaskInvocation::invocation_id)
            .collect();
        let stage = loaded.run.current_stage.unwrap_or(Stage::FIRST);
        self.append(
            loaded,
            stage,
            EventPayload::RunCancelled {
                reason: reason.to_string(),
            },
        )
        .await?;

        self.withdraw(&pending).await;
        log_run_operation("CANCEL", run_id, Some(stage), "cancelled", Some(reason));
        self.finish(loaded).await;
        Ok(true)
    }

    async fn recover_run(&self, run_id: &RunId, slot: &mut RunSlot) -> Result<RunStatus> {
        let loaded = self.prepare(run_id, slot).await?;
        if loaded.run.is_terminal() {
            return Ok(loaded.run.status());
        }

        let in_flight = loaded.run.in_flight();
        for invocation in &in_flight {
            self.enqueue(invocation).await?;
        }
        log_run_operation(
            "RECOVER",
            run_id,
            loaded.run.current_stage,
            "resumed",
            Some(&format!("redispatched={}", in_flight.len())),
        );

        self.advance(loaded).await?;
        self.finish(loaded).await;
        Ok(loaded.run.status())
    }

    /// Apply decisions until the run has to wait for outcomes or has ended
    async fn advance(&self, loaded: &mut LoadedRun) -> Result<()> {
        loop {
            let actions = decide(&loaded.run);
            if actions.is_empty() {
                return Ok(());
            }
            for action in actions {
                self.execute(loaded, action).await?;
            }
        }
    }

    async fn execute(&self, loaded: &mut LoadedRun, action: Action) -> Result<()> {
        let run_id = loaded.run.run_id.clone();
        match action {
            Action::StartStage {
                stage,
                planned_tasks,
            } => {
                self.append(loaded, stage, EventPayload::StageStarted { planned_tasks })
                    .await?;
                log_run_operation(
                    "START_STAGE",
                    &run_id,
                    Some(stage),
                    "started",
                    Some(&format!("planned_tasks={planned_tasks}")),
                );
            }
            Action::Dispatch { stage, task } => {
                let invocation =
                    self.dispatcher
                        .first_attempt(&run_id, stage, &task, self.clock.now())?;
                self.append(
                    loaded,
                    stage,
                    EventPayload::TaskDispatched {
                        invocation: invocation.clone(),
                    },
                )
                .await?;
                self.enqueue(&invocation).await?;
                log_task_operation("DISPATCH", &run_id, task.task_id, 1, "dispatched", Some(&invocation.queue_name));
            }
            Action::CompleteStage {
                stage,
                state,
                succeeded,
                failed,
            } => {
                self.append(
                    loaded,
                    stage,
                    EventPayload::StageCompleted {
                        state,
                        succeeded,
                        failed,
                    },
                )
                .await?;
                log_run_operation(
                    "COMPLETE_STAGE",
                    &run_id,
                    Some(stage),
                    &state.to_string(),
                    Some(&format!("succeeded={succeeded} failed={failed}")),
                );
            }
            Action::CompleteRun { state, output } => {
                let files = output.files_processed;
                self.append(loaded, Stage::Aggregate, EventPayload::RunCompleted { state, output })
                    .await?;
                log_run_operation(
                    "COMPLETE_RUN",
                    &run_id,
                    Some(Stage::Aggregate),
                    &state.to_string(),
                    Some(&format!("files_processed={files}")),
                );
            }
            Action::FailRun { stage, reason } => {
                self.append(
                    loaded,
                    stage,
                    EventPayload::RunFailed {
                        stage,
                        reason: reason.clone(),
                    },
                )
                .await?;
                log_run_operation("FAIL_RUN", &run_id, Some(stage), "failed", Some(&reason));
            }
        }
        Ok(())
    }

    /// Apply the event to the cached fold, then persist it under the lease.
    /// A failed write marks the cache stale.
    async fn append(&self, loaded: &mut LoadedRun, stage: Stage, payload: EventPayload) -> Result<()> {
        let run_id = loaded.run.run_id.clone();
        let event = StageEvent::new(
            run_id.clone(),
            loaded.run.next_sequence(),
            stage,
            payload,
            self.clock.now(),
        );
        apply(&mut loaded.run, &event).map_err(|source| PipelineError::Replay {
            run_id: run_id.clone(),
            source,
        })?;

        let lease = &loaded.lease;
        let written = with_infra_retry("append", &self.infra_retry, || {
            self.store.append(lease, &event)
        })
        .await;
        if let Err(e) = written {
            loaded.stale = true;
            return Err(PipelineError::from_store(&run_id, e));
        }

        loaded.since_snapshot += 1;
        if loaded.since_snapshot >= self.snapshot_interval || event.kind.is_terminal() {
            self.snapshot(loaded).await;
        }
        Ok(())
    }

    async fn snapshot(&self, loaded: &mut LoadedRun) {
        let snapshot = RunSnapshot::of(&loaded.run, self.clock.now());
        match self.store.save_snapshot(&snapshot).await {
            Ok(()) => {
                loaded.since_snapshot = 0;
                debug!(run_id = %snapshot.run_id, sequence_no = snapshot.sequence_no, "📸 Snapshot saved");
            }
            Err(e) => warn!(run_id = %snapshot.run_id, error = %e, "Snapshot failed, continuing"),
        }
    }

    /// The deadline is armed first: if the queue stays unreachable, the
    /// attempt times out and the retry goes through the normal path.
    async fn enqueue(&self, invocation: &TaskInvocation) -> Result<()> {
        self.deadlines.track(invocation);
        with_infra_retry("enqueue", &self.infra_retry, || self.queue.enqueue(invocation)).await?;
        Ok(())
    }

    async fn withdraw(&self, invocation_ids: &[String]) {
        if invocation_ids.is_empty() {
            return;
        }
        match self.queue.cancel(invocation_ids).await {
            Ok(removed) => debug!(requested = invocation_ids.len(), removed, "Withdrew pending invocations"),
            Err(e) => warn!(error = %e, "Could not withdraw pending invocations"),
        }
    }

    /// Publish the new status; once the run has ended, drop its deadlines
    async fn finish(&self, loaded: &mut LoadedRun) {
        let status = loaded.run.status();
        if let Some(sender) = self.watchers.get(&status.run_id) {
            sender.send_replace(status.clone());
        }
        if status.is_terminal() {
            self.deadlines.clear_run(&status.run_id);
        }
    }
}

/// The outstanding attempt an outcome refers to, or why it is not one
fn current_attempt(
    run: &PipelineRun,
    task_id: TaskId,
    attempt_number: u32,
) -> std::result::Result<TaskInvocation, IgnoredReason> {
    if run.is_terminal() {
        return Err(IgnoredReason::RunTerminal);
    }
    let progress = run
        .stage(task_id.stage)
        .filter(|progress| {
            run.current_stage == Some(task_id.stage) && !progress.state.is_terminal()
        })
        .ok_or(IgnoredReason::StageClosed)?;
    let member = progress
        .fan_out
        .get(task_id.index)
        .ok_or(IgnoredReason::UnknownTask)?;
    if member.is_terminal() {
        return Err(IgnoredReason::AlreadyTerminal);
    }
    if member.attempt_number != attempt_number {
        return Err(IgnoredReason::AttemptMismatch {
            current: member.attempt_number,
            reported: attempt_number,
        });
    }
    Ok(member.to_invocation(&run.run_id, progress.stage))
}
