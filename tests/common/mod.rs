//! Shared harness for the integration tests: in-memory backends on a manual
//! clock, stub stage handlers, and a synchronous driver that pumps workers
//! and outcomes until the system goes quiet.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use dataflow_core::config::{BackoffConfig, BackoffStrategy, PipelineConfig};
use dataflow_core::constants::queues;
use dataflow_core::events::{EventKind, EventPayload, StageEvent};
use dataflow_core::messaging::{Delivery, InMemoryTaskQueue, OutcomeMessage, TaskQueue};
use dataflow_core::models::{
    CvResult, DatasetInfo, ListFilesRequest, MlResult, PartialFailurePolicy, PipelineInput,
    ProcessFileRequest, AnalyzeRequest, RunId, TaskId,
};
use dataflow_core::orchestration::{ManualClock, Orchestrator};
use dataflow_core::store::{InMemoryRunStateStore, RunStateStore};
use dataflow_core::worker::{typed_handler, HandlerError, HandlerRegistry, SharedHandler, WorkerPool};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub const BUCKET: &str = "b";
pub const PREFIX: &str = "p/";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Defaults with immediate retries, so no clock movement is needed between
/// attempts
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.backoff = BackoffConfig {
        strategy: BackoffStrategy::Fixed,
        initial_delay_ms: 0,
        multiplier: 1.0,
        max_delay_ms: 0,
        jitter_fraction: 0.0,
    };
    config.queue.visibility_timeout_seconds = 3600;
    config.queue.poll_interval_ms = 5;
    config.engine.status_poll_interval_ms = 10;
    config
}

pub fn file_name(index: usize) -> String {
    format!("{PREFIX}image_{index:04}.jpg")
}

pub fn metadata_handler() -> SharedHandler {
    Arc::new(typed_handler(|input: PipelineInput| async move {
        Ok::<_, HandlerError>(DatasetInfo {
            dataset_id: Some(input.dataset_id),
            name: Some(format!("dataset {}", input.dataset_id)),
            s3_bucket: BUCKET.to_string(),
            s3_prefix: PREFIX.to_string(),
            description: None,
        })
    }))
}

pub fn storage_handler(file_count: usize) -> SharedHandler {
    Arc::new(typed_handler(move |request: ListFilesRequest| async move {
        assert_eq!(request.s3_bucket, BUCKET);
        Ok::<_, HandlerError>((0..file_count).map(file_name).collect::<Vec<String>>())
    }))
}

pub fn cv_result(file: &str) -> CvResult {
    CvResult {
        file: file.to_string(),
        detections: (file.len() % 7) as u32,
        features: vec![0.25, 0.5],
        confidence: 0.9,
        processing_time_secs: None,
    }
}

pub fn cv_handler() -> SharedHandler {
    cv_handler_failing(HashSet::new())
}

/// CV handler that fails permanently for the given files
pub fn cv_handler_failing(failing: HashSet<String>) -> SharedHandler {
    Arc::new(typed_handler(move |request: ProcessFileRequest| {
        let fail = failing.contains(&request.file);
        async move {
            if fail {
                return Err(HandlerError::permanent(format!("corrupt image {}", request.file)));
            }
            Ok(cv_result(&request.file))
        }
    }))
}

pub fn ml_handler() -> SharedHandler {
    Arc::new(typed_handler(|request: AnalyzeRequest| async move {
        Ok::<_, HandlerError>(MlResult {
            file: request.cv_result.file.clone(),
            predicted_class: if request.cv_result.detections > 2 {
                "busy".to_string()
            } else {
                "sparse".to_string()
            },
            confidence: 0.8,
            model_version: "v1".to_string(),
            cv_confidence: Some(request.cv_result.confidence),
        })
    }))
}

/// Handlers for every stage queue, all succeeding
pub fn standard_registry(file_count: usize) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_shared(queues::METADATA, metadata_handler());
    registry.register_shared(queues::STORAGE, storage_handler(file_count));
    registry.register_shared(queues::CV, cv_handler());
    registry.register_shared(queues::ML, ml_handler());
    registry
}

pub struct Harness {
    pub config: PipelineConfig,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryRunStateStore>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub orchestrator: Arc<Orchestrator>,
    pools: Vec<WorkerPool>,
}

impl Harness {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_config(test_config(), registry)
    }

    pub fn with_policy(policy: PartialFailurePolicy, registry: HandlerRegistry) -> Self {
        let mut config = test_config();
        config.policy.partial_failure = policy;
        Self::with_config(config, registry)
    }

    pub fn with_config(config: PipelineConfig, registry: HandlerRegistry) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(InMemoryRunStateStore::new(clock.clone()));
        let queue = Arc::new(InMemoryTaskQueue::new(
            clock.clone(),
            config.queue.visibility_timeout(),
            config.queue.poll_interval(),
        ));
        let orchestrator = Arc::new(
            Orchestrator::new(&config, store.clone(), queue.clone(), clock.clone())
                .with_owner_id("orch-a"),
        );
        let mut harness = Self {
            config,
            clock,
            store,
            queue,
            orchestrator,
            pools: Vec::new(),
        };
        harness.set_registry(registry);
        harness
    }

    pub fn set_registry(&mut self, registry: HandlerRegistry) {
        self.pools = registry
            .queue_names()
            .into_iter()
            .filter_map(|name| {
                let handler = registry.get(&name)?;
                Some(WorkerPool::new(name, handler, self.queue.clone(), 1))
            })
            .collect();
    }

    /// A second orchestrator over the same store and queue
    pub fn replica(&self, owner_id: &str) -> Arc<Orchestrator> {
        Arc::new(
            Orchestrator::new(
                &self.config,
                self.store.clone(),
                self.queue.clone(),
                self.clock.clone(),
            )
            .with_owner_id(owner_id),
        )
    }

    /// Run every available invocation through its handler; returns how many
    pub async fn run_workers(&self) -> usize {
        let mut handled = 0;
        for pool in &self.pools {
            while pool.process_one().await.unwrap() {
                handled += 1;
            }
        }
        handled
    }

    /// Every outcome currently on the result channel, unacknowledged
    pub async fn take_outcomes(&self) -> Vec<Delivery<OutcomeMessage>> {
        let mut outcomes = Vec::new();
        while let Some(delivery) = self.queue.try_next_outcome().await.unwrap() {
            outcomes.push(delivery);
        }
        outcomes
    }

    /// Record outcomes with `orchestrator` and acknowledge them
    pub async fn deliver(&self, orchestrator: &Orchestrator, outcomes: Vec<Delivery<OutcomeMessage>>) {
        for delivery in outcomes {
            let message = &delivery.message;
            orchestrator
                .signal_task_outcome(&message.run_id, message.task_id, message.outcome.clone())
                .await
                .unwrap();
            self.queue.ack(&delivery.receipt).await.unwrap();
        }
    }

    /// Alternate workers and outcome delivery until neither has anything to do
    pub async fn drive(&self) {
        self.drive_with(&self.orchestrator).await;
    }

    pub async fn drive_with(&self, orchestrator: &Orchestrator) {
        for _ in 0..10_000 {
            let handled = self.run_workers().await;
            let outcomes = self.take_outcomes().await;
            if handled == 0 && outcomes.is_empty() {
                return;
            }
            self.deliver(orchestrator, outcomes).await;
        }
        panic!("pipeline did not settle");
    }

    pub async fn events(&self, run_id: &RunId) -> Vec<StageEvent> {
        self.store.read_all(run_id).await.unwrap()
    }

    /// Dispatch events recorded for one task, attempt numbers in log order
    pub async fn dispatched_attempts(&self, run_id: &RunId, task_id: TaskId) -> Vec<u32> {
        self.events(run_id)
            .await
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::TaskDispatched { invocation } if invocation.task_id == task_id => {
                    Some(invocation.attempt_number)
                }
                _ => None,
            })
            .collect()
    }

    pub async fn count_kind(&self, run_id: &RunId, kind: EventKind) -> usize {
        self.events(run_id)
            .await
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }

    pub fn advance(&self, by: Duration) {
        self.clock
            .advance(chrono::Duration::from_std(by).unwrap());
    }
}
