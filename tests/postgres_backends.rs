//! Runs against a real PostgreSQL with the pgmq extension installed.
//! `DATABASE_URL=postgres://... cargo test -- --ignored`

mod common;

use common::*;
use dataflow_core::config::QueueConfig;
use dataflow_core::events::{EventPayload, StageEvent};
use dataflow_core::messaging::{EnqueueResult, PgmqTaskQueue, TaskQueue};
use dataflow_core::models::{PartialFailurePolicy, PipelineInput, RunId, RunRecord, Stage};
use dataflow_core::orchestration::{Orchestrator, SystemClock};
use dataflow_core::state_machine::RunState;
use dataflow_core::store::{CreateRunOutcome, LeaseOutcome, PgRunStateStore, RunStateStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn store() -> PgRunStateStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PgRunStateStore::connect(&url, 5).await.unwrap();
    store.migrate().await.unwrap();
    store
}

fn unique_run() -> RunRecord {
    RunRecord::new(
        RunId::new(format!("test-{}", Uuid::new_v4())),
        PipelineInput { dataset_id: 42 },
        PartialFailurePolicy::Proceed,
        chrono::Utc::now(),
    )
}

fn started(run_id: &RunId, sequence_no: u64) -> StageEvent {
    StageEvent::new(
        run_id.clone(),
        sequence_no,
        Stage::MetadataFetch,
        EventPayload::StageStarted { planned_tasks: 1 },
        chrono::Utc::now(),
    )
}

#[tokio::test]
#[ignore]
async fn test_pg_create_append_and_read() {
    let store = store().await;
    let record = unique_run();

    assert!(matches!(store.create_run(&record).await.unwrap(), CreateRunOutcome::Created));
    assert!(matches!(
        store.create_run(&record).await.unwrap(),
        CreateRunOutcome::AlreadyExists(_)
    ));

    let LeaseOutcome::Acquired(lease) = store
        .acquire_lease(&record.run_id, "orch-a", Duration::from_secs(30))
        .await
        .unwrap()
    else {
        panic!("fresh run should be leasable");
    };

    store.append(&lease, &started(&record.run_id, 1)).await.unwrap();
    let duplicate = store.append(&lease, &started(&record.run_id, 1)).await.unwrap_err();
    assert!(matches!(duplicate, StoreError::SequenceConflict { .. }));

    let events = store.read_all(&record.run_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(store.last_sequence(&record.run_id).await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn test_pg_lease_fences_other_owners() {
    let store = store().await;
    let record = unique_run();
    store.create_run(&record).await.unwrap();

    let LeaseOutcome::Acquired(lease) = store
        .acquire_lease(&record.run_id, "orch-a", Duration::from_secs(30))
        .await
        .unwrap()
    else {
        panic!("fresh run should be leasable");
    };
    let other = store
        .acquire_lease(&record.run_id, "orch-b", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(matches!(other, LeaseOutcome::HeldBy { ref owner, .. } if owner == "orch-a"));

    store.release_lease(&lease).await.unwrap();
    let LeaseOutcome::Acquired(taken) = store
        .acquire_lease(&record.run_id, "orch-b", Duration::from_secs(30))
        .await
        .unwrap()
    else {
        panic!("released lease should be available");
    };
    let stale = store.append(&lease, &started(&record.run_id, 1)).await.unwrap_err();
    assert!(matches!(stale, StoreError::LeaseNotHeld { .. }));
    store.append(&taken, &started(&record.run_id, 1)).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_pgmq_enqueue_dequeue_ack() {
    let store = store().await;
    let config = QueueConfig::default();
    let queue = PgmqTaskQueue::new_with_pool(store.pool().clone(), &config).await;
    let queue_name = format!("test_{}", Uuid::new_v4().simple());
    queue.ensure_queue(&queue_name).await.unwrap();

    let now = chrono::Utc::now();
    let invocation = dataflow_core::models::TaskInvocation {
        run_id: RunId::new(format!("test-{}", Uuid::new_v4())),
        stage: Stage::ProcessItems,
        task_id: dataflow_core::models::TaskId::new(Stage::ProcessItems, 0),
        queue_name: queue_name.clone(),
        input: serde_json::json!({"file": "p/image_0000.jpg"}),
        attempt_number: 1,
        available_at: now,
        deadline: now + chrono::Duration::minutes(30),
        previous_error: None,
    };
    assert_eq!(queue.enqueue(&invocation).await.unwrap(), EnqueueResult::Enqueued);
    assert_eq!(queue.enqueue(&invocation).await.unwrap(), EnqueueResult::Deduplicated);

    let delivery = queue.try_dequeue(&queue_name).await.unwrap().unwrap();
    assert_eq!(delivery.message, invocation);
    queue.ack(&delivery.receipt).await.unwrap();
    assert!(queue.try_dequeue(&queue_name).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_pg_lease_acquisition_under_release_churn() {
    let store = Arc::new(store().await);
    let record = unique_run();
    store.create_run(&record).await.unwrap();

    let contenders: Vec<_> = (0..4)
        .map(|n| {
            let store = Arc::clone(&store);
            let run_id = record.run_id.clone();
            tokio::spawn(async move {
                let owner = format!("orch-{n}");
                for _ in 0..25 {
                    let outcome = store
                        .acquire_lease(&run_id, &owner, Duration::from_secs(30))
                        .await
                        .unwrap();
                    if let LeaseOutcome::Acquired(lease) = outcome {
                        store.release_lease(&lease).await.unwrap();
                    }
                }
            })
        })
        .collect();
    for contender in contenders {
        contender.await.unwrap();
    }
}

#[tokio::test]
#[ignore]
async fn test_pgmq_index_follows_messages_settled_elsewhere() {
    let store = store().await;
    let config = QueueConfig::default();
    let producer = PgmqTaskQueue::new_with_pool(store.pool().clone(), &config).await;
    let consumer = PgmqTaskQueue::new_with_pool(store.pool().clone(), &config).await;
    let queue_name = format!("test_{}", Uuid::new_v4().simple());
    producer.ensure_queue(&queue_name).await.unwrap();

    let now = chrono::Utc::now();
    let invocation = dataflow_core::models::TaskInvocation {
        run_id: RunId::new(format!("test-{}", Uuid::new_v4())),
        stage: Stage::ProcessItems,
        task_id: dataflow_core::models::TaskId::new(Stage::ProcessItems, 0),
        queue_name: queue_name.clone(),
        input: serde_json::json!({"file": "p/image_0000.jpg"}),
        attempt_number: 1,
        available_at: now,
        deadline: now + chrono::Duration::minutes(30),
        previous_error: None,
    };
    assert_eq!(producer.enqueue(&invocation).await.unwrap(), EnqueueResult::Enqueued);

    // acked by another process
    let delivery = consumer.try_dequeue(&queue_name).await.unwrap().unwrap();
    consumer.ack(&delivery.receipt).await.unwrap();
    assert_eq!(producer.tracked_invocations(), 1);
    assert_eq!(producer.enqueue(&invocation).await.unwrap(), EnqueueResult::Enqueued);
    assert_eq!(producer.tracked_invocations(), 1);

    // withdrawn while another process holds it
    let delivery = consumer.try_dequeue(&queue_name).await.unwrap().unwrap();
    assert!(!consumer.is_withdrawn(&delivery.receipt).await.unwrap());
    assert_eq!(producer.cancel(&[invocation.invocation_id()]).await.unwrap(), 1);
    assert!(consumer.is_withdrawn(&delivery.receipt).await.unwrap());
    assert_eq!(producer.tracked_invocations(), 0);

    assert_eq!(producer.enqueue(&invocation).await.unwrap(), EnqueueResult::Enqueued);
    producer.forget(&[invocation.invocation_id()]);
    assert_eq!(producer.tracked_invocations(), 0);
}

#[tokio::test]
#[ignore]
async fn test_pg_pipeline_end_to_end() {
    let store = Arc::new(store().await);
    let mut config = test_config();
    config.queue.visibility_timeout_seconds = 30;
    let queue = Arc::new(PgmqTaskQueue::new_with_pool(store.pool().clone(), &config.queue).await);
    for name in config.queue_names() {
        queue.ensure_queue(&name).await.unwrap();
    }

    let orchestrator = Orchestrator::new(&config, store.clone(), queue.clone(), Arc::new(SystemClock));
    let run_id = RunId::new(format!("test-{}", Uuid::new_v4()));
    orchestrator
        .submit(run_id.clone(), PipelineInput { dataset_id: 42 })
        .await
        .unwrap();

    let registry = standard_registry(3);
    let pools: Vec<_> = registry
        .queue_names()
        .into_iter()
        .map(|name| {
            let handler = registry.get(&name).unwrap();
            dataflow_core::worker::WorkerPool::new(name, handler, queue.clone(), 1)
        })
        .collect();

    for _ in 0..50 {
        for pool in &pools {
            while pool.process_one().await.unwrap() {}
        }
        while let Some(delivery) = queue.try_next_outcome().await.unwrap() {
            let message = &delivery.message;
            orchestrator
                .signal_task_outcome(&message.run_id, message.task_id, message.outcome.clone())
                .await
                .unwrap();
            queue.ack(&delivery.receipt).await.unwrap();
        }
        if orchestrator.get_status(&run_id).await.unwrap().is_terminal() {
            break;
        }
    }

    let status = orchestrator.get_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.output.unwrap().files_processed, 3);
}
