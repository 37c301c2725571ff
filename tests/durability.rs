mod common;

use common::*;
use dataflow_core::constants::queues;
use dataflow_core::messaging::TaskQueue;
use dataflow_core::models::{Stage, TaskId, TaskOutcome};
use dataflow_core::orchestration::{IgnoredReason, SignalResult};
use dataflow_core::state_machine::{replay, replay_from, RunState};
use dataflow_core::store::RunStateStore;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn test_sequential_resubmission_creates_one_run() {
    let harness = Harness::new(standard_registry(4));
    let first = harness.orchestrator.submit_dataset(42).await.unwrap();
    let second = harness.orchestrator.submit_dataset(42).await.unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.run_id, second.run_id);

    harness.drive().await;
    let third = harness.orchestrator.submit_dataset(42).await.unwrap();
    assert!(!third.created);

    assert_eq!(harness.store.list_runs().await.unwrap().len(), 1);
    let status = harness.orchestrator.get_status(&first.run_id).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(
        harness
            .dispatched_attempts(&first.run_id, TaskId::new(Stage::ProcessItems, 0))
            .await,
        vec![1]
    );
}

#[tokio::test]
async fn test_concurrent_submission_creates_one_run() {
    let harness = Harness::new(standard_registry(4));
    let replica = harness.replica("orch-b");

    let (a, b, c) = tokio::join!(
        harness.orchestrator.submit_dataset(42),
        harness.orchestrator.submit_dataset(42),
        replica.submit_dataset(42),
    );
    let created = [&a, &b, &c]
        .iter()
        .filter(|result| matches!(result, Ok(handle) if handle.created))
        .count();
    assert_eq!(created, 1);
    // the replica either saw the run or lost the lease race
    assert!(c.is_ok() || c.as_ref().is_err_and(|e| e.is_lease_conflict()));

    assert_eq!(harness.queue.depth(queues::METADATA), 1);
    harness.drive().await;

    let run_id = a.unwrap().run_id;
    assert_eq!(
        harness.orchestrator.get_status(&run_id).await.unwrap().state,
        RunState::Completed
    );
    assert_eq!(
        harness
            .dispatched_attempts(&run_id, TaskId::new(Stage::MetadataFetch, 0))
            .await,
        vec![1]
    );
}

#[tokio::test]
async fn test_restart_mid_fan_out_resumes_to_the_same_output() {
    // uninterrupted reference run
    let reference = Harness::new(standard_registry(20));
    let reference_id = reference.orchestrator.submit_dataset(42).await.unwrap().run_id;
    reference.drive().await;
    let expected = reference
        .orchestrator
        .get_status(&reference_id)
        .await
        .unwrap()
        .output
        .unwrap();

    let harness = Harness::new(standard_registry(20));
    let run_id = harness.orchestrator.submit_dataset(42).await.unwrap().run_id;

    // metadata and enumeration
    for _ in 0..2 {
        harness.run_workers().await;
        let outcomes = harness.take_outcomes().await;
        harness.deliver(&harness.orchestrator, outcomes).await;
    }
    assert_eq!(harness.queue.depth(queues::CV), 20);

    // half the CV fan-out finishes, then the orchestrator dies with ten
    // outcomes still unread on the result channel
    let cv_pool = dataflow_core::worker::WorkerPool::new(
        queues::CV,
        cv_handler(),
        harness.queue.clone(),
        1,
    );
    for _ in 0..15 {
        assert!(cv_pool.process_one().await.unwrap());
    }
    let mut outcomes = harness.take_outcomes().await;
    let unread = outcomes.split_off(5);
    harness.deliver(&harness.orchestrator, outcomes).await;
    drop(unread);

    let before_crash = harness.events(&run_id).await.len();

    // a replacement picks the run up once the lease lapses
    harness.advance(harness.config.store.lease_duration() + Duration::from_secs(1));
    let replacement = harness.replica("orch-b");
    let recovered = replacement.recover_all().await.unwrap();
    assert_eq!(recovered, vec![run_id.clone()]);

    // unacknowledged outcomes come back after the visibility window
    harness.advance(harness.config.queue.visibility_timeout() + Duration::from_secs(1));
    harness.drive_with(&replacement).await;

    let status = replacement.get_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.output.unwrap(), expected);

    // nothing that finished before the crash was dispatched again
    let events = harness.events(&run_id).await;
    let mut dispatches: HashMap<TaskId, usize> = HashMap::new();
    for event in &events[before_crash..] {
        if let dataflow_core::EventPayload::TaskDispatched { invocation } = &event.payload {
            *dispatches.entry(invocation.task_id).or_default() += 1;
        }
    }
    for index in 0..5 {
        assert!(!dispatches.contains_key(&TaskId::new(Stage::ProcessItems, index)));
    }
    assert!(dispatches
        .keys()
        .all(|task_id| task_id.stage != Stage::MetadataFetch));
}

#[tokio::test]
async fn test_lease_held_by_a_live_replica_blocks_others() {
    let harness = Harness::new(standard_registry(2));
    let run_id = harness.orchestrator.submit_dataset(1).await.unwrap().run_id;
    let replica = harness.replica("orch-b");

    let err = replica.recover(&run_id).await.unwrap_err();
    assert!(err.is_lease_conflict());
    assert!(replica.recover_all().await.unwrap().is_empty());

    // reads need no lease
    let status = replica.get_status(&run_id).await.unwrap();
    assert_eq!(status.current_stage, Some(Stage::MetadataFetch));

    harness.drive().await;
    assert_eq!(
        harness.orchestrator.get_status(&run_id).await.unwrap().state,
        RunState::Completed
    );
}

#[tokio::test]
async fn test_snapshots_fold_to_the_same_state_as_the_full_log() {
    let mut config = test_config();
    config.store.snapshot_interval_events = 3;
    let harness = Harness::with_config(config, standard_registry(6));
    let run_id = harness.orchestrator.submit_dataset(8).await.unwrap().run_id;
    harness.drive().await;

    let record = harness.store.get_run(&run_id).await.unwrap().unwrap();
    let events = harness.events(&run_id).await;
    let full = replay(&record, &events).unwrap();

    let snapshot = harness.store.load_snapshot(&run_id).await.unwrap().unwrap();
    let tail = harness
        .store
        .read_after(&run_id, snapshot.run.last_sequence)
        .await
        .unwrap();
    let from_snapshot = replay_from(snapshot.run, &tail).unwrap();
    assert_eq!(from_snapshot, full);

    // and from any cut point of the log
    for cut in 0..events.len() {
        let prefix = replay(&record, &events[..cut]).unwrap();
        assert_eq!(replay_from(prefix, &events[cut..]).unwrap(), full);
    }

    // a fresh orchestrator reading snapshot + tail reports the same status
    let reader = harness.replica("orch-reader");
    assert_eq!(reader.get_status(&run_id).await.unwrap(), full.status());
}

#[tokio::test]
async fn test_compacted_log_still_resumes() {
    let mut config = test_config();
    config.store.snapshot_interval_events = 4;
    let harness = Harness::with_config(config, standard_registry(6));
    let run_id = harness.orchestrator.submit_dataset(8).await.unwrap().run_id;

    for _ in 0..2 {
        harness.run_workers().await;
        let outcomes = harness.take_outcomes().await;
        harness.deliver(&harness.orchestrator, outcomes).await;
    }

    let snapshot = harness.store.load_snapshot(&run_id).await.unwrap().unwrap();
    let removed = harness
        .store
        .compact(&run_id, snapshot.sequence_no)
        .await
        .unwrap();
    assert!(removed > 0);

    harness.advance(harness.config.store.lease_duration() + Duration::from_secs(1));
    let replacement = harness.replica("orch-b");
    replacement.recover(&run_id).await.unwrap();
    harness.drive_with(&replacement).await;

    let status = replacement.get_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.output.unwrap().files_processed, 6);
}

#[tokio::test]
async fn test_timeout_retries_and_late_outcome_is_ignored() {
    let harness = Harness::new(standard_registry(1));
    let run_id = harness.orchestrator.submit_dataset(5).await.unwrap().run_id;

    // a worker picks the task up and goes silent
    let delivery = harness
        .queue
        .try_dequeue(queues::METADATA)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.message.attempt_number, 1);

    harness.advance(harness.config.stages.metadata_fetch.timeout() + Duration::from_secs(1));
    assert_eq!(harness.orchestrator.handle_timeouts().await, 1);
    assert_eq!(
        harness
            .dispatched_attempts(&run_id, TaskId::new(Stage::MetadataFetch, 0))
            .await,
        vec![1, 2]
    );

    // the first attempt finally answers
    let late = harness
        .orchestrator
        .signal_task_outcome(
            &run_id,
            delivery.message.task_id,
            TaskOutcome::succeeded(1, json!({"s3_bucket": "b", "s3_prefix": "p/"})),
        )
        .await
        .unwrap();
    assert_eq!(
        late,
        SignalResult::Ignored(IgnoredReason::AttemptMismatch {
            current: 2,
            reported: 1
        })
    );

    harness.drive().await;
    let status = harness.orchestrator.get_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.output.unwrap().files_processed, 1);
}

#[tokio::test]
async fn test_timeouts_exhaust_attempts() {
    let harness = Harness::new(standard_registry(1));
    let run_id = harness.orchestrator.submit_dataset(5).await.unwrap().run_id;
    let timeout = harness.config.stages.metadata_fetch.timeout() + Duration::from_secs(1);

    for _ in 0..harness.config.stages.metadata_fetch.max_attempts {
        harness.advance(timeout);
        assert_eq!(harness.orchestrator.handle_timeouts().await, 1);
    }

    let status = harness.orchestrator.get_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Failed);
    let failure = status.failure.unwrap();
    assert_eq!(failure.stage, Stage::MetadataFetch);
    assert!(harness.orchestrator.deadlines().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_ignores_later_outcomes() {
    let harness = Harness::new(standard_registry(4));
    let run_id = harness.orchestrator.submit_dataset(2).await.unwrap().run_id;

    for _ in 0..2 {
        harness.run_workers().await;
        let outcomes = harness.take_outcomes().await;
        harness.deliver(&harness.orchestrator, outcomes).await;
    }
    assert_eq!(harness.queue.depth(queues::CV), 4);

    // one CV task is already with a worker when the run is cancelled
    let in_flight = harness.queue.try_dequeue(queues::CV).await.unwrap().unwrap();
    assert!(harness.orchestrator.cancel(&run_id, "dataset withdrawn").await.unwrap());
    assert_eq!(harness.queue.depth(queues::CV), 0);
    assert!(harness.queue.is_withdrawn(&in_flight.receipt).await.unwrap());

    // nothing comes back once the visibility window lapses
    harness.advance(Duration::from_secs(3601));
    assert_eq!(harness.run_workers().await, 0);
    assert_eq!(harness.queue.outcome_depth(), 0);

    let late = harness
        .orchestrator
        .signal_task_outcome(
            &run_id,
            in_flight.message.task_id,
            TaskOutcome::succeeded(1, serde_json::to_value(cv_result(&file_name(0))).unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(late, SignalResult::Ignored(IgnoredReason::RunTerminal));

    let status = harness.orchestrator.get_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Cancelled);
    assert_eq!(status.cancellation.as_deref(), Some("dataset withdrawn"));
    assert!(status.output.is_none());
}

#[tokio::test]
async fn test_store_outage_is_retried_transparently() {
    let harness = Harness::new(standard_registry(3));
    harness.store.inject_failures(2);
    harness.queue.inject_failures(1);
    let run_id = harness.orchestrator.submit_dataset(4).await.unwrap().run_id;
    assert_eq!(harness.queue.depth(queues::METADATA), 1);

    harness.drive().await;

    let status = harness.orchestrator.get_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
}
