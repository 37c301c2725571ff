//! # Messaging Module
//!
//! At-least-once task queues, one per stage queue name, plus the result
//! channel workers report outcomes on.
//!
//! A dequeued message stays invisible to other consumers for the visibility
//! window. If it is not acknowledged in time it becomes eligible for
//! redelivery, which is how work held by a crashed worker gets picked up
//! again.

pub mod errors;
pub mod memory;
pub mod pgmq_queue;

pub use errors::{MessagingError, MessagingResult};
pub use memory::InMemoryTaskQueue;
pub use pgmq_queue::PgmqTaskQueue;

use crate::models::{RunId, TaskId, TaskInvocation, TaskOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Identifies one delivery, for acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryReceipt {
    pub queue_name: String,
    pub message_id: String,
}

#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub receipt: DeliveryReceipt,
    pub message: T,
    /// 1 on first delivery, higher on redelivery
    pub delivery_count: u32,
}

/// What a worker reports back after running an invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeMessage {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub worker_id: String,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued,
    /// The same invocation id is already queued or in flight
    Deduplicated,
}

#[async_trait]
pub trait TaskQueue: Send + Sync + fmt::Debug {
    /// Create the named queue if it does not exist
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()>;

    /// Queue an invocation on `invocation.queue_name`, not deliverable before
    /// `invocation.available_at`. Enqueueing an invocation id that is still
    /// pending is a no-op.
    async fn enqueue(&self, invocation: &TaskInvocation) -> MessagingResult<EnqueueResult>;

    /// Take the oldest deliverable invocation, if any
    async fn try_dequeue(
        &self,
        queue_name: &str,
    ) -> MessagingResult<Option<Delivery<TaskInvocation>>>;

    /// Wait up to `wait` for an invocation
    async fn dequeue(
        &self,
        queue_name: &str,
        wait: Duration,
    ) -> MessagingResult<Option<Delivery<TaskInvocation>>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_dequeue(queue_name).await? {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Remove a delivered message permanently
    async fn ack(&self, receipt: &DeliveryReceipt) -> MessagingResult<()>;

    /// Withdraw invocations, whether waiting or already delivered. A
    /// withdrawn delivery is never redelivered, and a worker holding one
    /// sees it through [`Self::is_withdrawn`]. Returns how many were removed.
    async fn cancel(&self, invocation_ids: &[String]) -> MessagingResult<usize>;

    /// Whether the message behind a delivery has been withdrawn or acked
    async fn is_withdrawn(&self, receipt: &DeliveryReceipt) -> MessagingResult<bool>;

    /// Drop any local bookkeeping for invocations whose outcome is settled
    fn forget(&self, _invocation_ids: &[String]) {}

    /// Report an outcome on the result channel
    async fn publish_outcome(&self, outcome: &OutcomeMessage) -> MessagingResult<()>;

    async fn try_next_outcome(&self) -> MessagingResult<Option<Delivery<OutcomeMessage>>>;

    /// Wait up to `wait` for an outcome
    async fn next_outcome(&self, wait: Duration) -> MessagingResult<Option<Delivery<OutcomeMessage>>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_next_outcome().await? {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    fn poll_interval(&self) -> Duration;
}

pub type SharedQueue = Arc<dyn TaskQueue>;
