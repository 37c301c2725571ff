//! # Worker Pool
//!
//! Consumers for one queue. Each consumer takes an invocation, runs the
//! queue's handler on it, reports the outcome on the result channel and only
//! then acknowledges the delivery. A consumer that dies before acknowledging
//! leaves the message to reappear after the visibility window. A delivery
//! whose invocation was withdrawn before the handler started is dropped
//! without running it.

use super::handler::SharedHandler;
use crate::messaging::{Delivery, MessagingResult, OutcomeMessage, SharedQueue};
use crate::models::{TaskFailure, TaskInvocation, TaskOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct WorkerPool {
    worker_id: String,
    queue_name: String,
    handler: SharedHandler,
    queue: SharedQueue,
    concurrency: usize,
    poll_wait: Duration,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_id", &self.worker_id)
            .field("queue_name", &self.queue_name)
            .field("handler", &self.handler.handler_name())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        queue_name: impl Into<String>,
        handler: SharedHandler,
        queue: SharedQueue,
        concurrency: usize,
    ) -> Self {
        let queue_name = queue_name.into();
        let poll_wait = queue.poll_interval() * 10;
        Self {
            worker_id: format!("worker-{queue_name}-{}", Uuid::new_v4()),
            queue_name,
            handler,
            queue,
            concurrency: concurrency.max(1),
            poll_wait,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Handle at most one invocation. Returns whether one was available.
    pub async fn process_one(&self) -> MessagingResult<bool> {
        match self.queue.try_dequeue(&self.queue_name).await? {
            Some(delivery) => {
                self.execute(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start `concurrency` consumers that run until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            queue = %self.queue_name,
            concurrency = self.concurrency,
            "🚀 Starting worker pool"
        );
        (0..self.concurrency)
            .map(|consumer| {
                let pool = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.consume(consumer, shutdown).await })
            })
            .collect()
    }

    async fn consume(&self, consumer: usize, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                delivery = self.queue.dequeue(&self.queue_name, self.poll_wait) => delivery,
            };
            match delivery {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.execute(delivery).await {
                        warn!(queue = %self.queue_name, consumer, error = %e, "Delivery left unacknowledged");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(queue = %self.queue_name, consumer, error = %e, "Dequeue failed");
                    tokio::time::sleep(self.queue.poll_interval()).await;
                }
            }
        }
        debug!(queue = %self.queue_name, consumer, "Worker consumer stopped");
    }

    async fn execute(&self, delivery: Delivery<TaskInvocation>) -> MessagingResult<()> {
        let invocation = delivery.message;
        debug!(
            queue = %self.queue_name,
            task_id = %invocation.task_id,
            attempt = invocation.attempt_number,
            delivery_count = delivery.delivery_count,
            "Executing invocation"
        );

        match self.queue.is_withdrawn(&delivery.receipt).await {
            Ok(true) => {
                debug!(
                    queue = %self.queue_name,
                    task_id = %invocation.task_id,
                    attempt = invocation.attempt_number,
                    "Invocation withdrawn before it started"
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                debug!(queue = %self.queue_name, error = %e, "Withdrawal check failed; running anyway");
            }
        }

        let handler = Arc::clone(&self.handler);
        let input = invocation.input.clone();
        let joined = tokio::spawn(async move { handler.handle(input).await }).await;
        let outcome = match joined {
            Ok(Ok(output)) => TaskOutcome::succeeded(invocation.attempt_number, output),
            Ok(Err(e)) => TaskOutcome::failed(invocation.attempt_number, e.into_failure()),
            Err(e) => TaskOutcome::failed(
                invocation.attempt_number,
                TaskFailure::transient(format!("handler panicked: {e}")),
            ),
        };

        self.queue
            .publish_outcome(&OutcomeMessage {
                run_id: invocation.run_id.clone(),
                task_id: invocation.task_id,
                outcome,
                worker_id: self.worker_id.clone(),
                reported_at: Utc::now(),
            })
            .await?;
        self.queue.ack(&delivery.receipt).await
    }
}
