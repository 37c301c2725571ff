//! # PostgreSQL Message Queue backend (pgmq-rs)
//!
//! `enqueue` maps to `send_delay`, `dequeue` to `read` with the configured
//! visibility timeout, and `ack` to `delete`. pgmq queue names only allow
//! `[a-z0-9_]`, so logical names like `cv-queue` are stored as `cv_queue`.
//!
//! De-duplication and cancellation use a process-local index of the
//! invocations this instance enqueued; invocations enqueued by another
//! process are not de-duplicated against. An index entry is dropped when the
//! message is deleted here, when the engine settles the invocation's outcome,
//! or when a re-enqueue finds the message already gone.

use super::{
    Delivery, DeliveryReceipt, EnqueueResult, MessagingError, MessagingResult, OutcomeMessage,
    TaskQueue,
};
use crate::config::QueueConfig;
use crate::models::TaskInvocation;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use pgmq::PGMQueue;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PgmqTaskQueue {
    pgmq: PGMQueue,
    results_queue_name: String,
    visibility_timeout_seconds: i32,
    poll_interval: Duration,
    /// invocation id -> (logical queue, message id)
    pending: DashMap<String, (String, i64)>,
    /// (logical queue, message id) -> invocation id
    by_message: DashMap<(String, i64), String>,
}

impl PgmqTaskQueue {
    /// Create a queue client on an existing connection pool
    pub async fn new_with_pool(pool: sqlx::PgPool, config: &QueueConfig) -> Self {
        info!("🚀 Creating pgmq task queue with shared connection pool");
        let pgmq = PGMQueue::new_with_pool(pool).await;
        Self {
            pgmq,
            results_queue_name: config.results_queue_name.clone(),
            visibility_timeout_seconds: i32::try_from(config.visibility_timeout_seconds)
                .unwrap_or(i32::MAX),
            poll_interval: config.poll_interval(),
            pending: DashMap::new(),
            by_message: DashMap::new(),
        }
    }

    /// pgmq-safe physical name for a logical queue name
    pub fn physical_name(queue_name: &str) -> MessagingResult<String> {
        let name: String = queue_name
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_lowercase() })
            .collect();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(MessagingError::invalid_queue_name(
                queue_name,
                "only letters, digits, '-' and '_' are allowed",
            ));
        }
        Ok(name)
    }

    async fn read_one<T: DeserializeOwned + Serialize + Send>(
        &self,
        queue_name: &str,
    ) -> MessagingResult<Option<Delivery<T>>> {
        let physical = Self::physical_name(queue_name)?;
        let message = self
            .pgmq
            .read::<T>(&physical, Some(self.visibility_timeout_seconds))
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "read", e.to_string()))?;
        Ok(message.map(|message| Delivery {
            receipt: DeliveryReceipt {
                queue_name: queue_name.to_string(),
                message_id: message.msg_id.to_string(),
            },
            delivery_count: u32::try_from(message.read_ct).unwrap_or(0),
            message: message.message,
        }))
    }

    async fn delete(&self, queue_name: &str, message_id: i64) -> MessagingResult<()> {
        let physical = Self::physical_name(queue_name)?;
        self.pgmq
            .delete(&physical, message_id)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "delete", e.to_string()))?;
        self.untrack(queue_name, message_id);
        Ok(())
    }

    fn untrack(&self, queue_name: &str, message_id: i64) {
        if let Some((_, invocation_id)) = self.by_message.remove(&(queue_name.to_string(), message_id))
        {
            self.pending.remove(&invocation_id);
        }
    }

    /// Whether a message is still in its queue table, visible or not
    async fn message_exists(&self, queue_name: &str, message_id: i64) -> MessagingResult<bool> {
        let physical = Self::physical_name(queue_name)?;
        let query = format!("SELECT EXISTS(SELECT 1 FROM pgmq.q_{physical} WHERE msg_id = $1)");
        sqlx::query_scalar::<_, bool>(&query)
            .bind(message_id)
            .fetch_one(&self.pgmq.connection)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "exists", e.to_string()))
    }

    /// Invocations in the local de-duplication index
    pub fn tracked_invocations(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl TaskQueue for PgmqTaskQueue {
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        let physical = Self::physical_name(queue_name)?;
        debug!("📋 Creating queue: {} ({})", queue_name, physical);
        self.pgmq
            .create(&physical)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "create", e.to_string()))?;
        Ok(())
    }

    async fn enqueue(&self, invocation: &TaskInvocation) -> MessagingResult<EnqueueResult> {
        let invocation_id = invocation.invocation_id();
        let tracked = self.pending.get(&invocation_id).map(|entry| entry.value().clone());
        if let Some((tracked_queue, message_id)) = tracked {
            if self.message_exists(&tracked_queue, message_id).await? {
                return Ok(EnqueueResult::Deduplicated);
            }
            debug!(invocation_id = %invocation_id, message_id, "Tracked message is gone; enqueueing again");
            self.untrack(&tracked_queue, message_id);
        }

        let queue_name = invocation.queue_name.as_str();
        let physical = Self::physical_name(queue_name)?;
        let delay = (invocation.available_at - Utc::now())
            .to_std()
            .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
            .unwrap_or(0);

        let message_id = self
            .pgmq
            .send_delay(&physical, invocation, delay)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "send", e.to_string()))?;

        self.pending
            .insert(invocation_id.clone(), (queue_name.to_string(), message_id));
        self.by_message
            .insert((queue_name.to_string(), message_id), invocation_id);
        debug!(queue = queue_name, message_id, delay_seconds = delay, "📤 Invocation enqueued");
        Ok(EnqueueResult::Enqueued)
    }

    async fn try_dequeue(
        &self,
        queue_name: &str,
    ) -> MessagingResult<Option<Delivery<TaskInvocation>>> {
        self.read_one(queue_name).await
    }

    async fn ack(&self, receipt: &DeliveryReceipt) -> MessagingResult<()> {
        let message_id: i64 = receipt.message_id.parse().map_err(|_| {
            MessagingError::unknown_receipt(&receipt.queue_name, &receipt.message_id)
        })?;
        self.delete(&receipt.queue_name, message_id).await
    }

    async fn cancel(&self, invocation_ids: &[String]) -> MessagingResult<usize> {
        let mut removed = 0;
        for invocation_id in invocation_ids {
            let Some((_, (queue_name, message_id))) = self.pending.remove(invocation_id) else {
                continue;
            };
            self.delete(&queue_name, message_id).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn is_withdrawn(&self, receipt: &DeliveryReceipt) -> MessagingResult<bool> {
        let message_id: i64 = receipt.message_id.parse().map_err(|_| {
            MessagingError::unknown_receipt(&receipt.queue_name, &receipt.message_id)
        })?;
        Ok(!self.message_exists(&receipt.queue_name, message_id).await?)
    }

    fn forget(&self, invocation_ids: &[String]) {
        for invocation_id in invocation_ids {
            if let Some((_, (queue_name, message_id))) = self.pending.remove(invocation_id) {
                self.by_message.remove(&(queue_name, message_id));
            }
        }
    }

    async fn publish_outcome(&self, outcome: &OutcomeMessage) -> MessagingResult<()> {
        let physical = Self::physical_name(&self.results_queue_name)?;
        self.pgmq.send(&physical, outcome).await.map_err(|e| {
            MessagingError::queue_operation(&self.results_queue_name, "send", e.to_string())
        })?;
        Ok(())
    }

    async fn try_next_outcome(&self) -> MessagingResult<Option<Delivery<OutcomeMessage>>> {
        self.read_one(&self.results_queue_name).await
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
