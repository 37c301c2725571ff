//! In-memory task queue for tests and single-process deployments.
//!
//! Visibility windows and delayed availability are judged against an
//! injected [`Clock`](crate::orchestration::clock::Clock), so redelivery can be
//! exercised by advancing a manual clock. Queues are created on first use.

use super::{
    Delivery, DeliveryReceipt, EnqueueResult, MessagingError, MessagingResult, OutcomeMessage,
    TaskQueue,
};
use crate::constants::{queues, system};
use crate::models::TaskInvocation;
use crate::orchestration::clock::{to_chrono, SharedClock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry<T> {
    message_id: u64,
    dedup_key: Option<String>,
    message: T,
    available_at: DateTime<Utc>,
    invisible_until: Option<DateTime<Utc>>,
    delivery_count: u32,
}

#[derive(Debug)]
struct Channel<T> {
    entries: Vec<Entry<T>>,
    keys: HashSet<String>,
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            keys: HashSet::new(),
        }
    }
}

impl<T: Clone> Channel<T> {
    /// Oldest entry that is both available and visible, marked in flight
    fn take(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
        visibility: chrono::Duration,
    ) -> Option<Delivery<T>> {
        let entry = self.entries.iter_mut().find(|entry| {
            entry.available_at <= now && entry.invisible_until.map_or(true, |until| until <= now)
        })?;
        entry.invisible_until = Some(now + visibility);
        entry.delivery_count += 1;
        Some(Delivery {
            receipt: DeliveryReceipt {
                queue_name: queue_name.to_string(),
                message_id: entry.message_id.to_string(),
            },
            message: entry.message.clone(),
            delivery_count: entry.delivery_count,
        })
    }

    fn remove(&mut self, message_id: u64) -> bool {
        let Some(position) = self.entries.iter().position(|e| e.message_id == message_id) else {
            return false;
        };
        let entry = self.entries.remove(position);
        if let Some(key) = entry.dedup_key {
            self.keys.remove(&key);
        }
        true
    }
}

#[derive(Debug)]
pub struct InMemoryTaskQueue {
    tasks: Mutex<HashMap<String, Channel<TaskInvocation>>>,
    outcomes: Mutex<Channel<OutcomeMessage>>,
    results_queue_name: String,
    clock: SharedClock,
    visibility_timeout: Duration,
    poll_interval: Duration,
    next_id: AtomicU64,
    injected_failures: AtomicU32,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(
            Arc::new(SystemClock),
            Duration::from_secs(system::DEFAULT_VISIBILITY_TIMEOUT_SECONDS),
            Duration::from_millis(system::DEFAULT_POLL_INTERVAL_MS),
        )
    }
}

impl InMemoryTaskQueue {
    pub fn new(clock: SharedClock, visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(Channel::default()),
            results_queue_name: queues::RESULTS.to_string(),
            clock,
            visibility_timeout,
            poll_interval,
            next_id: AtomicU64::new(1),
            injected_failures: AtomicU32::new(0),
        }
    }

    pub fn with_results_queue(mut self, name: impl Into<String>) -> Self {
        self.results_queue_name = name.into();
        self
    }

    /// Make the next `count` operations fail as if the backend were unreachable
    pub fn inject_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &str) -> MessagingResult<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(MessagingError::unavailable(operation, "injected failure")),
            Err(_) => Ok(()),
        }
    }

    /// Every invocation still on `queue_name`, in flight or not, FIFO order
    pub fn pending(&self, queue_name: &str) -> Vec<TaskInvocation> {
        self.tasks
            .lock()
            .get(queue_name)
            .map(|channel| channel.entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn depth(&self, queue_name: &str) -> usize {
        self.tasks
            .lock()
            .get(queue_name)
            .map_or(0, |channel| channel.entries.len())
    }

    pub fn outcome_depth(&self) -> usize {
        self.outcomes.lock().entries.len()
    }

    fn parse_id(receipt: &DeliveryReceipt) -> MessagingResult<u64> {
        receipt
            .message_id
            .parse()
            .map_err(|_| MessagingError::unknown_receipt(&receipt.queue_name, &receipt.message_id))
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        if queue_name != self.results_queue_name {
            self.tasks.lock().entry(queue_name.to_string()).or_default();
        }
        Ok(())
    }

    async fn enqueue(&self, invocation: &TaskInvocation) -> MessagingResult<EnqueueResult> {
        self.check_available("enqueue")?;
        let key = invocation.invocation_id();
        let mut tasks = self.tasks.lock();
        let channel = tasks.entry(invocation.queue_name.clone()).or_default();
        if !channel.keys.insert(key.clone()) {
            debug!(invocation_id = %key, "Duplicate enqueue ignored");
            return Ok(EnqueueResult::Deduplicated);
        }
        channel.entries.push(Entry {
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            dedup_key: Some(key),
            message: invocation.clone(),
            available_at: invocation.available_at,
            invisible_until: None,
            delivery_count: 0,
        });
        Ok(EnqueueResult::Enqueued)
    }

    async fn try_dequeue(
        &self,
        queue_name: &str,
    ) -> MessagingResult<Option<Delivery<TaskInvocation>>> {
        self.check_available("dequeue")?;
        let now = self.clock.now();
        let visibility = to_chrono(self.visibility_timeout);
        Ok(self
            .tasks
            .lock()
            .get_mut(queue_name)
            .and_then(|channel| channel.take(queue_name, now, visibility)))
    }

    async fn ack(&self, receipt: &DeliveryReceipt) -> MessagingResult<()> {
        self.check_available("ack")?;
        let message_id = Self::parse_id(receipt)?;
        let removed = if receipt.queue_name == self.results_queue_name {
            self.outcomes.lock().remove(message_id)
        } else {
            self.tasks
                .lock()
                .get_mut(&receipt.queue_name)
                .is_some_and(|channel| channel.remove(message_id))
        };
        if !removed {
            debug!(
                queue = %receipt.queue_name,
                message_id = %receipt.message_id,
                "Ack for a message that is already gone"
            );
        }
        Ok(())
    }

    async fn cancel(&self, invocation_ids: &[String]) -> MessagingResult<usize> {
        self.check_available("cancel")?;
        let wanted: HashSet<&str> = invocation_ids.iter().map(String::as_str).collect();
        let mut removed = 0;
        for channel in self.tasks.lock().values_mut() {
            let before = channel.entries.len();
            channel.entries.retain(|entry| {
                !entry
                    .dedup_key
                    .as_deref()
                    .is_some_and(|key| wanted.contains(key))
            });
            removed += before - channel.entries.len();
            channel.keys.retain(|key| !wanted.contains(key.as_str()));
        }
        Ok(removed)
    }

    async fn is_withdrawn(&self, receipt: &DeliveryReceipt) -> MessagingResult<bool> {
        let message_id = Self::parse_id(receipt)?;
        let present = self
            .tasks
            .lock()
            .get(&receipt.queue_name)
            .is_some_and(|channel| channel.entries.iter().any(|e| e.message_id == message_id));
        Ok(!present)
    }

    async fn publish_outcome(&self, outcome: &OutcomeMessage) -> MessagingResult<()> {
        self.check_available("publish_outcome")?;
        let now = self.clock.now();
        self.outcomes.lock().entries.push(Entry {
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            dedup_key: None,
            message: outcome.clone(),
            available_at: now,
            invisible_until: None,
            delivery_count: 0,
        });
        Ok(())
    }

    async fn try_next_outcome(&self) -> MessagingResult<Option<Delivery<OutcomeMessage>>> {
        self.check_available("next_outcome")?;
        let now = self.clock.now();
        let visibility = to_chrono(self.visibility_timeout);
        Ok(self
            .outcomes
            .lock()
            .take(&self.results_queue_name, now, visibility))
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
