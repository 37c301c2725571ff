//! In-flight deadline tracking.
//!
//! The engine arms one deadline per dispatched attempt and clears it when an
//! outcome is recorded. A periodic tick collects the expired ones and feeds
//! them back as `TimedOut` outcomes.

use crate::models::{InvocationKey, RunId, TaskId, TaskInvocation};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct Inner {
    /// Ordered by deadline so expiry scans stop early
    by_deadline: BTreeSet<(DateTime<Utc>, InvocationKey)>,
    by_task: HashMap<(RunId, TaskId), (DateTime<Utc>, InvocationKey)>,
}

#[derive(Debug, Default)]
pub struct DeadlineTracker {
    inner: Mutex<Inner>,
}

impl DeadlineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the deadline for an attempt, replacing any earlier attempt of the
    /// same task
    pub fn track(&self, invocation: &TaskInvocation) {
        let key = invocation.key();
        let mut inner = self.inner.lock();
        if let Some(previous) = inner
            .by_task
            .insert((key.run_id.clone(), key.task_id), (invocation.deadline, key.clone()))
        {
            inner.by_deadline.remove(&previous);
        }
        inner.by_deadline.insert((invocation.deadline, key));
    }

    /// Put back an attempt taken by [`Self::expired`] whose timeout could not
    /// be recorded. A newer deadline for the same task wins.
    pub fn rearm(&self, key: InvocationKey, deadline: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let task = (key.run_id.clone(), key.task_id);
        if inner.by_task.contains_key(&task) {
            return;
        }
        inner.by_task.insert(task, (deadline, key.clone()));
        inner.by_deadline.insert((deadline, key));
    }

    pub fn clear(&self, run_id: &RunId, task_id: TaskId) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.by_task.remove(&(run_id.clone(), task_id)) {
            inner.by_deadline.remove(&previous);
        }
    }

    pub fn clear_run(&self, run_id: &RunId) {
        let mut inner = self.inner.lock();
        let Inner {
            by_deadline,
            by_task,
        } = &mut *inner;
        by_task.retain(|(run, _), entry| {
            if run == run_id {
                by_deadline.remove(entry);
                false
            } else {
                true
            }
        });
    }

    /// Remove and return every attempt whose deadline is at or before `now`,
    /// earliest first
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<InvocationKey> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        while let Some(first) = inner.by_deadline.first().cloned() {
            if first.0 > now {
                break;
            }
            inner.by_deadline.remove(&first);
            inner.by_task.remove(&(first.1.run_id.clone(), first.1.task_id));
            expired.push(first.1);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_deadline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn invocation(run: i64, index: u32, attempt: u32, deadline_secs: i64) -> TaskInvocation {
        TaskInvocation {
            run_id: RunId::for_dataset(run),
            stage: Stage::ProcessItems,
            task_id: TaskId::new(Stage::ProcessItems, index),
            queue_name: "cv-queue".to_string(),
            input: json!(null),
            attempt_number: attempt,
            available_at: t0(),
            deadline: t0() + Duration::seconds(deadline_secs),
            previous_error: None,
        }
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let tracker = DeadlineTracker::new();
        tracker.track(&invocation(1, 0, 1, 30));
        tracker.track(&invocation(1, 1, 1, 10));
        tracker.track(&invocation(1, 2, 1, 60));

        let expired = tracker.expired(t0() + Duration::seconds(30));
        let indexes: Vec<u32> = expired.iter().map(|k| k.task_id.index).collect();
        assert_eq!(indexes, vec![1, 0]);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.expired(t0() + Duration::seconds(30)).is_empty());
    }

    #[test]
    fn test_retry_replaces_previous_attempt() {
        let tracker = DeadlineTracker::new();
        tracker.track(&invocation(1, 0, 1, 10));
        tracker.track(&invocation(1, 0, 2, 100));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.expired(t0() + Duration::seconds(50)).is_empty());
        let expired = tracker.expired(t0() + Duration::seconds(100));
        assert_eq!(expired[0].attempt_number, 2);
    }

    #[test]
    fn test_rearm_restores_expired_attempt() {
        let tracker = DeadlineTracker::new();
        tracker.track(&invocation(1, 0, 1, 10));
        let expired = tracker.expired(t0() + Duration::seconds(10));
        assert!(tracker.is_empty());

        tracker.rearm(expired[0].clone(), t0() + Duration::seconds(10));
        assert_eq!(tracker.len(), 1);
        let again = tracker.expired(t0() + Duration::seconds(10));
        assert_eq!(again, expired);
    }

    #[test]
    fn test_rearm_never_replaces_a_newer_attempt() {
        let tracker = DeadlineTracker::new();
        tracker.track(&invocation(1, 0, 1, 10));
        let expired = tracker.expired(t0() + Duration::seconds(10));
        tracker.track(&invocation(1, 0, 2, 100));

        tracker.rearm(expired[0].clone(), t0() + Duration::seconds(10));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.expired(t0() + Duration::seconds(50)).is_empty());
        assert_eq!(
            tracker.expired(t0() + Duration::seconds(100))[0].attempt_number,
            2
        );
    }

    #[test]
    fn test_clear_and_clear_run() {
        let tracker = DeadlineTracker::new();
        tracker.track(&invocation(1, 0, 1, 10));
        tracker.track(&invocation(1, 1, 1, 10));
        tracker.track(&invocation(2, 0, 1, 10));

        tracker.clear(&RunId::for_dataset(1), TaskId::new(Stage::ProcessItems, 0));
        assert_eq!(tracker.len(), 2);

        tracker.clear_run(&RunId::for_dataset(1));
        let expired = tracker.expired(t0() + Duration::seconds(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].run_id, RunId::for_dataset(2));
    }
}
