//! In-memory run state store.
//!
//! Single-process only; state is lost when the process exits. Lease expiry
//! is judged against an injected [`Clock`], so tests can expire a lease by
//! advancing a [`ManualClock`](crate::orchestration::clock::ManualClock).

use super::{
    CreateRunOutcome, LeaseOutcome, RunLease, RunSnapshot, RunStateStore, StoreError, StoreResult,
};
use crate::events::StageEvent;
use crate::models::{RunId, RunRecord};
use crate::orchestration::clock::{to_chrono, SharedClock, SystemClock};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug)]
struct RunEntry {
    created_order: u64,
    record: RunRecord,
    events: Vec<StageEvent>,
    /// Highest sequence number removed by compaction
    compacted_through: u64,
    snapshot: Option<RunSnapshot>,
    lease: Option<RunLease>,
}

impl RunEntry {
    fn last_sequence(&self) -> u64 {
        self.events
            .last()
            .map(|event| event.sequence_no)
            .unwrap_or(self.compacted_through)
    }
}

#[derive(Debug)]
pub struct InMemoryRunStateStore {
    runs: DashMap<RunId, Arc<Mutex<RunEntry>>>,
    clock: SharedClock,
    next_order: AtomicU64,
    injected_failures: AtomicU32,
}

impl Default for InMemoryRunStateStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryRunStateStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            runs: DashMap::new(),
            clock,
            next_order: AtomicU64::new(0),
            injected_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` operations fail as if the store were unreachable
    pub fn inject_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &str) -> StoreResult<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::unavailable(operation, "injected failure")),
            Err(_) => Ok(()),
        }
    }

    fn entry(&self, run_id: &RunId) -> StoreResult<Arc<Mutex<RunEntry>>> {
        self.runs
            .get(run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.clone(),
            })
    }
}

#[async_trait]
impl RunStateStore for InMemoryRunStateStore {
    async fn create_run(&self, record: &RunRecord) -> StoreResult<CreateRunOutcome> {
        self.check_available("create_run")?;
        let entry = self.runs.entry(record.run_id.clone());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(existing) => Ok(
                CreateRunOutcome::AlreadyExists(existing.get().lock().record.clone()),
            ),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(RunEntry {
                    created_order: self.next_order.fetch_add(1, Ordering::SeqCst),
                    record: record.clone(),
                    events: Vec::new(),
                    compacted_through: 0,
                    snapshot: None,
                    lease: None,
                })));
                Ok(CreateRunOutcome::Created)
            }
        }
    }

    async fn get_run(&self, run_id: &RunId) -> StoreResult<Option<RunRecord>> {
        self.check_available("get_run")?;
        Ok(self
            .runs
            .get(run_id)
            .map(|entry| entry.value().lock().record.clone()))
    }

    async fn list_runs(&self) -> StoreResult<Vec<RunRecord>> {
        self.check_available("list_runs")?;
        let mut runs: Vec<(u64, RunRecord)> = self
            .runs
            .iter()
            .map(|entry| {
                let entry = entry.value().lock();
                (entry.created_order, entry.record.clone())
            })
            .collect();
        runs.sort_by_key(|(order, _)| *order);
        Ok(runs.into_iter().map(|(_, record)| record).collect())
    }

    async fn append(&self, lease: &RunLease, event: &StageEvent) -> StoreResult<()> {
        self.check_available("append")?;
        if lease.run_id != event.run_id {
            return Err(StoreError::invalid_operation(
                &event.run_id,
                format!("lease belongs to run {}", lease.run_id),
            ));
        }
        let entry = self.entry(&event.run_id)?;
        let mut entry = entry.lock();

        let now = self.clock.now();
        let held = entry
            .lease
            .as_ref()
            .is_some_and(|current| current.token == lease.token && current.is_live_at(now));
        if !held {
            return Err(StoreError::LeaseNotHeld {
                run_id: event.run_id.clone(),
                holder: entry
                    .lease
                    .as_ref()
                    .filter(|current| current.is_live_at(now))
                    .map(|current| current.owner.clone()),
            });
        }

        if event.sequence_no != entry.last_sequence() + 1 {
            return Err(StoreError::SequenceConflict {
                run_id: event.run_id.clone(),
                sequence_no: event.sequence_no,
            });
        }

        entry.events.push(event.clone());
        Ok(())
    }

    async fn read_all(&self, run_id: &RunId) -> StoreResult<Vec<StageEvent>> {
        self.read_after(run_id, 0).await
    }

    async fn read_after(&self, run_id: &RunId, after: u64) -> StoreResult<Vec<StageEvent>> {
        self.check_available("read")?;
        let entry = self.entry(run_id)?;
        let entry = entry.lock();
        Ok(entry
            .events
            .iter()
            .filter(|event| event.sequence_no > after)
            .cloned()
            .collect())
    }

    async fn last_sequence(&self, run_id: &RunId) -> StoreResult<u64> {
        self.check_available("last_sequence")?;
        let entry = self.entry(run_id)?;
        let last = entry.lock().last_sequence();
        Ok(last)
    }

    async fn save_snapshot(&self, snapshot: &RunSnapshot) -> StoreResult<()> {
        self.check_available("save_snapshot")?;
        let entry = self.entry(&snapshot.run_id)?;
        let mut entry = entry.lock();
        if snapshot.sequence_no > entry.last_sequence() {
            return Err(StoreError::invalid_operation(
                &snapshot.run_id,
                format!(
                    "snapshot at {} is ahead of the log at {}",
                    snapshot.sequence_no,
                    entry.last_sequence()
                ),
            ));
        }
        let newer_exists = entry
            .snapshot
            .as_ref()
            .is_some_and(|existing| existing.sequence_no > snapshot.sequence_no);
        if !newer_exists {
            entry.snapshot = Some(snapshot.clone());
        }
        Ok(())
    }

    async fn load_snapshot(&self, run_id: &RunId) -> StoreResult<Option<RunSnapshot>> {
        self.check_available("load_snapshot")?;
        let entry = self.entry(run_id)?;
        let snapshot = entry.lock().snapshot.clone();
        Ok(snapshot)
    }

    async fn compact(&self, run_id: &RunId, through: u64) -> StoreResult<u64> {
        self.check_available("compact")?;
        let entry = self.entry(run_id)?;
        let mut entry = entry.lock();
        let covered = entry
            .snapshot
            .as_ref()
            .is_some_and(|snapshot| snapshot.sequence_no >= through);
        if !covered {
            return Err(StoreError::invalid_operation(
                run_id,
                format!("no snapshot covers sequence {through}"),
            ));
        }
        let before = entry.events.len();
        entry.events.retain(|event| event.sequence_no > through);
        entry.compacted_through = entry.compacted_through.max(through);
        Ok((before - entry.events.len()) as u64)
    }

    async fn acquire_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<LeaseOutcome> {
        self.check_available("acquire_lease")?;
        let entry = self.entry(run_id)?;
        let mut entry = entry.lock();
        let now = self.clock.now();
        let expires_at = now + to_chrono(ttl);

        if let Some(current) = entry.lease.as_mut() {
            if current.is_live_at(now) {
                if current.owner != owner {
                    return Ok(LeaseOutcome::HeldBy {
                        owner: current.owner.clone(),
                        expires_at: current.expires_at,
                    });
                }
                current.expires_at = expires_at;
                return Ok(LeaseOutcome::Acquired(current.clone()));
            }
        }

        let lease = RunLease {
            run_id: run_id.clone(),
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            expires_at,
        };
        entry.lease = Some(lease.clone());
        Ok(LeaseOutcome::Acquired(lease))
    }

    async fn release_lease(&self, lease: &RunLease) -> StoreResult<()> {
        self.check_available("release_lease")?;
        let entry = self.entry(&lease.run_id)?;
        let mut entry = entry.lock();
        if entry
            .lease
            .as_ref()
            .is_some_and(|current| current.token == lease.token)
        {
            entry.lease = None;
        }
        Ok(())
    }
}
