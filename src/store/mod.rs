//! # Run State Store
//!
//! Durable home of every run: the immutable [`RunRecord`], the append-only
//! event log, an optional snapshot, and the per-run lease that fences
//! concurrent orchestrators.
//!
//! ## Contract
//!
//! - Events are write-once. `append` succeeds only for
//!   `sequence_no == last + 1`; anything else is a [`StoreError::SequenceConflict`].
//! - `append` also requires the caller's lease to be the current, unexpired
//!   one; a stale token is rejected with [`StoreError::LeaseNotHeld`].
//! - `read_all` returns events in strictly ascending sequence order. After
//!   `compact` it returns only the events the compaction kept.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRunStateStore;
pub use postgres::PgRunStateStore;

use crate::events::StageEvent;
use crate::models::{PipelineRun, RunId, RunRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: RunId },

    #[error("Sequence {sequence_no} for run {run_id} is already taken or out of order")]
    SequenceConflict { run_id: RunId, sequence_no: u64 },

    #[error("Lease for run {run_id} not held by caller (holder: {holder:?})")]
    LeaseNotHeld {
        run_id: RunId,
        holder: Option<String>,
    },

    #[error("Invalid store operation on run {run_id}: {message}")]
    InvalidOperation { run_id: RunId, message: String },

    #[error("Store unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },

    #[error("Store query failed during {operation}: {message}")]
    Query { operation: String, message: String },

    #[error("Stored data could not be decoded: {message}")]
    Serialization { message: String },
}

impl StoreError {
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn invalid_operation(run_id: &RunId, message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            run_id: run_id.clone(),
            message: message.into(),
        }
    }

    /// The store itself could not be reached; the operation may be retried
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Classify a sqlx error raised during `operation`
    pub(crate) fn from_sqlx(operation: &str, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::unavailable(operation, err.to_string())
            }
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("40001") => {
                Self::unavailable(operation, err.to_string())
            }
            other => Self::query(operation, other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of `create_run`; submission is idempotent on the run id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateRunOutcome {
    Created,
    AlreadyExists(RunRecord),
}

/// Exclusive right to append to one run's log until `expires_at`.
///
/// The token changes every time ownership changes hands, so a lease that was
/// taken over cannot be used to append even by the same owner id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub run_id: RunId,
    pub owner: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// New or renewed lease for the caller
    Acquired(RunLease),
    /// Another owner holds an unexpired lease
    HeldBy {
        owner: String,
        expires_at: DateTime<Utc>,
    },
}

/// Folded run state as of `sequence_no`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub sequence_no: u64,
    pub run: PipelineRun,
    pub taken_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn of(run: &PipelineRun, taken_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            sequence_no: run.last_sequence,
            run: run.clone(),
            taken_at,
        }
    }
}

#[async_trait]
pub trait RunStateStore: Send + Sync + fmt::Debug {
    /// Persist a new run record, or report the existing one
    async fn create_run(&self, record: &RunRecord) -> StoreResult<CreateRunOutcome>;

    async fn get_run(&self, run_id: &RunId) -> StoreResult<Option<RunRecord>>;

    /// Records of every run, in creation order
    async fn list_runs(&self) -> StoreResult<Vec<RunRecord>>;

    /// Append one event under `lease`
    async fn append(&self, lease: &RunLease, event: &StageEvent) -> StoreResult<()>;

    async fn read_all(&self, run_id: &RunId) -> StoreResult<Vec<StageEvent>>;

    /// Events with `sequence_no > after`, ascending
    async fn read_after(&self, run_id: &RunId, after: u64) -> StoreResult<Vec<StageEvent>>;

    /// Highest sequence number written, 0 for an empty log
    async fn last_sequence(&self, run_id: &RunId) -> StoreResult<u64>;

    /// Replace the run's snapshot
    async fn save_snapshot(&self, snapshot: &RunSnapshot) -> StoreResult<()>;

    async fn load_snapshot(&self, run_id: &RunId) -> StoreResult<Option<RunSnapshot>>;

    /// Drop events with `sequence_no <= through`. Only allowed once a snapshot
    /// covers them. Returns the number of events removed.
    async fn compact(&self, run_id: &RunId, through: u64) -> StoreResult<u64>;

    /// Take, renew or fail to take the run's lease. The same owner renewing an
    /// unexpired lease keeps its token.
    async fn acquire_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<LeaseOutcome>;

    /// Give the lease up early; a no-op if it already changed hands
    async fn release_lease(&self, lease: &RunLease) -> StoreResult<()>;
}

pub type SharedStore = Arc<dyn RunStateStore>;
