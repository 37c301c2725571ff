//! PostgreSQL-backed run state store.
//!
//! The events table's primary key `(run_id, sequence_no)` makes every
//! sequence number write-once, and appends run in a transaction that locks
//! the run's lease row, so a stale lease holder can never interleave with the
//! current one. Lease expiry is judged by the database clock.

use super::{
    CreateRunOutcome, LeaseOutcome, RunLease, RunSnapshot, RunStateStore, StoreError, StoreResult,
};
use crate::events::StageEvent;
use crate::models::{PartialFailurePolicy, PipelineInput, RunId, RunRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    run_id TEXT PRIMARY KEY,
    dataset_id BIGINT NOT NULL,
    partial_failure TEXT NOT NULL,
    compacted_through BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    created_order BIGSERIAL
);

CREATE TABLE IF NOT EXISTS pipeline_run_events (
    run_id TEXT NOT NULL REFERENCES pipeline_runs (run_id),
    sequence_no BIGINT NOT NULL,
    stage TEXT NOT NULL,
    kind TEXT NOT NULL,
    event JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (run_id, sequence_no)
);

CREATE TABLE IF NOT EXISTS pipeline_run_snapshots (
    run_id TEXT PRIMARY KEY REFERENCES pipeline_runs (run_id),
    sequence_no BIGINT NOT NULL,
    run JSONB NOT NULL,
    taken_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_run_leases (
    run_id TEXT PRIMARY KEY REFERENCES pipeline_runs (run_id),
    owner TEXT NOT NULL,
    token UUID NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
"#;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
/// Upsert-then-read rounds before lease contention is reported
const LEASE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct PgRunStateStore {
    pool: PgPool,
}

impl PgRunStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        info!("🚀 Connecting run state store to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::from_sqlx("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the store's tables if they do not exist
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("migrate", e))?;
        debug!("✅ Run state store schema ready");
        Ok(())
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<RunRecord> {
        let get_err = |e: sqlx::Error| StoreError::from_sqlx("decode run", e);
        let policy: String = row.try_get("partial_failure").map_err(get_err)?;
        let partial_failure = policy
            .parse::<PartialFailurePolicy>()
            .map_err(|message| StoreError::Serialization { message })?;
        Ok(RunRecord {
            run_id: RunId::new(row.try_get::<String, _>("run_id").map_err(get_err)?),
            input: PipelineInput {
                dataset_id: row.try_get("dataset_id").map_err(get_err)?,
            },
            partial_failure,
            created_at: row.try_get("created_at").map_err(get_err)?,
        })
    }

    fn decode_events(rows: Vec<sqlx::postgres::PgRow>) -> StoreResult<Vec<StageEvent>> {
        rows.into_iter()
            .map(|row| {
                let value: serde_json::Value = row
                    .try_get("event")
                    .map_err(|e| StoreError::from_sqlx("decode event", e))?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    /// One upsert-then-read round. `None` means the lease was released or
    /// expired between the two statements.
    async fn try_acquire_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Option<LeaseOutcome>> {
        let sql_err = |e: sqlx::Error| StoreError::from_sqlx("acquire_lease", e);
        let acquired = sqlx::query(
            "INSERT INTO pipeline_run_leases (run_id, owner, token, expires_at)
             VALUES ($1, $2, $3, now() + $4::double precision * interval '1 millisecond')
             ON CONFLICT (run_id) DO UPDATE
             SET token = CASE
                     WHEN pipeline_run_leases.owner = EXCLUDED.owner
                          AND pipeline_run_leases.expires_at > now()
                     THEN pipeline_run_leases.token
                     ELSE EXCLUDED.token
                 END,
                 owner = EXCLUDED.owner,
                 expires_at = EXCLUDED.expires_at
             WHERE pipeline_run_leases.expires_at <= now()
                OR pipeline_run_leases.owner = EXCLUDED.owner
             RETURNING owner, token, expires_at",
        )
        .bind(run_id.as_str())
        .bind(owner)
        .bind(Uuid::new_v4())
        .bind(ttl.as_millis() as f64)
        .fetch_optional(&self.pool)
        .await;

        let acquired = match acquired {
            Err(e) if is_db_error(&e, FOREIGN_KEY_VIOLATION) => {
                return Err(StoreError::RunNotFound {
                    run_id: run_id.clone(),
                })
            }
            other => other.map_err(sql_err)?,
        };

        if let Some(row) = acquired {
            return Ok(Some(LeaseOutcome::Acquired(RunLease {
                run_id: run_id.clone(),
                owner: row.try_get("owner").map_err(sql_err)?,
                token: row.try_get("token").map_err(sql_err)?,
                expires_at: row.try_get("expires_at").map_err(sql_err)?,
            })));
        }

        let holder = sqlx::query(
            "SELECT owner, expires_at FROM pipeline_run_leases
             WHERE run_id = $1 AND expires_at > now()",
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;
        match holder {
            Some(row) => Ok(Some(LeaseOutcome::HeldBy {
                owner: row.try_get("owner").map_err(sql_err)?,
                expires_at: row.try_get("expires_at").map_err(sql_err)?,
            })),
            None => {
                debug!(run_id = %run_id, "Lease changed hands during acquisition; retrying");
                Ok(None)
            }
        }
    }
}

fn to_i64(run_id: &RunId, value: u64) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::invalid_operation(run_id, format!("sequence {value} out of range")))
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn is_db_error(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}

#[async_trait]
impl RunStateStore for PgRunStateStore {
    async fn create_run(&self, record: &RunRecord) -> StoreResult<CreateRunOutcome> {
        let inserted = sqlx::query(
            "INSERT INTO pipeline_runs (run_id, dataset_id, partial_failure, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(record.run_id.as_str())
        .bind(record.input.dataset_id)
        .bind(record.partial_failure.to_string())
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("create_run", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(CreateRunOutcome::Created);
        }
        let existing = self
            .get_run(&record.run_id)
            .await?
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: record.run_id.clone(),
            })?;
        Ok(CreateRunOutcome::AlreadyExists(existing))
    }

    async fn get_run(&self, run_id: &RunId) -> StoreResult<Option<RunRecord>> {
        let row = sqlx::query(
            "SELECT run_id, dataset_id, partial_failure, created_at
             FROM pipeline_runs WHERE run_id = $1",
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("get_run", e))?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn list_runs(&self) -> StoreResult<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT run_id, dataset_id, partial_failure, created_at
             FROM pipeline_runs ORDER BY created_order",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("list_runs", e))?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn append(&self, lease: &RunLease, event: &StageEvent) -> StoreResult<()> {
        let run_id = &event.run_id;
        let sequence_no = to_i64(run_id, event.sequence_no)?;
        let sql_err = |e: sqlx::Error| StoreError::from_sqlx("append", e);

        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        let lease_row = sqlx::query(
            "SELECT owner, token, expires_at > now() AS live
             FROM pipeline_run_leases WHERE run_id = $1 FOR UPDATE",
        )
        .bind(run_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(sql_err)?;

        let (holder, held) = match lease_row {
            Some(row) => {
                let owner: String = row.try_get("owner").map_err(sql_err)?;
                let token: Uuid = row.try_get("token").map_err(sql_err)?;
                let live: bool = row.try_get("live").map_err(sql_err)?;
                (live.then_some(owner), live && token == lease.token)
            }
            None => (None, false),
        };
        if !held || lease.run_id != *run_id {
            return Err(StoreError::LeaseNotHeld {
                run_id: run_id.clone(),
                holder,
            });
        }

        let last: i64 = sqlx::query(
            "SELECT COALESCE(
                 (SELECT MAX(sequence_no) FROM pipeline_run_events WHERE run_id = $1),
                 r.compacted_through) AS last
             FROM pipeline_runs r WHERE r.run_id = $1",
        )
        .bind(run_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(sql_err)?
        .try_get("last")
        .map_err(sql_err)?;

        if sequence_no != last + 1 {
            return Err(StoreError::SequenceConflict {
                run_id: run_id.clone(),
                sequence_no: event.sequence_no,
            });
        }

        let inserted = sqlx::query(
            "INSERT INTO pipeline_run_events (run_id, sequence_no, stage, kind, event, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(run_id.as_str())
        .bind(sequence_no)
        .bind(event.stage.as_str())
        .bind(event.kind.as_str())
        .bind(serde_json::to_value(event)?)
        .bind(event.timestamp)
        .execute(&mut *tx)
        .await;

        match inserted {
            Err(e) if is_db_error(&e, UNIQUE_VIOLATION) => {
                return Err(StoreError::SequenceConflict {
                    run_id: run_id.clone(),
                    sequence_no: event.sequence_no,
                })
            }
            Err(e) => return Err(sql_err(e)),
            Ok(_) => {}
        }

        tx.commit().await.map_err(sql_err)?;
        Ok(())
    }

    async fn read_all(&self, run_id: &RunId) -> StoreResult<Vec<StageEvent>> {
        self.read_after(run_id, 0).await
    }

    async fn read_after(&self, run_id: &RunId, after: u64) -> StoreResult<Vec<StageEvent>> {
        if self.get_run(run_id).await?.is_none() {
            return Err(StoreError::RunNotFound {
                run_id: run_id.clone(),
            });
        }
        let rows = sqlx::query(
            "SELECT event FROM pipeline_run_events
             WHERE run_id = $1 AND sequence_no > $2
             ORDER BY sequence_no",
        )
        .bind(run_id.as_str())
        .bind(to_i64(run_id, after)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("read", e))?;
        Self::decode_events(rows)
    }

    async fn last_sequence(&self, run_id: &RunId) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(
                 (SELECT MAX(sequence_no) FROM pipeline_run_events WHERE run_id = $1),
                 r.compacted_through) AS last
             FROM pipeline_runs r WHERE r.run_id = $1",
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("last_sequence", e))?
        .ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.clone(),
        })?;
        let last: i64 = row
            .try_get("last")
            .map_err(|e| StoreError::from_sqlx("last_sequence", e))?;
        Ok(to_u64(last))
    }

    async fn save_snapshot(&self, snapshot: &RunSnapshot) -> StoreResult<()> {
        let run_id = &snapshot.run_id;
        let last = self.last_sequence(run_id).await?;
        if snapshot.sequence_no > last {
            return Err(StoreError::invalid_operation(
                run_id,
                format!("snapshot at {} is ahead of the log at {last}", snapshot.sequence_no),
            ));
        }
        sqlx::query(
            "INSERT INTO pipeline_run_snapshots (run_id, sequence_no, run, taken_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (run_id) DO UPDATE
             SET sequence_no = EXCLUDED.sequence_no, run = EXCLUDED.run, taken_at = EXCLUDED.taken_at
             WHERE pipeline_run_snapshots.sequence_no <= EXCLUDED.sequence_no",
        )
        .bind(run_id.as_str())
        .bind(to_i64(run_id, snapshot.sequence_no)?)
        .bind(serde_json::to_value(&snapshot.run)?)
        .bind(snapshot.taken_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("save_snapshot", e))?;
        Ok(())
    }

    async fn load_snapshot(&self, run_id: &RunId) -> StoreResult<Option<RunSnapshot>> {
        let sql_err = |e: sqlx::Error| StoreError::from_sqlx("load_snapshot", e);
        let Some(row) = sqlx::query(
            "SELECT sequence_no, run, taken_at FROM pipeline_run_snapshots WHERE run_id = $1",
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?
        else {
            return Ok(None);
        };

        let sequence_no: i64 = row.try_get("sequence_no").map_err(sql_err)?;
        let run: serde_json::Value = row.try_get("run").map_err(sql_err)?;
        let taken_at: DateTime<Utc> = row.try_get("taken_at").map_err(sql_err)?;
        Ok(Some(RunSnapshot {
            run_id: run_id.clone(),
            sequence_no: to_u64(sequence_no),
            run: serde_json::from_value(run)?,
            taken_at,
        }))
    }

    async fn compact(&self, run_id: &RunId, through: u64) -> StoreResult<u64> {
        let covered = self
            .load_snapshot(run_id)
            .await?
            .is_some_and(|snapshot| snapshot.sequence_no >= through);
        if !covered {
            return Err(StoreError::invalid_operation(
                run_id,
                format!("no snapshot covers sequence {through}"),
            ));
        }
        let through_i64 = to_i64(run_id, through)?;
        let sql_err = |e: sqlx::Error| StoreError::from_sqlx("compact", e);

        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        sqlx::query(
            "UPDATE pipeline_runs SET compacted_through = GREATEST(compacted_through, $2)
             WHERE run_id = $1",
        )
        .bind(run_id.as_str())
        .bind(through_i64)
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?;
        let removed = sqlx::query(
            "DELETE FROM pipeline_run_events WHERE run_id = $1 AND sequence_no <= $2",
        )
        .bind(run_id.as_str())
        .bind(through_i64)
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?
        .rows_affected();
        tx.commit().await.map_err(sql_err)?;
        Ok(removed)
    }

    async fn acquire_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<LeaseOutcome> {
        for _ in 0..LEASE_ATTEMPTS {
            if let Some(outcome) = self.try_acquire_lease(run_id, owner, ttl).await? {
                return Ok(outcome);
            }
        }
        Err(StoreError::unavailable(
            "acquire_lease",
            format!("lease for {run_id} kept changing hands"),
        ))
    }

    async fn release_lease(&self, lease: &RunLease) -> StoreResult<()> {
        sqlx::query("DELETE FROM pipeline_run_leases WHERE run_id = $1 AND token = $2")
            .bind(lease.run_id.as_str())
            .bind(lease.token)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("release_lease", e))?;
        Ok(())
    }
}
