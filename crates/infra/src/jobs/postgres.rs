//! Postgres-backed job store.
//!
//! Claims use a conditional `UPDATE ... WHERE job_id IN (SELECT ... FOR UPDATE
//! SKIP LOCKED)`, so concurrent schedulers sharing the table never take the
//! same row: a locked candidate is skipped rather than waited on.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) on insert | `23505` | `DuplicateId` |
//! | Database (connection exception / shutdown) | `08***`, `57P01`–`57P03` | `Unavailable` |
//! | Io, Tls, Protocol, PoolTimedOut, PoolClosed, WorkerCrashed | N/A | `Unavailable` |
//! | Begin/commit/rollback failure (other) | N/A | `Transaction` |
//! | Guarded write matched no row held by the owner | N/A | `ClaimLost` |
//! | Anything else | Any other | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{instrument, Span};
use uuid::Uuid;

use jobstore_core::{Job, JobId, Priority, WorkerId};

use super::store::{ClaimRequest, JobStore, JobStoreError};

/// Table definition and indexes, idempotent.
const SCHEMA: &str = include_str!("../../migrations/0001_create_job.sql");

/// Column list for `job` queries.
const COLUMNS: &str = "\
    job_id, job_data, next_task, next_task_start_time, \
    start_time, worker_id, retry_attempts_remaining, priority";

/// Postgres-backed job store.
///
/// `PostgresJobStore` is `Send + Sync` and cheap to clone; all operations go
/// through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `job` table and its indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn claim_tier(
        tx: &mut Transaction<'static, Postgres>,
        request: &ClaimRequest,
        priority: Priority,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let query = format!(
            "UPDATE job \
             SET worker_id = $1, start_time = $2 \
             WHERE job_id IN ( \
                 SELECT job_id FROM job \
                 WHERE priority = $3 \
                   AND next_task_start_time <= $2 \
                   AND (worker_id IS NULL OR start_time < $4) \
                 ORDER BY next_task_start_time ASC, job_id ASC \
                 LIMIT $5 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );

        let rows = sqlx::query(&query)
            .bind(request.worker_id.as_uuid())
            .bind(request.now)
            .bind(priority.as_str())
            .bind(request.lease_cutoff)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("claim_unassigned", e))?;

        // RETURNING carries no ordering guarantee.
        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| {
            a.next_task_start_time
                .cmp(&b.next_task_start_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| transaction_error("begin_transaction", e))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), JobStoreError> {
        tx.commit()
            .await
            .map_err(|e| transaction_error("commit_transaction", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), JobStoreError> {
        tx.rollback()
            .await
            .map_err(|e| transaction_error("rollback_transaction", e))
    }

    #[instrument(skip(self, tx, job), fields(job_id = %job.job_id, task = %job.next_task), err)]
    async fn insert(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job (
                job_id,
                job_data,
                next_task,
                next_task_start_time,
                start_time,
                worker_id,
                retry_attempts_remaining,
                priority
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(&job.job_data)
        .bind(&job.next_task)
        .bind(job.next_task_start_time)
        .bind(job.start_time)
        .bind(job.worker_id.map(Uuid::from))
        .bind(retries_to_db(job.retry_attempts_remaining))
        .bind(job.priority.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::DuplicateId(job.job_id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(
        skip(self, tx, request),
        fields(worker_id = %request.worker_id, limit = request.limit, claimed = tracing::field::Empty),
        err
    )]
    async fn claim_unassigned(
        &self,
        tx: &mut Self::Tx,
        request: &ClaimRequest,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut claimed = Vec::new();
        for priority in &request.priorities {
            let remaining = request.limit.saturating_sub(claimed.len());
            if remaining == 0 {
                break;
            }
            claimed.extend(Self::claim_tier(tx, request, *priority, remaining).await?);
        }

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    async fn release(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE job SET worker_id = NULL, start_time = NULL \
             WHERE job_id = $1 AND worker_id = $2",
        )
        .bind(job_id.as_uuid())
        .bind(owner.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        held_by(result.rows_affected(), job_id, owner)
    }

    async fn update_task_data(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
        data: &serde_json::Value,
    ) -> Result<(), JobStoreError> {
        let result =
            sqlx::query("UPDATE job SET job_data = $3 WHERE job_id = $1 AND worker_id = $2")
                .bind(job_id.as_uuid())
                .bind(owner.as_uuid())
                .bind(data)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("update_task_data", e))?;
        held_by(result.rows_affected(), job_id, owner)
    }

    async fn update_next_task(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
        next_task: &str,
        start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE job \
             SET next_task = $3, next_task_start_time = $4, retry_attempts_remaining = $5 \
             WHERE job_id = $1 AND worker_id = $2",
        )
        .bind(job_id.as_uuid())
        .bind(owner.as_uuid())
        .bind(next_task)
        .bind(start_time)
        .bind(retries_to_db(retry_attempts_remaining))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_next_task", e))?;
        held_by(result.rows_affected(), job_id, owner)
    }

    async fn update_retry_details(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
        start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE job \
             SET next_task_start_time = $3, retry_attempts_remaining = $4 \
             WHERE job_id = $1 AND worker_id = $2",
        )
        .bind(job_id.as_uuid())
        .bind(owner.as_uuid())
        .bind(start_time)
        .bind(retries_to_db(retry_attempts_remaining))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_retry_details", e))?;
        held_by(result.rows_affected(), job_id, owner)
    }

    async fn delete(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM job WHERE job_id = $1 AND worker_id = $2")
            .bind(job_id.as_uuid())
            .bind(owner.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        held_by(result.rows_affected(), job_id, owner)
    }

    async fn find(&self, tx: &mut Self::Tx, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let query = format!("SELECT {COLUMNS} FROM job WHERE job_id = $1");
        let row = sqlx::query(&query)
            .bind(job_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;

        row.as_ref().map(job_from_row).transpose()
    }
}

/// A guarded write that touched no row lost its claim.
fn held_by(rows_affected: u64, job_id: JobId, owner: WorkerId) -> Result<(), JobStoreError> {
    if rows_affected == 0 {
        Err(JobStoreError::ClaimLost { job_id, owner })
    } else {
        Ok(())
    }
}

fn retries_to_db(retries: u32) -> i32 {
    i32::try_from(retries).unwrap_or(i32::MAX)
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let job_id: Uuid = row.try_get("job_id").map_err(decode)?;
    let worker_id: Option<Uuid> = row.try_get("worker_id").map_err(decode)?;
    let retries: i32 = row.try_get("retry_attempts_remaining").map_err(decode)?;
    let priority: String = row.try_get("priority").map_err(decode)?;

    Ok(Job {
        job_id: JobId::from_uuid(job_id),
        job_data: row.try_get("job_data").map_err(decode)?,
        next_task: row.try_get("next_task").map_err(decode)?,
        next_task_start_time: row.try_get("next_task_start_time").map_err(decode)?,
        start_time: row.try_get("start_time").map_err(decode)?,
        worker_id: worker_id.map(WorkerId::from_uuid),
        retry_attempts_remaining: u32::try_from(retries).map_err(|_| {
            JobStoreError::Storage(format!("negative retry_attempts_remaining for job {job_id}"))
        })?,
        priority: priority
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("job {job_id}: {e}")))?,
    })
}

/// Errors raised by begin/commit/rollback. Connectivity stays `Unavailable`.
fn transaction_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match map_sqlx_error(operation, err) {
        JobStoreError::Storage(msg) => JobStoreError::Transaction(msg),
        other => other,
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if is_connection_code(code.as_ref()) => JobStoreError::Unavailable(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            JobStoreError::Unavailable(format!("connection error in {}: {}", operation, err))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// SQLSTATE class 08 (connection exception) and operator intervention
/// shutdowns.
fn is_connection_code(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
