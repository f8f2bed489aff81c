//! Job Store: the durable record of every live job, table `_hb_pg_jobs`.

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgConnection, Postgres};
use uuid::Uuid;

use crate::error::SqlError;

pub const JOBS_TABLE: &str = "_hb_pg_jobs";
pub const QUEUE_TABLE: &str = "_hb_pg_job_queue";
pub const METADATA_TABLE: &str = "_hb_pg_job_queue_metadata";

/// A job's position in its lifecycle. Encoded as `SMALLINT` (0/1/2) in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Failed,
}

impl JobStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Failed => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(JobStatus::Pending),
            1 => Some(JobStatus::Processing),
            2 => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A row of `_hb_pg_jobs`. The payload is opaque to everything in this crate;
/// interpreting it is a worker-layer concern.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub payload: Vec<u8>,
    pub status: JobStatus,
    pub last_modified: DateTime<Utc>,
}

/// Idempotent DDL for the Job Store and Queue Index tables. Declared as a single
/// migration step so the four pieces of schema land atomically.
pub async fn ensure_schema(conn: &mut PgConnection) -> Result<(), SqlError> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS "_hb_pg_jobs" (
    id            UUID PRIMARY KEY,
    job           BYTEA,
    status        SMALLINT NOT NULL,
    "lastModified" TIMESTAMPTZ NOT NULL DEFAULT now()
)
        "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(|error| SqlError::query("CREATE TABLE jobs", error))?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS "_hb_job_status" ON "_hb_pg_jobs" (status)"#)
        .execute(&mut *conn)
        .await
        .map_err(|error| SqlError::query("CREATE INDEX job_status", error))?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS "_hb_pg_job_queue" (
    job_id        UUID PRIMARY KEY,
    "createdAt"   TIMESTAMPTZ NOT NULL,
    delayed_until TIMESTAMPTZ NULL
)
        "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(|error| SqlError::query("CREATE TABLE job_queue", error))?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS "_hb_job_queueidx" ON "_hb_pg_job_queue" ("createdAt" ASC)"#)
        .execute(&mut *conn)
        .await
        .map_err(|error| SqlError::query("CREATE INDEX job_queueidx", error))?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS "_hb_pg_job_queue_metadata" (
    key   TEXT PRIMARY KEY,
    value BYTEA
)
        "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(|error| SqlError::query("CREATE TABLE job_queue_metadata", error))?;

    Ok(())
}

pub async fn insert_job<'c, E>(
    executor: E,
    id: Uuid,
    payload: &[u8],
    status: JobStatus,
) -> Result<(), SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(r#"INSERT INTO "_hb_pg_jobs" (id, job, status) VALUES ($1, $2, $3)"#)
        .bind(id)
        .bind(payload)
        .bind(status.as_i16())
        .execute(executor)
        .await
        .map_err(|error| SqlError::query("INSERT job", error))?;

    Ok(())
}

pub async fn delete_job<'c, E>(executor: E, id: Uuid) -> Result<(), SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(r#"DELETE FROM "_hb_pg_jobs" WHERE id = $1"#)
        .bind(id)
        .execute(executor)
        .await
        .map_err(|error| SqlError::query("DELETE job", error))?;

    Ok(())
}

pub async fn set_status<'c, E>(executor: E, id: Uuid, status: JobStatus) -> Result<(), SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(r#"UPDATE "_hb_pg_jobs" SET status = $2, "lastModified" = now() WHERE id = $1"#)
        .bind(id)
        .bind(status.as_i16())
        .execute(executor)
        .await
        .map_err(|error| SqlError::query("UPDATE job status", error))?;

    Ok(())
}

/// `SELECT job FROM _hb_pg_jobs WHERE id = $1 FOR UPDATE SKIP LOCKED`, run inside the
/// caller's transaction. Returns `None` if the row vanished or is locked elsewhere.
pub async fn select_payload_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Vec<u8>>, SqlError> {
    let row: Option<(Vec<u8>,)> =
        sqlx::query_as(r#"SELECT job FROM "_hb_pg_jobs" WHERE id = $1 FOR UPDATE SKIP LOCKED"#)
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(|error| SqlError::query("SELECT job FOR UPDATE", error))?;

    Ok(row.map(|(payload,)| payload))
}

/// Diagnostic listing of job ids with a given status.
pub async fn ids_with_status<'c, E>(executor: E, status: JobStatus) -> Result<Vec<Uuid>, SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows: Vec<(Uuid,)> =
        sqlx::query_as(r#"SELECT id FROM "_hb_pg_jobs" WHERE status = $1 FOR UPDATE SKIP LOCKED"#)
            .bind(status.as_i16())
            .fetch_all(executor)
            .await
            .map_err(|error| SqlError::query("SELECT ids by status", error))?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn delete_all_with_status<'c, E>(executor: E, status: JobStatus) -> Result<u64, SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(r#"DELETE FROM "_hb_pg_jobs" WHERE status = $1"#)
        .bind(status.as_i16())
        .execute(executor)
        .await
        .map_err(|error| SqlError::query("DELETE by status", error))?;

    Ok(result.rows_affected())
}

pub async fn insert_queue_entry<'c, E>(
    executor: E,
    job_id: Uuid,
    delayed_until: Option<DateTime<Utc>>,
) -> Result<(), SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"INSERT INTO "_hb_pg_job_queue" (job_id, "createdAt", delayed_until) VALUES ($1, now(), $2)"#,
    )
    .bind(job_id)
    .bind(delayed_until)
    .execute(executor)
    .await
    .map_err(|error| SqlError::query("INSERT queue entry", error))?;

    Ok(())
}

pub async fn get_metadata<'c, E>(executor: E, key: &str) -> Result<Option<Vec<u8>>, SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: Option<(Vec<u8>,)> =
        sqlx::query_as(r#"SELECT value FROM "_hb_pg_job_queue_metadata" WHERE key = $1"#)
            .bind(key)
            .fetch_optional(executor)
            .await
            .map_err(|error| SqlError::query("SELECT metadata", error))?;

    Ok(row.map(|(value,)| value))
}

pub async fn set_metadata<'c, E>(executor: E, key: &str, value: &[u8]) -> Result<(), SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
INSERT INTO "_hb_pg_job_queue_metadata" (key, value)
VALUES ($1, $2)
ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(executor)
    .await
    .map_err(|error| SqlError::query("UPSERT metadata", error))?;

    Ok(())
}
