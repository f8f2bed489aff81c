//! Queue Driver: push / claim-next / finished / failed, metadata, and startup recovery.
//!
//! The claim protocol is the load-bearing part of this module — see `claim_next`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::SqlError;
use crate::gateway::PgGateway;
use crate::migrations::{noop, FnMigration, MigrationEngine, JOBQUEUE_GROUP};

use super::error::QueueError;
use super::store::{self, JobStatus};

/// What to do, on startup, with jobs left in a given status by a prior process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPolicy {
    DoNothing,
    Rerun,
    Remove,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub pending: InitPolicy,
    pub processing: InitPolicy,
    pub failed: InitPolicy,
    pub poll_time: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            pending: InitPolicy::DoNothing,
            processing: InitPolicy::Rerun,
            failed: InitPolicy::Rerun,
            poll_time: Duration::from_millis(100),
        }
    }
}

/// A job handed to a worker after a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub payload: Vec<u8>,
}

/// Register the Job Store's and Queue Index's migrations with `engine`. Call before
/// `engine.apply(...)`. Creates the full schema in one migration for atomicity.
pub async fn register_migrations(engine: &MigrationEngine) {
    engine
        .add(FnMigration::new(
            "create_hb_pg_jobs",
            JOBQUEUE_GROUP,
            |conn: &mut PgConnection| Box::pin(async move { store::ensure_schema(conn).await.map_err(sql_to_sqlx) }),
            noop(),
        ))
        .await;
}

fn sql_to_sqlx(error: SqlError) -> sqlx::Error {
    match error {
        SqlError::ConnectionError { error } => error,
        SqlError::QueryError { error, .. } => error,
        SqlError::TransactionError { error, .. } => error,
    }
}

/// A durable job queue: producers `push`, workers repeatedly `claim_next`.
pub struct QueueDriver {
    gateway: PgGateway,
    recovery: RecoveryConfig,
    stopped: Arc<AtomicBool>,
}

impl QueueDriver {
    pub fn new(gateway: PgGateway, recovery: RecoveryConfig) -> Self {
        Self {
            gateway,
            recovery,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Await migration completion, then apply the configured recovery policy to jobs left
    /// in a non-terminal status by a prior process.
    pub async fn on_init(&self, engine: &MigrationEngine) -> Result<(), QueueError> {
        engine.wait_until_completed().await?;

        self.apply_recovery_policy(JobStatus::Failed, self.recovery.failed).await?;
        self.apply_recovery_policy(JobStatus::Processing, self.recovery.processing)
            .await?;
        // `pending` rows are already enqueued; only `remove` has any effect for that status.
        self.apply_recovery_policy(JobStatus::Pending, self.recovery.pending).await?;

        Ok(())
    }

    async fn apply_recovery_policy(&self, status: JobStatus, policy: InitPolicy) -> Result<(), QueueError> {
        match policy {
            InitPolicy::DoNothing => Ok(()),
            InitPolicy::Remove => {
                let deleted = store::delete_all_with_status(self.gateway.pool(), status).await?;
                if deleted > 0 {
                    info!(?status, deleted, "removed stale jobs on startup");
                }
                Ok(())
            }
            InitPolicy::Rerun => {
                if status == JobStatus::Pending {
                    return Ok(());
                }
                let ids = store::ids_with_status(self.gateway.pool(), status).await?;
                for id in &ids {
                    store::insert_queue_entry(self.gateway.pool(), *id, None).await?;
                    store::set_status(self.gateway.pool(), *id, JobStatus::Pending).await?;
                }
                if !ids.is_empty() {
                    info!(?status, count = ids.len(), "re-enqueued stale jobs on startup");
                }
                Ok(())
            }
        }
    }

    /// Insert a Job Store row plus one Queue Index row in a single transaction.
    pub async fn push(&self, payload: &[u8], delayed_until: Option<DateTime<Utc>>) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();

        self.gateway
            .with_transaction(|txn| {
                Box::pin(async move {
                    store::insert_job(&mut **txn, id, payload, JobStatus::Pending).await?;
                    store::insert_queue_entry(&mut **txn, id, delayed_until).await?;
                    Ok::<(), SqlError>(())
                })
            })
            .await
            .map_err(QueueError::FailedToAdd)?;

        Ok(id)
    }

    /// The core claim protocol: atomically remove one eligible queue entry, read its payload,
    /// and mark the Job `processing`.
    #[instrument(skip(self))]
    pub async fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let start_time = Instant::now();
        let result = self.claim_next_inner().await;
        metrics::histogram!("job_claim_duration_seconds").record(start_time.elapsed().as_secs_f64());
        result
    }

    async fn claim_next_inner(&self) -> Result<Option<ClaimedJob>, QueueError> {
        loop {
            let mut txn = self
                .gateway
                .pool()
                .begin()
                .await
                .map_err(|error| SqlError::ConnectionError { error })?;

            let claimed_id: Option<(Uuid,)> = sqlx::query_as(
                r#"
DELETE FROM "_hb_pg_job_queue" pse
WHERE pse.job_id = (
    SELECT pse_inner.job_id FROM "_hb_pg_job_queue" pse_inner
    WHERE (pse_inner.delayed_until IS NULL OR pse_inner.delayed_until <= now())
    ORDER BY pse_inner."createdAt" ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING pse.job_id
                "#,
            )
            .fetch_optional(&mut *txn)
            .await
            .map_err(|error| SqlError::query("DELETE queue entry", error))?;

            let Some((job_id,)) = claimed_id else {
                txn.rollback().await.ok();
                return Ok(None);
            };

            let payload = store::select_payload_for_update(&mut *txn, job_id).await?;

            let Some(payload) = payload else {
                // The job row vanished between steps; the queue entry is already gone too.
                // Treat as an orphan and loop back for another candidate.
                txn.commit().await.map_err(|error| SqlError::transaction("COMMIT", error))?;
                continue;
            };

            store::set_status(&mut *txn, job_id, JobStatus::Processing).await?;

            txn.commit()
                .await
                .map_err(|error| SqlError::transaction("COMMIT", error))?;

            return Ok(Some(ClaimedJob { id: job_id, payload }));
        }
    }

    pub async fn finished(&self, job_id: Uuid) -> Result<(), QueueError> {
        store::delete_job(self.gateway.pool(), job_id).await?;
        Ok(())
    }

    pub async fn failed(&self, job_id: Uuid) -> Result<(), QueueError> {
        store::set_status(self.gateway.pool(), job_id, JobStatus::Failed).await?;
        Ok(())
    }

    /// Re-enqueue a job for retry: a fresh queue entry, status back to `pending`.
    pub async fn retry(&self, job_id: Uuid, delayed_until: Option<DateTime<Utc>>) -> Result<(), QueueError> {
        self.gateway
            .with_transaction(|txn| {
                Box::pin(async move {
                    store::insert_queue_entry(&mut **txn, job_id, delayed_until).await?;
                    store::set_status(&mut **txn, job_id, JobStatus::Pending).await?;
                    Ok::<(), SqlError>(())
                })
            })
            .await?;
        Ok(())
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, QueueError> {
        Ok(store::get_metadata(self.gateway.pool(), key).await?)
    }

    pub async fn set_metadata(&self, key: &str, value: &[u8]) -> Result<(), QueueError> {
        store::set_metadata(self.gateway.pool(), key, value).await?;
        Ok(())
    }

    pub async fn get_jobs(&self, with_status: JobStatus) -> Result<Vec<Uuid>, QueueError> {
        Ok(store::ids_with_status(self.gateway.pool(), with_status).await?)
    }

    /// One-way flag: halts the claim loop without interrupting in-flight handlers.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Block until either work arrives or `stop()` has been called, sleeping `poll_time`
    /// between empty polls. Returns `None` once stopped.
    pub async fn next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        loop {
            if self.is_stopped() {
                return Ok(None);
            }

            match self.claim_next().await? {
                Some(job) => return Ok(Some(job)),
                None => tokio::time::sleep(self.recovery.poll_time).await,
            }
        }
    }
}
