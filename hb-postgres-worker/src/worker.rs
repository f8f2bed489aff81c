//! Worker Pool: N concurrent consumers sharing one [`QueueDriver`], invoking
//! user-registered handlers with retry and cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use health::HealthHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use hb_postgres_common::jobs::{QueueDriver, QueueError};
use hb_postgres_common::retry::RetryPolicy;

use crate::handlers::{decode_tagged, HandlerRegistry};

/// In-memory attempt counter, keyed by job id. Cleared once a job terminates
/// (success or final failure). The persisted schema has no attempt column, so
/// retry counts don't survive a process restart — a restarted process's
/// `processing`/`failed` recovery policy governs what happens instead.
#[derive(Default, Clone)]
struct AttemptTracker {
    attempts: Arc<Mutex<HashMap<Uuid, u32>>>,
}

impl AttemptTracker {
    fn record_attempt(&self, job_id: Uuid) -> u32 {
        let mut attempts = self.attempts.lock().expect("attempt tracker mutex poisoned");
        let count = attempts.entry(job_id).or_insert(0);
        *count += 1;
        *count
    }

    fn forget(&self, job_id: Uuid) {
        self.attempts
            .lock()
            .expect("attempt tracker mutex poisoned")
            .remove(&job_id);
    }
}

/// Tracks how many of the pool's workers are currently executing a handler, for
/// the `job_worker_saturation_percent` gauge.
#[derive(Default, Clone)]
struct SaturationTracker {
    busy: Arc<AtomicUsize>,
    concurrency: usize,
}

impl SaturationTracker {
    fn new(concurrency: usize) -> Self {
        Self {
            busy: Arc::new(AtomicUsize::new(0)),
            concurrency,
        }
    }

    fn enter(&self) -> SaturationGuard<'_> {
        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.report(busy);
        SaturationGuard { tracker: self }
    }

    fn report(&self, busy: usize) {
        if self.concurrency > 0 {
            let percent = (busy as f64 / self.concurrency as f64) * 100.0;
            metrics::gauge!("job_worker_saturation_percent").set(percent);
        }
    }
}

struct SaturationGuard<'a> {
    tracker: &'a SaturationTracker,
}

impl Drop for SaturationGuard<'_> {
    fn drop(&mut self) {
        let busy = self.tracker.busy.fetch_sub(1, Ordering::SeqCst) - 1;
        self.tracker.report(busy);
    }
}

/// Hosts `concurrency` concurrent consumers pulling from a shared [`QueueDriver`].
pub struct WorkerPool {
    driver: Arc<QueueDriver>,
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    concurrency: usize,
    liveness: HealthHandle,
}

impl WorkerPool {
    pub fn new(
        driver: Arc<QueueDriver>,
        registry: HandlerRegistry,
        retry_policy: RetryPolicy,
        concurrency: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            driver,
            registry: Arc::new(registry),
            retry_policy,
            concurrency,
            liveness,
        }
    }

    /// Spawn `concurrency` claim-and-execute tasks. Each task runs until `cancel`
    /// fires or `self.driver.stop()` is called by some other path. Returns the
    /// join handles so a caller can `shutdown_gracefully`.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let attempts = AttemptTracker::default();

        (0..self.concurrency)
            .map(|worker_index| {
                let driver = Arc::clone(&self.driver);
                let registry = Arc::clone(&self.registry);
                let retry_policy = self.retry_policy;
                let liveness = self.liveness.clone();
                let cancel = cancel.clone();
                let attempts = attempts.clone();

                tokio::spawn(async move {
                    run_worker_loop(
                        worker_index,
                        driver,
                        registry,
                        retry_policy,
                        liveness,
                        cancel,
                        attempts,
                    )
                    .await;
                })
            })
            .collect()
    }

    /// Stop accepting new claims and wait for every in-flight handler to finish.
    /// `stop()` alone only flips the one-way flag; this additionally joins the
    /// spawned tasks.
    pub async fn shutdown_gracefully(&self, handles: Vec<JoinHandle<()>>) {
        self.driver.stop();
        for handle in handles {
            if let Err(error) = handle.await {
                error!(%error, "worker task panicked during graceful shutdown");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker_loop(
    worker_index: usize,
    driver: Arc<QueueDriver>,
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
    cancel: CancellationToken,
    attempts: AttemptTracker,
) {
    loop {
        if cancel.is_cancelled() || driver.is_stopped() {
            return;
        }

        liveness.report_healthy().await;

        let claimed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = driver.next() => result,
        };

        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => return, // driver was stopped mid-poll
            Err(error) => {
                error!(worker_index, %error, "claim failed");
                continue;
            }
        };

        process_claimed_job(&driver, &registry, retry_policy, &attempts, job.id, job.payload).await;
    }
}

async fn process_claimed_job(
    driver: &QueueDriver,
    registry: &HandlerRegistry,
    retry_policy: RetryPolicy,
    attempts: &AttemptTracker,
    job_id: Uuid,
    payload: Vec<u8>,
) {
    let Some((job_type, body)) = decode_tagged(&payload) else {
        warn!(%job_id, error = %QueueError::DecodeJobFailed, "could not identify a handler for the claimed payload");
        if let Err(error) = driver.failed(job_id).await {
            error!(%job_id, %error, "failed to mark undecodable job as failed");
        }
        return;
    };

    let Some(handler) = registry.get(job_type) else {
        warn!(%job_id, job_type, error = %QueueError::DecodeJobFailed, "no handler registered for job type");
        if let Err(error) = driver.failed(job_id).await {
            error!(%job_id, %error, "failed to mark unhandled job as failed");
        }
        return;
    };

    let attempt = attempts.record_attempt(job_id);

    match handler.handle(body).await {
        Ok(()) => {
            attempts.forget(job_id);
            metrics::counter!("job_worker_jobs_completed_total", "job_type" => job_type.to_owned())
                .increment(1);
            if let Err(error) = driver.finished(job_id).await {
                error!(%job_id, %error, "failed to finalize completed job");
            }
        }
        Err(error) => {
            metrics::counter!("job_worker_jobs_failed_attempts_total", "job_type" => job_type.to_owned())
                .increment(1);

            if attempt <= handler.max_retry_count() {
                let delay = retry_policy.time_until_next_retry(attempt - 1, None);
                info!(%job_id, job_type, attempt, ?delay, %error, "job failed, scheduling retry");

                let delayed_until = chrono::Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

                if let Err(retry_error) = driver.retry(job_id, Some(delayed_until)).await {
                    error!(%job_id, %retry_error, "failed to re-enqueue job for retry");
                }
            } else {
                attempts.forget(job_id);
                error!(%job_id, job_type, %error, "job exhausted retries, marking failed");
                metrics::counter!("job_worker_jobs_terminally_failed_total", "job_type" => job_type.to_owned())
                    .increment(1);
                if let Err(fail_error) = driver.failed(job_id).await {
                    error!(%job_id, %fail_error, "failed to mark exhausted job as failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rand::Rng;
    use sqlx::PgPool;
    use tokio::sync::Notify;

    use hb_postgres_common::gateway::PgGateway;
    use hb_postgres_common::jobs::{encode_tagged, store, JobStatus, RecoveryConfig};

    use super::*;
    use crate::handlers::JobHandler;

    async fn driver_for(pool: PgPool) -> Arc<QueueDriver> {
        let mut conn = pool.acquire().await.expect("acquire failed");
        store::ensure_schema(&mut conn).await.expect("ensure_schema failed");
        drop(conn);
        Arc::new(QueueDriver::new(PgGateway::from_pool(pool), RecoveryConfig::default()))
    }

    async fn liveness_handle() -> HealthHandle {
        // Constructed fresh per test; the registry itself isn't under test here.
        let registry = health::HealthRegistry::new("liveness");
        registry
            .register("worker_pool".to_owned(), time::Duration::seconds(60))
            .await
    }

    /// Fails on its first attempt, succeeds on every attempt after.
    struct FailOnceHandler {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for FailOnceHandler {
        fn job_type(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _body: &[u8]) -> Result<(), eyre::Error> {
            let attempt = self.attempts.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if attempt == 1 {
                Err(eyre::eyre!("transient failure"))
            } else {
                Ok(())
            }
        }

        fn max_retry_count(&self) -> u32 {
            3
        }
    }

    #[sqlx::test]
    async fn test_retry_then_succeed(pool: PgPool) {
        let driver = driver_for(pool).await;
        let attempts = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        registry.register(FailOnceHandler {
            attempts: Arc::clone(&attempts),
        });

        let retry_policy = RetryPolicy::new(1, Duration::from_millis(5), None);
        let worker_pool = WorkerPool::new(
            Arc::clone(&driver),
            registry,
            retry_policy,
            1,
            liveness_handle().await,
        );

        let cancel = CancellationToken::new();
        let handles = worker_pool.spawn(cancel.clone());

        driver.push(&encode_tagged("flaky", b""), None).await.expect("push failed");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while attempts.load(AtomicOrdering::SeqCst) < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 2, "expected one failed attempt then a success");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if driver.get_jobs(JobStatus::Failed).await.unwrap().is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never cleared failed status");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        worker_pool.shutdown_gracefully(handles).await;
    }

    /// A handler that announces it has started, then waits to be released before
    /// returning successfully — used to observe state while a job is in flight.
    struct ReleasableHandler {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for ReleasableHandler {
        fn job_type(&self) -> &str {
            "slow"
        }

        async fn handle(&self, _body: &[u8]) -> Result<(), eyre::Error> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[sqlx::test]
    async fn test_shutdown_gracefully_waits_for_inflight_handler(pool: PgPool) {
        let driver = driver_for(pool).await;

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let mut registry = HandlerRegistry::new();
        registry.register(ReleasableHandler {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });

        let pool_ = WorkerPool::new(
            Arc::clone(&driver),
            registry,
            RetryPolicy::default(),
            1,
            liveness_handle().await,
        );

        let cancel = CancellationToken::new();
        let handles = pool_.spawn(cancel.clone());

        let job_id = driver
            .push(&encode_tagged("slow", b""), None)
            .await
            .expect("push failed");

        started.notified().await;

        // The job is mid-flight: processing, no queue entry, `stop()` alone must
        // not interrupt it.
        driver.stop();
        let processing = driver.get_jobs(JobStatus::Processing).await.unwrap();
        assert!(processing.contains(&job_id));

        let shutdown = tokio::spawn({
            let pool_ = pool_;
            async move {
                pool_.shutdown_gracefully(handles).await;
            }
        });

        // `shutdown_gracefully` must be waiting on the in-flight handler, not the
        // claim loop (already stopped).
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_finished());

        release.notify_one();
        shutdown.await.expect("shutdown task panicked");

        let processing_after = driver.get_jobs(JobStatus::Processing).await.unwrap();
        assert!(!processing_after.contains(&job_id));
    }

    /// Sleeps a randomized 10-50ms per job while recording a high-water mark of
    /// how many handlers were running at once, via `current.fetch_add`/`fetch_sub`
    /// around the sleep and `fetch_max` on the observed peak.
    struct ConcurrencyTrackingHandler {
        current: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for ConcurrencyTrackingHandler {
        fn job_type(&self) -> &str {
            "counted"
        }

        async fn handle(&self, _body: &[u8]) -> Result<(), eyre::Error> {
            let in_flight = self.current.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(in_flight, AtomicOrdering::SeqCst);

            let millis = rand::thread_rng().gen_range(10..=50);
            tokio::time::sleep(Duration::from_millis(millis)).await;

            self.current.fetch_sub(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[sqlx::test]
    async fn test_worker_pool_runs_jobs_concurrently_within_bound(pool: PgPool) {
        const CONCURRENCY: usize = 4;
        const JOB_COUNT: usize = 10;

        let driver = driver_for(pool).await;

        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        registry.register(ConcurrencyTrackingHandler {
            current: Arc::clone(&current),
            peak: Arc::clone(&peak),
        });

        let worker_pool = WorkerPool::new(
            Arc::clone(&driver),
            registry,
            RetryPolicy::default(),
            CONCURRENCY,
            liveness_handle().await,
        );

        let cancel = CancellationToken::new();
        let handles = worker_pool.spawn(cancel.clone());

        for _ in 0..JOB_COUNT {
            driver
                .push(&encode_tagged("counted", b""), None)
                .await
                .expect("push failed");
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let remaining = driver.get_jobs(JobStatus::Processing).await.unwrap().len()
                + driver.get_jobs(JobStatus::Pending).await.unwrap().len();
            if remaining == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "jobs never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        worker_pool.shutdown_gracefully(handles).await;

        let observed_peak = peak.load(AtomicOrdering::SeqCst);
        assert!(
            observed_peak > 1 && observed_peak <= CONCURRENCY as u32,
            "expected observed concurrency in (1, {CONCURRENCY}], got {observed_peak}"
        );
    }
}
