//! Worker Pool binary: reconciles migrations to completion, then polls the
//! shared job queue with a configurable number of concurrent workers.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hb_postgres_common::jobs::{register_migrations, QueueDriver, RecoveryConfig};
use hb_postgres_common::metrics::setup_metrics_router;
use hb_postgres_common::migrations::MigrationEngine;
use hb_postgres_common::PgGateway;
use health::HealthRegistry;

use hb_postgres_worker::config::Config;
use hb_postgres_worker::error::WorkerError;
use hb_postgres_worker::handlers::HandlerRegistry;
use hb_postgres_worker::worker::WorkerPool;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let gateway = PgGateway::connect(&config.database_url, config.max_pg_connections, "hb-postgres-worker")
        .await
        .expect("failed to connect to postgres");

    let engine = Arc::new(MigrationEngine::new(gateway.clone()));
    register_migrations(&engine).await;

    let engine_for_apply = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(error) = engine_for_apply.apply(None, false).await {
            tracing::error!(%error, "migration reconciliation failed");
        }
    });

    let recovery = RecoveryConfig {
        pending: config.pending_jobs_initialization.0,
        processing: config.processing_jobs_initialization.0,
        failed: config.failed_jobs_initialization.0,
        poll_time: config.poll_interval.0,
    };
    let driver = Arc::new(QueueDriver::new(gateway.clone(), recovery));
    driver.on_init(&engine).await.map_err(|error| {
        tracing::error!(%error, "queue startup recovery failed");
        WorkerError::from(error)
    })?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker_pool".to_owned(), time::Duration::seconds(60))
        .await;

    // Host applications register their own job handlers; this binary ships empty.
    let registry = HandlerRegistry::new();

    let pool = WorkerPool::new(
        Arc::clone(&driver),
        registry,
        config.retry_policy.build(),
        config.concurrency,
        worker_liveness,
    );

    let cancel = CancellationToken::new();
    let handles = pool.spawn(cancel.clone());

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(liveness.get_status())),
        );
    let router = router.merge(setup_metrics_router());
    let bind = config.bind();

    tokio::spawn(async move {
        if let Ok(listener) = tokio::net::TcpListener::bind(&bind).await {
            let _ = axum::serve(listener, router).await;
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, stopping worker pool gracefully");
    cancel.cancel();
    pool.shutdown_gracefully(handles).await;

    Ok(())
}

pub async fn index() -> &'static str {
    "hb-postgres-worker"
}
