//! HTTP producer surface: lets other services enqueue jobs and inspect queue
//! state without taking a direct Postgres dependency.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hb_postgres_common::jobs::register_migrations;
use hb_postgres_common::jobs::QueueDriver;
use hb_postgres_common::jobs::RecoveryConfig;
use hb_postgres_common::metrics::setup_metrics_router;
use hb_postgres_common::migrations::MigrationEngine;
use hb_postgres_common::persist::{self, PersistStore};
use hb_postgres_common::PgGateway;
use health::HealthRegistry;

mod config;
mod error;
mod handlers;

use config::Config;
use error::ProducerError;

#[tokio::main]
async fn main() -> Result<(), ProducerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let gateway = PgGateway::connect(&config.database_url, config.max_pg_connections, "hb-postgres-producer")
        .await
        .expect("failed to connect to postgres");

    let engine = Arc::new(MigrationEngine::new(gateway.clone()));
    register_migrations(&engine).await;
    persist::register_migration(&engine).await;

    let liveness = HealthRegistry::new("liveness");
    let migrations_liveness = liveness
        .register("migration_engine".to_owned(), time::Duration::seconds(60))
        .await;

    // The Migration Engine must finish reconciling before this surface serves
    // traffic; `wait_until_completed` blocks the request path on it below, but we
    // kick reconciliation off now so steady-state requests don't pay for it.
    let engine_for_apply = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(error) = engine_for_apply.apply(None, false).await {
            tracing::error!(%error, "migration reconciliation failed");
        }
    });

    engine.wait_until_completed().await?;
    migrations_liveness.report_healthy().await;

    let driver = Arc::new(QueueDriver::new(gateway.clone(), RecoveryConfig::default()));

    let sweeper_cancel = CancellationToken::new();
    let persist_store = PersistStore::new(gateway);
    let sweeper_engine = Arc::clone(&engine);
    let sweeper_handle = tokio::spawn({
        let cancel = sweeper_cancel.clone();
        let interval = config.persist_sweep_interval.0;
        async move {
            persist::run_sweeper(persist_store, &sweeper_engine, interval, cancel).await;
        }
    });

    let app = handlers::add_routes(Router::new(), driver, config.max_body_size);
    let app = app
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .merge(setup_metrics_router());

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping persist sweeper");
        }
    }

    sweeper_cancel.cancel();
    sweeper_handle.await.ok();

    Ok(())
}
