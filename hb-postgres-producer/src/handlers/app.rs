use std::sync::Arc;

use axum::{routing, Router};
use tower_http::limit::RequestBodyLimitLayer;

use hb_postgres_common::jobs::QueueDriver;

use super::{jobs, metadata};

pub fn add_routes(router: Router, driver: Arc<QueueDriver>, max_body_size: usize) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/jobs",
            routing::post(jobs::post_job)
                .get(jobs::get_jobs)
                .with_state(Arc::clone(&driver))
                .layer(RequestBodyLimitLayer::new(max_body_size)),
        )
        .route(
            "/metadata/:key",
            routing::get(metadata::get_metadata)
                .put(metadata::put_metadata)
                .with_state(driver)
                .layer(RequestBodyLimitLayer::new(max_body_size)),
        )
}

pub async fn index() -> &'static str {
    "hb-postgres-producer"
}
