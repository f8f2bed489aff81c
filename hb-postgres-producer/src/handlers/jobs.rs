use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_derive::Deserialize;
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use hb_postgres_common::jobs::{encode_tagged, JobStatus, QueueDriver};

#[derive(Serialize, Deserialize)]
pub struct JobResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// The body of a request made to enqueue a job. `payload` is caller-defined JSON;
/// it is serialized and tagged with `job_type` before being pushed onto the queue.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct JobPostRequestBody {
    job_type: String,
    payload: Value,
    #[serde(default)]
    delayed_until: Option<DateTime<Utc>>,
}

pub async fn post_job(
    State(driver): State<Arc<QueueDriver>>,
    Json(payload): Json<JobPostRequestBody>,
) -> Result<Json<JobResponse>, (StatusCode, Json<JobResponse>)> {
    debug!(job_type = %payload.job_type, "received job");

    let body = serde_json::to_vec(&payload.payload).map_err(|_| bad_request("payload is not valid JSON"))?;
    let encoded = encode_tagged(&payload.job_type, &body);

    let start_time = Instant::now();

    let id = driver
        .push(&encoded, payload.delayed_until)
        .await
        .map_err(internal_error)?;

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("producer_enqueue_duration_seconds").record(elapsed_time);
    metrics::counter!("producer_jobs_enqueued_total", "job_type" => payload.job_type).increment(1);

    Ok(Json(JobResponse {
        id: Some(id),
        error: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    status: String,
}

pub async fn get_jobs(
    State(driver): State<Arc<QueueDriver>>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<Uuid>>, (StatusCode, Json<JobResponse>)> {
    let status = parse_status(&query.status)?;

    let ids = driver.get_jobs(status).await.map_err(internal_error)?;

    Ok(Json(ids))
}

fn parse_status(raw: &str) -> Result<JobStatus, (StatusCode, Json<JobResponse>)> {
    match raw {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "failed" => Ok(JobStatus::Failed),
        other => Err(bad_request(&format!("unknown status '{other}'"))),
    }
}

fn bad_request(msg: &str) -> (StatusCode, Json<JobResponse>) {
    error!(msg);
    (
        StatusCode::BAD_REQUEST,
        Json(JobResponse {
            id: None,
            error: Some(msg.to_owned()),
        }),
    )
}

fn internal_error<E>(err: E) -> (StatusCode, Json<JobResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(JobResponse {
            id: None,
            error: Some(err.to_string()),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use sqlx::PgPool;
    use tower::ServiceExt;

    use hb_postgres_common::gateway::PgGateway;
    use hb_postgres_common::jobs::{store, RecoveryConfig};

    use crate::handlers::app::add_routes;

    const MAX_BODY_SIZE: usize = 1_000_000;

    async fn driver_for(pool: PgPool) -> Arc<QueueDriver> {
        let mut conn = pool.acquire().await.expect("acquire failed");
        store::ensure_schema(&mut conn).await.expect("ensure_schema failed");
        drop(conn);
        Arc::new(QueueDriver::new(PgGateway::from_pool(pool), RecoveryConfig::default()))
    }

    #[sqlx::test]
    async fn test_post_job_success(pool: PgPool) {
        let driver = driver_for(pool).await;
        let app = add_routes(Router::new(), Arc::clone(&driver), MAX_BODY_SIZE);

        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/jobs")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::to_string(&JobPostRequestBody {
                            job_type: "send_email".to_owned(),
                            payload: serde_json::json!({"to": "a@b.com"}),
                            delayed_until: None,
                        })
                        .unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let pending = driver.get_jobs(JobStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[sqlx::test]
    async fn test_get_jobs_bad_status(pool: PgPool) {
        let driver = driver_for(pool).await;
        let app = add_routes(Router::new(), driver, MAX_BODY_SIZE);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/jobs?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_get_jobs_by_status(pool: PgPool) {
        let driver = driver_for(pool).await;
        let app = add_routes(Router::new(), Arc::clone(&driver), MAX_BODY_SIZE);

        driver.push(b"ping\0{}", None).await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/jobs?status=pending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let ids: Vec<Uuid> = serde_json::from_slice(&body).unwrap();
        assert_eq!(ids.len(), 1);
    }
}
