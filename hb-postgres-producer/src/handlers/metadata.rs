use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use hb_postgres_common::jobs::QueueDriver;

#[derive(Serialize)]
pub struct MetadataResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
pub struct MetadataPutRequestBody {
    value: Value,
}

pub async fn get_metadata(
    State(driver): State<Arc<QueueDriver>>,
    Path(key): Path<String>,
) -> Result<Json<MetadataResponse>, (StatusCode, Json<MetadataResponse>)> {
    let raw = driver.get_metadata(&key).await.map_err(internal_error)?;

    let value = match raw {
        Some(bytes) => Some(serde_json::from_slice(&bytes).map_err(|_| {
            internal_error_msg("stored metadata value is not valid JSON")
        })?),
        None => None,
    };

    Ok(Json(MetadataResponse { value, error: None }))
}

pub async fn put_metadata(
    State(driver): State<Arc<QueueDriver>>,
    Path(key): Path<String>,
    Json(body): Json<MetadataPutRequestBody>,
) -> Result<Json<MetadataResponse>, (StatusCode, Json<MetadataResponse>)> {
    let bytes = serde_json::to_vec(&body.value).map_err(|_| bad_request("value is not valid JSON"))?;

    driver.set_metadata(&key, &bytes).await.map_err(internal_error)?;

    Ok(Json(MetadataResponse {
        value: Some(body.value),
        error: None,
    }))
}

fn bad_request(msg: &str) -> (StatusCode, Json<MetadataResponse>) {
    error!(msg);
    (
        StatusCode::BAD_REQUEST,
        Json(MetadataResponse {
            value: None,
            error: Some(msg.to_owned()),
        }),
    )
}

fn internal_error_msg(msg: &str) -> (StatusCode, Json<MetadataResponse>) {
    error!(msg);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(MetadataResponse {
            value: None,
            error: Some(msg.to_owned()),
        }),
    )
}

fn internal_error<E>(err: E) -> (StatusCode, Json<MetadataResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(MetadataResponse {
            value: None,
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
    async fn test_metadata_roundtrip(pool: PgPool) {
        let driver = driver_for(pool).await;
        let app = add_routes(Router::new(), driver, MAX_BODY_SIZE);

        let put_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(http::Method::PUT)
                    .uri("/metadata/cursor")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"value": 42}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(put_response.status(), StatusCode::OK);

        let get_response = app
            .oneshot(
                Request::builder()
                    .uri("/metadata/cursor")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);

        let body = get_response.into_body().collect().await.unwrap().to_bytes();
        let parsed: MetadataResponseDebug = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.value, Some(serde_json::json!(42)));
    }

    #[derive(Deserialize)]
    struct MetadataResponseDebug {
        value: Option<Value>,
    }

    #[sqlx::test]
    async fn test_get_missing_metadata_key(pool: PgPool) {
        let driver = driver_for(pool).await;
        let app = add_routes(Router::new(), driver, MAX_BODY_SIZE);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metadata/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: MetadataResponseDebug = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.value, None);
    }
}
