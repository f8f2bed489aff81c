//! # Persist Store
//!
//! Key-scoped JSON values with an optional TTL, backed by table `_hb_pg_persist`.
//! Declares its own migration in group [`crate::migrations::PERSIST_GROUP`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{Executor, PgConnection, Postgres};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SqlError;
use crate::gateway::{PgGateway, DISTANT_FUTURE_OFFSET};
use crate::migrations::{exec_sql, noop, FnMigration, MigrationEngine, PERSIST_GROUP};

pub const TABLE: &str = "_hb_pg_persist";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("key already exists")]
    Duplicate,
    #[error("stored payload did not match the requested shape: {0}")]
    InvalidConversion(serde_json::Error),
    #[error(transparent)]
    Sql(#[from] SqlError),
}

/// Register the Persist Store's own migration with `engine`. Call before `engine.apply(...)`.
pub async fn register_migration(engine: &MigrationEngine) {
    engine
        .add(FnMigration::new(
            "create_hb_pg_persist",
            PERSIST_GROUP,
            exec_sql(
                r#"
CREATE TABLE IF NOT EXISTS "_hb_pg_persist" (
    id      TEXT PRIMARY KEY,
    data    JSON NOT NULL,
    expires TIMESTAMPTZ NOT NULL
)
                "#,
            ),
            noop(),
        ))
        .await;
}

fn distant_future() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(DISTANT_FUTURE_OFFSET).expect("offset fits in chrono::Duration")
}

/// A TTL-aware key/value store of JSON values.
#[derive(Clone)]
pub struct PersistStore {
    gateway: PgGateway,
}

impl PersistStore {
    pub fn new(gateway: PgGateway) -> Self {
        Self { gateway }
    }

    /// Single-shot insert; fails with [`PersistError::Duplicate`] if `key` already exists.
    pub async fn create<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), PersistError> {
        let expires = ttl
            .map(|ttl| Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
            .unwrap_or_else(distant_future);

        let data = serde_json::to_value(value).map_err(PersistError::InvalidConversion)?;

        let result = sqlx::query(r#"INSERT INTO "_hb_pg_persist" (id, data, expires) VALUES ($1, $2, $3)"#)
            .bind(key)
            .bind(&data)
            .bind(expires)
            .execute(self.gateway.pool())
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(ref db_error)) if db_error.is_unique_violation() => {
                Err(PersistError::Duplicate)
            }
            Err(error) => Err(PersistError::Sql(SqlError::query("INSERT", error))),
        }
    }

    /// Upsert: on conflict, overwrite both `data` and `expires`.
    pub async fn set<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), PersistError> {
        let expires = ttl
            .map(|ttl| Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
            .unwrap_or_else(distant_future);

        let data = serde_json::to_value(value).map_err(PersistError::InvalidConversion)?;

        sqlx::query(
            r#"
INSERT INTO "_hb_pg_persist" (id, data, expires)
VALUES ($1, $2, $3)
ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, expires = EXCLUDED.expires
            "#,
        )
        .bind(key)
        .bind(&data)
        .bind(expires)
        .execute(self.gateway.pool())
        .await
        .map_err(|error| SqlError::query("UPSERT", error))?;

        Ok(())
    }

    /// Select `key`; returns `None` if absent or expired. A decode failure surfaces as
    /// [`PersistError::InvalidConversion`].
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistError> {
        let row: Option<(serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            r#"SELECT data, expires FROM "_hb_pg_persist" WHERE id = $1"#,
        )
        .bind(key)
        .fetch_optional(self.gateway.pool())
        .await
        .map_err(|error| SqlError::query("SELECT", error))?;

        let Some((data, expires)) = row else {
            return Ok(None);
        };

        if expires <= Utc::now() {
            return Ok(None);
        }

        serde_json::from_value(data)
            .map(Some)
            .map_err(PersistError::InvalidConversion)
    }

    /// Unconditional delete.
    pub async fn remove(&self, key: &str) -> Result<(), PersistError> {
        sqlx::query(r#"DELETE FROM "_hb_pg_persist" WHERE id = $1"#)
            .bind(key)
            .execute(self.gateway.pool())
            .await
            .map_err(|error| SqlError::query("DELETE", error))?;

        Ok(())
    }

    /// Delete all rows whose `expires` has passed. Invoked by [`run_sweeper`] on a timer and
    /// exposed directly for callers who want to drive their own schedule.
    pub async fn sweep_expired(&self) -> Result<u64, PersistError> {
        let result = sqlx::query(r#"DELETE FROM "_hb_pg_persist" WHERE expires < now()"#)
            .execute(self.gateway.pool())
            .await
            .map_err(|error| SqlError::query("DELETE", error))?;

        Ok(result.rows_affected())
    }
}

/// Run the sweeper until `cancel` fires: waits for `engine` to complete, then deletes expired
/// rows every `interval` until asked to stop.
pub async fn run_sweeper(
    store: PersistStore,
    engine: &MigrationEngine,
    interval: Duration,
    cancel: CancellationToken,
) {
    if let Err(error) = engine.wait_until_completed().await {
        warn!(%error, "persist sweeper exiting: migrations never completed");
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("persist sweeper stopping");
                return;
            }
            _ = ticker.tick() => {
                match store.sweep_expired().await {
                    Ok(deleted) if deleted > 0 => info!(deleted, "swept expired persist rows"),
                    Ok(_) => {}
                    Err(error) => warn!(%error, "persist sweep failed"),
                }
            }
        }
    }
}

/// Exposed for callers that embed the Persist Store's DDL manually instead of through
/// [`register_migration`], e.g. test fixtures. Mirrors the migration's `up` step.
pub async fn ensure_table<'c, E>(executor: E) -> Result<(), SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS "_hb_pg_persist" (
    id      TEXT PRIMARY KEY,
    data    JSON NOT NULL,
    expires TIMESTAMPTZ NOT NULL
)
        "#,
    )
    .execute(executor)
    .await
    .map_err(|error| SqlError::query("CREATE TABLE", error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Payload {
        value: u32,
    }

    async fn store_for(pool: PgPool) -> PersistStore {
        ensure_table(&pool).await.expect("failed to create table");
        PersistStore::new(PgGateway::from_pool(pool))
    }

    #[sqlx::test]
    async fn test_create_then_get(pool: PgPool) {
        let store = store_for(pool).await;
        store
            .create("k1", &Payload { value: 1 }, None)
            .await
            .expect("create failed");

        let got: Option<Payload> = store.get("k1").await.expect("get failed");
        assert_eq!(got, Some(Payload { value: 1 }));
    }

    #[sqlx::test]
    async fn test_create_duplicate_errors(pool: PgPool) {
        let store = store_for(pool).await;
        store.create("k1", &Payload { value: 1 }, None).await.unwrap();

        let result = store.create("k1", &Payload { value: 2 }, None).await;
        assert!(matches!(result, Err(PersistError::Duplicate)));
    }

    #[sqlx::test]
    async fn test_set_upserts(pool: PgPool) {
        let store = store_for(pool).await;
        store.set("k1", &Payload { value: 1 }, None).await.unwrap();
        store.set("k1", &Payload { value: 2 }, None).await.unwrap();

        let got: Option<Payload> = store.get("k1").await.unwrap();
        assert_eq!(got, Some(Payload { value: 2 }));
    }

    #[sqlx::test]
    async fn test_get_expired_is_absent(pool: PgPool) {
        let store = store_for(pool).await;
        store
            .set("k1", &Payload { value: 1 }, Some(Duration::from_secs(0)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let got: Option<Payload> = store.get("k1").await.unwrap();
        assert_eq!(got, None);
    }

    #[sqlx::test]
    async fn test_remove(pool: PgPool) {
        let store = store_for(pool).await;
        store.create("k1", &Payload { value: 1 }, None).await.unwrap();
        store.remove("k1").await.unwrap();

        let got: Option<Payload> = store.get("k1").await.unwrap();
        assert_eq!(got, None);
    }

    #[sqlx::test]
    async fn test_sweep_expired(pool: PgPool) {
        let store = store_for(pool).await;
        store
            .set("expired", &Payload { value: 1 }, Some(Duration::from_secs(0)))
            .await
            .unwrap();
        store.set("alive", &Payload { value: 2 }, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let deleted = store.sweep_expired().await.unwrap();
        assert_eq!(deleted, 1);

        let got: Option<Payload> = store.get("alive").await.unwrap();
        assert_eq!(got, Some(Payload { value: 2 }));
    }
}
