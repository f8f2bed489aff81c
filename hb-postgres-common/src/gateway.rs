//! # PgGateway
//!
//! A thin adapter over a pooled Postgres client. `pool()` hands out the
//! underlying `PgPool` for single-statement access; `with_transaction` wraps
//! multi-statement work that must commit or roll back atomically.
//!
//! Cancellation of the calling task is not implemented as a bespoke
//! `CancellationToken` contract here: dropping the future that's awaiting a
//! `sqlx` query or an in-flight transaction is itself what releases the
//! connection back to the pool (a rolled-back transaction, in the
//! transactional case) — ordinary Rust future-drop semantics already give
//! callers that guarantee, so there's nothing for this module to add on top.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

pub use crate::error::SqlError as PgGatewayError;

pub type GatewayResult<T> = std::result::Result<T, PgGatewayError>;

/// A thin adapter exposing pooled connection access plus a `withTransaction`
/// helper over a pooled Postgres client.
#[derive(Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    /// Connect lazily to `url`, building a pool with a tagged application name.
    pub async fn connect(url: &str, max_connections: u32, app_name: &'static str) -> GatewayResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| PgGatewayError::ConnectionError { error })?
            .application_name(app_name);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    /// Wrap an existing pool the host application already owns. Postgres connection
    /// parameters are the host application's concern; this is how it hands us a pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Wrap `BEGIN; op; COMMIT;` with automatic `ROLLBACK` on any failure propagated
    /// out of `op`.
    pub async fn with_transaction<F, Fut, T>(&self, op: F) -> GatewayResult<T>
    where
        F: FnOnce(&mut Transaction<'_, Postgres>) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(|error| PgGatewayError::transaction("BEGIN", error))?;

        match op(&mut txn).await {
            Ok(value) => {
                txn.commit()
                    .await
                    .map_err(|error| PgGatewayError::transaction("COMMIT", error))?;
                Ok(value)
            }
            Err(error) => {
                // Rollback happens implicitly when `txn` is dropped.
                Err(error)
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Convenience constant: the sentinel "distant future" timestamp used by the Persist
/// Store when no TTL is supplied.
pub const DISTANT_FUTURE_OFFSET: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
