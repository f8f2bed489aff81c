//! The persisted ledger of applied migrations: table `_hb_pg_migrations`.
//!
//! All operations run against a caller-supplied executor so they can be composed
//! inside a transaction alongside the migration's own DDL.

use sqlx::{Executor, Postgres};

use crate::error::SqlError;

pub const TABLE: &str = "_hb_pg_migrations";

/// A row in the ledger. `order` reflects insertion order; reads are always
/// `ORDER BY "order" ASC`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub order: i32,
    pub name: String,
    #[sqlx(rename = "group")]
    pub group: String,
}

/// Idempotent DDL for `_hb_pg_migrations`.
pub async fn ensure_table<'c, E>(executor: E) -> Result<(), SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = format!(
        r#"
CREATE TABLE IF NOT EXISTS "{TABLE}" (
    "order"  SERIAL PRIMARY KEY,
    name     TEXT NOT NULL,
    "group"  TEXT NOT NULL
)
        "#
    );

    sqlx::query(&sql)
        .execute(executor)
        .await
        .map_err(|error| SqlError::query("CREATE TABLE", error))?;

    Ok(())
}

pub async fn insert<'c, E>(executor: E, name: &str, group: &str) -> Result<(), SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = format!(r#"INSERT INTO "{TABLE}" (name, "group") VALUES ($1, $2)"#);

    sqlx::query(&sql)
        .bind(name)
        .bind(group)
        .execute(executor)
        .await
        .map_err(|error| SqlError::query("INSERT", error))?;

    Ok(())
}

pub async fn delete_by_name<'c, E>(executor: E, name: &str, group: &str) -> Result<(), SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = format!(r#"DELETE FROM "{TABLE}" WHERE name = $1 AND "group" = $2"#);

    sqlx::query(&sql)
        .bind(name)
        .bind(group)
        .execute(executor)
        .await
        .map_err(|error| SqlError::query("DELETE", error))?;

    Ok(())
}

pub async fn list_ordered<'c, E>(executor: E) -> Result<Vec<AppliedMigration>, SqlError>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = format!(r#"SELECT "order", name, "group" FROM "{TABLE}" ORDER BY "order" ASC"#);

    let rows = sqlx::query_as::<_, AppliedMigration>(&sql)
        .fetch_all(executor)
        .await
        .map_err(|error| SqlError::query("SELECT", error))?;

    Ok(rows)
}
