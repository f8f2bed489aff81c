use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::PgConnection;

/// Default migration group used when a caller doesn't supply one explicitly.
pub const DEFAULT_GROUP: &str = "_hb_default";
/// Well-known group the Persist Store's own migration is declared under.
pub const PERSIST_GROUP: &str = "_hb_persist";
/// Well-known group the job queue's own migrations are declared under.
pub const JOBQUEUE_GROUP: &str = "_hb_jobqueue";

/// A namespace migrations are reconciled independently within. Groups are compared
/// by string equality; libraries that ship their own migrations (persist, jobs)
/// declare them under their own group so host applications can evolve independently.
pub type MigrationGroup = String;

/// A single declared migration. Identity is `(group, name)`; names must be unique
/// within a group. Descriptors are immutable once declared for a run.
#[async_trait]
pub trait MigrationDescriptor: Send + Sync {
    /// Unique within `group()`.
    fn name(&self) -> &str;
    fn group(&self) -> &str;

    async fn apply(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error>;
    async fn revert(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error>;
}

type StepFn = Box<
    dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> + Send + Sync,
>;

/// A [`MigrationDescriptor`] built from a pair of closures, for callers who'd
/// rather not write a dedicated struct per migration.
pub struct FnMigration {
    name: String,
    group: String,
    up: StepFn,
    down: StepFn,
}

impl FnMigration {
    pub fn new<U, UFut, D, DFut>(name: impl Into<String>, group: impl Into<String>, up: U, down: D) -> Self
    where
        U: for<'c> Fn(&'c mut PgConnection) -> UFut + Send + Sync + 'static,
        UFut: std::future::Future<Output = Result<(), sqlx::Error>> + Send + 'static,
        D: for<'c> Fn(&'c mut PgConnection) -> DFut + Send + Sync + 'static,
        DFut: std::future::Future<Output = Result<(), sqlx::Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            group: group.into(),
            up: Box::new(move |conn| Box::pin(up(conn))),
            down: Box::new(move |conn| Box::pin(down(conn))),
        }
    }

    /// Construct a migration in the default group.
    pub fn in_default_group<U, UFut, D, DFut>(name: impl Into<String>, up: U, down: D) -> Self
    where
        U: for<'c> Fn(&'c mut PgConnection) -> UFut + Send + Sync + 'static,
        UFut: std::future::Future<Output = Result<(), sqlx::Error>> + Send + 'static,
        D: for<'c> Fn(&'c mut PgConnection) -> DFut + Send + Sync + 'static,
        DFut: std::future::Future<Output = Result<(), sqlx::Error>> + Send + 'static,
    {
        Self::new(name, DEFAULT_GROUP, up, down)
    }
}

#[async_trait]
impl MigrationDescriptor for FnMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> &str {
        &self.group
    }

    async fn apply(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        (self.up)(conn).await
    }

    async fn revert(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        (self.down)(conn).await
    }
}

/// Run a single bare SQL statement as a migration step. Most schema migrations
/// in this crate are expressed this way.
pub fn exec_sql(sql: &'static str) -> impl for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> + Send + Sync {
    move |conn: &mut PgConnection| {
        Box::pin(async move {
            sqlx::query(sql).execute(&mut *conn).await?;
            Ok(())
        })
    }
}

/// A step that does nothing — used for migrations with no meaningful revert.
pub fn noop() -> impl for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> + Send + Sync {
    |_conn: &mut PgConnection| Box::pin(async move { Ok(()) })
}
