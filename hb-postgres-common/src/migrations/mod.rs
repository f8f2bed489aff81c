//! Migration Ledger and reconciliation engine.

pub mod descriptor;
pub mod engine;
pub mod ledger;

pub use descriptor::{
    exec_sql, noop, FnMigration, MigrationDescriptor, MigrationGroup, DEFAULT_GROUP,
    JOBQUEUE_GROUP, PERSIST_GROUP,
};
pub use engine::{MigrationEngine, MigrationError, RevertedEntry};
pub use ledger::AppliedMigration;
