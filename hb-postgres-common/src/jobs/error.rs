use thiserror::Error;

use crate::error::SqlError;
use crate::migrations::MigrationError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("could not identify a handler for the claimed payload")]
    DecodeJobFailed,
    #[error("failed to add job: {0}")]
    FailedToAdd(SqlError),
    #[error("migrations never completed: {0}")]
    MigrationsFailed(#[from] MigrationError),
    #[error(transparent)]
    Sql(#[from] SqlError),
}
