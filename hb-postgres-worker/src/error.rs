use thiserror::Error;

use hb_postgres_common::jobs::QueueError;
use hb_postgres_common::MigrationError;

/// Errors a single handler invocation can raise. Handlers report failures this way
/// rather than by panicking; the pool decides retry vs. terminal `failed` from here.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(#[from] eyre::Error),
}

/// Enumeration of errors related to initialization and running of the worker pool.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("migrations never completed: {0}")]
    Migrations(#[from] MigrationError),
    #[error("queue driver error: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to bind http listener: {0}")]
    Io(#[from] std::io::Error),
}
