use thiserror::Error;

use hb_postgres_common::jobs::QueueError;
use hb_postgres_common::MigrationError;

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("migrations never completed: {0}")]
    Migrations(#[from] MigrationError),
    #[error("queue driver error: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to bind http listener: {0}")]
    Io(#[from] std::io::Error),
}
