use thiserror::Error;

/// Errors that can originate from sqlx and are wrapped to provide additional context,
/// shared by every component that issues queries through the [`crate::gateway::PgGateway`].
#[derive(Error, Debug)]
pub enum SqlError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
}

impl SqlError {
    pub fn query(command: impl Into<String>, error: sqlx::Error) -> Self {
        Self::QueryError {
            command: command.into(),
            error,
        }
    }

    pub fn transaction(command: impl Into<String>, error: sqlx::Error) -> Self {
        Self::TransactionError {
            command: command.into(),
            error,
        }
    }
}
