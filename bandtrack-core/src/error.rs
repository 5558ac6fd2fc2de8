//! Common error types for Bandtrack

use thiserror::Error;

/// Result type alias using the Bandtrack error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Boundary-facing classification of an [`Error`]
///
/// Request handlers map these onto user-facing statuses. Storage, IO and
/// configuration failures all collapse into `Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Conflict,
    InvalidInput,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Database(_) | Error::Io(_) | Error::Config(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Translate a unique-constraint violation into `Conflict`, pass anything else through
    pub fn from_unique_violation(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Error::Conflict(what.into())
            }
            _ => Error::Database(err),
        }
    }

    /// True when SQLite reported writer contention
    pub fn is_database_locked(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => {
                let msg = db_err.message();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}
